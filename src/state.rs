//! Shared driver state, written by the reader task and observed by the
//! session machine and socket owners.

use core::cell::RefCell;
use core::future::poll_fn;
use core::net::IpAddr;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;
use embassy_sync::waitqueue::WakerRegistration;
use heapless::Vec;

use crate::at::{Frame, InfoLine, SessionShared};
use crate::error::Error;
use crate::registration::{RegOutcome, RegType, RegistrationState, Status};
use crate::socket::{SocketId, SocketSet};

pub(crate) const FRAME_QUEUE: usize = 4;
pub(crate) const MAX_DNS_ADDRS: usize = 4;

/// Lifecycle of the cellular session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionPhase {
    #[default]
    Off,
    Powering,
    BaudProbing,
    Ready,
    Configuring,
    RadioOn,
    Registering,
    Attached,
    Detaching,
    Closing,
}

/// Progress of an unsolicited DNS resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DnsUpdate {
    /// The modem reported a resolver error.
    Failed(u16),
    /// Header announcing how many addresses follow.
    Expect(usize),
    Addr(IpAddr),
}

/// Typed records the module shim translates unsolicited lines into. The
/// reader task applies them to shared state before framing the next line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    SocketReadable(SocketId),
    SocketClosed(SocketId),
    /// Completion of an asynchronous connect; nonzero code is a failure.
    SocketConnectResult(SocketId, u16),
    /// The data context dropped; sockets must deactivate it on close.
    ContextDeactivated,
    Registration(RegType, Status),
    Dns(DnsUpdate),
    /// PSM timer report after attach.
    PsmTimer,
}

/// Vendor hook turning an unsolicited line into an [`Event`].
pub type UrcTranslator = fn(&InfoLine) -> Option<Event>;

#[derive(Debug, Default)]
struct DnsSlot {
    active: bool,
    done: bool,
    expected: usize,
    error: Option<u16>,
    addrs: Vec<IpAddr, MAX_DNS_ADDRS>,
}

struct Inner {
    phase: SessionPhase,
    reg: RegistrationState,
    reg_waker: WakerRegistration,
    dns: DnsSlot,
    dns_waker: WakerRegistration,
    psm_timer_seen: bool,
    /// Enter PSM instead of powering off at teardown. Cleared on GSM
    /// fallback.
    use_psm: bool,
    /// The current attach is LTE; false after a GSM (`+CGREG`) attach.
    is_lte: bool,
    psm_handler_registered: bool,
}

/// State shared across the reader task and driver-facing objects.
pub struct DriverShared {
    inner: BlockingMutex<NoopRawMutex, RefCell<Inner>>,
}

impl DriverShared {
    pub(crate) const fn new() -> Self {
        Self {
            inner: BlockingMutex::new(RefCell::new(Inner {
                phase: SessionPhase::Off,
                reg: RegistrationState::new(),
                reg_waker: WakerRegistration::new(),
                dns: DnsSlot {
                    active: false,
                    done: false,
                    expected: 0,
                    error: None,
                    addrs: Vec::new(),
                },
                dns_waker: WakerRegistration::new(),
                psm_timer_seen: false,
                use_psm: false,
                is_lte: false,
                psm_handler_registered: false,
            })),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.lock(|i| i.borrow().phase)
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            if inner.phase != phase {
                debug!("session phase {:?} -> {:?}", inner.phase, phase);
                inner.phase = phase;
            }
        });
    }

    /// Apply one translated unsolicited event. Runs on the reader task;
    /// must not block.
    pub(crate) fn apply(&self, event: Event, sockets: &SocketSet) {
        trace!("urc event {:?}", event);
        match event {
            Event::SocketReadable(id) => sockets.set_state(id, crate::socket::READABLE),
            Event::SocketClosed(id) => {
                sockets.mark_closed(id);
            }
            Event::SocketConnectResult(id, code) => sockets.set_connect_result(id, code),
            Event::ContextDeactivated => sockets.pdp_deact_all(),
            Event::Registration(reg_type, status) => self.inner.lock(|i| {
                let inner = &mut *i.borrow_mut();
                inner.reg.set(reg_type, status);
                inner.reg_waker.wake();
            }),
            Event::Dns(update) => self.apply_dns(update),
            Event::PsmTimer => self.inner.lock(|i| i.borrow_mut().psm_timer_seen = true),
        }
    }

    pub(crate) fn reg_reset(&self) {
        self.inner.lock(|i| i.borrow_mut().reg.reset());
    }

    pub(crate) fn registration(&self) -> RegistrationState {
        self.inner.lock(|i| i.borrow().reg.clone())
    }

    /// Wait for the registration latch to reach a terminal outcome. The
    /// caller bounds this with its own deadline.
    pub(crate) async fn wait_registration(&self) -> Result<RegType, Error> {
        poll_fn(|cx| {
            self.inner.lock(|i| {
                let inner = &mut *i.borrow_mut();
                match inner.reg.outcome() {
                    Some(RegOutcome::Registered(reg_type)) => Poll::Ready(Ok(reg_type)),
                    Some(RegOutcome::Denied) => Poll::Ready(Err(Error::RegistrationDenied)),
                    Some(RegOutcome::Lost) => Poll::Ready(Err(Error::ConnectionLost)),
                    None => {
                        inner.reg_waker.register(cx.waker());
                        Poll::Pending
                    }
                }
            })
        })
        .await
    }

    fn apply_dns(&self, update: DnsUpdate) {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            let dns = &mut inner.dns;
            if !dns.active {
                return;
            }
            match update {
                DnsUpdate::Failed(code) => {
                    dns.error = Some(code);
                    dns.done = true;
                }
                DnsUpdate::Expect(count) => {
                    dns.expected = count;
                    if count == 0 {
                        dns.done = true;
                    }
                }
                DnsUpdate::Addr(addr) => {
                    dns.addrs.push(addr).ok();
                    if dns.expected > 0 && dns.addrs.len() >= dns.expected.min(MAX_DNS_ADDRS) {
                        dns.done = true;
                    }
                }
            }
            inner.dns_waker.wake();
        });
    }

    /// Arm the one-shot resolution slot. Serialized by the resolver mutex.
    pub(crate) fn dns_begin(&self) {
        self.inner.lock(|i| {
            i.borrow_mut().dns = DnsSlot {
                active: true,
                ..Default::default()
            };
        });
    }

    pub(crate) async fn dns_wait(&self) -> Result<Vec<IpAddr, MAX_DNS_ADDRS>, Error> {
        let res = poll_fn(|cx| {
            self.inner.lock(|i| {
                let inner = &mut *i.borrow_mut();
                if inner.dns.done {
                    let slot = core::mem::take(&mut inner.dns);
                    return Poll::Ready(match slot.error {
                        Some(code) => Err(Error::Unknown(code)),
                        None if slot.addrs.is_empty() => Err(Error::Unknown(0)),
                        None => Ok(slot.addrs),
                    });
                }
                inner.dns_waker.register(cx.waker());
                Poll::Pending
            })
        })
        .await;
        res
    }

    pub(crate) fn dns_abandon(&self) {
        self.inner.lock(|i| i.borrow_mut().dns = DnsSlot::default());
    }

    pub(crate) fn reset_psm_timer(&self) {
        self.inner.lock(|i| i.borrow_mut().psm_timer_seen = false);
    }

    pub(crate) fn psm_timer_seen(&self) -> bool {
        self.inner.lock(|i| i.borrow().psm_timer_seen)
    }

    pub(crate) fn set_link_flags(&self, use_psm: bool, is_lte: bool) {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            inner.use_psm = use_psm;
            inner.is_lte = is_lte;
        });
    }

    pub(crate) fn use_psm(&self) -> bool {
        self.inner.lock(|i| i.borrow().use_psm)
    }

    pub(crate) fn is_lte(&self) -> bool {
        self.inner.lock(|i| i.borrow().is_lte)
    }

    /// First caller wins; used to register the PSM timer handler exactly
    /// once.
    pub(crate) fn psm_handler_once(&self) -> bool {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            let first = !inner.psm_handler_registered;
            inner.psm_handler_registered = true;
            first
        })
    }
}

/// Statically-allocatable storage for one driver instance.
pub struct Resources {
    pub(crate) session: SessionShared,
    pub(crate) driver: DriverShared,
    pub(crate) sockets: SocketSet,
    pub(crate) frames: Channel<NoopRawMutex, Frame, FRAME_QUEUE>,
}

impl Default for Resources {
    fn default() -> Self {
        Self::new()
    }
}

impl Resources {
    pub const fn new() -> Self {
        Self {
            session: SessionShared::new(),
            driver: DriverShared::new(),
            sockets: SocketSet::new(),
            frames: Channel::new(),
        }
    }
}
