use core::cell::RefCell;
use core::future::poll_fn;
use core::net::SocketAddr;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::waitqueue::WakerRegistration;

use crate::error::Error;
use crate::MAX_SOCKETS;

use super::{SocketId, SocketKind, CLOSED, CONNECTED, READABLE};

#[derive(Debug)]
struct Entry {
    kind: SocketKind,
    peer: Option<SocketAddr>,
    state: u8,
    /// Set by every `set_state`; blocks `clear` until the next fresh wait.
    /// Preserves a state edge delivered concurrently with a wait/clear
    /// pair.
    dirty: bool,
    error: u16,
    /// Closing this socket must also deactivate the PDP context.
    pdp_deact: bool,
    waker: WakerRegistration,
}

struct Inner {
    base: u8,
    count: usize,
    entries: [Option<Entry>; MAX_SOCKETS],
}

impl Inner {
    fn slot(&self, id: SocketId) -> Option<usize> {
        let slot = id.0.checked_sub(self.base)? as usize;
        (slot < self.count).then_some(slot)
    }

    fn entry_mut(&mut self, id: SocketId) -> Option<&mut Entry> {
        let slot = self.slot(id)?;
        self.entries[slot].as_mut()
    }
}

/// The id → socket-state map shared by the reader task, the socket objects
/// and the session machine.
pub struct SocketSet {
    inner: BlockingMutex<NoopRawMutex, RefCell<Inner>>,
}

impl core::fmt::Debug for SocketSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SocketSet").finish_non_exhaustive()
    }
}

impl SocketSet {
    pub(crate) const fn new() -> Self {
        const NONE: Option<Entry> = None;
        Self {
            inner: BlockingMutex::new(RefCell::new(Inner {
                base: 0,
                count: MAX_SOCKETS,
                entries: [NONE; MAX_SOCKETS],
            })),
        }
    }

    /// Restrict the id space to the module's range.
    pub(crate) fn init(&mut self, base: u8, count: usize) {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            inner.base = base;
            inner.count = count.min(MAX_SOCKETS);
        });
    }

    /// Allocate the lowest free id.
    pub(crate) fn add(&self, kind: SocketKind) -> Result<SocketId, Error> {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            let slot = (0..inner.count)
                .find(|&s| inner.entries[s].is_none())
                .ok_or(Error::ResourceExhausted)?;
            inner.entries[slot] = Some(Entry::fresh(kind));
            Ok(SocketId(inner.base + slot as u8))
        })
    }

    /// Register a modem-assigned id (u-blox `+USOCR` picks the id itself).
    pub(crate) fn claim(&self, id: SocketId, kind: SocketKind) -> Result<(), Error> {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            let slot = inner.slot(id).ok_or(Error::ResourceExhausted)?;
            if inner.entries[slot].is_some() {
                return Err(Error::ResourceExhausted);
            }
            inner.entries[slot] = Some(Entry::fresh(kind));
            Ok(())
        })
    }

    /// Drop the entry. Waiters are woken and observe the socket as closed.
    pub(crate) fn remove(&self, id: SocketId) {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            if let Some(slot) = inner.slot(id) {
                if let Some(entry) = inner.entries[slot].as_mut() {
                    entry.waker.wake();
                }
                inner.entries[slot] = None;
            }
        });
    }

    pub(crate) fn set_state(&self, id: SocketId, bits: u8) {
        self.inner.lock(|i| {
            if let Some(entry) = i.borrow_mut().entry_mut(id) {
                entry.state |= bits;
                entry.dirty = true;
                entry.waker.wake();
            }
        });
    }

    /// Clear `bits`, unless a concurrent `set_state` marked the entry dirty
    /// since the last fresh wait.
    pub(crate) fn clear(&self, id: SocketId, bits: u8) {
        self.inner.lock(|i| {
            if let Some(entry) = i.borrow_mut().entry_mut(id) {
                if !entry.dirty {
                    entry.state &= !bits;
                }
            }
        });
    }

    /// Record the result of an asynchronous connect.
    pub(crate) fn set_connect_result(&self, id: SocketId, code: u16) {
        self.inner.lock(|i| {
            if let Some(entry) = i.borrow_mut().entry_mut(id) {
                if code == 0 {
                    entry.state |= CONNECTED;
                } else {
                    entry.error = code;
                    entry.state |= CLOSED;
                }
                entry.dirty = true;
                entry.waker.wake();
            }
        });
    }

    /// Transition to CLOSED. Returns whether the bit was already set, so
    /// the close path runs exactly once per socket.
    pub(crate) fn mark_closed(&self, id: SocketId) -> bool {
        self.inner.lock(|i| {
            match i.borrow_mut().entry_mut(id) {
                Some(entry) => {
                    let was = entry.state & CLOSED != 0;
                    entry.state |= CLOSED;
                    entry.dirty = true;
                    entry.waker.wake();
                    was
                }
                None => true,
            }
        })
    }

    pub(crate) fn set_pdp_deact(&self, id: SocketId) {
        self.inner.lock(|i| {
            if let Some(entry) = i.borrow_mut().entry_mut(id) {
                entry.pdp_deact = true;
            }
        });
    }

    pub(crate) fn pdp_deact(&self, id: SocketId) -> bool {
        self.inner.lock(|i| {
            i.borrow_mut()
                .entry_mut(id)
                .map_or(false, |e| e.pdp_deact)
        })
    }

    pub(crate) fn state_of(&self, id: SocketId) -> u8 {
        self.inner
            .lock(|i| i.borrow_mut().entry_mut(id).map_or(CLOSED, |e| e.state))
    }

    pub(crate) fn error_of(&self, id: SocketId) -> u16 {
        self.inner
            .lock(|i| i.borrow_mut().entry_mut(id).map_or(0, |e| e.error))
    }

    pub(crate) fn set_peer(&self, id: SocketId, peer: SocketAddr) {
        self.inner.lock(|i| {
            if let Some(entry) = i.borrow_mut().entry_mut(id) {
                entry.peer = Some(peer);
            }
        });
    }

    pub(crate) fn peer_of(&self, id: SocketId) -> Option<SocketAddr> {
        self.inner
            .lock(|i| i.borrow_mut().entry_mut(id).and_then(|e| e.peer))
    }

    pub(crate) fn kind_of(&self, id: SocketId) -> Option<SocketKind> {
        self.inner
            .lock(|i| i.borrow_mut().entry_mut(id).map(|e| e.kind))
    }

    /// The data context went away underneath every open socket: mark them
    /// closed and require PDP deactivation on their close path.
    pub(crate) fn pdp_deact_all(&self) {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            for entry in inner.entries.iter_mut().flatten() {
                entry.pdp_deact = true;
                entry.state |= CLOSED;
                entry.dirty = true;
                entry.waker.wake();
            }
        });
    }

    /// Mark every remaining socket closed and drop it from the map; used by
    /// network teardown.
    pub(crate) fn close_all(&self) {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            for entry in inner.entries.iter_mut() {
                if let Some(e) = entry.as_mut() {
                    e.state |= CLOSED;
                    e.waker.wake();
                }
                *entry = None;
            }
        });
    }

    /// Wait until any of `mask` is set. A fresh wait resets the dirty bit,
    /// re-arming `clear`. A missing entry reads as CLOSED.
    pub(crate) async fn wait_for(&self, id: SocketId, mask: u8) -> u8 {
        let mut fresh = true;
        poll_fn(move |cx| {
            self.inner.lock(|i| {
                let mut borrow = i.borrow_mut();
                let Some(entry) = borrow.entry_mut(id) else {
                    return Poll::Ready(CLOSED);
                };
                if fresh {
                    entry.dirty = false;
                    fresh = false;
                }
                if entry.state & mask != 0 {
                    Poll::Ready(entry.state)
                } else {
                    entry.waker.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }
}

impl Entry {
    fn fresh(kind: SocketKind) -> Self {
        Self {
            kind,
            peer: None,
            state: 0,
            dirty: false,
            error: 0,
            pdp_deact: false,
            waker: WakerRegistration::new(),
        }
    }
}
