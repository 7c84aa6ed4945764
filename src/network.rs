//! Cellular session machine: power sequencing, baud discovery, SIM
//! readiness, radio configuration, registration and teardown, plus the
//! failure-counter reset policy.

use core::marker::PhantomData;
use core::str::FromStr;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{with_timeout, Duration, Instant, Timer};
use embedded_io_async::{Read, Write};
use heapless::String;

use crate::at::{AtHandle, AtMutex, AtSession, Command, Ingress, InfoLine, SessionShared};
use crate::config::{AttemptsStore, CellularConfig, Config, Rat};
use crate::error::Error;
use crate::modules::{ConfigOutcome, Module};
use crate::registration::RegType;
use crate::socket::SocketSet;
use crate::state::{DriverShared, Resources, SessionPhase};

const SIM_READY_TIMEOUT: Duration = Duration::from_secs(10);
const SIM_POLL_INTERVAL: Duration = Duration::from_millis(250);
const BAUD_PROBE_TIMEOUT: Duration = Duration::from_millis(250);
const BAUD_SWEEPS: usize = 5;
const ALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(180);
const CONFIG_PASS_LIMIT: usize = 8;

/// Consecutive failed open attempts before a soft reset; at twice this the
/// module is power cycled instead.
const RESET_THRESHOLD: u16 = 8;

/// One modem, one driver. Control-plane methods bring the link up and
/// down; data-plane methods (`tcp_connect`, `udp_open`, `resolve`) hand
/// out sockets multiplexed over it.
pub struct Device<'d, M: Module, W: Write, C: CellularConfig, S: AttemptsStore> {
    pub(crate) at: AtMutex<'d, W>,
    pub(crate) session: &'d SessionShared,
    pub(crate) shared: &'d DriverShared,
    pub(crate) sockets: &'d SocketSet,
    pub(crate) hw: Mutex<NoopRawMutex, C>,
    pub(crate) store: Mutex<NoopRawMutex, S>,
    pub(crate) config: Config,
    /// Serializes DNS resolutions; one in flight at a time.
    pub(crate) dns_lock: Mutex<NoopRawMutex, ()>,
    /// Serializes TCP connects on chips that allow only one.
    pub(crate) connect_lock: Mutex<NoopRawMutex, ()>,
    pub(crate) _module: PhantomData<M>,
}

/// Wire a driver out of its static resources and the UART halves. The
/// returned [`Ingress`] must be run in a background task.
pub fn new_device<'d, M, R, W, C, S>(
    resources: &'d mut Resources,
    rx: R,
    tx: W,
    hw: C,
    store: S,
    config: Config,
) -> (Device<'d, M, W, C, S>, Ingress<'d, R>)
where
    M: Module,
    R: Read,
    W: Write,
    C: CellularConfig,
    S: AttemptsStore,
{
    resources.session.s3 = b'\r';
    resources.session.data_marker = M::DATA_MARKER;
    resources.session.cmd_cooldown = M::timings().command_delay;
    resources.session.data_byte_delay = M::DATA_BYTE_DELAY;
    resources.session.init(
        M::ok_terminations(),
        M::error_terminations(),
        M::urc_verbs(),
        M::response_parsers(),
        M::translate_urc,
    );
    resources.sockets.init(M::SOCKET_ID_BASE, M::SOCKET_COUNT);

    let resources = &*resources;
    let ingress = Ingress::new(
        rx,
        &resources.session,
        &resources.driver,
        &resources.sockets,
        resources.frames.sender(),
    );
    let session = AtSession::new(tx, &resources.session, resources.frames.receiver());
    let device = Device {
        at: Mutex::new(session),
        session: &resources.session,
        shared: &resources.driver,
        sockets: &resources.sockets,
        hw: Mutex::new(hw),
        store: Mutex::new(store),
        config,
        dns_lock: Mutex::new(()),
        connect_lock: Mutex::new(()),
        _module: PhantomData,
    };
    (device, ingress)
}

fn note_psm_timer(_line: &InfoLine) {
    debug!("PSM timer reported by the network");
}

impl<'d, M: Module, W: Write, C: CellularConfig, S: AttemptsStore> Device<'d, M, W, C, S> {
    pub fn at_handle(&self) -> AtHandle<'_, 'd, W> {
        AtHandle {
            mutex: &self.at,
            shared: self.session,
        }
    }

    /// Session-level extension points: extra terminations, response
    /// parsers and URC handler registration.
    pub fn session(&self) -> &'d SessionShared {
        self.session
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    /// Whether the network reported PSM timers after the last attach.
    pub fn psm_timer_reported(&self) -> bool {
        self.shared.psm_timer_seen()
    }

    /// Bring the modem from powered-off to attached with an active data
    /// session.
    pub async fn open_network(&self) -> Result<(), Error> {
        let attempts = {
            let mut store = self.store.lock().await;
            let attempts = store.load().wrapping_add(1);
            store.store(attempts);
            attempts
        };
        info!("opening network, attempt counter at {}", attempts);

        self.shared
            .set_link_flags(self.config.psm.is_some(), true);
        self.shared.reset_psm_timer();

        let result = self.open_inner(attempts).await;
        match result {
            Ok(()) => {
                self.store.lock().await.store(0);
                self.shared.set_phase(SessionPhase::Attached);
                Ok(())
            }
            Err(e) => {
                error!("network open failed: {:?}", e);
                self.shared.set_phase(SessionPhase::Off);
                Err(e)
            }
        }
    }

    async fn open_inner(&self, attempts: u16) -> Result<(), Error> {
        if attempts % (2 * RESET_THRESHOLD) == 0 {
            warn!("{} consecutive failures, power cycling the module", attempts);
            self.hard_power_off().await;
        }

        self.shared.set_phase(SessionPhase::Powering);
        self.power_on().await;

        self.shared.set_phase(SessionPhase::BaudProbing);
        self.probe_baud().await?;

        if attempts % (2 * RESET_THRESHOLD) != 0 && attempts % RESET_THRESHOLD == 0 {
            warn!("{} consecutive failures, soft resetting the module", attempts);
            self.soft_reset().await?;
        }

        self.shared.set_phase(SessionPhase::Ready);
        self.init_at().await?;
        self.wait_sim_ready().await?;

        self.shared.set_phase(SessionPhase::Configuring);
        self.configure_loop().await?;

        self.shared.set_phase(SessionPhase::RadioOn);
        self.at_handle()
            .send(&Command::set("+CFUN").int(1).timeout(Duration::from_secs(15)))
            .await?;

        self.shared.set_phase(SessionPhase::Registering);
        self.register().await?;

        let mut at = self.at.lock().await;
        M::on_connected(&mut at, &self.config).await?;
        Ok(())
    }

    /// Walk the candidate rates until the modem answers, then move it to
    /// the preferred rate.
    async fn probe_baud(&self) -> Result<(), Error> {
        let rates: &[u32] = if self.config.baud_rates.is_empty() {
            M::baud_rates()
        } else {
            &self.config.baud_rates
        };
        let preferred = *rates.first().ok_or(Error::BaudDetection)?;

        for sweep in 0..BAUD_SWEEPS {
            for &rate in rates {
                self.hw.lock().await.set_baud_rate(rate);
                if !self.ping(BAUD_PROBE_TIMEOUT).await {
                    continue;
                }
                if rate != preferred {
                    debug!("modem answered at {}, switching to {}", rate, preferred);
                    {
                        let mut at = self.at.lock().await;
                        M::set_baud(&mut at, preferred).await?;
                    }
                    self.hw.lock().await.set_baud_rate(preferred);
                    Timer::after(Duration::from_millis(100)).await;
                    if !self.ping(BAUD_PROBE_TIMEOUT).await {
                        continue;
                    }
                }
                return Ok(());
            }
            if sweep >= 2 {
                // Stubborn link: try restoring factory UART settings.
                self.at_handle()
                    .send(&Command::raw("&F").timeout(BAUD_PROBE_TIMEOUT))
                    .await
                    .ok();
            }
        }
        Err(Error::BaudDetection)
    }

    async fn ping(&self, timeout: Duration) -> bool {
        self.at_handle()
            .send(&Command::action("").timeout(timeout))
            .await
            .is_ok()
    }

    pub(crate) async fn wait_alive(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.ping(Duration::from_secs(1)).await {
                return Ok(());
            }
            Timer::after(SIM_POLL_INTERVAL).await;
        }
        Err(Error::BaudDetection)
    }

    async fn soft_reset(&self) -> Result<(), Error> {
        {
            let mut at = self.at.lock().await;
            M::soft_reset(&mut at).await?;
        }
        Timer::after(M::timings().boot_wait).await;
        self.wait_alive(ALIVE_TIMEOUT).await
    }

    async fn init_at(&self) -> Result<(), Error> {
        let mut at = self.at.lock().await;
        // Echo off first; the framer drops echoed lines until this lands.
        at.send(&Command::raw("E0")).await?;
        at.send(&Command::set("+CMEE").int(2)).await?;
        Ok(())
    }

    async fn wait_sim_ready(&self) -> Result<(), Error> {
        let deadline = Instant::now() + SIM_READY_TIMEOUT;
        loop {
            let resp = self.at_handle().lock().await?.query("+CPIN").await;
            if let Ok(resp) = resp {
                match resp.single().and_then(|l| l.str(0)) {
                    Ok("READY") => return Ok(()),
                    Ok(state) => warn!("SIM requires {:?}", state),
                    Err(_) => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::SimTimeout);
            }
            Timer::after(SIM_POLL_INTERVAL).await;
        }
    }

    /// Repeat configuration passes until one changes nothing. Settings
    /// that only apply after a reboot restart the loop.
    async fn configure_loop(&self) -> Result<(), Error> {
        for _ in 0..CONFIG_PASS_LIMIT {
            let outcome = {
                let mut at = self.at.lock().await;
                M::configure(&mut at, &self.config).await?
            };
            match outcome {
                ConfigOutcome::Unchanged => return Ok(()),
                ConfigOutcome::Changed => {}
                ConfigOutcome::RebootRequired => self.soft_reset().await?,
            }
        }
        error!("configuration loop failed to converge");
        Err(Error::Unavailable)
    }

    async fn register(&self) -> Result<(), Error> {
        self.shared.reg_reset();

        let want_gsm = M::SUPPORTS_GSM && self.config.rats.contains(&Rat::Gsm);
        {
            let mut at = self.at.lock().await;
            at.send(&Command::set("+CEREG").int(2)).await?;
            if want_gsm {
                at.send(&Command::set("+CGREG").int(2)).await?;
            }
            let cops = match &self.config.operator {
                Some(operator) => Command::set("+COPS").int(1).int(2).str(operator),
                None => Command::set("+COPS").int(0),
            };
            at.send(&cops.timeout(REGISTRATION_TIMEOUT).abortable())
                .await?;
        }

        let reg_type = with_timeout(REGISTRATION_TIMEOUT, self.shared.wait_registration())
            .await
            .map_err(|_| Error::CommandTimeout)??;

        if reg_type == RegType::Cgreg {
            // GSM attach: no PSM on this session.
            info!("registered on GSM");
            self.shared.set_link_flags(false, false);
        } else {
            info!("registered on LTE");
        }
        Ok(())
    }

    /// Reconnect after a PSM wake: the modem kept its registration, so
    /// only the registration latch is re-armed.
    pub async fn connect_psm(&self) -> Result<(), Error> {
        if self.shared.psm_handler_once() {
            self.session.register_urc("+QPSMTIMER", note_psm_timer);
        }
        self.wait_alive(ALIVE_TIMEOUT).await?;
        self.shared.set_phase(SessionPhase::Registering);
        match self.register().await {
            Ok(()) => {
                let mut at = self.at.lock().await;
                M::on_connected(&mut at, &self.config).await?;
                drop(at);
                self.shared.set_phase(SessionPhase::Attached);
                Ok(())
            }
            Err(e) => {
                self.shared.set_phase(SessionPhase::Off);
                Err(e)
            }
        }
    }

    /// Orderly teardown of the data session: sockets dropped, modem told
    /// to power down (or enter PSM), with a hard pulse as backstop. The AT
    /// session itself stays usable for a later `open_network`.
    pub async fn close_network(&self) -> Result<(), Error> {
        self.shared.set_phase(SessionPhase::Detaching);
        self.sockets.close_all();

        let psm_sleep =
            self.shared.use_psm() && self.shared.is_lte() && self.shared.registration().is_registered();

        self.shared.set_phase(SessionPhase::Closing);
        {
            let mut at = self.at.lock().await;
            let res = if psm_sleep {
                debug!("entering PSM instead of powering off");
                M::enter_psm(&mut at).await
            } else {
                M::power_off(&mut at).await
            };
            if let Err(e) = res {
                // Keep tearing down; the hard pulse below is the backstop.
                warn!("power-off command failed: {:?}", e);
            }
        }

        if !psm_sleep {
            Timer::after(Duration::from_secs(1)).await;
            if !self.is_powered_off().await {
                warn!("module still powered after AT power-off, pulsing the line");
                self.hard_power_off().await;
            }
        }

        self.shared.reg_reset();
        self.shared.set_phase(SessionPhase::Off);
        Ok(())
    }

    /// Full driver teardown: close the network, stop the AT session, park
    /// the control lines. Everything afterwards fails with `Closed`.
    pub async fn close(&self) -> Result<(), Error> {
        let res = self.close_network().await;
        self.session.close();
        self.release_pins().await;
        res
    }

    /// RSSI/BER as reported by `+CSQ` (99 meaning unknown).
    pub async fn signal_quality(&self) -> Result<(u8, u8), Error> {
        let resp = self.at_handle().send(&Command::action("+CSQ")).await?;
        let line = resp.single().map_err(Error::from)?;
        Ok((line.int(0)? as u8, line.int(1)? as u8))
    }

    /// SIM ICCID.
    pub async fn iccid(&self) -> Result<String<22>, Error> {
        let resp = self
            .at_handle()
            .send(&Command::action(M::CCID_VERB))
            .await?;
        let line = resp.single().map_err(Error::from)?;
        match line.values.first() {
            Some(crate::at::AtValue::Str(s)) => {
                String::from_str(s.as_str()).map_err(|_| Error::Overflow)
            }
            Some(crate::at::AtValue::Int(v)) => {
                let mut out = String::new();
                core::fmt::write(&mut out, format_args!("{}", v)).map_err(|_| Error::Overflow)?;
                Ok(out)
            }
            _ => Err(Error::Parse),
        }
    }

    /// Module model identifier (`+CGMM`).
    pub async fn model(&self) -> Result<String<32>, Error> {
        self.text_query("+CGMM").await
    }

    /// Module firmware revision (`+CGMR`).
    pub async fn firmware_version(&self) -> Result<String<32>, Error> {
        self.text_query("+CGMR").await
    }

    async fn text_query(&self, verb: &str) -> Result<String<32>, Error> {
        let resp = self.at_handle().send(&Command::action(verb)).await?;
        let line = resp.lines.first().ok_or(Error::Parse)?;
        let text = line.str(0).map_err(Error::from)?;
        String::from_str(&text[..text.len().min(32)]).map_err(|_| Error::Parse)
    }
}
