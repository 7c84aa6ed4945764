//! Power and reset line sequencing.

use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_io_async::Write;

use crate::config::{AttemptsStore, CellularConfig};
use crate::modules::Module;
use crate::network::Device;

/// A line level must hold this long to count as settled.
const QUIESCENT_WINDOW: Duration = Duration::from_millis(100);
const QUIESCENT_TIMEOUT: Duration = Duration::from_secs(2);
const QUIESCENT_POLL: Duration = Duration::from_millis(10);

impl<'d, M: Module, W: Write, C: CellularConfig, S: AttemptsStore> Device<'d, M, W, C, S> {
    /// Pulse `PWR_ON` with the module's switch-on timing, then give it its
    /// boot time.
    pub(crate) async fn power_on(&self) {
        let timings = M::timings();
        {
            let mut hw = self.hw.lock().await;
            if let Some(vint) = hw.vint_pin() {
                if vint.is_high().unwrap_or(false) {
                    debug!("module is already powered");
                    return;
                }
            }
            if let Some(pwr) = hw.power_pin() {
                trace!("pulsing power-on for {} ms", timings.pwr_on_pull.as_millis());
                pwr.set_low().ok();
                Timer::after(timings.pwr_on_pull).await;
                pwr.set_high().ok();
            }
        }
        Timer::after(timings.boot_wait).await;
    }

    /// Unconditional switch-off pulse.
    pub(crate) async fn hard_power_off(&self) {
        let timings = M::timings();
        let mut hw = self.hw.lock().await;
        if let Some(pwr) = hw.power_pin() {
            trace!("pulsing power-off for {} ms", timings.pwr_off_pull.as_millis());
            pwr.set_low().ok();
            Timer::after(timings.pwr_off_pull).await;
            pwr.set_high().ok();
        }
    }

    /// Reset via `RESET_N`, where wired. Clears module NVM on some chips.
    pub async fn hard_reset(&self) {
        let timings = M::timings();
        {
            let mut hw = self.hw.lock().await;
            if let Some(rst) = hw.reset_pin() {
                rst.set_low().ok();
                Timer::after(timings.reset_hold).await;
                rst.set_high().ok();
            }
        }
        Timer::after(timings.boot_wait).await;
    }

    /// Probe whether the module is actually off: the power-state feedback
    /// line where wired, an unanswered ping otherwise.
    pub(crate) async fn is_powered_off(&self) -> bool {
        {
            let mut hw = self.hw.lock().await;
            if let Some(vint) = hw.vint_pin() {
                return vint.is_low().unwrap_or(false);
            }
        }
        self.wait_alive(Duration::from_secs(2)).await.is_err()
    }

    /// Wait for the modem's TX line to settle, then leave the control
    /// lines alone. Part of the shutdown contract: releasing the UART
    /// while the modem still talks glitches some boards.
    pub(crate) async fn release_pins(&self) {
        let mut hw = self.hw.lock().await;
        if let Some(rx) = hw.rx_sense_pin() {
            wait_quiescent(rx).await;
        }
    }
}

async fn wait_quiescent<P: InputPin>(pin: &mut P) {
    let deadline = Instant::now() + QUIESCENT_TIMEOUT;
    let mut level = pin.is_high().unwrap_or(true);
    let mut stable_since = Instant::now();
    while Instant::now() < deadline {
        Timer::after(QUIESCENT_POLL).await;
        let current = pin.is_high().unwrap_or(true);
        if current != level {
            level = current;
            stable_since = Instant::now();
        } else if Instant::now() - stable_since >= QUIESCENT_WINDOW {
            return;
        }
    }
    warn!("line never settled before release");
}
