use embassy_time::Duration;

/// Power and reset line timing for one module family.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Low time of `PWR_ON` to trigger switch-on from power off.
    pub pwr_on_pull: Duration,
    /// Low time of `PWR_ON` to trigger a graceful switch-off.
    pub pwr_off_pull: Duration,
    /// Wait after the power-on pulse before the AT interface is probed.
    pub boot_wait: Duration,
    /// Low time of `RESET_N` to reboot the module.
    pub reset_hold: Duration,
    /// Wait for an organised power-down before pulling the plug.
    pub power_down_wait: Duration,
    /// Idle time between the end of one AT command and the next.
    pub command_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            pwr_on_pull: Duration::from_millis(150),
            pwr_off_pull: Duration::from_secs(1),
            boot_wait: Duration::from_secs(5),
            reset_hold: Duration::from_millis(100),
            power_down_wait: Duration::from_secs(35),
            command_delay: Duration::from_millis(100),
        }
    }
}
