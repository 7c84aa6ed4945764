use core::convert::Infallible;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin, PinState};
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

/// Placeholder for an unwired control line.
pub struct NoPin;

impl ErrorType for NoPin {
    type Error = Infallible;
}

impl InputPin for NoPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Inverting wrapper for active-low wiring of power/reset lines.
pub struct ReverseOutputPin<P: OutputPin<Error = Infallible>>(pub P);

impl<P: OutputPin<Error = Infallible>> ErrorType for ReverseOutputPin<P> {
    type Error = Infallible;
}

impl<P: OutputPin<Error = Infallible>> OutputPin for ReverseOutputPin<P> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_high()
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_low()
    }

    fn set_state(&mut self, state: PinState) -> Result<(), Self::Error> {
        match state {
            PinState::Low => self.0.set_state(PinState::High),
            PinState::High => self.0.set_state(PinState::Low),
        }
    }
}

/// Inverting wrapper for active-low sense inputs.
pub struct ReverseInputPin<P: InputPin<Error = Infallible>>(pub P);

impl<P: InputPin<Error = Infallible>> ErrorType for ReverseInputPin<P> {
    type Error = Infallible;
}

impl<P: InputPin<Error = Infallible>> InputPin for ReverseInputPin<P> {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.0.is_low()
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.0.is_high()
    }
}

/// Board-level wiring: the control lines around the UART, and the knob to
/// retune the UART itself during baud discovery.
pub trait CellularConfig {
    type ResetPin: OutputPin;
    type PowerPin: OutputPin;
    type VintPin: InputPin;
    type RxSensePin: InputPin;

    fn reset_pin(&mut self) -> Option<&mut Self::ResetPin>;
    fn power_pin(&mut self) -> Option<&mut Self::PowerPin>;
    /// Module power-state feedback line, when wired.
    fn vint_pin(&mut self) -> Option<&mut Self::VintPin>;
    /// Modem-TX sense line used for the quiescence check at teardown.
    fn rx_sense_pin(&mut self) -> Option<&mut Self::RxSensePin>;

    /// Retune the host UART.
    fn set_baud_rate(&mut self, baud: u32);
}

/// Radio access technologies, in the numbering the configuration map uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rat {
    LteM = 1,
    NbIot = 2,
    Gsm = 3,
}

/// Requested power-saving mode timers, as `+CPSMS` bit strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PsmConfig {
    /// Requested periodic TAU (T3412), e.g. `"00101011"`.
    pub periodic_tau: String<8>,
    /// Requested active time (T3324).
    pub active_time: String<8>,
}

pub const MAX_BANDS: usize = 24;
pub const MAX_RATS: usize = 3;
pub const MAX_BAUD_RATES: usize = 4;

/// Session-machine settings, populated from the host's configuration map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub apn: String<64>,
    /// Numeric operator for manual `+COPS` selection; automatic when empty.
    pub operator: Option<String<16>>,
    /// 1-based LTE band numbers, scan order preserved.
    pub bands: Vec<u8, MAX_BANDS>,
    /// RAT preference order.
    pub rats: Vec<Rat, MAX_RATS>,
    /// Candidate UART rates, preferred first; module defaults when empty.
    pub baud_rates: Vec<u32, MAX_BAUD_RATES>,
    pub psm: Option<PsmConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub const fn new() -> Self {
        Self {
            apn: String::new(),
            operator: None,
            bands: Vec::new(),
            rats: Vec::new(),
            baud_rates: Vec::new(),
            psm: None,
        }
    }

    pub fn with_apn(mut self, apn: &str) -> Self {
        self.apn = String::try_from(apn).unwrap_or_default();
        self
    }

    pub fn with_operator(mut self, operator: &str) -> Self {
        self.operator = String::try_from(operator).ok();
        self
    }

    pub fn with_bands(mut self, bands: &[u8]) -> Self {
        self.bands = Vec::from_slice(bands).unwrap_or_default();
        self
    }

    pub fn with_rats(mut self, rats: &[Rat]) -> Self {
        self.rats = Vec::from_slice(rats).unwrap_or_default();
        self
    }

    pub fn with_baud_rates(mut self, rates: &[u32]) -> Self {
        self.baud_rates = Vec::from_slice(rates).unwrap_or_default();
        self
    }

    pub fn with_psm(mut self, psm: PsmConfig) -> Self {
        self.psm = Some(psm);
        self
    }
}

/// Persistence of the consecutive-failure counter. A torn write may lose
/// an increment but must never produce a non-integer; a single flash
/// key-value slot with per-key atomicity is sufficient.
pub trait AttemptsStore {
    fn load(&mut self) -> u16;
    fn store(&mut self, attempts: u16);
}

/// Volatile store; loses the reset/power-off cadence across reboots.
#[derive(Debug, Default)]
pub struct RamAttemptsStore(pub u16);

impl AttemptsStore for RamAttemptsStore {
    fn load(&mut self) -> u16 {
        self.0
    }

    fn store(&mut self, attempts: u16) {
        self.0 = attempts;
    }
}
