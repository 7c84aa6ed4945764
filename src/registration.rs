//! Network registration status, latched from `+CEREG`/`+CGREG` reports.

use crate::at::InfoLine;

/// Which report family a status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegType {
    /// `+CEREG`, EPS (LTE) registration.
    Cereg,
    /// `+CGREG`, GPRS (GSM) registration.
    Cgreg,
}

/// 3GPP registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    #[default]
    None,
    NotRegistering,
    Home,
    Searching,
    Denied,
    Unknown,
    Roaming,
    /// State 80: the network dropped an established registration.
    Lost,
}

impl From<u8> for Status {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::NotRegistering,
            1 => Self::Home,
            2 => Self::Searching,
            3 => Self::Denied,
            4 => Self::Unknown,
            5 => Self::Roaming,
            80 => Self::Lost,
            _ => Self::None,
        }
    }
}

impl Status {
    pub fn registered(&self) -> bool {
        matches!(self, Status::Home | Status::Roaming)
    }
}

/// Terminal result of a registration wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegOutcome {
    Registered(RegType),
    Denied,
    Lost,
}

/// Latch over both report families. LTE registration wins when both fire;
/// a GSM-first attach is reported so the caller can disable PSM.
#[derive(Debug, Clone, Default)]
pub struct RegistrationState {
    pub eps: Status,
    pub csd: Status,
}

impl RegistrationState {
    pub const fn new() -> Self {
        Self {
            eps: Status::None,
            csd: Status::None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn set(&mut self, reg_type: RegType, status: Status) {
        match reg_type {
            RegType::Cereg => self.eps = status,
            RegType::Cgreg => self.csd = status,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.eps.registered() || self.csd.registered()
    }

    pub fn outcome(&self) -> Option<RegOutcome> {
        if self.eps.registered() {
            return Some(RegOutcome::Registered(RegType::Cereg));
        }
        if self.csd.registered() {
            return Some(RegOutcome::Registered(RegType::Cgreg));
        }
        if self.eps == Status::Lost || self.csd == Status::Lost {
            return Some(RegOutcome::Lost);
        }
        if self.eps == Status::Denied || self.csd == Status::Denied {
            return Some(RegOutcome::Denied);
        }
        None
    }
}

/// Parse a `+CEREG`/`+CGREG` unsolicited report. The unsolicited form
/// leads with the stat value.
pub(crate) fn from_urc(line: &InfoLine) -> Option<(RegType, Status)> {
    let reg_type = match line.verb.as_str() {
        "+CEREG" => RegType::Cereg,
        "+CGREG" => RegType::Cgreg,
        _ => return None,
    };
    let stat = line.values.first()?.as_int()?;
    Some((reg_type, Status::from(stat as u8)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::response::split_values;
    use core::str::FromStr;
    use heapless::{String, Vec};

    fn line(verb: &str, rest: &str) -> InfoLine {
        let mut values = Vec::new();
        split_values(rest, &mut values).unwrap();
        InfoLine {
            verb: String::from_str(verb).unwrap(),
            values,
        }
    }

    #[test]
    fn urc_parse() {
        assert_eq!(
            from_urc(&line("+CEREG", "5,\"54DB\",\"0F6B0578\",7")),
            Some((RegType::Cereg, Status::Roaming))
        );
        assert_eq!(
            from_urc(&line("+CGREG", "1")),
            Some((RegType::Cgreg, Status::Home))
        );
        assert_eq!(from_urc(&line("+CSQ", "24,99")), None);
    }

    #[test]
    fn latch_outcomes() {
        let mut reg = RegistrationState::new();
        assert_eq!(reg.outcome(), None);

        reg.set(RegType::Cereg, Status::Searching);
        assert_eq!(reg.outcome(), None);

        reg.set(RegType::Cgreg, Status::Home);
        assert_eq!(reg.outcome(), Some(RegOutcome::Registered(RegType::Cgreg)));

        // LTE takes precedence once it lands.
        reg.set(RegType::Cereg, Status::Roaming);
        assert_eq!(reg.outcome(), Some(RegOutcome::Registered(RegType::Cereg)));

        reg.reset();
        reg.set(RegType::Cereg, Status::Denied);
        assert_eq!(reg.outcome(), Some(RegOutcome::Denied));

        reg.reset();
        reg.set(RegType::Cereg, Status::from(80));
        assert_eq!(reg.outcome(), Some(RegOutcome::Lost));
    }
}
