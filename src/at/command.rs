use core::fmt::Write as _;

use embassy_time::Duration;
use heapless::{String, Vec};

use super::Error;

pub const MAX_PARAMS: usize = 8;

/// Command buffer size. Sized for u-blox hex-mode socket writes, which
/// inline up to 1024 payload bytes as 2048 hex characters.
pub const CMD_BUF_LEN: usize = 2176;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// The five AT command shapes these modules use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmdKind {
    /// `AT+VERB`
    Action,
    /// `AT+VERB?`
    Read,
    /// `AT+VERB=?`
    Test,
    /// `AT+VERB=p1,p2,...`
    Set,
    /// Pre-formatted text, sent as-is (after the `AT` prefix).
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Param<'a> {
    Int(i64),
    /// Emitted quoted.
    Str(&'a str),
    /// Emitted bare, for enum-like arguments the modem expects unquoted.
    Bare(&'a str),
    /// Empty positional slot.
    Null,
}

/// A single AT command, ready to be issued by the session.
#[derive(Debug, Clone)]
pub struct Command<'a> {
    pub verb: &'a str,
    pub kind: CmdKind,
    pub params: Vec<Param<'a>, MAX_PARAMS>,
    /// Binary payload written after the modem emits its data marker.
    pub data: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Long-running commands advertise that they may be aborted by the
    /// empty-ping flush protocol when their deadline fires.
    pub abortable: bool,
}

impl<'a> Command<'a> {
    fn new(verb: &'a str, kind: CmdKind) -> Self {
        Self {
            verb,
            kind,
            params: Vec::new(),
            data: None,
            timeout: DEFAULT_TIMEOUT,
            abortable: false,
        }
    }

    pub fn action(verb: &'a str) -> Self {
        Self::new(verb, CmdKind::Action)
    }

    pub fn read(verb: &'a str) -> Self {
        Self::new(verb, CmdKind::Read)
    }

    pub fn test(verb: &'a str) -> Self {
        Self::new(verb, CmdKind::Test)
    }

    pub fn set(verb: &'a str) -> Self {
        Self::new(verb, CmdKind::Set)
    }

    pub fn raw(text: &'a str) -> Self {
        Self::new(text, CmdKind::Raw)
    }

    pub fn int(mut self, v: i64) -> Self {
        unwrap!(self.params.push(Param::Int(v)).ok());
        self
    }

    pub fn str(mut self, v: &'a str) -> Self {
        unwrap!(self.params.push(Param::Str(v)).ok());
        self
    }

    pub fn bare(mut self, v: &'a str) -> Self {
        unwrap!(self.params.push(Param::Bare(v)).ok());
        self
    }

    pub fn null(mut self) -> Self {
        unwrap!(self.params.push(Param::Null).ok());
        self
    }

    pub fn data(mut self, data: &'a [u8]) -> Self {
        self.data = Some(data);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn abortable(mut self) -> Self {
        self.abortable = true;
        self
    }

    /// The verb information lines of the response are matched against.
    ///
    /// For `Raw` commands this is the text up to the first `=` or `?`.
    pub fn response_verb(&self) -> &str {
        match self.kind {
            CmdKind::Raw => {
                let end = self.verb.find(['=', '?']).unwrap_or(self.verb.len());
                &self.verb[..end]
            }
            _ => self.verb,
        }
    }

    /// Render the command, without the line terminator.
    pub fn format(&self, out: &mut String<CMD_BUF_LEN>) -> Result<(), Error> {
        out.clear();
        out.push_str("AT").map_err(|_| Error::Overflow)?;
        out.push_str(self.verb).map_err(|_| Error::Overflow)?;
        match self.kind {
            CmdKind::Action | CmdKind::Raw => {}
            CmdKind::Read => out.push('?').map_err(|_| Error::Overflow)?,
            CmdKind::Test => out.push_str("=?").map_err(|_| Error::Overflow)?,
            CmdKind::Set => {
                out.push('=').map_err(|_| Error::Overflow)?;
                for (i, param) in self.params.iter().enumerate() {
                    if i != 0 {
                        out.push(',').map_err(|_| Error::Overflow)?;
                    }
                    match param {
                        Param::Int(v) => write!(out, "{}", v).map_err(|_| Error::Overflow)?,
                        Param::Str(s) => write!(out, "\"{}\"", s).map_err(|_| Error::Overflow)?,
                        Param::Bare(s) => out.push_str(s).map_err(|_| Error::Overflow)?,
                        Param::Null => {}
                    }
                }
            }
        }
        Ok(())
    }
}
