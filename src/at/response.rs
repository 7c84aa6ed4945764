use core::str::FromStr;

use heapless::{String, Vec};

use super::Error;

pub const VERB_LEN: usize = 20;
pub const VALUE_LEN: usize = 64;
pub const MAX_VALUES: usize = 8;
pub const MAX_LINES: usize = 6;

/// Raw line cap for the framer. Sized for u-blox hex-mode socket reads,
/// which inline up to 1024 payload bytes as hex on one line.
pub const LINE_LEN: usize = 2176;

/// Upper bound on one framed binary payload. Covers the largest single
/// read any module issues (1500 bytes on Quectel/Sequans).
pub const PAYLOAD_LEN: usize = 1536;

pub type PayloadBuf = Vec<u8, PAYLOAD_LEN>;

/// One parsed field of an information line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AtValue {
    Int(i64),
    /// Quoted string (quotes stripped), bare keyword, or a parenthesised
    /// list kept verbatim.
    Str(String<VALUE_LEN>),
    /// Empty positional slot.
    Null,
}

impl AtValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AtValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AtValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// A parsed `+VERB: a,b,"c"` line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InfoLine {
    pub verb: String<VERB_LEN>,
    pub values: Vec<AtValue, MAX_VALUES>,
}

impl InfoLine {
    pub fn int(&self, index: usize) -> Result<i64, Error> {
        self.values
            .get(index)
            .and_then(AtValue::as_int)
            .ok_or(Error::Parse)
    }

    pub fn str(&self, index: usize) -> Result<&str, Error> {
        self.values
            .get(index)
            .and_then(AtValue::as_str)
            .ok_or(Error::Parse)
    }
}

/// How the bytes following an information line are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRule {
    /// Nothing follows; the next byte starts a new line.
    None,
    /// `values[len_index]` raw bytes follow the line terminator
    /// (`+QIRD: <len>\r\n<bytes>` and friends).
    LengthValue { len_index: usize },
}

/// Splits the text after `: ` into values, optionally producing a decoded
/// payload (u-blox hex-mode reads carry data inline as a hex string).
pub type SplitFn = fn(&str, &mut Vec<AtValue, MAX_VALUES>, &mut PayloadBuf) -> Result<(), Error>;

/// Per-verb parsing override registered by the module shim.
#[derive(Clone, Copy)]
pub struct ResponseParser {
    pub verb: &'static str,
    pub payload: PayloadRule,
    pub split: Option<SplitFn>,
}

impl ResponseParser {
    pub const fn plain(verb: &'static str) -> Self {
        Self {
            verb,
            payload: PayloadRule::None,
            split: None,
        }
    }

    pub const fn length_prefixed(verb: &'static str, len_index: usize) -> Self {
        Self {
            verb,
            payload: PayloadRule::LengthValue { len_index },
            split: None,
        }
    }

    pub const fn custom(verb: &'static str, split: SplitFn) -> Self {
        Self {
            verb,
            payload: PayloadRule::None,
            split: Some(split),
        }
    }
}

/// A final error line, e.g. `+CME ERROR: 17` or plain `ERROR`, together
/// with the verb of the command it failed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AtErrorLine {
    pub verb: String<VERB_LEN>,
    /// Numeric CME/CMS code when the modem reported one, 0 otherwise.
    pub code: u16,
    pub message: String<VALUE_LEN>,
}

impl AtErrorLine {
    pub(crate) fn from_final(verb: &str, line: &str) -> Self {
        let mut out = Self {
            verb: String::from_str(&verb[..verb.len().min(VERB_LEN)]).unwrap_or_default(),
            code: 0,
            message: String::new(),
        };
        let detail = line
            .split_once(':')
            .map(|(_, rest)| rest.trim())
            .unwrap_or("");
        match detail.parse::<u16>() {
            Ok(code) => out.code = code,
            Err(_) => {
                out.message = String::from_str(&detail[..detail.len().min(VALUE_LEN)])
                    .unwrap_or_default();
            }
        }
        out
    }

    pub(crate) fn aborted(&self) -> bool {
        // BG96 and SARA report "Command aborted" as text; some firmwares
        // use CME code 100 ("unknown") for the same condition.
        self.message.as_str().eq_ignore_ascii_case("command aborted")
    }
}

/// Everything accumulated for one command.
#[derive(Debug, Clone, Default)]
pub struct AtResponse {
    /// The terminating status line (`OK`, `SEND OK`, `CONNECT`, ...).
    pub code: String<VALUE_LEN>,
    /// Information lines, in arrival order.
    pub lines: Vec<InfoLine, MAX_LINES>,
    /// Binary payload of the response, when the verb's parser produced one.
    pub payload: Option<PayloadBuf>,
}

impl AtResponse {
    /// The most recent information line.
    pub fn last(&self) -> Option<&InfoLine> {
        self.lines.last()
    }

    /// Asserts exactly one information line and returns it.
    pub fn single(&self) -> Result<&InfoLine, Error> {
        match self.lines.len() {
            1 => Ok(&self.lines[0]),
            _ => Err(Error::Parse),
        }
    }

    pub fn take_payload(&mut self) -> PayloadBuf {
        self.payload.take().unwrap_or_default()
    }
}

/// Line categories the framer distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineClass<'a> {
    Final { ok: bool },
    Info { verb: &'a str, rest: &'a str },
    /// Free-standing text, e.g. the model name answering `AT+CGMM`.
    Bare,
}

/// A termination entry matches a line either exactly, or as a prefix when
/// the entry ends with `:` (`+CME ERROR:`).
fn matches_termination(line: &str, term: &str) -> bool {
    if term.ends_with(':') {
        line.starts_with(term)
    } else {
        line == term
    }
}

pub(crate) fn classify<'a>(
    line: &'a str,
    ok_terms: &[&str],
    err_terms: &[&str],
) -> LineClass<'a> {
    if err_terms.iter().any(|t| matches_termination(line, t)) {
        return LineClass::Final { ok: false };
    }
    if ok_terms.iter().any(|t| matches_termination(line, t)) {
        return LineClass::Final { ok: true };
    }
    if let Some((verb, rest)) = split_info(line) {
        return LineClass::Info { verb, rest };
    }
    LineClass::Bare
}

/// Splits `+VERB: rest`; returns `None` for anything else.
pub(crate) fn split_info(line: &str) -> Option<(&str, &str)> {
    if !line.starts_with('+') {
        return None;
    }
    let colon = line.find(':')?;
    let verb = &line[..colon];
    if verb.len() > VERB_LEN || verb[1..].contains(' ') {
        return None;
    }
    Some((verb, line[colon + 1..].trim_start()))
}

/// Default CSV splitter: quoted strings are unescaped, bare integers become
/// `Int`, empty slots `Null`, and anything else (keywords, parenthesised
/// lists) is kept as `Str`.
pub(crate) fn split_values(rest: &str, out: &mut Vec<AtValue, MAX_VALUES>) -> Result<(), Error> {
    let mut remaining = rest.trim_end();
    if remaining.is_empty() {
        return Ok(());
    }
    loop {
        let consumed = if let Some(stripped) = remaining.strip_prefix('"') {
            let end = stripped.find('"').ok_or(Error::Parse)?;
            let field = &stripped[..end];
            out.push(AtValue::Str(
                String::from_str(&field[..field.len().min(VALUE_LEN)]).unwrap_or_default(),
            ))
            .map_err(|_| Error::Overflow)?;
            end + 2
        } else {
            let end = remaining.find(',').unwrap_or(remaining.len());
            let field = remaining[..end].trim();
            // Leading zeros are significant (scan sequences, PSM timer
            // strings); keep such fields textual.
            let zero_padded = field.len() > 1 && field.starts_with('0');
            let value = if field.is_empty() {
                AtValue::Null
            } else if let (false, Ok(v)) = (zero_padded, i64::from_str(field)) {
                AtValue::Int(v)
            } else {
                AtValue::Str(
                    String::from_str(&field[..field.len().min(VALUE_LEN)]).unwrap_or_default(),
                )
            };
            out.push(value).map_err(|_| Error::Overflow)?;
            end
        };
        if consumed >= remaining.len() {
            break;
        }
        // Skip the separating comma.
        remaining = &remaining[consumed..];
        match remaining.strip_prefix(',') {
            Some(rest) => {
                if rest.is_empty() {
                    out.push(AtValue::Null).map_err(|_| Error::Overflow)?;
                    break;
                }
                remaining = rest;
            }
            None => return Err(Error::Parse),
        }
    }
    Ok(())
}
