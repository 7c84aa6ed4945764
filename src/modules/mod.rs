//! Per-chip shims: verb sets, parsers, timing constants, band masks, PSM
//! targets and the socket command flows.

pub mod bg96;
pub mod monarch;
pub mod sara_r4;
pub mod sara_r5;

use core::net::{IpAddr, SocketAddr};

use embedded_io_async::Write;
use heapless::Vec;

use crate::at::{AtHandle, AtSession, Command, InfoLine, ResponseParser};
use crate::config::Config;
use crate::error::Error;
use crate::module_timing::Timings;
use crate::socket::{SocketId, SocketKind, SocketSet};
use crate::state::{DriverShared, Event, MAX_DNS_ADDRS};

pub use bg96::Bg96;
pub use monarch::Monarch;
pub use sara_r4::SaraR4;
pub use sara_r5::SaraR5;

/// Result of one pass of the configuration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigOutcome {
    /// Nothing had to be written; the loop terminates.
    Unchanged,
    /// Settings were written; run another pass to verify.
    Changed,
    /// A written setting only takes effect after a module reboot.
    RebootRequired,
}

/// Everything chip-specific the driver core needs.
///
/// The core owns power sequencing, the configuration loop, registration and
/// the socket state machine; implementations of this trait supply the verbs
/// and quirks of one modem family.
pub trait Module {
    const MODEL: &'static str;

    const SOCKET_ID_BASE: u8;
    const SOCKET_COUNT: usize;
    /// Largest payload of a single TCP send command.
    const TCP_CHUNK: usize;
    /// Largest datagram a single UDP send accepts.
    const UDP_MTU: usize;
    /// Largest single read request.
    const READ_CHUNK: usize;
    /// The chip permits only one connecting TCP socket at a time.
    const SERIALIZE_CONNECT: bool = false;
    /// Byte the modem emits to request a binary payload.
    const DATA_MARKER: u8 = b'>';
    /// Pacing between payload bytes, for chips that drop unpaced input.
    const DATA_BYTE_DELAY: Option<embassy_time::Duration> = None;
    /// `+CFUN` target taking the radio offline for configuration.
    const RADIO_OFF_FUN: u8 = 0;
    const SUPPORTS_GSM: bool = false;
    /// ICCID query verb (`+QCCID`/`+CCID`/`+SQNCCID`).
    const CCID_VERB: &'static str;

    fn timings() -> Timings;

    /// Candidate UART rates, preferred first.
    fn baud_rates() -> &'static [u32] {
        &[115_200]
    }

    /// Vendor additions to the `OK` termination set.
    fn ok_terminations() -> &'static [&'static str] {
        &[]
    }

    /// Vendor additions to the error termination set.
    fn error_terminations() -> &'static [&'static str] {
        &[]
    }

    /// Verbs that arrive unsolicited and must never be attributed to a
    /// command response.
    fn urc_verbs() -> &'static [&'static str];

    /// Per-verb parsing overrides (binary payload framing etc).
    fn response_parsers() -> &'static [ResponseParser] {
        &[]
    }

    /// Turn an unsolicited line into a typed event, applied on the reader
    /// task.
    fn translate_urc(line: &InfoLine) -> Option<Event>;

    /// Switch and (where supported) persist the UART rate.
    async fn set_baud<W: Write>(at: &mut AtSession<'_, W>, baud: u32) -> Result<(), Error>;

    /// One idempotent configuration pass: RAT selection, band mask, APN,
    /// PSM. Writes only what differs from the reported state.
    async fn configure<W: Write>(
        at: &mut AtSession<'_, W>,
        config: &Config,
    ) -> Result<ConfigOutcome, Error>;

    /// Hook run after successful registration (PDP context activation).
    async fn on_connected<W: Write>(
        _at: &mut AtSession<'_, W>,
        _config: &Config,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Vendor power-off verb.
    async fn power_off<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error>;

    /// Software reboot.
    async fn soft_reset<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error> {
        at.send(
            &Command::set("+CFUN")
                .int(15)
                .timeout(embassy_time::Duration::from_secs(3)),
        )
        .await?;
        Ok(())
    }

    /// Put the module to PSM sleep instead of powering off.
    async fn enter_psm<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error> {
        Self::power_off(at).await
    }

    /// Allocate a socket id, issuing the vendor create verb where the chip
    /// assigns ids itself.
    async fn socket_create<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        kind: SocketKind,
    ) -> Result<SocketId, Error>;

    /// Issue the vendor TCP connect flow; resolves once the socket is
    /// CONNECTED (or failed) according to the chip's completion style.
    async fn tcp_connect<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        remote: SocketAddr,
    ) -> Result<(), Error>;

    /// Outbound buffer check before a TCP send; `false` asks the caller to
    /// back off.
    async fn can_send<W: Write>(
        _at: AtHandle<'_, '_, W>,
        _id: SocketId,
        _len: usize,
    ) -> Result<bool, Error> {
        Ok(true)
    }

    /// Send one chunk (at most `TCP_CHUNK` bytes) on a connected socket.
    async fn tcp_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Read up to `want` bytes into `buf`; `Ok(0)` means the modem buffer
    /// turned out to be empty.
    async fn socket_read<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        want: usize,
        buf: &mut [u8],
    ) -> Result<usize, Error>;

    /// Send a datagram to `remote`.
    async fn udp_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        remote: SocketAddr,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Receive one datagram; `None` when the modem buffer is empty.
    async fn udp_receive<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, Error>;

    /// Vendor close verb. "Operation not allowed" from a close race is
    /// tolerated by the caller.
    async fn socket_close<W: Write>(at: AtHandle<'_, '_, W>, id: SocketId) -> Result<(), Error>;

    /// Tear down the PDP context; used when a closed socket carries the
    /// deactivation flag.
    async fn deactivate_pdp<W: Write>(_at: AtHandle<'_, '_, W>) -> Result<(), Error> {
        Ok(())
    }

    /// Vendor DNS flow. Callers serialize through the resolver mutex.
    async fn resolve<W: Write>(
        at: AtHandle<'_, '_, W>,
        shared: &DriverShared,
        host: &str,
    ) -> Result<Vec<IpAddr, MAX_DNS_ADDRS>, Error>;
}

/// CME/vendor error codes that mean "try again later" rather than a broken
/// socket: operation not allowed, memory full, busy.
pub(crate) fn classify_vendor_error(code: u16) -> Error {
    match code {
        // CME 3 "operation not allowed", 20 "memory full"; Quectel 567 is
        // busy, 568 out of memory.
        3 | 20 | 256 | 567 | 568 => Error::Unavailable,
        code => Error::Unknown(code),
    }
}

/// Format an IP address or hostname argument the way the socket verbs
/// expect it (bare dotted quad / colon-hex, no brackets).
pub(crate) fn format_ip(addr: &IpAddr, out: &mut heapless::String<64>) {
    use core::fmt::Write as _;
    match addr {
        IpAddr::V4(v4) => write!(out, "{}", v4).ok(),
        IpAddr::V6(v6) => write!(out, "{}", v6).ok(),
    };
}
