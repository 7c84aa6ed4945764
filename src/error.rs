use crate::at;

/// Driver-level error type, surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Final error line from the modem, with the reported code and text.
    At(at::AtErrorLine),
    /// No terminating line arrived before the command deadline.
    CommandTimeout,
    /// Transient modem condition (busy, out of memory, operation not
    /// allowed); the caller may retry.
    Unavailable,
    /// Unexpected socket-level error code reported by the modem.
    Unknown(u16),
    /// The network refused the attach; not retryable at this layer.
    RegistrationDenied,
    /// The network dropped an established registration.
    ConnectionLost,
    /// No free socket id in the module's range.
    ResourceExhausted,
    /// Datagram exceeds the module's per-send maximum.
    PayloadTooLarge,
    /// Socket used without a prior connect.
    NotConnected,
    /// Operation on a closed socket or session.
    Closed,
    /// Listening sockets and broadcast are not provided by these modules.
    Unimplemented,
    /// No working baud rate found during link bring-up.
    BaudDetection,
    /// The SIM never reported ready.
    SimTimeout,
    /// A modem response did not parse as expected.
    Parse,
    /// An internal fixed-capacity buffer was exceeded.
    Overflow,
    /// The UART transport failed.
    Io,
}

impl From<at::Error> for Error {
    fn from(e: at::Error) -> Self {
        match e {
            at::Error::Response(line) => Error::At(line),
            at::Error::Timeout => Error::CommandTimeout,
            at::Error::Closed => Error::Closed,
            at::Error::Parse => Error::Parse,
            at::Error::Overflow => Error::Overflow,
            at::Error::Io => Error::Io,
        }
    }
}

impl embedded_io_async::Error for Error {
    fn kind(&self) -> embedded_io_async::ErrorKind {
        match self {
            Error::CommandTimeout => embedded_io_async::ErrorKind::TimedOut,
            Error::NotConnected | Error::Closed => embedded_io_async::ErrorKind::NotConnected,
            Error::ResourceExhausted => embedded_io_async::ErrorKind::OutOfMemory,
            Error::Unimplemented => embedded_io_async::ErrorKind::Unsupported,
            _ => embedded_io_async::ErrorKind::Other,
        }
    }
}
