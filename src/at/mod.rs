//! AT command/response protocol engine.
//!
//! Split into a writer half ([`AtSession`]) that serializes commands and a
//! reader half ([`Ingress`]) that frames lines, matches responses and
//! dispatches unsolicited result codes. [`AtHandle`] is the mutual-exclusion
//! wrapper tasks go through to issue commands.

pub mod command;
pub mod response;
mod session;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embedded_io_async::Write;

pub use command::{CmdKind, Command, Param};
pub use response::{
    AtErrorLine, AtResponse, AtValue, InfoLine, PayloadBuf, PayloadRule, ResponseParser,
};
pub use session::{AtSession, Ingress, PauseGuard, SessionShared, UrcHandler};

pub(crate) use session::Frame;

/// AT-layer failures. Converted into [`crate::error::Error`] at the driver
/// surface.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The modem answered with an error termination.
    Response(AtErrorLine),
    /// No terminating line before the command deadline.
    Timeout,
    /// The session has been torn down.
    Closed,
    Parse,
    Overflow,
    Io,
}

pub(crate) type AtMutex<'d, W> = Mutex<NoopRawMutex, AtSession<'d, W>>;

/// Guarded access to the session: one task sends commands at a time, the
/// guard releases on every exit path. URC delivery is unaffected by the
/// lock since the reader half runs independently.
pub struct AtHandle<'a, 'd, W: Write> {
    pub(crate) mutex: &'a AtMutex<'d, W>,
    pub(crate) shared: &'a SessionShared,
}

impl<'a, 'd, W: Write> core::fmt::Debug for AtHandle<'a, 'd, W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtHandle").finish_non_exhaustive()
    }
}

impl<'a, 'd, W: Write> Clone for AtHandle<'a, 'd, W> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, 'd, W: Write> Copy for AtHandle<'a, 'd, W> {}

impl<'a, 'd, W: Write> AtHandle<'a, 'd, W> {
    /// Acquire the session. Do not call while already holding a guard on
    /// the same handle; the lock is not re-entrant.
    pub async fn lock(&self) -> Result<MutexGuard<'a, NoopRawMutex, AtSession<'d, W>>, Error> {
        if self.shared.is_closed() {
            return Err(Error::Closed);
        }
        Ok(self.mutex.lock().await)
    }

    /// Convenience: lock, send one command, release.
    pub async fn send(&self, cmd: &Command<'_>) -> Result<AtResponse, Error> {
        self.lock().await?.send(cmd).await
    }
}
