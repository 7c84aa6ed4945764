use core::marker::PhantomData;
use core::net::SocketAddr;

use embassy_futures::yield_now;
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;

use crate::at::AtHandle;
use crate::error::Error;
use crate::modules::Module;

use super::{SocketId, SocketSet, CLOSED, CONNECTED, READABLE};

/// A connected TCP stream multiplexed over the modem's socket API.
///
/// Readiness and closure are driven by unsolicited reports; reads block on
/// the READABLE bit and drain the modem buffer with the vendor read verb.
pub struct TcpSocket<'a, 'd, M: Module, W: Write> {
    pub(crate) id: SocketId,
    pub(crate) at: AtHandle<'a, 'd, W>,
    pub(crate) sockets: &'a SocketSet,
    pub(crate) _module: PhantomData<M>,
}

impl<'a, 'd, M: Module, W: Write> core::fmt::Debug for TcpSocket<'a, 'd, M, W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TcpSocket").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<'a, 'd, M: Module, W: Write> TcpSocket<'a, 'd, M, W> {
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.sockets.peer_of(self.id)
    }

    /// Largest payload one send command carries.
    pub fn mtu(&self) -> usize {
        M::TCP_CHUNK
    }

    /// Read into `buf`. Returns `Ok(0)` at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let state = self.sockets.wait_for(self.id, READABLE | CLOSED).await;
            if state & CLOSED != 0 {
                return Ok(0);
            }
            let want = buf.len().min(M::READ_CHUNK);
            let n = M::socket_read(self.at, self.id, want, buf).await?;
            if n == 0 {
                // Buffer drained; wait for the next readable edge.
                self.sockets.clear(self.id, READABLE);
                continue;
            }
            return Ok(n);
        }
    }

    /// Write at most one vendor-sized chunk. Returns 0 (after a short
    /// back-off) under outbound buffer pressure; the caller retries.
    pub async fn try_write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.sockets.state_of(self.id);
        if state & CLOSED != 0 {
            return Err(Error::Closed);
        }
        if state & CONNECTED == 0 {
            return Err(Error::NotConnected);
        }

        let chunk = &buf[..buf.len().min(M::TCP_CHUNK)];

        if !M::can_send(self.at, self.id, chunk.len()).await? {
            Timer::after(Duration::from_millis(100)).await;
            return Ok(0);
        }

        if let Err(e) = M::tcp_send(self.at, self.id, chunk).await {
            // A failure mid-send leaves the modem in an unknown framing
            // state; the whole session is compromised.
            error!("send failed on socket {}, closing session", self.id.0);
            self.at.shared.close();
            self.sockets.mark_closed(self.id);
            return Err(e);
        }

        // Let the reader task run before the next chunk.
        yield_now().await;
        Ok(chunk.len())
    }

    /// Write the whole buffer, retrying through back-pressure.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = self.try_write(&buf[sent..]).await?;
            sent += n;
        }
        Ok(buf.len())
    }

    /// Close the socket and remove it from the multiplexer map.
    pub async fn close(self) -> Result<(), Error> {
        close_socket::<M, W>(self.at, self.sockets, self.id).await
    }
}

/// Shared close path for both socket types: transition to CLOSED exactly
/// once, issue the vendor close verb, always drop the map entry.
pub(crate) async fn close_socket<M: Module, W: Write>(
    at: AtHandle<'_, '_, W>,
    sockets: &SocketSet,
    id: SocketId,
) -> Result<(), Error> {
    let already_closed = sockets.mark_closed(id);
    let pdp_deact = sockets.pdp_deact(id);

    let res = async {
        if pdp_deact {
            M::deactivate_pdp(at).await?;
        }
        if already_closed && sockets.kind_of(id).is_none() {
            // Torn down by close_all; nothing left to tell the modem.
            return Ok(());
        }
        M::socket_close(at, id).await
    }
    .await;

    sockets.remove(id);

    match res {
        // Benign race: the modem closed the socket (and said so with a URC)
        // while our close command was in flight.
        Err(Error::Unavailable) => Ok(()),
        Err(Error::At(line)) if line.code == 3 => Ok(()),
        other => other,
    }
}

impl<'a, 'd, M: Module, W: Write> embedded_io_async::ErrorType for TcpSocket<'a, 'd, M, W> {
    type Error = Error;
}

impl<'a, 'd, M: Module, W: Write> embedded_io_async::Read for TcpSocket<'a, 'd, M, W> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        TcpSocket::read(self, buf).await
    }
}

impl<'a, 'd, M: Module, W: Write> embedded_io_async::Write for TcpSocket<'a, 'd, M, W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        loop {
            let n = self.try_write(buf).await?;
            if n > 0 {
                return Ok(n);
            }
        }
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
