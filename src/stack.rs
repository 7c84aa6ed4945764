//! Data-plane facade: sockets over the attached modem.

use core::convert::Infallible;
use core::marker::PhantomData;
use core::net::SocketAddr;

use embedded_io_async::Write;

use crate::config::{AttemptsStore, CellularConfig};
use crate::error::Error;
use crate::modules::Module;
use crate::network::Device;
use crate::socket::SocketKind;
#[cfg(feature = "socket-tcp")]
use crate::socket::TcpSocket;
#[cfg(feature = "socket-udp")]
use crate::socket::UdpSocket;
use crate::state::SessionPhase;

impl<'d, M: Module, W: Write, C: CellularConfig, S: AttemptsStore> Device<'d, M, W, C, S> {
    fn check_attached(&self) -> Result<(), Error> {
        match self.phase() {
            SessionPhase::Attached => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    /// Open a TCP connection to `remote`. On failure no socket entry is
    /// left behind.
    #[cfg(feature = "socket-tcp")]
    pub async fn tcp_connect(
        &self,
        remote: SocketAddr,
    ) -> Result<TcpSocket<'_, 'd, M, W>, Error> {
        self.check_attached()?;
        let at = self.at_handle();
        let id = M::socket_create(at, self.sockets, SocketKind::Tcp).await?;

        let connected = if M::SERIALIZE_CONNECT {
            let _guard = self.connect_lock.lock().await;
            M::tcp_connect(at, self.sockets, id, remote).await
        } else {
            M::tcp_connect(at, self.sockets, id, remote).await
        };

        match connected {
            Ok(()) => Ok(TcpSocket {
                id,
                at,
                sockets: self.sockets,
                _module: PhantomData,
            }),
            Err(e) => {
                self.sockets.remove(id);
                // Best effort: drop whatever half-open state the modem
                // kept for the id.
                M::socket_close(at, id).await.ok();
                Err(e)
            }
        }
    }

    /// Open a UDP socket, optionally bound to a default remote.
    #[cfg(feature = "socket-udp")]
    pub async fn udp_open(
        &self,
        remote: Option<SocketAddr>,
    ) -> Result<UdpSocket<'_, 'd, M, W>, Error> {
        self.check_attached()?;
        let at = self.at_handle();
        let id = M::socket_create(at, self.sockets, SocketKind::Udp).await?;
        let mut socket = UdpSocket {
            id,
            at,
            sockets: self.sockets,
            _module: PhantomData,
        };
        if let Some(remote) = remote {
            socket.connect(remote);
        }
        Ok(socket)
    }

    /// These modules provide no listening sockets.
    pub fn tcp_listen(&self, _port: u16) -> Result<Infallible, Error> {
        Err(Error::Unimplemented)
    }
}
