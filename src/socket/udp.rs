use core::marker::PhantomData;
use core::net::SocketAddr;

use embedded_io_async::Write;

use crate::at::AtHandle;
use crate::error::Error;
use crate::modules::Module;

use super::tcp::close_socket;
use super::{SocketId, SocketSet, CLOSED, CONNECTED, READABLE};

/// A UDP socket multiplexed over the modem's socket API.
pub struct UdpSocket<'a, 'd, M: Module, W: Write> {
    pub(crate) id: SocketId,
    pub(crate) at: AtHandle<'a, 'd, W>,
    pub(crate) sockets: &'a SocketSet,
    pub(crate) _module: PhantomData<M>,
}

impl<'a, 'd, M: Module, W: Write> core::fmt::Debug for UdpSocket<'a, 'd, M, W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UdpSocket").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<'a, 'd, M: Module, W: Write> UdpSocket<'a, 'd, M, W> {
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Largest accepted datagram.
    pub fn mtu(&self) -> usize {
        M::UDP_MTU
    }

    /// Record the default remote. No wire traffic.
    pub fn connect(&mut self, remote: SocketAddr) {
        self.sockets.set_peer(self.id, remote);
        self.sockets.set_state(self.id, CONNECTED);
    }

    /// Send a datagram to the connected remote.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        let remote = self.sockets.peer_of(self.id).ok_or(Error::NotConnected)?;
        self.send_to(remote, data).await
    }

    /// Send a datagram to `remote`, independent of the connected state.
    pub async fn send_to(&mut self, remote: SocketAddr, data: &[u8]) -> Result<(), Error> {
        if data.len() > M::UDP_MTU {
            return Err(Error::PayloadTooLarge);
        }
        if self.sockets.state_of(self.id) & CLOSED != 0 {
            return Err(Error::Closed);
        }
        M::udp_send(self.at, self.sockets, self.id, remote, data).await
    }

    /// Receive one datagram and its source address.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        loop {
            let state = self.sockets.wait_for(self.id, READABLE | CLOSED).await;
            if state & CLOSED != 0 {
                return Err(Error::Closed);
            }
            match M::udp_receive(self.at, self.sockets, self.id, buf).await? {
                Some((len, source)) => return Ok((len, source)),
                None => {
                    self.sockets.clear(self.id, READABLE);
                }
            }
        }
    }

    /// Close the socket and remove it from the multiplexer map.
    pub async fn close(self) -> Result<(), Error> {
        close_socket::<M, W>(self.at, self.sockets, self.id).await
    }
}
