//! Host-name resolution through the modem's DNS verbs.

use core::net::IpAddr;

use embedded_io_async::Write;
use embedded_nal_async::{AddrType, Dns};
use heapless::Vec;

use crate::config::{AttemptsStore, CellularConfig};
use crate::error::Error;
use crate::modules::Module;
use crate::network::Device;
use crate::state::MAX_DNS_ADDRS;

fn to_no_std_net(addr: IpAddr) -> embedded_nal_async::IpAddr {
    match addr {
        IpAddr::V4(v4) => embedded_nal_async::IpAddr::V4(embedded_nal_async::Ipv4Addr::from(
            v4.octets(),
        )),
        IpAddr::V6(v6) => embedded_nal_async::IpAddr::V6(embedded_nal_async::Ipv6Addr::from(
            v6.octets(),
        )),
    }
}

impl<'d, M: Module, W: Write, C: CellularConfig, S: AttemptsStore> Device<'d, M, W, C, S> {
    /// Resolve `host` to addresses, in the order the modem reports them.
    /// IP literals short-circuit without touching the modem. Resolutions
    /// are serialized; only one is in flight at a time.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr, MAX_DNS_ADDRS>, Error> {
        if let Ok(addr) = host.parse::<IpAddr>() {
            let mut out = Vec::new();
            out.push(addr).ok();
            return Ok(out);
        }
        let _guard = self.dns_lock.lock().await;
        M::resolve(self.at_handle(), self.shared, host).await
    }
}

impl<'d, M: Module, W: Write, C: CellularConfig, S: AttemptsStore> Dns for Device<'d, M, W, C, S> {
    type Error = Error;

    async fn get_host_by_name(
        &self,
        host: &str,
        addr_type: AddrType,
    ) -> Result<embedded_nal_async::IpAddr, Error> {
        let addrs = self.resolve(host).await?;
        addrs
            .iter()
            .find(|addr| match addr_type {
                AddrType::IPv4 => addr.is_ipv4(),
                AddrType::IPv6 => addr.is_ipv6(),
                AddrType::Either => true,
            })
            .copied()
            .map(to_no_std_net)
            .ok_or(Error::Unknown(0))
    }

    async fn get_host_by_address(
        &self,
        _addr: embedded_nal_async::IpAddr,
        _result: &mut [u8],
    ) -> Result<usize, Error> {
        // The modems offer no reverse lookup.
        Err(Error::Unimplemented)
    }
}
