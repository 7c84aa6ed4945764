//! u-blox SARA-R5 (LTE-M).
//!
//! Shares the SARA-R4 socket and configuration flows; differs in power
//! timing, the airplane-mode requirement for SIM-touching configuration,
//! and PSD-profile-based context activation.

use core::net::{IpAddr, SocketAddr};

use embassy_time::Duration;
use embedded_io_async::Write;
use heapless::Vec;

use crate::at::{AtHandle, AtSession, Command, InfoLine, ResponseParser};
use crate::config::Config;
use crate::error::Error;
use crate::module_timing::Timings;
use crate::socket::{SocketId, SocketKind, SocketSet};
use crate::state::{DriverShared, Event, MAX_DNS_ADDRS};

use super::sara_r4::SaraR4;
use super::{ConfigOutcome, Module};

/// PSD profile mapped onto the default PDP context.
const PROFILE_ID: i64 = 0;

pub struct SaraR5;

impl Module for SaraR5 {
    const MODEL: &'static str = "SARA-R5";

    const SOCKET_ID_BASE: u8 = SaraR4::SOCKET_ID_BASE;
    const SOCKET_COUNT: usize = SaraR4::SOCKET_COUNT;
    const TCP_CHUNK: usize = SaraR4::TCP_CHUNK;
    const UDP_MTU: usize = SaraR4::UDP_MTU;
    const READ_CHUNK: usize = SaraR4::READ_CHUNK;
    const SERIALIZE_CONNECT: bool = true;
    /// Configuration touching the SIM runs in airplane mode on this chip.
    const RADIO_OFF_FUN: u8 = 4;
    const CCID_VERB: &'static str = "+CCID";

    fn timings() -> Timings {
        Timings {
            pwr_on_pull: Duration::from_millis(1000),
            pwr_off_pull: Duration::from_millis(23100),
            boot_wait: Duration::from_secs(1),
            reset_hold: Duration::from_millis(100),
            ..Timings::default()
        }
    }

    fn urc_verbs() -> &'static [&'static str] {
        &["+UUSORD", "+UUSORF", "+UUSOCL", "+UUSOCO", "+UUPSDD", "+CEREG"]
    }

    fn response_parsers() -> &'static [ResponseParser] {
        SaraR4::response_parsers()
    }

    fn translate_urc(line: &InfoLine) -> Option<Event> {
        SaraR4::translate_urc(line)
    }

    async fn set_baud<W: Write>(at: &mut AtSession<'_, W>, baud: u32) -> Result<(), Error> {
        SaraR4::set_baud(at, baud).await
    }

    async fn configure<W: Write>(
        at: &mut AtSession<'_, W>,
        config: &Config,
    ) -> Result<ConfigOutcome, Error> {
        SaraR4::configure(at, config).await
    }

    async fn on_connected<W: Write>(
        at: &mut AtSession<'_, W>,
        _config: &Config,
    ) -> Result<(), Error> {
        // Map the PSD profile onto the attached context and bring it up.
        let resp = at
            .send(&Command::set("+UPSND").int(PROFILE_ID).int(8))
            .await?;
        if resp.single()?.int(2) == Ok(1) {
            return Ok(());
        }
        at.send(&Command::set("+UPSD").int(PROFILE_ID).int(100).int(1))
            .await?;
        at.send(&Command::set("+UPSD").int(PROFILE_ID).int(0).int(0))
            .await?;
        at.send(
            &Command::set("+UPSDA")
                .int(PROFILE_ID)
                .int(3)
                .timeout(Duration::from_secs(180))
                .abortable(),
        )
        .await?;
        Ok(())
    }

    async fn power_off<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error> {
        SaraR4::power_off(at).await
    }

    async fn socket_create<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        kind: SocketKind,
    ) -> Result<SocketId, Error> {
        SaraR4::socket_create(at, sockets, kind).await
    }

    async fn tcp_connect<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        remote: SocketAddr,
    ) -> Result<(), Error> {
        SaraR4::tcp_connect(at, sockets, id, remote).await
    }

    async fn can_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        len: usize,
    ) -> Result<bool, Error> {
        SaraR4::can_send(at, id, len).await
    }

    async fn tcp_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        data: &[u8],
    ) -> Result<(), Error> {
        SaraR4::tcp_send(at, id, data).await
    }

    async fn socket_read<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        want: usize,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        SaraR4::socket_read(at, id, want, buf).await
    }

    async fn udp_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        remote: SocketAddr,
        data: &[u8],
    ) -> Result<(), Error> {
        SaraR4::udp_send(at, sockets, id, remote, data).await
    }

    async fn udp_receive<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, Error> {
        SaraR4::udp_receive(at, sockets, id, buf).await
    }

    async fn socket_close<W: Write>(at: AtHandle<'_, '_, W>, id: SocketId) -> Result<(), Error> {
        SaraR4::socket_close(at, id).await
    }

    async fn resolve<W: Write>(
        at: AtHandle<'_, '_, W>,
        shared: &DriverShared,
        host: &str,
    ) -> Result<Vec<IpAddr, MAX_DNS_ADDRS>, Error> {
        SaraR4::resolve(at, shared, host).await
    }
}
