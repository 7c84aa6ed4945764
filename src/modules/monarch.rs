//! Sequans Monarch (LTE-M single-RAT).

use core::fmt::Write as _;
use core::net::{IpAddr, SocketAddr};

use embassy_time::{Duration, Instant};
use embedded_io_async::Write;
use heapless::{String, Vec};

use crate::at::command::DEFAULT_TIMEOUT;
use crate::at::{AtHandle, AtSession, Command, InfoLine, ResponseParser};
use crate::config::{Config, Rat};
use crate::error::Error;
use crate::module_timing::Timings;
use crate::registration;
use crate::socket::{SocketId, SocketKind, SocketSet, CONNECTED};
use crate::state::{DriverShared, Event, MAX_DNS_ADDRS};

use super::{classify_vendor_error, format_ip, ConfigOutcome, Module};

const PDP_CID: i64 = 1;
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// `+SQNSD` transmission protocol selector.
const PROTO_TCP: i64 = 0;
const PROTO_UDP: i64 = 1;

pub struct Monarch;

impl Monarch {
    async fn dial<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        proto: i64,
        remote: SocketAddr,
    ) -> Result<(), Error> {
        let mut ip: String<64> = String::new();
        format_ip(&remote.ip(), &mut ip);
        // Command mode (last argument 1): the final OK reports the
        // established connection.
        let res = at
            .send(
                &Command::set("+SQNSD")
                    .int(id.0 as i64)
                    .int(proto)
                    .int(remote.port() as i64)
                    .str(&ip)
                    .int(0)
                    .int(0)
                    .int(1)
                    .timeout(DIAL_TIMEOUT)
                    .abortable(),
            )
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(crate::at::Error::Response(line)) => Err(classify_vendor_error(line.code)),
            Err(e) => Err(e.into()),
        }
    }

    async fn hang_up<W: Write>(at: AtHandle<'_, '_, W>, id: SocketId) -> Result<(), Error> {
        at.send(
            &Command::set("+SQNSH")
                .int(id.0 as i64)
                .timeout(Duration::from_secs(10)),
        )
        .await?;
        Ok(())
    }

    fn band_list(bands: &[u8]) -> String<72> {
        let mut list = String::new();
        for (i, band) in bands.iter().enumerate() {
            if i != 0 {
                list.push(',').ok();
            }
            write!(&mut list, "{}", band).ok();
        }
        list
    }
}

impl Module for Monarch {
    const MODEL: &'static str = "Monarch";

    const SOCKET_ID_BASE: u8 = 1;
    const SOCKET_COUNT: usize = 6;
    const TCP_CHUNK: usize = 1500;
    const UDP_MTU: usize = 1500;
    const READ_CHUNK: usize = 1500;
    const CCID_VERB: &'static str = "+SQNCCID";

    fn timings() -> Timings {
        Timings {
            pwr_on_pull: Duration::from_millis(150),
            boot_wait: Duration::from_secs(5),
            ..Timings::default()
        }
    }

    fn urc_verbs() -> &'static [&'static str] {
        &["+SQNSRING", "+SQNSH", "+CEREG"]
    }

    fn response_parsers() -> &'static [ResponseParser] {
        // `+SQNSRECV: <conn>,<len>` is followed by that many raw bytes.
        static PARSERS: [ResponseParser; 1] = [ResponseParser::length_prefixed("+SQNSRECV", 1)];
        &PARSERS
    }

    fn translate_urc(line: &InfoLine) -> Option<Event> {
        if let Some((reg_type, status)) = registration::from_urc(line) {
            return Some(Event::Registration(reg_type, status));
        }
        match line.verb.as_str() {
            "+SQNSRING" => Some(Event::SocketReadable(SocketId(line.int(0).ok()? as u8))),
            "+SQNSH" => Some(Event::SocketClosed(SocketId(line.int(0).ok()? as u8))),
            _ => None,
        }
    }

    async fn set_baud<W: Write>(at: &mut AtSession<'_, W>, baud: u32) -> Result<(), Error> {
        at.send(&Command::set("+IPR").int(baud as i64)).await?;
        Ok(())
    }

    async fn configure<W: Write>(
        at: &mut AtSession<'_, W>,
        config: &Config,
    ) -> Result<ConfigOutcome, Error> {
        let mut outcome = ConfigOutcome::Unchanged;

        if config.rats.iter().any(|r| !matches!(r, Rat::LteM)) {
            debug!("Monarch is LTE-M only; ignoring other requested RATs");
        }

        if !config.bands.is_empty() {
            let desired = Self::band_list(&config.bands);
            let resp = at.query("+SQNBANDSEL").await?;
            let current = resp
                .lines
                .iter()
                .find(|l| l.int(0) == Ok(0))
                .and_then(|l| l.str(2).ok());
            if current != Some(desired.as_str()) {
                at.send(
                    &Command::set("+SQNBANDSEL")
                        .int(0)
                        .str("standard")
                        .str(&desired),
                )
                .await?;
                outcome = ConfigOutcome::Changed;
            }
        }

        if !config.apn.is_empty() {
            let resp = at.query("+CGDCONT").await?;
            let current = resp
                .lines
                .iter()
                .find(|l| l.int(0) == Ok(PDP_CID))
                .and_then(|l| l.str(2).ok());
            if current != Some(config.apn.as_str()) {
                at.send(&Command::set("+CFUN").int(0).timeout(Duration::from_secs(15)))
                    .await?;
                at.send(
                    &Command::set("+CGDCONT")
                        .int(PDP_CID)
                        .str("IP")
                        .str(&config.apn),
                )
                .await?;
                outcome = ConfigOutcome::Changed;
            }
        }

        match &config.psm {
            Some(psm) => {
                let resp = at.query("+CPSMS").await?;
                let line = resp.single()?;
                let matches = line.int(0) == Ok(1)
                    && line.str(3) == Ok(psm.periodic_tau.as_str())
                    && line.str(4) == Ok(psm.active_time.as_str());
                if !matches {
                    at.send(
                        &Command::set("+CPSMS")
                            .int(1)
                            .null()
                            .null()
                            .str(&psm.periodic_tau)
                            .str(&psm.active_time),
                    )
                    .await?;
                    // Allow the UART to power-save between transfers, and
                    // drop to reduced bands while idle.
                    at.send(&Command::set("+SQNIPSCFG").int(1).int(100)).await?;
                    at.send(&Command::set("+SQNIBRCFG").int(1)).await?;
                    outcome = ConfigOutcome::Changed;
                }
            }
            None => {
                let resp = at.query("+CPSMS").await?;
                if resp.single()?.int(0).unwrap_or(-1) != 0 {
                    at.send(&Command::set("+CPSMS").int(0)).await?;
                    at.send(&Command::set("+SQNIPSCFG").int(0)).await?;
                    outcome = ConfigOutcome::Changed;
                }
            }
        }

        Ok(outcome)
    }

    async fn power_off<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error> {
        at.send(&Command::action("+SQNSSHDN").timeout(Duration::from_secs(10)))
            .await?;
        Ok(())
    }

    async fn soft_reset<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error> {
        at.send(&Command::raw("^RESET").timeout(Duration::from_secs(3)))
            .await?;
        Ok(())
    }

    async fn socket_create<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        kind: SocketKind,
    ) -> Result<SocketId, Error> {
        let id = sockets.add(kind)?;
        let res = async {
            let mut session = at.lock().await?;
            // Per-socket transport configuration: context, packet size,
            // no global timeout, 60 s connect timeout, 5 s send timeout.
            session
                .send(
                    &Command::set("+SQNSCFG")
                        .int(id.0 as i64)
                        .int(PDP_CID)
                        .int(Self::TCP_CHUNK as i64)
                        .int(0)
                        .int(600)
                        .int(50),
                )
                .await?;
            // Ring notifications with data length, buffered receive mode.
            session
                .send(
                    &Command::set("+SQNSCFGEXT")
                        .int(id.0 as i64)
                        .int(1)
                        .int(0)
                        .int(0),
                )
                .await?;
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = res {
            sockets.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    async fn tcp_connect<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        remote: SocketAddr,
    ) -> Result<(), Error> {
        Self::dial(at, id, PROTO_TCP, remote).await?;
        sockets.set_peer(id, remote);
        sockets.set_state(id, CONNECTED);
        Ok(())
    }

    async fn tcp_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        data: &[u8],
    ) -> Result<(), Error> {
        let started = Instant::now();
        at.send(
            &Command::set("+SQNSSENDEXT")
                .int(id.0 as i64)
                .int(data.len() as i64)
                .data(data)
                .timeout(Duration::from_secs(10)),
        )
        .await?;
        let elapsed = Instant::now() - started;
        if elapsed > DEFAULT_TIMEOUT {
            // Advisory only; the send succeeded.
            warn!("slow socket send: {} ms", elapsed.as_millis());
        }
        Ok(())
    }

    async fn socket_read<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        want: usize,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let res = at
            .send(
                &Command::set("+SQNSRECV")
                    .int(id.0 as i64)
                    .int(want.min(Self::READ_CHUNK) as i64)
                    .timeout(Duration::from_secs(5)),
            )
            .await;
        let mut resp = match res {
            Ok(resp) => resp,
            // "Operation not allowed": the buffer is empty.
            Err(crate::at::Error::Response(line)) if line.code == 3 || line.code == 4 => {
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let payload = resp.take_payload();
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    async fn udp_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        remote: SocketAddr,
        data: &[u8],
    ) -> Result<(), Error> {
        // The chip has no send-to verb; datagrams flow over a dialed
        // socket. Re-dial when the target changes.
        let connected = sockets.state_of(id) & CONNECTED != 0;
        if !connected || sockets.peer_of(id) != Some(remote) {
            if connected {
                Self::hang_up(at, id).await.ok();
            }
            Self::dial(at, id, PROTO_UDP, remote).await?;
            sockets.set_peer(id, remote);
            sockets.set_state(id, CONNECTED);
        }
        at.send(
            &Command::set("+SQNSSENDEXT")
                .int(id.0 as i64)
                .int(data.len() as i64)
                .data(data)
                .timeout(Duration::from_secs(10)),
        )
        .await?;
        Ok(())
    }

    async fn udp_receive<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, Error> {
        let source = sockets.peer_of(id).ok_or(Error::NotConnected)?;
        let n = Self::socket_read(at, id, Self::READ_CHUNK, buf).await?;
        Ok((n > 0).then_some((n, source)))
    }

    async fn socket_close<W: Write>(at: AtHandle<'_, '_, W>, id: SocketId) -> Result<(), Error> {
        Self::hang_up(at, id).await
    }

    async fn resolve<W: Write>(
        at: AtHandle<'_, '_, W>,
        _shared: &DriverShared,
        host: &str,
    ) -> Result<Vec<IpAddr, MAX_DNS_ADDRS>, Error> {
        let resp = at
            .send(
                &Command::set("+SQNDNSLKUP")
                    .str(host)
                    .int(0)
                    .timeout(Duration::from_secs(70))
                    .abortable(),
            )
            .await?;
        let mut addrs = Vec::new();
        for line in resp
            .lines
            .iter()
            .filter(|l| l.verb.as_str() == "+SQNDNSLKUP")
        {
            for value in line.values.iter().skip(1) {
                if let Some(addr) = value.as_str().and_then(|s| s.parse::<IpAddr>().ok()) {
                    addrs.push(addr).ok();
                }
            }
        }
        if addrs.is_empty() {
            return Err(Error::Unknown(0));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    fn line(verb: &str, rest: &str) -> InfoLine {
        let mut values = Vec::new();
        crate::at::response::split_values(rest, &mut values).unwrap();
        InfoLine {
            verb: heapless::String::from_str(verb).unwrap(),
            values,
        }
    }

    #[test]
    fn ring_and_hangup_urcs() {
        assert_eq!(
            Monarch::translate_urc(&line("+SQNSRING", "3,128")),
            Some(Event::SocketReadable(SocketId(3)))
        );
        assert_eq!(
            Monarch::translate_urc(&line("+SQNSH", "2")),
            Some(Event::SocketClosed(SocketId(2)))
        );
        assert_eq!(Monarch::translate_urc(&line("+SQNSCFG", "1,1")), None);
    }

    #[test]
    fn band_list_format() {
        assert_eq!(Monarch::band_list(&[1, 3, 8, 20]).as_str(), "1,3,8,20");
        assert_eq!(Monarch::band_list(&[]).as_str(), "");
    }
}
