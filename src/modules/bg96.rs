//! Quectel BG96 (LTE-M / NB-IoT / EGPRS fallback).

use core::fmt::Write as _;
use core::net::{IpAddr, SocketAddr};

use embassy_time::{with_timeout, Duration};
use embedded_io_async::Write;
use heapless::{String, Vec};

use crate::at::{AtHandle, AtSession, AtValue, Command, InfoLine, ResponseParser};
use crate::config::{Config, Rat};
use crate::error::Error;
use crate::module_timing::Timings;
use crate::registration;
use crate::socket::{SocketId, SocketKind, SocketSet, CLOSED, CONNECTED};
use crate::state::{DnsUpdate, DriverShared, Event, MAX_DNS_ADDRS};

use super::{classify_vendor_error, format_ip, ConfigOutcome, Module};

/// PDP context all sockets and DNS lookups run on.
const CONTEXT_ID: i64 = 1;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(150);
const DNS_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Bg96;

impl Bg96 {
    /// Fetch the extended error for the last socket operation.
    async fn last_socket_error<W: Write>(session: &mut AtSession<'_, W>) -> Option<u16> {
        let resp = session.action("+QIGETERROR").await.ok()?;
        let code = resp.single().ok()?.int(0).ok()?;
        Some(code as u16)
    }

    fn scan_seq(rats: &[Rat]) -> String<8> {
        let mut seq = String::new();
        for rat in rats {
            let part = match rat {
                Rat::Gsm => "01",
                Rat::LteM => "02",
                Rat::NbIot => "03",
            };
            seq.push_str(part).ok();
        }
        if seq.is_empty() {
            seq.push_str("00").ok();
        }
        seq
    }

    fn scan_mode(rats: &[Rat]) -> i64 {
        let gsm = rats.contains(&Rat::Gsm);
        let lte = rats.iter().any(|r| matches!(r, Rat::LteM | Rat::NbIot));
        match (gsm, lte) {
            (true, false) => 1,
            (false, _) => 3,
            (true, true) => 0,
        }
    }

    fn iot_op_mode(rats: &[Rat]) -> i64 {
        let m1 = rats.contains(&Rat::LteM);
        let nb = rats.contains(&Rat::NbIot);
        match (m1, nb) {
            (true, false) => 0,
            (false, true) => 1,
            _ => 2,
        }
    }

    fn band_mask(bands: &[u8]) -> u64 {
        bands
            .iter()
            .filter(|&&b| (1..=64).contains(&b))
            .fold(0, |mask, &b| mask | 1u64 << (b - 1))
    }
}

impl Module for Bg96 {
    const MODEL: &'static str = "BG96";

    const SOCKET_ID_BASE: u8 = 0;
    const SOCKET_COUNT: usize = 12;
    const TCP_CHUNK: usize = 1460;
    const UDP_MTU: usize = 1460;
    const READ_CHUNK: usize = 1500;
    const SUPPORTS_GSM: bool = true;
    const CCID_VERB: &'static str = "+QCCID";

    fn timings() -> Timings {
        Timings {
            pwr_on_pull: Duration::from_millis(150),
            pwr_off_pull: Duration::from_millis(650),
            boot_wait: Duration::from_secs(5),
            reset_hold: Duration::from_millis(150),
            ..Timings::default()
        }
    }

    fn baud_rates() -> &'static [u32] {
        &[921_600, 115_200]
    }

    fn ok_terminations() -> &'static [&'static str] {
        &["SEND OK"]
    }

    fn error_terminations() -> &'static [&'static str] {
        &["SEND FAIL", "NO CARRIER"]
    }

    fn urc_verbs() -> &'static [&'static str] {
        &["+QIURC", "+QIOPEN", "+QIND", "+CEREG", "+CGREG", "+QPSMTIMER"]
    }

    fn response_parsers() -> &'static [ResponseParser] {
        // `+QIRD: <len>` is followed by that many raw bytes.
        static PARSERS: [ResponseParser; 1] = [ResponseParser::length_prefixed("+QIRD", 0)];
        &PARSERS
    }

    fn translate_urc(line: &InfoLine) -> Option<Event> {
        if let Some((reg_type, status)) = registration::from_urc(line) {
            return Some(Event::Registration(reg_type, status));
        }
        match line.verb.as_str() {
            "+QIOPEN" => {
                let id = line.int(0).ok()?;
                let code = line.int(1).ok()?;
                Some(Event::SocketConnectResult(SocketId(id as u8), code as u16))
            }
            "+QIURC" => match line.str(0).ok()? {
                "recv" => Some(Event::SocketReadable(SocketId(line.int(1).ok()? as u8))),
                "closed" => Some(Event::SocketClosed(SocketId(line.int(1).ok()? as u8))),
                "pdpdeact" => Some(Event::ContextDeactivated),
                "dnsgip" => Some(Event::Dns(match line.values.get(1)? {
                    AtValue::Int(0) => DnsUpdate::Expect(line.int(2).ok()? as usize),
                    AtValue::Int(err) => DnsUpdate::Failed(*err as u16),
                    AtValue::Str(ip) => match ip.parse::<IpAddr>() {
                        Ok(addr) => DnsUpdate::Addr(addr),
                        Err(_) => DnsUpdate::Failed(0),
                    },
                    AtValue::Null => return None,
                })),
                _ => None,
            },
            "+QPSMTIMER" => Some(Event::PsmTimer),
            _ => None,
        }
    }

    async fn set_baud<W: Write>(at: &mut AtSession<'_, W>, baud: u32) -> Result<(), Error> {
        at.send(&Command::set("+IPR").int(baud as i64)).await?;
        // Store the rate in the user profile so it survives resets.
        at.action("&W").await?;
        Ok(())
    }

    async fn configure<W: Write>(
        at: &mut AtSession<'_, W>,
        config: &Config,
    ) -> Result<ConfigOutcome, Error> {
        let mut outcome = ConfigOutcome::Unchanged;

        // RAT scan order and technology selection.
        let seq = Self::scan_seq(&config.rats);
        let resp = at.send(&Command::set("+QCFG").str("nwscanseq")).await?;
        if resp.single()?.str(1).unwrap_or("") != seq.as_str() {
            at.send(&Command::set("+QCFG").str("nwscanseq").bare(&seq).int(1))
                .await?;
            outcome = ConfigOutcome::Changed;
        }

        let mode = Self::scan_mode(&config.rats);
        let resp = at.send(&Command::set("+QCFG").str("nwscanmode")).await?;
        if resp.single()?.int(1).unwrap_or(-1) != mode {
            at.send(&Command::set("+QCFG").str("nwscanmode").int(mode).int(1))
                .await?;
            outcome = ConfigOutcome::Changed;
        }

        let iotop = Self::iot_op_mode(&config.rats);
        let resp = at.send(&Command::set("+QCFG").str("iotopmode")).await?;
        if resp.single()?.int(1).unwrap_or(-1) != iotop {
            at.send(&Command::set("+QCFG").str("iotopmode").int(iotop).int(1))
                .await?;
            outcome = ConfigOutcome::Changed;
        }

        // Band masks: the same LTE mask is applied to both CAT-M and NB.
        if !config.bands.is_empty() {
            let mask = Self::band_mask(&config.bands);
            let resp = at.send(&Command::set("+QCFG").str("band")).await?;
            let line = resp.single()?;
            let current_m1 = parse_hex(line.values.get(2));
            let current_nb = parse_hex(line.values.get(3));
            if current_m1 != Some(mask) || current_nb != Some(mask) {
                let mut args: String<64> = String::new();
                write!(&mut args, "\"band\",f,{:x},{:x},1", mask, mask)
                    .map_err(|_| Error::Overflow)?;
                let mut raw: String<80> = String::new();
                write!(&mut raw, "+QCFG={}", args).map_err(|_| Error::Overflow)?;
                at.send(&Command::raw(&raw)).await?;
                outcome = ConfigOutcome::Changed;
            }
        }

        // APN on the data context.
        if !config.apn.is_empty() {
            let resp = at.query("+CGDCONT").await?;
            let current = resp
                .lines
                .iter()
                .find(|l| l.int(0) == Ok(CONTEXT_ID))
                .and_then(|l| l.str(2).ok());
            if current != Some(config.apn.as_str()) {
                at.send(&Command::set("+CFUN").int(0).timeout(Duration::from_secs(15)))
                    .await?;
                at.send(
                    &Command::set("+CGDCONT")
                        .int(CONTEXT_ID)
                        .str("IP")
                        .str(&config.apn),
                )
                .await?;
                // A changed APN only takes effect after a reboot.
                return Ok(ConfigOutcome::RebootRequired);
            }
        }

        // PSM timers; eDRX is kept off whenever PSM is reconfigured.
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
                    at.send(&Command::set("+CEDRXS").int(0)).await?;
                    outcome = ConfigOutcome::Changed;
                }
            }
            None => {
                let resp = at.query("+CPSMS").await?;
                if resp.single()?.int(0).unwrap_or(-1) != 0 {
                    at.send(&Command::set("+CPSMS").int(0)).await?;
                    outcome = ConfigOutcome::Changed;
                }
            }
        }

        Ok(outcome)
    }

    async fn on_connected<W: Write>(
        at: &mut AtSession<'_, W>,
        _config: &Config,
    ) -> Result<(), Error> {
        // Activate the PDP context unless a previous attach left it up.
        let resp = at.query("+QIACT").await?;
        let active = resp
            .lines
            .iter()
            .any(|l| l.int(0) == Ok(CONTEXT_ID) && l.int(1) == Ok(1));
        if !active {
            at.send(
                &Command::set("+QIACT")
                    .int(CONTEXT_ID)
                    .timeout(Duration::from_secs(150))
                    .abortable(),
            )
            .await?;
        }
        Ok(())
    }

    async fn power_off<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error> {
        at.send(&Command::set("+QPOWD").int(1).timeout(Duration::from_secs(3)))
            .await?;
        Ok(())
    }

    async fn soft_reset<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error> {
        at.send(
            &Command::set("+CFUN")
                .int(1)
                .int(1)
                .timeout(Duration::from_secs(3)),
        )
        .await?;
        Ok(())
    }

    async fn enter_psm<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error> {
        at.send(&Command::raw("+QCFG=\"psm/enter\",1")).await?;
        Ok(())
    }

    async fn socket_create<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        kind: SocketKind,
    ) -> Result<SocketId, Error> {
        let id = sockets.add(kind)?;
        if kind == SocketKind::Udp {
            // UDP service sockets are opened immediately; the host argument
            // is ignored for this service type.
            let res = async {
                at.send(
                    &Command::set("+QIOPEN")
                        .int(CONTEXT_ID)
                        .int(id.0 as i64)
                        .str("UDP SERVICE")
                        .str("127.0.0.1")
                        .int(0)
                        .int(0)
                        .int(0)
                        .timeout(Duration::from_secs(10)),
                )
                .await?;
                match with_timeout(
                    Duration::from_secs(30),
                    sockets.wait_for(id, CONNECTED | CLOSED),
                )
                .await
                {
                    Ok(state) if state & CONNECTED != 0 => Ok(()),
                    Ok(_) => Err(classify_vendor_error(sockets.error_of(id))),
                    Err(_) => Err(Error::CommandTimeout),
                }
            }
            .await;
            if let Err(e) = res {
                sockets.remove(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    async fn tcp_connect<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        remote: SocketAddr,
    ) -> Result<(), Error> {
        let mut ip: String<64> = String::new();
        format_ip(&remote.ip(), &mut ip);
        {
            let mut session = at.lock().await?;
            let res = session
                .send(
                    &Command::set("+QIOPEN")
                        .int(CONTEXT_ID)
                        .int(id.0 as i64)
                        .str("TCP")
                        .str(&ip)
                        .int(remote.port() as i64)
                        .int(0)
                        .int(1)
                        .timeout(Duration::from_secs(10)),
                )
                .await;
            if let Err(e) = res {
                let refined = Self::last_socket_error(&mut session).await;
                return Err(refined.map(classify_vendor_error).unwrap_or(e.into()));
            }
        }
        // Completion arrives as a `+QIOPEN: <id>,<err>` report.
        match with_timeout(CONNECT_TIMEOUT, sockets.wait_for(id, CONNECTED | CLOSED)).await {
            Ok(state) if state & CONNECTED != 0 => {
                sockets.set_peer(id, remote);
                Ok(())
            }
            Ok(_) => Err(classify_vendor_error(sockets.error_of(id))),
            Err(_) => Err(Error::CommandTimeout),
        }
    }

    async fn tcp_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        data: &[u8],
    ) -> Result<(), Error> {
        at.send(
            &Command::set("+QISEND")
                .int(id.0 as i64)
                .int(data.len() as i64)
                .data(data)
                .timeout(Duration::from_secs(10)),
        )
        .await?;
        Ok(())
    }

    async fn socket_read<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        want: usize,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let mut session = at.lock().await?;
        let res = session
            .send(
                &Command::set("+QIRD")
                    .int(id.0 as i64)
                    .int(want.min(Self::READ_CHUNK) as i64)
                    .timeout(Duration::from_secs(5)),
            )
            .await;
        let mut resp = match res {
            Ok(resp) => resp,
            Err(e) => {
                let refined = Self::last_socket_error(&mut session).await;
                return Err(refined.map(classify_vendor_error).unwrap_or(e.into()));
            }
        };
        let payload = resp.take_payload();
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    async fn udp_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        _sockets: &SocketSet,
        id: SocketId,
        remote: SocketAddr,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut ip: String<64> = String::new();
        format_ip(&remote.ip(), &mut ip);
        at.send(
            &Command::set("+QISEND")
                .int(id.0 as i64)
                .int(data.len() as i64)
                .str(&ip)
                .int(remote.port() as i64)
                .data(data)
                .timeout(Duration::from_secs(10)),
        )
        .await?;
        Ok(())
    }

    async fn udp_receive<W: Write>(
        at: AtHandle<'_, '_, W>,
        _sockets: &SocketSet,
        id: SocketId,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, Error> {
        let mut resp = at
            .send(
                &Command::set("+QIRD")
                    .int(id.0 as i64)
                    .int(Self::READ_CHUNK as i64)
                    .timeout(Duration::from_secs(5)),
            )
            .await?;
        let payload = resp.take_payload();
        if payload.is_empty() {
            return Ok(None);
        }
        let line = resp.single()?;
        let ip: IpAddr = line.str(1)?.parse().map_err(|_| Error::Parse)?;
        let port = line.int(2)? as u16;
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(Some((n, SocketAddr::new(ip, port))))
    }

    async fn socket_close<W: Write>(at: AtHandle<'_, '_, W>, id: SocketId) -> Result<(), Error> {
        at.send(
            &Command::set("+QICLOSE")
                .int(id.0 as i64)
                .timeout(Duration::from_secs(10)),
        )
        .await?;
        Ok(())
    }

    async fn deactivate_pdp<W: Write>(at: AtHandle<'_, '_, W>) -> Result<(), Error> {
        at.send(
            &Command::set("+QIDEACT")
                .int(CONTEXT_ID)
                .timeout(Duration::from_secs(40))
                .abortable(),
        )
        .await?;
        Ok(())
    }

    async fn resolve<W: Write>(
        at: AtHandle<'_, '_, W>,
        shared: &DriverShared,
        host: &str,
    ) -> Result<Vec<IpAddr, MAX_DNS_ADDRS>, Error> {
        shared.dns_begin();
        let issued = at
            .send(&Command::set("+QIDNSGIP").int(CONTEXT_ID).str(host))
            .await;
        if let Err(e) = issued {
            shared.dns_abandon();
            return Err(e.into());
        }
        // Results arrive as `+QIURC: "dnsgip",...` reports.
        match with_timeout(DNS_TIMEOUT, shared.dns_wait()).await {
            Ok(res) => res,
            Err(_) => {
                shared.dns_abandon();
                Err(Error::CommandTimeout)
            }
        }
    }
}

fn parse_hex(value: Option<&AtValue>) -> Option<u64> {
    match value? {
        AtValue::Int(v) => {
            let mut s: String<20> = String::new();
            write!(&mut s, "{}", v).ok()?;
            u64::from_str_radix(&s, 16).ok()
        }
        AtValue::Str(s) => u64::from_str_radix(s, 16).ok(),
        AtValue::Null => None,
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
    fn scan_parameters() {
        assert_eq!(Bg96::scan_seq(&[Rat::LteM, Rat::NbIot]).as_str(), "0203");
        assert_eq!(Bg96::scan_seq(&[]).as_str(), "00");
        assert_eq!(Bg96::scan_mode(&[Rat::LteM]), 3);
        assert_eq!(Bg96::scan_mode(&[Rat::Gsm]), 1);
        assert_eq!(Bg96::scan_mode(&[Rat::Gsm, Rat::LteM]), 0);
        assert_eq!(Bg96::iot_op_mode(&[Rat::LteM]), 0);
        assert_eq!(Bg96::iot_op_mode(&[Rat::NbIot]), 1);
        assert_eq!(Bg96::iot_op_mode(&[Rat::LteM, Rat::NbIot]), 2);
    }

    #[test]
    fn band_mask_bits() {
        assert_eq!(Bg96::band_mask(&[1, 3, 20]), 0x8_0005);
        assert_eq!(Bg96::band_mask(&[]), 0);
        // Out-of-range bands are ignored.
        assert_eq!(Bg96::band_mask(&[0, 65, 8]), 0x80);
    }

    #[test]
    fn urc_translation() {
        assert_eq!(
            Bg96::translate_urc(&line("+QIOPEN", "0,0")),
            Some(Event::SocketConnectResult(SocketId(0), 0))
        );
        assert_eq!(
            Bg96::translate_urc(&line("+QIOPEN", "0,566")),
            Some(Event::SocketConnectResult(SocketId(0), 566))
        );
        assert_eq!(
            Bg96::translate_urc(&line("+QIURC", "\"recv\",2")),
            Some(Event::SocketReadable(SocketId(2)))
        );
        assert_eq!(
            Bg96::translate_urc(&line("+QIURC", "\"closed\",1")),
            Some(Event::SocketClosed(SocketId(1)))
        );
        assert_eq!(
            Bg96::translate_urc(&line("+QIURC", "\"pdpdeact\",1")),
            Some(Event::ContextDeactivated)
        );
        assert_eq!(Bg96::translate_urc(&line("+QIURC", "\"incoming\",5")), None);
    }

    #[test]
    fn dns_urc_translation() {
        assert_eq!(
            Bg96::translate_urc(&line("+QIURC", "\"dnsgip\",0,2,600")),
            Some(Event::Dns(DnsUpdate::Expect(2)))
        );
        assert_eq!(
            Bg96::translate_urc(&line("+QIURC", "\"dnsgip\",565")),
            Some(Event::Dns(DnsUpdate::Failed(565)))
        );
        assert_eq!(
            Bg96::translate_urc(&line("+QIURC", "\"dnsgip\",\"93.184.216.34\"")),
            Some(Event::Dns(DnsUpdate::Addr(IpAddr::V4(
                core::net::Ipv4Addr::new(93, 184, 216, 34)
            ))))
        );
    }
}
