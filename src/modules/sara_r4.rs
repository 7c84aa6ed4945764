//! u-blox SARA-R4 (LTE-M / NB-IoT / EGPRS).
//!
//! Socket payloads travel in hex mode (`+UDCONF=1,1`), so reads and writes
//! are inline strings rather than prompted binary.

use core::fmt::Write as _;
use core::net::{IpAddr, SocketAddr};

use embassy_time::Duration;
use embedded_io_async::Write;
use heapless::{String, Vec};

use crate::at::response::{split_values, AtValue, PayloadBuf, MAX_VALUES};
use crate::at::{AtHandle, AtSession, Command, InfoLine, ResponseParser};
use crate::config::{Config, Rat};
use crate::error::Error;
use crate::hex::{decode_hex, encode_hex};
use crate::module_timing::Timings;
use crate::registration;
use crate::socket::{SocketId, SocketKind, SocketSet, CONNECTED};
use crate::state::{DriverShared, Event, MAX_DNS_ADDRS};

use super::{ConfigOutcome, Module};

/// Outbound buffer cap; beyond this, sends are deferred.
const TX_BUFFER_LIMIT: usize = 10240;

/// `+USOCTL` parameter id for outgoing unacknowledged bytes.
const CTL_OUTGOING_BYTES: i64 = 11;

const MNO_PROFILE_STANDARD: i64 = 100;

pub struct SaraR4;

/// Hex-mode read: `<id>,<len>,"<hex>"` (TCP) or
/// `<id>,"<ip>",<port>,<len>,"<hex>"` (UDP). The trailing hex field is
/// decoded into the payload buffer.
fn split_hex_read(
    rest: &str,
    values: &mut Vec<AtValue, MAX_VALUES>,
    payload: &mut PayloadBuf,
) -> Result<(), crate::at::Error> {
    match rest.trim_end().rsplit_once(',') {
        Some((head, hex)) if hex.starts_with('"') && hex.len() >= 2 => {
            split_values(head, values)?;
            let hex = &hex[1..hex.len() - 1];
            payload
                .resize_default(hex.len() / 2)
                .map_err(|_| crate::at::Error::Overflow)?;
            decode_hex(hex, payload).map_err(|_| crate::at::Error::Parse)?;
            Ok(())
        }
        // Zero-length variants carry no hex field.
        _ => split_values(rest, values),
    }
}

pub(crate) fn rat_selector(rat: Rat) -> i64 {
    match rat {
        Rat::LteM => 7,
        Rat::NbIot => 8,
        Rat::Gsm => 9,
    }
}

pub(crate) fn band_mask(bands: &[u8]) -> u64 {
    bands
        .iter()
        .filter(|&&b| (1..=64).contains(&b))
        .fold(0, |mask, &b| mask | 1u64 << (b - 1))
}

/// Decode a `+UBANDMASK` report into the first-word masks for LTE-M and
/// NB-IoT. Each RAT entry carries one or two 64-bit words; both words
/// belong to that RAT.
pub(crate) fn decode_band_masks(values: &[AtValue]) -> Option<(u64, u64)> {
    match values.len() {
        // 0,<mask>,1,<mask>
        4 => Some((values[1].as_int()? as u64, values[3].as_int()? as u64)),
        // 0,<m0>,<m0hi>,1,<m1>,<m1hi>
        6 => Some((values[1].as_int()? as u64, values[4].as_int()? as u64)),
        _ => None,
    }
}

impl SaraR4 {
    async fn write_hex_command<W: Write>(
        at: AtHandle<'_, '_, W>,
        cmd_verb: &'static str,
        id: SocketId,
        remote: Option<SocketAddr>,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut hex: String<2048> = String::new();
        encode_hex(data, &mut hex).map_err(|_| Error::Overflow)?;
        let mut ip: String<64> = String::new();

        let mut cmd = Command::set(cmd_verb).int(id.0 as i64);
        if let Some(remote) = remote {
            super::format_ip(&remote.ip(), &mut ip);
            cmd = cmd.str(&ip).int(remote.port() as i64);
        }
        let cmd = cmd
            .int(data.len() as i64)
            .str(&hex)
            .timeout(Duration::from_secs(10));

        let resp = at.send(&cmd).await?;
        let written = resp.single()?.int(1).unwrap_or(data.len() as i64);
        if written != data.len() as i64 {
            return Err(Error::Parse);
        }
        Ok(())
    }
}

impl Module for SaraR4 {
    const MODEL: &'static str = "SARA-R4";

    const SOCKET_ID_BASE: u8 = 0;
    const SOCKET_COUNT: usize = 12;
    const TCP_CHUNK: usize = 1024;
    const UDP_MTU: usize = 1024;
    const READ_CHUNK: usize = 1024;
    const SERIALIZE_CONNECT: bool = true;
    const SUPPORTS_GSM: bool = true;
    const CCID_VERB: &'static str = "+CCID";

    fn timings() -> Timings {
        Timings {
            pwr_on_pull: Duration::from_millis(150),
            pwr_off_pull: Duration::from_millis(1500),
            boot_wait: Duration::from_secs(5),
            reset_hold: Duration::from_secs(10),
            ..Timings::default()
        }
    }

    fn urc_verbs() -> &'static [&'static str] {
        &["+UUSORD", "+UUSORF", "+UUSOCL", "+UUSOCO", "+UUPSDD", "+CEREG", "+CGREG"]
    }

    fn response_parsers() -> &'static [ResponseParser] {
        static PARSERS: [ResponseParser; 2] = [
            ResponseParser::custom("+USORD", split_hex_read),
            ResponseParser::custom("+USORF", split_hex_read),
        ];
        &PARSERS
    }

    fn translate_urc(line: &InfoLine) -> Option<Event> {
        if let Some((reg_type, status)) = registration::from_urc(line) {
            return Some(Event::Registration(reg_type, status));
        }
        match line.verb.as_str() {
            "+UUSORD" | "+UUSORF" => {
                Some(Event::SocketReadable(SocketId(line.int(0).ok()? as u8)))
            }
            "+UUSOCL" => Some(Event::SocketClosed(SocketId(line.int(0).ok()? as u8))),
            "+UUSOCO" => {
                let id = line.int(0).ok()?;
                let code = line.int(1).ok()?;
                Some(Event::SocketConnectResult(SocketId(id as u8), code as u16))
            }
            "+UUPSDD" => Some(Event::ContextDeactivated),
            _ => None,
        }
    }

    async fn set_baud<W: Write>(at: &mut AtSession<'_, W>, baud: u32) -> Result<(), Error> {
        // IPR is volatile on this family; the preferred rate is re-applied
        // on every bring-up.
        at.send(&Command::set("+IPR").int(baud as i64)).await?;
        Ok(())
    }

    async fn configure<W: Write>(
        at: &mut AtSession<'_, W>,
        config: &Config,
    ) -> Result<ConfigOutcome, Error> {
        let mut outcome = ConfigOutcome::Unchanged;

        // An undefined MNO profile leaves the radio planless.
        let resp = at.query("+UMNOPROF").await?;
        if resp.single()?.int(0).unwrap_or(0) == 0 {
            at.send(&Command::set("+CFUN").int(Self::RADIO_OFF_FUN as i64))
                .await?;
            at.send(&Command::set("+UMNOPROF").int(MNO_PROFILE_STANDARD))
                .await?;
            return Ok(ConfigOutcome::RebootRequired);
        }

        // Hex mode for all socket payload commands.
        let resp = at.send(&Command::set("+UDCONF").int(1)).await?;
        if resp.single()?.int(1).unwrap_or(0) != 1 {
            at.send(&Command::set("+UDCONF").int(1).int(1)).await?;
            outcome = ConfigOutcome::Changed;
        }

        if let Some(&first) = config.rats.first() {
            let desired = rat_selector(first);
            let resp = at.query("+URAT").await?;
            if resp.single()?.int(0).unwrap_or(-1) != desired {
                at.send(&Command::set("+CFUN").int(Self::RADIO_OFF_FUN as i64))
                    .await?;
                at.send(&Command::set("+URAT").int(desired)).await?;
                // RAT selection only takes effect after a reboot.
                return Ok(ConfigOutcome::RebootRequired);
            }
        }

        if !config.bands.is_empty() {
            let desired = band_mask(&config.bands);
            let resp = at.query("+UBANDMASK").await?;
            let current = decode_band_masks(&resp.single()?.values);
            if current != Some((desired, desired)) {
                at.send(&Command::set("+UBANDMASK").int(0).int(desired as i64))
                    .await?;
                at.send(&Command::set("+UBANDMASK").int(1).int(desired as i64))
                    .await?;
                outcome = ConfigOutcome::Changed;
            }
        }

        if !config.apn.is_empty() {
            let resp = at.query("+CGDCONT").await?;
            let current = resp
                .lines
                .iter()
                .find(|l| l.int(0) == Ok(1))
                .and_then(|l| l.str(2).ok());
            if current != Some(config.apn.as_str()) {
                at.send(&Command::set("+CFUN").int(Self::RADIO_OFF_FUN as i64))
                    .await?;
                at.send(&Command::set("+CGDCONT").int(1).str("IP").str(&config.apn))
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
                    at.send(&Command::set("+UPSV").int(4)).await?;
                    outcome = ConfigOutcome::Changed;
                }
            }
            None => {
                let resp = at.query("+CPSMS").await?;
                if resp.single()?.int(0).unwrap_or(-1) != 0 {
                    at.send(&Command::set("+CPSMS").int(0)).await?;
                    at.send(&Command::set("+UPSV").int(0)).await?;
                    outcome = ConfigOutcome::Changed;
                }
            }
        }

        Ok(outcome)
    }

    async fn power_off<W: Write>(at: &mut AtSession<'_, W>) -> Result<(), Error> {
        at.send(&Command::action("+CPWROFF").timeout(Duration::from_secs(40)))
            .await?;
        Ok(())
    }

    async fn socket_create<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        kind: SocketKind,
    ) -> Result<SocketId, Error> {
        let protocol = match kind {
            SocketKind::Tcp => 6,
            SocketKind::Udp => 17,
        };
        let resp = at.send(&Command::set("+USOCR").int(protocol)).await?;
        let id = SocketId(resp.single()?.int(0)? as u8);
        sockets.claim(id, kind)?;
        Ok(id)
    }

    async fn tcp_connect<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        remote: SocketAddr,
    ) -> Result<(), Error> {
        let mut ip: String<64> = String::new();
        super::format_ip(&remote.ip(), &mut ip);
        at.send(
            &Command::set("+USOCO")
                .int(id.0 as i64)
                .str(&ip)
                .int(remote.port() as i64)
                .timeout(Duration::from_secs(120))
                .abortable(),
        )
        .await?;
        sockets.set_peer(id, remote);
        sockets.set_state(id, CONNECTED);
        Ok(())
    }

    async fn can_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        len: usize,
    ) -> Result<bool, Error> {
        let resp = at
            .send(
                &Command::set("+USOCTL")
                    .int(id.0 as i64)
                    .int(CTL_OUTGOING_BYTES)
                    .timeout(Duration::from_secs(5)),
            )
            .await?;
        let outstanding = resp.single()?.int(2)? as usize;
        Ok(outstanding + len <= TX_BUFFER_LIMIT)
    }

    async fn tcp_send<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        data: &[u8],
    ) -> Result<(), Error> {
        Self::write_hex_command(at, "+USOWR", id, None, data).await
    }

    async fn socket_read<W: Write>(
        at: AtHandle<'_, '_, W>,
        id: SocketId,
        want: usize,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let mut resp = at
            .send(
                &Command::set("+USORD")
                    .int(id.0 as i64)
                    .int(want.min(Self::READ_CHUNK) as i64)
                    .timeout(Duration::from_secs(5)),
            )
            .await?;
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
        Self::write_hex_command(at, "+USOST", id, Some(remote), data).await
    }

    async fn udp_receive<W: Write>(
        at: AtHandle<'_, '_, W>,
        sockets: &SocketSet,
        id: SocketId,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, Error> {
        // Large datagrams come out in chunks; reassemble by offset and
        // take the source from each chunk.
        let mut total = 0;
        let mut source = None;
        loop {
            let want = (buf.len() - total).min(Self::READ_CHUNK);
            if want == 0 {
                break;
            }
            let mut resp = at
                .send(
                    &Command::set("+USORF")
                        .int(id.0 as i64)
                        .int(want as i64)
                        .timeout(Duration::from_secs(5)),
                )
                .await?;
            let payload = resp.take_payload();
            if payload.is_empty() {
                break;
            }
            let line = resp.single()?;
            if let (Ok(ip), Ok(port)) = (line.str(1), line.int(2)) {
                let ip: IpAddr = ip.parse().map_err(|_| Error::Parse)?;
                source = Some(SocketAddr::new(ip, port as u16));
            }
            let n = payload.len().min(buf.len() - total);
            buf[total..total + n].copy_from_slice(&payload[..n]);
            total += n;
            if payload.len() < want {
                break;
            }
        }
        match source {
            Some(source) if total > 0 => Ok(Some((total, source))),
            _ if total > 0 => Ok(Some((total, sockets.peer_of(id).ok_or(Error::Parse)?))),
            _ => Ok(None),
        }
    }

    async fn socket_close<W: Write>(at: AtHandle<'_, '_, W>, id: SocketId) -> Result<(), Error> {
        at.send(
            &Command::set("+USOCL")
                .int(id.0 as i64)
                .timeout(Duration::from_secs(120)),
        )
        .await?;
        Ok(())
    }

    async fn resolve<W: Write>(
        at: AtHandle<'_, '_, W>,
        _shared: &DriverShared,
        host: &str,
    ) -> Result<Vec<IpAddr, MAX_DNS_ADDRS>, Error> {
        let resp = at
            .send(
                &Command::set("+UDNSRN")
                    .int(0)
                    .str(host)
                    .timeout(Duration::from_secs(70))
                    .abortable(),
            )
            .await?;
        let mut addrs = Vec::new();
        for line in resp.lines.iter().filter(|l| l.verb.as_str() == "+UDNSRN") {
            for value in line.values.iter() {
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

    #[test]
    fn hex_read_split() {
        let mut values = Vec::new();
        let mut payload = PayloadBuf::new();
        split_hex_read("0,4,\"C0FFEE00\"", &mut values, &mut payload).unwrap();
        assert_eq!(values[0].as_int(), Some(0));
        assert_eq!(values[1].as_int(), Some(4));
        assert_eq!(payload.as_slice(), &[0xc0, 0xff, 0xee, 0x00]);
    }

    #[test]
    fn hex_read_split_with_source() {
        let mut values = Vec::new();
        let mut payload = PayloadBuf::new();
        split_hex_read(
            "2,\"93.184.216.34\",6000,2,\"ABCD\"",
            &mut values,
            &mut payload,
        )
        .unwrap();
        assert_eq!(values[1].as_str(), Some("93.184.216.34"));
        assert_eq!(values[3].as_int(), Some(2));
        assert_eq!(payload.as_slice(), &[0xab, 0xcd]);
    }

    #[test]
    fn hex_read_split_empty() {
        let mut values = Vec::new();
        let mut payload = PayloadBuf::new();
        split_hex_read("0,0,\"\"", &mut values, &mut payload).unwrap();
        assert!(payload.is_empty());

        values.clear();
        split_hex_read("0,0", &mut values, &mut payload).unwrap();
        assert_eq!(values[1].as_int(), Some(0));
    }

    #[test]
    fn band_mask_decode() {
        let mut values = Vec::new();
        split_values("0,524420,1,524420", &mut values).unwrap();
        assert_eq!(decode_band_masks(&values), Some((524420, 524420)));

        values.clear();
        split_values("0,524420,2,1,524420,2", &mut values).unwrap();
        assert_eq!(decode_band_masks(&values), Some((524420, 524420)));
    }
}
