//! End-to-end driver tests against a scripted fake modem.
//!
//! The fake pairs each expected command line (or raw payload) with a canned
//! reply; unsolicited lines are injected between steps. Futures run on
//! `embassy_futures::block_on` with the std time driver.

use core::cell::{Cell, RefCell};
use core::future::poll_fn;
use core::net::{IpAddr, Ipv4Addr, SocketAddr};
use core::task::Poll;
use std::collections::VecDeque;
use std::rc::Rc;
use std::string::String;
use std::vec::Vec;

use embassy_futures::block_on;
use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Instant};
use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};

use cellular_modem::at::Command;
use cellular_modem::config::{AttemptsStore, NoPin, PsmConfig, Rat};
use cellular_modem::modules::{Bg96, Monarch, SaraR4, SaraR5};
use cellular_modem::state::SessionPhase;
use cellular_modem::{new_device, CellularConfig, Config, Error, Resources};

#[derive(Debug)]
enum Step {
    /// Expect this command line (terminator stripped); reply with bytes.
    Cmd(&'static str, &'static str),
    /// Same, with runtime-built strings (hex payloads).
    CmdOwned(String, String),
    /// Expect exactly these raw bytes (a prompted payload); reply.
    Raw(Vec<u8>, &'static str),
}

struct WireInner {
    steps: RefCell<VecDeque<Step>>,
    rx: RefCell<VecDeque<u8>>,
    tx: RefCell<Vec<u8>>,
    /// Ignore writes once the script is exhausted (teardown probes).
    lenient_tail: Cell<bool>,
}

#[derive(Clone)]
struct Wire(Rc<WireInner>);

impl Wire {
    fn new(steps: Vec<Step>) -> Self {
        Self(Rc::new(WireInner {
            steps: RefCell::new(steps.into()),
            rx: RefCell::new(VecDeque::new()),
            tx: RefCell::new(Vec::new()),
            lenient_tail: Cell::new(false),
        }))
    }

    fn lenient(self) -> Self {
        self.0.lenient_tail.set(true);
        self
    }

    fn inject(&self, text: &str) {
        self.0.rx.borrow_mut().extend(text.bytes());
    }

    fn done(&self) -> bool {
        self.0.steps.borrow().is_empty()
    }

    fn halves(&self) -> (RxHalf, TxHalf) {
        (RxHalf(self.clone()), TxHalf(self.clone()))
    }

    fn process_tx(&self) {
        loop {
            let mut steps = self.0.steps.borrow_mut();
            let mut tx = self.0.tx.borrow_mut();
            let reply = match steps.front() {
                None => {
                    if self.0.lenient_tail.get() {
                        tx.clear();
                    } else if tx.iter().any(|&b| b == b'\r') {
                        panic!(
                            "unexpected command: {:?}",
                            String::from_utf8_lossy(&tx)
                        );
                    }
                    break;
                }
                Some(Step::Cmd(expect, reply)) => {
                    let Some(pos) = tx.iter().position(|&b| b == b'\r') else {
                        break;
                    };
                    let line: Vec<u8> = tx.drain(..=pos).take(pos).collect();
                    assert_eq!(String::from_utf8_lossy(&line), *expect, "command mismatch");
                    reply.to_string()
                }
                Some(Step::CmdOwned(expect, reply)) => {
                    let Some(pos) = tx.iter().position(|&b| b == b'\r') else {
                        break;
                    };
                    let line: Vec<u8> = tx.drain(..=pos).take(pos).collect();
                    assert_eq!(
                        String::from_utf8_lossy(&line),
                        expect.as_str(),
                        "command mismatch"
                    );
                    reply.clone()
                }
                Some(Step::Raw(expect, reply)) => {
                    if tx.len() < expect.len() {
                        break;
                    }
                    let got: Vec<u8> = tx.drain(..expect.len()).collect();
                    assert_eq!(&got, expect, "payload mismatch");
                    reply.to_string()
                }
            };
            steps.pop_front();
            drop(steps);
            drop(tx);
            self.inject(&reply);
        }
    }
}

struct RxHalf(Wire);

impl embedded_io_async::ErrorType for RxHalf {
    type Error = core::convert::Infallible;
}

impl embedded_io_async::Read for RxHalf {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        poll_fn(|cx| {
            let mut rx = self.0 .0.rx.borrow_mut();
            if rx.is_empty() {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            let n = buf.len().min(rx.len());
            for slot in buf[..n].iter_mut() {
                *slot = rx.pop_front().unwrap();
            }
            Poll::Ready(Ok(n))
        })
        .await
    }
}

struct TxHalf(Wire);

impl embedded_io_async::ErrorType for TxHalf {
    type Error = core::convert::Infallible;
}

impl embedded_io_async::Write for TxHalf {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0 .0.tx.borrow_mut().extend_from_slice(buf);
        self.0.process_tx();
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Power pin that records pulse widths.
#[derive(Clone, Default)]
struct PulsePin {
    low_since: Rc<Cell<Option<Instant>>>,
    pulses: Rc<RefCell<Vec<Duration>>>,
}

impl PinErrorType for PulsePin {
    type Error = core::convert::Infallible;
}

impl OutputPin for PulsePin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.low_since.set(Some(Instant::now()));
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        if let Some(at) = self.low_since.take() {
            self.pulses.borrow_mut().push(Instant::now() - at);
        }
        Ok(())
    }
}

struct FakeHw {
    power: PulsePin,
    bauds: Rc<RefCell<Vec<u32>>>,
}

impl FakeHw {
    fn new() -> Self {
        Self {
            power: PulsePin::default(),
            bauds: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl CellularConfig for FakeHw {
    type ResetPin = NoPin;
    type PowerPin = PulsePin;
    type VintPin = NoPin;
    type RxSensePin = NoPin;

    fn reset_pin(&mut self) -> Option<&mut NoPin> {
        None
    }

    fn power_pin(&mut self) -> Option<&mut PulsePin> {
        Some(&mut self.power)
    }

    fn vint_pin(&mut self) -> Option<&mut NoPin> {
        None
    }

    fn rx_sense_pin(&mut self) -> Option<&mut NoPin> {
        None
    }

    fn set_baud_rate(&mut self, baud: u32) {
        self.bauds.borrow_mut().push(baud);
    }
}

#[derive(Clone, Default)]
struct SharedStore(Rc<Cell<u16>>);

impl AttemptsStore for SharedStore {
    fn load(&mut self) -> u16 {
        self.0.get()
    }

    fn store(&mut self, attempts: u16) {
        self.0.set(attempts);
    }
}

/// Run `test` against the ingress task; panics if the reader dies first.
fn run<F: core::future::Future>(ingress: cellular_modem::at::Ingress<'_, RxHalf>, test: F) -> F::Output {
    block_on(async {
        match select(ingress.run(), test).await {
            Either::First(()) => panic!("reader task stopped early"),
            Either::Second(out) => out,
        }
    })
}

/// The standard BG96 bring-up exchange for a config whose settings already
/// match the modem state.
fn bg96_open_steps(apn: &'static str) -> Vec<Step> {
    vec![
        Step::Cmd("AT", "\r\nOK\r\n"),
        Step::Cmd("ATE0", "\r\nOK\r\n"),
        Step::Cmd("AT+CMEE=2", "\r\nOK\r\n"),
        Step::Cmd("AT+CPIN?", "\r\n+CPIN: READY\r\nOK\r\n"),
        Step::Cmd("AT+QCFG=\"nwscanseq\"", "\r\n+QCFG: \"nwscanseq\",02\r\nOK\r\n"),
        Step::Cmd("AT+QCFG=\"nwscanmode\"", "\r\n+QCFG: \"nwscanmode\",3\r\nOK\r\n"),
        Step::Cmd("AT+QCFG=\"iotopmode\"", "\r\n+QCFG: \"iotopmode\",0\r\nOK\r\n"),
        Step::CmdOwned(
            "AT+CGDCONT?".into(),
            format!("\r\n+CGDCONT: 1,\"IP\",\"{}\",\"0.0.0.0\",0,0\r\nOK\r\n", apn),
        ),
        Step::Cmd("AT+CPSMS?", "\r\n+CPSMS: 0,,,\"\",\"\"\r\nOK\r\n"),
        Step::Cmd("AT+CFUN=1", "\r\nOK\r\n"),
        Step::Cmd("AT+CEREG=2", "\r\nOK\r\n"),
        Step::Cmd("AT+COPS=0", "\r\nOK\r\n+CEREG: 1\r\n"),
        Step::Cmd("AT+QIACT?", "\r\n+QIACT: 1,1,1,\"10.32.1.5\"\r\nOK\r\n"),
    ]
}

fn bg96_config(apn: &str) -> Config {
    Config::new().with_apn(apn).with_rats(&[Rat::LteM])
}

#[test]
fn bg96_tcp_echo() {
    let mut steps = bg96_open_steps("soracom.io");
    steps.extend([
        Step::Cmd(
            "AT+QIOPEN=1,0,\"TCP\",\"93.184.216.34\",80,0,1",
            "\r\nOK\r\n+QIOPEN: 0,0\r\n",
        ),
        Step::Cmd("AT+QISEND=0,18", "> "),
        Step::Raw(b"GET / HTTP/1.0\r\n\r\n".to_vec(), "\r\nSEND OK\r\n"),
        Step::Cmd("AT+QIRD=0,1500", "\r\n+QIRD: 12\r\nHTTP/1.0 200\r\nOK\r\n"),
        Step::Cmd("AT+QICLOSE=0", "\r\nOK\r\n"),
        Step::Cmd("AT+QPOWD=1", "\r\nOK\r\n"),
    ]);
    let wire = Wire::new(steps).lenient();
    let (rx, tx) = wire.halves();
    let store = SharedStore(Rc::new(Cell::new(5)));

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        store.clone(),
        bg96_config("soracom.io"),
    );

    run(ingress, async {
        device.open_network().await.unwrap();
        assert_eq!(device.phase(), SessionPhase::Attached);
        // Success resets the failure counter.
        assert_eq!(store.0.get(), 0);

        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 80);
        let mut socket = device.tcp_connect(peer).await.unwrap();
        assert_eq!(socket.peer(), Some(peer));

        let written = socket.try_write(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        assert_eq!(written, 18);

        wire.inject("\r\n+QIURC: \"recv\",0\r\n");
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.0 200");

        socket.close().await.unwrap();

        device.close_network().await.unwrap();
        assert_eq!(device.phase(), SessionPhase::Off);
    });
    assert!(wire.done());
}

#[test]
fn bg96_connect_refused_leaves_no_socket() {
    let mut steps = bg96_open_steps("soracom.io");
    steps.extend([
        Step::Cmd(
            "AT+QIOPEN=1,0,\"TCP\",\"93.184.216.34\",80,0,1",
            "\r\nOK\r\n+QIOPEN: 0,566\r\n",
        ),
        // Best-effort cleanup of the failed id.
        Step::Cmd("AT+QICLOSE=0", "\r\nERROR\r\n"),
        // The id is free again for the next open.
        Step::Cmd(
            "AT+QIOPEN=1,0,\"TCP\",\"1.1.1.1\",53,0,1",
            "\r\nOK\r\n+QIOPEN: 0,0\r\n",
        ),
    ]);
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        bg96_config("soracom.io"),
    );

    run(ingress, async {
        device.open_network().await.unwrap();

        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 80);
        let err = device.tcp_connect(peer).await.unwrap_err();
        assert_eq!(err, Error::Unknown(566));

        // The map holds no entry: the same id is handed out again.
        let peer2 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);
        let socket = device.tcp_connect(peer2).await.unwrap();
        assert_eq!(socket.id().0, 0);
    });
    assert!(wire.done());
}

#[test]
fn dns_requests_are_serialized() {
    let steps = vec![
        Step::Cmd(
            "AT+QIDNSGIP=1,\"a.example\"",
            "\r\nOK\r\n+QIURC: \"dnsgip\",0,1,600\r\n+QIURC: \"dnsgip\",\"10.0.0.1\"\r\n",
        ),
        Step::Cmd(
            "AT+QIDNSGIP=1,\"b.example\"",
            "\r\nOK\r\n+QIURC: \"dnsgip\",0,2,600\r\n+QIURC: \"dnsgip\",\"10.0.0.2\"\r\n+QIURC: \"dnsgip\",\"10.0.0.3\"\r\n",
        ),
    ];
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new(),
    );

    run(ingress, async {
        let (a, b) = join(device.resolve("a.example"), device.resolve("b.example")).await;
        assert_eq!(
            a.unwrap().as_slice(),
            &[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]
        );
        assert_eq!(
            b.unwrap().as_slice(),
            &[
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3))
            ]
        );
    });
    assert!(wire.done());
}

#[test]
fn ip_literals_resolve_without_the_modem() {
    let wire = Wire::new(vec![]);
    let (rx, tx) = wire.halves();
    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new(),
    );
    run(ingress, async {
        let addrs = device.resolve("192.168.1.7").await.unwrap();
        assert_eq!(
            addrs.as_slice(),
            &[IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7))]
        );
    });
}

fn sara_open_steps(apn: &'static str) -> Vec<Step> {
    vec![
        Step::Cmd("AT", "\r\nOK\r\n"),
        Step::Cmd("ATE0", "\r\nOK\r\n"),
        Step::Cmd("AT+CMEE=2", "\r\nOK\r\n"),
        Step::Cmd("AT+CPIN?", "\r\n+CPIN: READY\r\nOK\r\n"),
        Step::Cmd("AT+UMNOPROF?", "\r\n+UMNOPROF: 100\r\nOK\r\n"),
        Step::Cmd("AT+UDCONF=1", "\r\n+UDCONF: 1,1\r\nOK\r\n"),
        Step::Cmd("AT+URAT?", "\r\n+URAT: 7\r\nOK\r\n"),
        Step::CmdOwned(
            "AT+CGDCONT?".into(),
            format!("\r\n+CGDCONT: 1,\"IP\",\"{}\"\r\nOK\r\n", apn),
        ),
        Step::Cmd("AT+CPSMS?", "\r\n+CPSMS: 0\r\nOK\r\n"),
        Step::Cmd("AT+CFUN=1", "\r\nOK\r\n"),
        Step::Cmd("AT+CEREG=2", "\r\nOK\r\n"),
        Step::Cmd("AT+COPS=0", "\r\nOK\r\n+CEREG: 5\r\n"),
    ]
}

#[test]
fn sara_write_backpressure_then_hex_write() {
    let payload = [0xABu8; 1024];
    let hex: String = "AB".repeat(1024);

    let mut steps = sara_open_steps("internet");
    steps.extend([
        Step::Cmd("AT+USOCR=6", "\r\n+USOCR: 0\r\nOK\r\n"),
        Step::Cmd("AT+USOCO=0,\"10.9.8.7\",4444", "\r\nOK\r\n"),
        // First attempt: the outbound buffer is too full.
        Step::Cmd("AT+USOCTL=0,11", "\r\n+USOCTL: 0,11,10000\r\nOK\r\n"),
        // Second attempt: drained.
        Step::Cmd("AT+USOCTL=0,11", "\r\n+USOCTL: 0,11,128\r\nOK\r\n"),
        Step::CmdOwned(
            format!("AT+USOWR=0,1024,\"{}\"", hex),
            "\r\n+USOWR: 0,1024\r\nOK\r\n".into(),
        ),
    ]);
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<SaraR4, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new().with_apn("internet").with_rats(&[Rat::LteM]),
    );

    run(ingress, async {
        device.open_network().await.unwrap();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7)), 4444);
        let mut socket = device.tcp_connect(peer).await.unwrap();

        let before = Instant::now();
        assert_eq!(socket.try_write(&payload).await.unwrap(), 0);
        // Back-pressure backs off for about 100 ms.
        assert!(Instant::now() - before >= Duration::from_millis(100));

        assert_eq!(socket.try_write(&payload).await.unwrap(), 1024);
    });
    assert!(wire.done());
}

#[test]
fn sara_hex_read() {
    let mut steps = sara_open_steps("internet");
    steps.extend([
        Step::Cmd("AT+USOCR=6", "\r\n+USOCR: 2\r\nOK\r\n"),
        Step::Cmd("AT+USOCO=2,\"10.9.8.7\",4444", "\r\nOK\r\n"),
        Step::Cmd("AT+USORD=2,64", "\r\n+USORD: 2,5,\"48454C4C4F\"\r\nOK\r\n"),
    ]);
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<SaraR4, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new().with_apn("internet").with_rats(&[Rat::LteM]),
    );

    run(ingress, async {
        device.open_network().await.unwrap();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7)), 4444);
        let mut socket = device.tcp_connect(peer).await.unwrap();

        wire.inject("\r\n+UUSORD: 2,5\r\n");
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HELLO");
    });
    assert!(wire.done());
}

#[test]
fn monarch_udp_round_trip() {
    let steps = vec![
        Step::Cmd("AT", "\r\nOK\r\n"),
        Step::Cmd("ATE0", "\r\nOK\r\n"),
        Step::Cmd("AT+CMEE=2", "\r\nOK\r\n"),
        Step::Cmd("AT+CPIN?", "\r\n+CPIN: READY\r\nOK\r\n"),
        Step::Cmd("AT+CPSMS?", "\r\n+CPSMS: 0\r\nOK\r\n"),
        Step::Cmd("AT+CFUN=1", "\r\nOK\r\n"),
        Step::Cmd("AT+CEREG=2", "\r\nOK\r\n"),
        Step::Cmd("AT+COPS=0", "\r\nOK\r\n+CEREG: 5\r\n"),
        // Socket ids start at 1 on this chip.
        Step::Cmd("AT+SQNSCFG=1,1,1500,0,600,50", "\r\nOK\r\n"),
        Step::Cmd("AT+SQNSCFGEXT=1,1,0,0", "\r\nOK\r\n"),
        Step::Cmd("AT+SQNSD=1,1,7,\"9.9.9.9\",0,0,1", "\r\nOK\r\n"),
        Step::Cmd("AT+SQNSSENDEXT=1,4", "> "),
        Step::Raw(b"ping".to_vec(), "\r\nOK\r\n"),
        Step::Cmd("AT+SQNSRECV=1,1500", "\r\n+SQNSRECV: 1,4\r\npong\r\nOK\r\n"),
    ];
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Monarch, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new(),
    );

    run(ingress, async {
        device.open_network().await.unwrap();

        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 7);
        let mut socket = device.udp_open(None).await.unwrap();
        assert_eq!(socket.id().0, 1);

        // Oversized datagrams are rejected before touching the wire.
        let oversized = vec![0u8; socket.mtu() + 1];
        assert_eq!(
            socket.send_to(peer, &oversized).await.unwrap_err(),
            Error::PayloadTooLarge
        );

        socket.send_to(peer, b"ping").await.unwrap();

        wire.inject("\r\n+SQNSRING: 1,4\r\n");
        let mut buf = [0u8; 32];
        let (n, source) = socket.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(source, peer);
    });
    assert!(wire.done());
}

#[test]
fn sockets_require_an_attached_session() {
    let wire = Wire::new(vec![]);
    let (rx, tx) = wire.halves();
    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Monarch, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new(),
    );
    run(ingress, async {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 7);
        assert_eq!(
            device.udp_open(Some(peer)).await.unwrap_err(),
            Error::NotConnected
        );
        assert_eq!(
            device.tcp_connect(peer).await.unwrap_err(),
            Error::NotConnected
        );
        assert_eq!(device.tcp_listen(7).unwrap_err(), Error::Unimplemented);
    })
}

#[test]
fn psm_reconnect_reregisters() {
    let steps = vec![
        // First wake.
        Step::Cmd("AT", "\r\nOK\r\n"),
        Step::Cmd("AT+CEREG=2", "\r\nOK\r\n"),
        Step::Cmd("AT+COPS=0", "\r\nOK\r\n+CEREG: 1\r\n+QPSMTIMER: 3600,120\r\n"),
        Step::Cmd("AT+QIACT?", "\r\n+QIACT: 1,1,1,\"10.0.0.9\"\r\nOK\r\n"),
        // Second wake; handler registration is not repeated but the
        // attach path is.
        Step::Cmd("AT", "\r\nOK\r\n"),
        Step::Cmd("AT+CEREG=2", "\r\nOK\r\n"),
        Step::Cmd("AT+COPS=0", "\r\nOK\r\n+CEREG: 1\r\n"),
        Step::Cmd("AT+QIACT?", "\r\n+QIACT: 1,1,1,\"10.0.0.9\"\r\nOK\r\n"),
    ];
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new().with_psm(PsmConfig {
            periodic_tau: heapless::String::try_from("00101011").unwrap(),
            active_time: heapless::String::try_from("00100001").unwrap(),
        }),
    );

    run(ingress, async {
        device.connect_psm().await.unwrap();
        assert_eq!(device.phase(), SessionPhase::Attached);
        assert!(device.psm_timer_reported());

        device.connect_psm().await.unwrap();
        assert_eq!(device.phase(), SessionPhase::Attached);
    });
    assert!(wire.done());
}

#[test]
fn soft_reset_on_eighth_consecutive_failure() {
    let steps = vec![
        Step::Cmd("AT", "\r\nOK\r\n"),
        // Attempt 8: the module is software-reset before proceeding.
        Step::Cmd("AT+CFUN=15", "\r\nOK\r\n"),
        Step::Cmd("AT", "\r\nOK\r\n"),
        Step::Cmd("ATE0", "\r\nOK\r\n"),
        Step::Cmd("AT+CMEE=2", "\r\nOK\r\n"),
        Step::Cmd("AT+CPIN?", "\r\n+CPIN: READY\r\nOK\r\n"),
        // Fail the attempt quickly afterwards.
        Step::Cmd("AT+UMNOPROF?", "\r\nERROR\r\n"),
    ];
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();
    let store = SharedStore(Rc::new(Cell::new(7)));

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<SaraR5, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        store.clone(),
        Config::new(),
    );

    run(ingress, async {
        let err = device.open_network().await.unwrap_err();
        assert!(matches!(err, Error::At(_)));
    });
    assert!(wire.done());
    // The counter keeps climbing until a success.
    assert_eq!(store.0.get(), 8);
}

#[test]
fn power_cycle_on_sixteenth_consecutive_failure() {
    let steps = vec![
        Step::Cmd("AT", "\r\nOK\r\n"),
        // Fail immediately after bring-up.
        Step::Cmd("ATE0", "\r\nERROR\r\n"),
    ];
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();
    let store = SharedStore(Rc::new(Cell::new(15)));
    let hw = FakeHw::new();
    let pulses = hw.power.pulses.clone();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        hw,
        store.clone(),
        Config::new(),
    );

    run(ingress, async {
        let err = device.open_network().await.unwrap_err();
        assert!(matches!(err, Error::At(_)));
    });
    assert_eq!(store.0.get(), 16);

    // Two pulses: the forced power-off, then the regular power-on.
    let pulses = pulses.borrow();
    assert_eq!(pulses.len(), 2);
    assert!(pulses[0] >= Duration::from_millis(650));
    assert!(pulses[1] >= Duration::from_millis(150) && pulses[1] < Duration::from_millis(650));
}

#[test]
fn urc_lines_are_not_attributed_to_responses() {
    let steps = vec![Step::Cmd(
        "AT+CPSMS?",
        "\r\n+QIURC: \"recv\",3\r\n+CPSMS: 0,,,\"\",\"\"\r\nOK\r\n",
    )];
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new(),
    );

    run(ingress, async {
        let resp = device
            .at_handle()
            .send(&Command::read("+CPSMS"))
            .await
            .unwrap();
        // The interleaved unsolicited line went to the URC path, not into
        // this response.
        assert_eq!(resp.lines.len(), 1);
        assert_eq!(resp.lines[0].verb.as_str(), "+CPSMS");
    });
    assert!(wire.done());
}

#[test]
fn timed_out_abortable_command_recovers_within_flush() {
    let steps = vec![
        // No reply to the scan; the command times out and is aborted.
        Step::Cmd("AT+COPS=0", ""),
        Step::Cmd("AT", "\r\n+CME ERROR: Command aborted\r\n"),
        // The channel is immediately usable again.
        Step::Cmd("AT+CSQ", "\r\n+CSQ: 24,99\r\nOK\r\n"),
    ];
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new(),
    );

    run(ingress, async {
        let err = device
            .at_handle()
            .send(
                &Command::set("+COPS")
                    .int(0)
                    .timeout(Duration::from_millis(200))
                    .abortable(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, cellular_modem::at::Error::Timeout);

        let flushed_by = Instant::now() + Duration::from_secs(1);
        let (rssi, _) = device.signal_quality().await.unwrap();
        assert_eq!(rssi, 24);
        assert!(Instant::now() < flushed_by);
    });
    assert!(wire.done());
}

#[test]
fn writes_larger_than_the_chunk_limit_are_split() {
    let big = vec![0x42u8; 1461];
    let mut steps = bg96_open_steps("soracom.io");
    steps.extend([
        Step::Cmd(
            "AT+QIOPEN=1,0,\"TCP\",\"8.8.4.4\",4000,0,1",
            "\r\nOK\r\n+QIOPEN: 0,0\r\n",
        ),
        Step::Cmd("AT+QISEND=0,1460", "> "),
        Step::Raw(vec![0x42u8; 1460], "\r\nSEND OK\r\n"),
        Step::Cmd("AT+QISEND=0,1", "> "),
        Step::Raw(vec![0x42u8; 1], "\r\nSEND OK\r\n"),
    ]);
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        bg96_config("soracom.io"),
    );

    run(ingress, async {
        device.open_network().await.unwrap();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)), 4000);
        let mut socket = device.tcp_connect(peer).await.unwrap();

        // One MTU in one transaction, the remainder in a second.
        assert_eq!(socket.try_write(&big).await.unwrap(), 1460);
        assert_eq!(socket.try_write(&big[1460..]).await.unwrap(), 1);
    });
    assert!(wire.done());
}

#[test]
fn bg96_apn_change_forces_reboot() {
    let steps = vec![
        Step::Cmd("AT", "\r\nOK\r\n"),
        Step::Cmd("ATE0", "\r\nOK\r\n"),
        Step::Cmd("AT+CMEE=2", "\r\nOK\r\n"),
        Step::Cmd("AT+CPIN?", "\r\n+CPIN: READY\r\nOK\r\n"),
        Step::Cmd("AT+QCFG=\"nwscanseq\"", "\r\n+QCFG: \"nwscanseq\",02\r\nOK\r\n"),
        Step::Cmd("AT+QCFG=\"nwscanmode\"", "\r\n+QCFG: \"nwscanmode\",3\r\nOK\r\n"),
        Step::Cmd("AT+QCFG=\"iotopmode\"", "\r\n+QCFG: \"iotopmode\",0\r\nOK\r\n"),
        // The modem still carries the previous APN.
        Step::Cmd(
            "AT+CGDCONT?",
            "\r\n+CGDCONT: 1,\"IP\",\"old.apn\"\r\nOK\r\n",
        ),
        Step::Cmd("AT+CFUN=0", "\r\nOK\r\n"),
        Step::Cmd("AT+CGDCONT=1,\"IP\",\"soracom.io\"", "\r\nOK\r\n"),
        // The write is only honored after a reboot.
        Step::Cmd("AT+CFUN=1,1", "\r\nOK\r\n"),
        Step::Cmd("AT", "\r\nOK\r\n"),
        // Fail the second pass quickly; the reboot has been observed.
        Step::Cmd("AT+QCFG=\"nwscanseq\"", "\r\nERROR\r\n"),
    ];
    let wire = Wire::new(steps);
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        bg96_config("soracom.io"),
    );

    run(ingress, async {
        let err = device.open_network().await.unwrap_err();
        assert!(matches!(err, Error::At(_)));
    });
    assert!(wire.done());
}

#[test]
fn session_close_stops_all_traffic() {
    let wire = Wire::new(vec![
        Step::Cmd("AT+CSQ", "\r\n+CSQ: 10,99\r\nOK\r\n"),
        Step::Cmd("AT+QPOWD=1", "\r\nOK\r\n"),
    ])
    .lenient();
    let (rx, tx) = wire.halves();

    let mut resources = Resources::new();
    let (device, ingress) = new_device::<Bg96, _, _, _, _>(
        &mut resources,
        rx,
        tx,
        FakeHw::new(),
        SharedStore::default(),
        Config::new(),
    );

    block_on(async {
        let ingress_task = ingress.run();
        let test = async {
            device.signal_quality().await.unwrap();
            device.close().await.ok();
            // Everything after close fails without touching the wire.
            assert_eq!(
                device.signal_quality().await.unwrap_err(),
                Error::Closed
            );
            assert!(device.resolve("x.example").await.is_err());
        };
        // The reader task exits on close; both sides finish.
        join(ingress_task, test).await;
    });
    assert!(wire.done());
}
