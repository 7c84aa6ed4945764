use core::cell::RefCell;
use core::str::FromStr;

use embassy_futures::select::{select, select3, Either, Either3};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_sync::signal::Signal;
use embassy_time::{with_deadline, Duration, Instant, Timer};
use embedded_io_async::{Read, Write};
use heapless::{String, Vec};

use crate::fmt::LossyStr;
use crate::socket::SocketSet;
use crate::state::{DriverShared, UrcTranslator, FRAME_QUEUE};

use super::command::{Command, CMD_BUF_LEN};
use super::response::{
    classify, split_values, AtErrorLine, AtResponse, AtValue, InfoLine, LineClass, PayloadBuf,
    PayloadRule, ResponseParser, LINE_LEN, VALUE_LEN, VERB_LEN,
};
use super::Error;

const MAX_TERMINATIONS: usize = 8;
const MAX_URC_VERBS: usize = 16;
const MAX_URC_HANDLERS: usize = 8;
const MAX_PARSERS: usize = 16;

const RAW_CHUNK: usize = 32;

const ABORT_ATTEMPTS: usize = 3;
const ABORT_PING_TIMEOUT: Duration = Duration::from_secs(5);
const ABORT_OVERALL_TIMEOUT: Duration = Duration::from_secs(20);

/// A handler invoked on the reader task for a matching unsolicited line.
/// Handlers must not issue AT commands; they only record state.
pub type UrcHandler = fn(&InfoLine);

/// Framed traffic from the reader task to the command sender.
#[derive(Debug)]
pub(crate) enum Frame {
    Info(InfoLine),
    Payload(PayloadBuf),
    Final { ok: bool, line: String<VALUE_LEN> },
    Prompt,
}

#[derive(Debug, Clone)]
struct Pending {
    verb: String<VERB_LEN>,
    wants_prompt: bool,
}

struct SessionInner {
    closed: bool,
    /// Command echo is still on; echoed lines are consumed silently.
    echo: bool,
    pending: Option<Pending>,
    ok_terms: Vec<&'static str, MAX_TERMINATIONS>,
    err_terms: Vec<&'static str, MAX_TERMINATIONS>,
    urc_verbs: Vec<&'static str, MAX_URC_VERBS>,
    handlers: Vec<(&'static str, UrcHandler), MAX_URC_HANDLERS>,
    parsers: Vec<ResponseParser, MAX_PARSERS>,
    translate: Option<UrcTranslator>,
}

/// State shared between the command sender and the reader task.
pub struct SessionShared {
    inner: BlockingMutex<NoopRawMutex, RefCell<SessionInner>>,
    pub(crate) s3: u8,
    pub(crate) data_marker: u8,
    pub(crate) cmd_cooldown: Duration,
    pub(crate) data_byte_delay: Option<Duration>,
    closed_sig: Signal<NoopRawMutex, ()>,
    pause_req: Signal<NoopRawMutex, ()>,
    pause_ack: Signal<NoopRawMutex, ()>,
    resume: Signal<NoopRawMutex, ()>,
    raw: Channel<NoopRawMutex, Vec<u8, RAW_CHUNK>, 2>,
}

impl SessionShared {
    pub(crate) const fn new() -> Self {
        Self {
            inner: BlockingMutex::new(RefCell::new(SessionInner {
                closed: false,
                echo: true,
                pending: None,
                ok_terms: Vec::new(),
                err_terms: Vec::new(),
                urc_verbs: Vec::new(),
                handlers: Vec::new(),
                parsers: Vec::new(),
                translate: None,
            })),
            s3: b'\r',
            data_marker: b'>',
            cmd_cooldown: Duration::from_millis(20),
            data_byte_delay: None,
            closed_sig: Signal::new(),
            pause_req: Signal::new(),
            pause_ack: Signal::new(),
            resume: Signal::new(),
            raw: Channel::new(),
        }
    }

    pub(crate) fn init(
        &mut self,
        ok_terms: &'static [&'static str],
        err_terms: &'static [&'static str],
        urc_verbs: &'static [&'static str],
        parsers: &'static [ResponseParser],
        translate: UrcTranslator,
    ) {
        self.inner.lock(|i| {
            let inner = &mut *i.borrow_mut();
            for &t in ["OK"].iter().chain(ok_terms) {
                inner.ok_terms.push(t).ok();
            }
            for &t in ["ERROR", "+CME ERROR:", "+CMS ERROR:"]
                .iter()
                .chain(err_terms)
            {
                inner.err_terms.push(t).ok();
            }
            for &v in urc_verbs {
                inner.urc_verbs.push(v).ok();
            }
            for p in parsers {
                inner.parsers.push(*p).ok();
            }
            inner.translate = Some(translate);
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock(|i| i.borrow().closed)
    }

    /// Tear the session down. Idempotent; wakes the reader task so it can
    /// stop consuming the UART.
    pub fn close(&self) {
        self.inner.lock(|i| i.borrow_mut().closed = true);
        self.closed_sig.signal(());
    }

    pub fn add_ok_termination(&self, term: &'static str) {
        self.inner.lock(|i| {
            i.borrow_mut().ok_terms.push(term).ok();
        });
    }

    pub fn add_error_termination(&self, term: &'static str) {
        self.inner.lock(|i| {
            i.borrow_mut().err_terms.push(term).ok();
        });
    }

    pub fn add_response_parser(&self, parser: ResponseParser) {
        self.inner.lock(|i| {
            i.borrow_mut().parsers.push(parser).ok();
        });
    }

    /// Register `handler` for `verb`. Handlers run in registration order;
    /// registering the same pair twice invokes it twice.
    pub fn register_urc(&self, verb: &'static str, handler: UrcHandler) {
        self.inner.lock(|i| {
            i.borrow_mut().handlers.push((verb, handler)).ok();
        });
    }

    /// Remove the first matching registration of `(verb, handler)`.
    pub fn unregister_urc(&self, verb: &'static str, handler: UrcHandler) {
        self.inner.lock(|i| {
            let handlers = &mut i.borrow_mut().handlers;
            if let Some(pos) = handlers
                .iter()
                .position(|(v, h)| *v == verb && *h == handler)
            {
                handlers.remove(pos);
            }
        });
    }

    fn set_pending(&self, verb: &str, wants_prompt: bool) {
        self.inner.lock(|i| {
            i.borrow_mut().pending = Some(Pending {
                verb: String::from_str(&verb[..verb.len().min(VERB_LEN)]).unwrap_or_default(),
                wants_prompt,
            });
        });
    }

    fn clear_pending(&self) {
        self.inner.lock(|i| i.borrow_mut().pending = None);
    }

    fn pending_verb(&self) -> Option<String<VERB_LEN>> {
        self.inner
            .lock(|i| i.borrow().pending.as_ref().map(|p| p.verb.clone()))
    }

    fn wants_prompt(&self) -> bool {
        self.inner.lock(|i| {
            i.borrow()
                .pending
                .as_ref()
                .map_or(false, |p| p.wants_prompt)
        })
    }

    fn prompt_seen(&self) {
        self.inner.lock(|i| {
            if let Some(p) = i.borrow_mut().pending.as_mut() {
                p.wants_prompt = false;
            }
        });
    }

    fn echo_enabled(&self) -> bool {
        self.inner.lock(|i| i.borrow().echo)
    }

    fn echo_off(&self) {
        self.inner.lock(|i| i.borrow_mut().echo = false);
    }

    fn terminations(
        &self,
    ) -> (
        Vec<&'static str, MAX_TERMINATIONS>,
        Vec<&'static str, MAX_TERMINATIONS>,
    ) {
        self.inner.lock(|i| {
            let inner = i.borrow();
            (inner.ok_terms.clone(), inner.err_terms.clone())
        })
    }

    fn parser_for(&self, verb: &str) -> Option<ResponseParser> {
        self.inner.lock(|i| {
            i.borrow()
                .parsers
                .iter()
                .find(|p| p.verb == verb)
                .copied()
        })
    }

    fn is_urc_verb(&self, verb: &str) -> bool {
        self.inner.lock(|i| {
            let inner = i.borrow();
            inner.urc_verbs.iter().any(|v| *v == verb)
                || inner.handlers.iter().any(|(v, _)| *v == verb)
        })
    }

    fn handlers_for(&self, verb: &str) -> Vec<UrcHandler, MAX_URC_HANDLERS> {
        self.inner.lock(|i| {
            i.borrow()
                .handlers
                .iter()
                .filter(|(v, _)| *v == verb)
                .map(|(_, h)| *h)
                .collect()
        })
    }

    fn translator(&self) -> Option<UrcTranslator> {
        self.inner.lock(|i| i.borrow().translate)
    }
}

enum FramerMode {
    Line,
    /// Collecting a length-delimited binary payload following `line`.
    Payload { line: InfoLine, remaining: usize },
}

/// Reader half of the session. Owns the UART receiver; frames lines,
/// attributes them to the outstanding command or dispatches them as URCs,
/// and applies module-translated events to driver state.
///
/// Run `.run()` in a background task for the driver to operate.
pub struct Ingress<'d, R: Read> {
    rx: R,
    shared: &'d SessionShared,
    driver: &'d DriverShared,
    sockets: &'d SocketSet,
    frames: Sender<'d, NoopRawMutex, Frame, FRAME_QUEUE>,
    line: Vec<u8, LINE_LEN>,
    payload: PayloadBuf,
    mode: FramerMode,
}

impl<'d, R: Read> Ingress<'d, R> {
    pub(crate) fn new(
        rx: R,
        shared: &'d SessionShared,
        driver: &'d DriverShared,
        sockets: &'d SocketSet,
        frames: Sender<'d, NoopRawMutex, Frame, FRAME_QUEUE>,
    ) -> Self {
        Self {
            rx,
            shared,
            driver,
            sockets,
            frames,
            line: Vec::new(),
            payload: Vec::new(),
            mode: FramerMode::Line,
        }
    }

    /// Reader loop; returns once the session is closed.
    pub async fn run(mut self) {
        let mut buf = [0u8; 32];
        loop {
            match select3(
                self.shared.pause_req.wait(),
                self.shared.closed_sig.wait(),
                self.rx.read(&mut buf),
            )
            .await
            {
                Either3::First(()) => self.paused().await,
                Either3::Second(()) => return,
                Either3::Third(Ok(n)) => {
                    for &b in &buf[..n] {
                        self.ingest(b).await;
                    }
                }
                Either3::Third(Err(_)) => {
                    warn!("UART read error");
                    Timer::after(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// The byte pipe is lent out; forward raw bytes until resumed, then
    /// resynchronize by dropping any partial line.
    async fn paused(&mut self) {
        self.shared.pause_ack.signal(());
        let mut buf = [0u8; RAW_CHUNK];
        loop {
            match select(self.shared.resume.wait(), self.rx.read(&mut buf)).await {
                Either::First(()) => {
                    self.line.clear();
                    self.mode = FramerMode::Line;
                    return;
                }
                Either::Second(Ok(n)) if n > 0 => {
                    let mut chunk = Vec::new();
                    chunk.extend_from_slice(&buf[..n]).ok();
                    self.shared.raw.send(chunk).await;
                }
                Either::Second(_) => Timer::after(Duration::from_millis(10)).await,
            }
        }
    }

    async fn ingest(&mut self, b: u8) {
        if matches!(self.mode, FramerMode::Payload { .. }) {
            self.payload.push(b).ok();
            let done = {
                let FramerMode::Payload { remaining, .. } = &mut self.mode else {
                    unreachable!()
                };
                *remaining -= 1;
                *remaining == 0
            };
            if done {
                let FramerMode::Payload { line, .. } =
                    core::mem::replace(&mut self.mode, FramerMode::Line)
                else {
                    unreachable!()
                };
                let payload = core::mem::take(&mut self.payload);
                self.route(line, Some(payload)).await;
            }
            return;
        }

        if self.line.is_empty() && b == self.shared.data_marker && self.shared.wants_prompt() {
            self.shared.prompt_seen();
            self.frames.send(Frame::Prompt).await;
            return;
        }
        if b == self.shared.s3 || b == b'\n' {
            if !self.line.is_empty() {
                let line = core::mem::take(&mut self.line);
                self.process_line(&line).await;
            }
            return;
        }
        if self.line.push(b).is_err() {
            warn!("line overflow, dropping {:?}", LossyStr(&self.line));
            self.line.clear();
        }
    }

    async fn process_line(&mut self, raw: &[u8]) {
        let Ok(text) = core::str::from_utf8(raw) else {
            warn!("non-UTF8 line {:?}", LossyStr(raw));
            return;
        };
        let text = text.trim_end();
        if text.is_empty() {
            return;
        }
        trace!("<- {:?}", text);

        if self.shared.echo_enabled() && text.starts_with("AT") {
            return;
        }

        let (ok_terms, err_terms) = self.shared.terminations();
        match classify(text, &ok_terms, &err_terms) {
            LineClass::Final { ok } => {
                if self.shared.pending_verb().is_some() {
                    let line =
                        String::from_str(&text[..text.len().min(VALUE_LEN)]).unwrap_or_default();
                    self.frames.send(Frame::Final { ok, line }).await;
                    // The exchange is over; anything further in this burst
                    // is unsolicited even if its verb matches.
                    self.shared.clear_pending();
                } else {
                    trace!("stray final line");
                }
            }
            LineClass::Info { verb, rest } => {
                let mut info = InfoLine {
                    verb: String::from_str(verb).unwrap_or_default(),
                    values: Vec::new(),
                };
                self.payload.clear();
                let parser = self.shared.parser_for(verb);
                let split = parser.and_then(|p| p.split);
                let parsed = match split {
                    Some(split) => split(rest, &mut info.values, &mut self.payload),
                    None => split_values(rest, &mut info.values),
                };
                if parsed.is_err() {
                    warn!("unparseable line {:?}", text);
                    return;
                }

                if !self.payload.is_empty() {
                    let payload = core::mem::take(&mut self.payload);
                    self.route(info, Some(payload)).await;
                    return;
                }

                if let Some(ResponseParser {
                    payload: PayloadRule::LengthValue { len_index },
                    ..
                }) = parser
                {
                    let len = info.values.get(len_index).and_then(AtValue::as_int);
                    match len {
                        Some(len) if len > 0 => {
                            // Bytes beyond the scratch capacity are counted
                            // down but dropped.
                            self.mode = FramerMode::Payload {
                                line: info,
                                remaining: len as usize,
                            };
                            return;
                        }
                        _ => {}
                    }
                }

                self.route(info, None).await;
            }
            LineClass::Bare => {
                if self.shared.pending_verb().is_some() {
                    let mut info = InfoLine::default();
                    info.values
                        .push(AtValue::Str(
                            String::from_str(&text[..text.len().min(VALUE_LEN)])
                                .unwrap_or_default(),
                        ))
                        .ok();
                    self.frames.send(Frame::Info(info)).await;
                }
            }
        }
    }

    /// Attribute a parsed information line: to the outstanding command's
    /// response, or to the URC path (typed event first, then registered
    /// handlers in order).
    async fn route(&mut self, info: InfoLine, payload: Option<PayloadBuf>) {
        let pending = self.shared.pending_verb();
        let for_command = match &pending {
            Some(verb) => verb == &info.verb || !self.shared.is_urc_verb(&info.verb),
            None => false,
        };

        if for_command {
            self.frames.send(Frame::Info(info)).await;
            if let Some(p) = payload {
                self.frames.send(Frame::Payload(p)).await;
            }
            return;
        }

        if let Some(translate) = self.shared.translator() {
            if let Some(event) = translate(&info) {
                self.driver.apply(event, self.sockets);
            }
        }
        for handler in self.shared.handlers_for(&info.verb) {
            handler(&info);
        }
    }
}

/// Writer half of the session. Serializes commands, matches their
/// responses, and owns the command-side tunables.
pub struct AtSession<'d, W: Write> {
    tx: W,
    frames: Receiver<'d, NoopRawMutex, Frame, FRAME_QUEUE>,
    shared: &'d SessionShared,
    last_done: Instant,
    buf: String<CMD_BUF_LEN>,
}

impl<'d, W: Write> AtSession<'d, W> {
    pub(crate) fn new(
        tx: W,
        shared: &'d SessionShared,
        frames: Receiver<'d, NoopRawMutex, Frame, FRAME_QUEUE>,
    ) -> Self {
        Self {
            tx,
            frames,
            shared,
            last_done: Instant::now(),
            buf: String::new(),
        }
    }

    pub fn shared(&self) -> &'d SessionShared {
        self.shared
    }

    /// Issue `AT<verb>`.
    pub async fn action(&mut self, verb: &str) -> Result<AtResponse, Error> {
        self.send(&Command::action(verb)).await
    }

    /// Issue `AT<verb>?`.
    pub async fn query(&mut self, verb: &str) -> Result<AtResponse, Error> {
        self.send(&Command::read(verb)).await
    }

    /// Issue `AT<verb>=?`.
    pub async fn test(&mut self, verb: &str) -> Result<AtResponse, Error> {
        self.send(&Command::test(verb)).await
    }

    /// Issue a preconstructed command and return its accumulated response.
    pub async fn send(&mut self, cmd: &Command<'_>) -> Result<AtResponse, Error> {
        if self.shared.is_closed() {
            return Err(Error::Closed);
        }

        Timer::at(self.last_done + self.shared.cmd_cooldown).await;

        // Drop anything left over from a previous (aborted) exchange.
        while self.frames.try_receive().is_ok() {}

        cmd.format(&mut self.buf)?;
        self.shared
            .set_pending(cmd.response_verb(), cmd.data.is_some());

        let res = self.transact(cmd).await;

        self.shared.clear_pending();
        self.last_done = Instant::now();

        if matches!(res, Err(Error::Timeout)) && cmd.abortable {
            self.flush_aborted().await;
            self.last_done = Instant::now();
        }
        res
    }

    async fn transact(&mut self, cmd: &Command<'_>) -> Result<AtResponse, Error> {
        let deadline = Instant::now() + cmd.timeout;

        debug!("-> {:?}", LossyStr(self.buf.as_bytes()));
        self.tx
            .write_all(self.buf.as_bytes())
            .await
            .map_err(|_| Error::Io)?;
        self.tx
            .write_all(&[self.shared.s3])
            .await
            .map_err(|_| Error::Io)?;
        self.tx.flush().await.map_err(|_| Error::Io)?;

        let mut resp = AtResponse::default();

        if let Some(data) = cmd.data {
            // The modem asks for the payload with its data marker.
            loop {
                match with_deadline(deadline, self.frames.receive())
                    .await
                    .map_err(|_| Error::Timeout)?
                {
                    Frame::Prompt => break,
                    Frame::Info(line) => {
                        resp.lines.push(line).ok();
                    }
                    Frame::Payload(p) => resp.payload = Some(p),
                    Frame::Final { ok: false, line } => {
                        return Err(Error::Response(AtErrorLine::from_final(
                            cmd.response_verb(),
                            &line,
                        )));
                    }
                    Frame::Final { ok: true, .. } => return Err(Error::Parse),
                }
            }
            match self.shared.data_byte_delay {
                Some(delay) => {
                    for &b in data {
                        self.tx.write_all(&[b]).await.map_err(|_| Error::Io)?;
                        Timer::after(delay).await;
                    }
                }
                None => self.tx.write_all(data).await.map_err(|_| Error::Io)?,
            }
            self.tx.flush().await.map_err(|_| Error::Io)?;
        }

        loop {
            match with_deadline(deadline, self.frames.receive())
                .await
                .map_err(|_| Error::Timeout)?
            {
                Frame::Info(line) => {
                    if resp.lines.push(line).is_err() {
                        warn!("response line overflow for {}", cmd.response_verb());
                    }
                }
                Frame::Payload(p) => resp.payload = Some(p),
                Frame::Prompt => {}
                Frame::Final { ok: true, line } => {
                    resp.code = line;
                    // First clean exchange means E0 has taken effect.
                    self.shared.echo_off();
                    return Ok(resp);
                }
                Frame::Final { ok: false, line } => {
                    return Err(Error::Response(AtErrorLine::from_final(
                        cmd.response_verb(),
                        &line,
                    )));
                }
            }
        }
    }

    /// Flush protocol for a timed-out abortable command: ping with empty
    /// `AT` until the channel produces a final line again. The aborted
    /// command itself answers `+CME ERROR: Command aborted`.
    async fn flush_aborted(&mut self) {
        debug!("aborting timed-out command");
        let overall = Instant::now() + ABORT_OVERALL_TIMEOUT;
        for _ in 0..ABORT_ATTEMPTS {
            if Instant::now() >= overall {
                break;
            }
            while self.frames.try_receive().is_ok() {}
            self.shared.set_pending("", false);

            if self.tx.write_all(b"AT").await.is_err()
                || self.tx.write_all(&[self.shared.s3]).await.is_err()
                || self.tx.flush().await.is_err()
            {
                break;
            }

            let deadline = (Instant::now() + ABORT_PING_TIMEOUT).min(overall);
            let mut flushed = false;
            loop {
                match with_deadline(deadline, self.frames.receive()).await {
                    Ok(Frame::Final { ok, line }) => {
                        if !ok {
                            let err = AtErrorLine::from_final("", &line);
                            if err.aborted() {
                                debug!("command abort confirmed");
                            }
                        }
                        flushed = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            self.shared.clear_pending();
            if flushed {
                return;
            }
        }
        warn!("abort flush failed; channel may be out of sync");
    }

    /// Surrender the byte pipe for a direct transfer (xmodem, firmware
    /// download). No command may be outstanding; the reader resynchronizes
    /// when the guard is dropped.
    pub async fn pause(&mut self) -> Result<PauseGuard<'_, 'd, W>, Error> {
        if self.shared.is_closed() {
            return Err(Error::Closed);
        }
        self.shared.pause_req.signal(());
        self.shared.pause_ack.wait().await;
        Ok(PauseGuard {
            session: self,
            chunk: Vec::new(),
            offset: 0,
        })
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

/// Exclusive access to the raw byte pipe while the reader task is parked.
pub struct PauseGuard<'a, 'd, W: Write> {
    session: &'a mut AtSession<'d, W>,
    chunk: Vec<u8, RAW_CHUNK>,
    offset: usize,
}

impl<'a, 'd, W: Write> PauseGuard<'a, 'd, W> {
    /// Hand the pipe back and resynchronize the reader.
    pub fn resume(self) {}
}

impl<'a, 'd, W: Write> Drop for PauseGuard<'a, 'd, W> {
    fn drop(&mut self) {
        self.session.shared.resume.signal(());
    }
}

impl<'a, 'd, W: Write> embedded_io_async::ErrorType for PauseGuard<'a, 'd, W> {
    type Error = crate::error::Error;
}

impl<'a, 'd, W: Write> Read for PauseGuard<'a, 'd, W> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.offset >= self.chunk.len() {
            self.chunk = self.session.shared.raw.receive().await;
            self.offset = 0;
        }
        let n = (self.chunk.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl<'a, 'd, W: Write> Write for PauseGuard<'a, 'd, W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.session
            .tx
            .write(buf)
            .await
            .map_err(|_| crate::error::Error::Io)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.session
            .tx
            .flush()
            .await
            .map_err(|_| crate::error::Error::Io)
    }
}
