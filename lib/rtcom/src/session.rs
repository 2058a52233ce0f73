//! One session per connected client.
//!
//! A session owns the inbound staging ring, the layer stack, the outbound
//! buffer queue, its subscription set and its cursor into the global
//! sample stream. All protocol state machines live here; the socket is
//! abstracted behind [`SessionStream`] so the whole thing can be driven
//! against an in-memory endpoint.

use crate::channels::{ChannelSet, DataFrame, Encoding, SubscriptionOptions};
use crate::codec::{self, CodecError};
use crate::dispatcher::{Context, Task};
use crate::layer::{self, IOBuffer, LayerStack, PROCESS_LAYER};
use crate::producer::{read_record, ControlRequest, ControlSender, RecordKind, Snapshot};
use crate::registry::Registry;
use crate::ring::{CharRing, SampleRing};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use rtkit::auth::{Principal, Step, Verifier};
use rtkit::encoding::base64;
use rtkit::logging::{self, Logger};
use rtkit::time::unix_now;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Feature list mirrored verbatim by CAPABILITIES.
pub const FEATURES: &str = "pushparameters,binparameters,maschinehalt,eventchannels";

/// Inbound staging ring size. Bounds the largest inbound frame.
const INBOUND_RING_SIZE: usize = 32 * 1024;

/// A session whose outbound queue grows past this has a dead or hopeless
/// peer; resource errors are fatal for the session.
const MAX_OUTBOUND_BYTES: usize = 4 * 1024 * 1024;

/// Fractional digits for POLL replies and parameter push events.
const POLL_PRECISION: usize = 6;

/// Everything a session shares with its siblings: registries, the sample
/// stream, the producer control queue and the credential verifier. One
/// instance per server, threaded through the constructors.
pub struct ServerCtx {
    pub registry: Registry,
    pub ring: Arc<SampleRing>,
    pub snapshot: Arc<Snapshot>,
    pub control: ControlSender,
    pub verifier: Box<dyn Verifier>,
    /// Sessions currently in START_STREAM; read by the producer to decide
    /// whether a wakeup is worth sending.
    pub streaming_sessions: Arc<AtomicUsize>,
    /// Capability bit: advertise and serve STATISTICS.
    pub statistics: bool,
    pub login_timeout: Duration,
    pub sessions: RefCell<Vec<Rc<RefCell<SessionStats>>>>,
}

/// Per-session bookkeeping shown by STATISTICS.
pub struct SessionStats {
    pub principal: Option<String>,
    pub host: String,
    pub application: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub overruns: u64,
    pub connected_at: u64,
}

/// The transport under a session. Production uses `mio::net::TcpStream`;
/// tests substitute an in-memory endpoint.
pub trait SessionStream: io::Read + io::Write {
    fn evented(&self) -> Option<&dyn mio::Evented> {
        None
    }

    fn peer(&self) -> String {
        "unknown".into()
    }
}

impl SessionStream for mio::net::TcpStream {
    fn evented(&self) -> Option<&dyn mio::Evented> {
        Some(self)
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".into())
    }
}

/// Dispatcher services a command handler may need. The adapter over
/// [`Context`] is built inside the task callbacks; tests pass a no-op.
pub trait SessionHooks {
    fn enable_streaming(&mut self, enabled: bool);
    fn cancel_login_timer(&mut self);
}

struct CxHooks<'a, 'b: 'a> {
    cx: &'a mut Context<'b>,
}

impl<'a, 'b> SessionHooks for CxHooks<'a, 'b> {
    fn enable_streaming(&mut self, enabled: bool) {
        self.cx.set_streaming(enabled);
    }

    fn cancel_login_timer(&mut self) {
        self.cx.cancel_timer();
    }
}

enum AuthState {
    Init,
    LoginContinue { user: String, challenge: Vec<u8> },
    Idle(Principal),
    LoginFail,
}

struct PendingBuf {
    buf: IOBuffer,
    offset: usize,
}

pub struct Session<S: SessionStream> {
    stream: S,
    ctx: Rc<ServerCtx>,

    stack: LayerStack,
    inbound: CharRing,
    inbound_cursor: usize,

    outbound: VecDeque<PendingBuf>,
    outbound_bytes: usize,

    auth: AuthState,
    channels: ChannelSet,
    ring_cursor: u64,
    streaming: bool,
    closing: bool,

    stats: Rc<RefCell<SessionStats>>,
    log: Logger,
}

impl<S: SessionStream> Session<S> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(stream: S, ctx: Rc<ServerCtx>, log: L) -> Session<S> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("peer" => stream.peer())),
            None => logging::discard_logger(),
        };

        let stats = Rc::new(RefCell::new(SessionStats {
            principal: None,
            host: stream.peer(),
            application: String::new(),
            bytes_in: 0,
            bytes_out: 0,
            overruns: 0,
            connected_at: unix_now(),
        }));

        ctx.sessions.borrow_mut().push(stats.clone());

        let ring_cursor = ctx.ring.write_pos();
        let inbound = CharRing::with_capacity(INBOUND_RING_SIZE);
        let inbound_cursor = inbound.write_pos();

        Session {
            stream,
            ctx,
            stack: layer::session_stack(),
            inbound,
            inbound_cursor,
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            auth: AuthState::Init,
            channels: ChannelSet::new(),
            ring_cursor,
            streaming: false,
            closing: false,
            stats,
            log,
        }
    }

    // -----------------------------------------------------------------
    // Inbound path
    // -----------------------------------------------------------------

    /// Stages a chunk of wire bytes and processes whatever frames
    /// completed. Returns the usual callback convention.
    fn ingest(&mut self, hooks: &mut dyn SessionHooks, chunk: &[u8]) -> i32 {
        self.stats.borrow_mut().bytes_in += chunk.len() as u64;

        // The staging ring must never overwrite unread bytes; a client
        // pushing a frame bigger than the ring can never complete it.
        if self.inbound.available(self.inbound_cursor) + chunk.len() >= self.inbound.capacity() {
            logging::warn!(self.log, "inbound staging exhausted; dropping client");
            return -1;
        }

        let mut offset = 0;
        while offset < chunk.len() {
            let step = (chunk.len() - offset).min(self.inbound.max_write());
            self.inbound.write(&chunk[offset..offset + step]);
            offset += step;
        }

        if self.process_inbound(hooks) < 0 {
            return -1;
        }

        self.finish_io()
    }

    fn process_inbound(&mut self, hooks: &mut dyn SessionHooks) -> i32 {
        loop {
            let avail = self.inbound.available(self.inbound_cursor);
            if avail == 0 {
                return 1;
            }

            let mut units = Vec::new();
            let consumed = {
                let data = self.inbound.linearize(self.inbound_cursor);
                match self.stack.receive(data, &mut units) {
                    Ok(consumed) => consumed,
                    Err(_) => {
                        logging::warn!(self.log, "corrupt frame; dropping client");
                        return -1;
                    }
                }
            };

            if consumed == 0 {
                return 1;
            }

            self.inbound.consume(&mut self.inbound_cursor, consumed);

            for unit in units {
                self.handle_frame(hooks, &unit);
            }
        }
    }

    fn handle_frame(&mut self, hooks: &mut dyn SessionHooks, frame: &[u8]) {
        if frame.len() < 4 {
            self.send_line("-ERR short frame");
            return;
        }

        let channel = BigEndian::read_u32(&frame[..4]);
        if channel != 0 {
            self.send_line("-ERR unknown channel");
            return;
        }

        let line = match std::str::from_utf8(&frame[4..]) {
            Ok(text) => text.trim_end_matches(|c| c == '\n' || c == '\r'),
            Err(_) => {
                self.send_line("-ERR malformed command");
                return;
            }
        };

        self.dispatch_command(hooks, line);
    }

    fn dispatch_command(&mut self, hooks: &mut dyn SessionHooks, line: &str) {
        let mut parts = line.split_whitespace();

        let verb = match parts.next() {
            Some(verb) => verb,
            None => {
                self.send_line("-ERR empty command");
                return;
            }
        };
        let args: Vec<&str> = parts.collect();

        logging::trace!(self.log, "command"; "verb" => verb);

        // LOGIN, AUTH and CAPABILITIES are the only verbs available before
        // the exchange completed.
        match verb {
            "LOGIN" => return self.cmd_login(&args),
            "AUTH" => return self.cmd_auth(hooks, &args),
            "CAPABILITIES" => {
                let features = self.features();
                return self.send_line(&format!("+OK {}", features));
            }
            _ => {}
        }

        match self.auth {
            AuthState::Idle(_) => {}
            _ => {
                self.send_line("-ERR not authenticated");
                return;
            }
        }

        match verb {
            "LIST_MODELS" => self.cmd_list_models(),
            "LIST_SIGNALS" => self.cmd_list_variables(true),
            "LIST_PARAMETERS" => self.cmd_list_variables(false),
            "SUBSCRIBE" => self.cmd_subscribe(&args),
            "UNSUBSCRIBE" => self.cmd_unsubscribe(&args),
            "POLL" => self.cmd_poll(&args),
            "WRITE" => self.cmd_write(&args),
            "START_STREAM" => self.cmd_start_stream(hooks),
            "STOP_STREAM" => self.cmd_stop_stream(hooks),
            "IDENT" => self.cmd_ident(&args),
            "HALT" => self.cmd_halt(),
            "STATISTICS" => self.cmd_statistics(),
            "QUIT" => {
                self.send_line("+OK bye");
                self.closing = true;
            }
            _ => self.send_line(&format!("-ERR unknown command {}", verb)),
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    fn cmd_login(&mut self, args: &[&str]) {
        match self.auth {
            AuthState::Idle(_) => {
                self.send_line("-ERR already authenticated");
                return;
            }
            // Terminal: no second attempt on this connection.
            AuthState::LoginFail => {
                self.send_line("-ERR authentication failed");
                return;
            }
            _ => {}
        }

        let user = match args {
            [user] => user.to_string(),
            _ => {
                self.send_line("-ERR usage: LOGIN <user>");
                return;
            }
        };

        match self.ctx.verifier.begin(&user) {
            Step::Challenge(challenge) => {
                let encoded = base64::encode(&challenge);
                self.auth = AuthState::LoginContinue { user, challenge };
                self.send_line(&format!("+OK challenge {}", encoded));
            }
            Step::Done(principal) => {
                self.finish_login(principal);
            }
            Step::Failed => self.fail_login(),
        }
    }

    fn cmd_auth(&mut self, hooks: &mut dyn SessionHooks, args: &[&str]) {
        let (user, challenge) = match &self.auth {
            AuthState::LoginContinue { user, challenge } => (user.clone(), challenge.clone()),
            _ => {
                self.send_line("-ERR no login in progress");
                return;
            }
        };

        let response = match args {
            [blob] => match base64::decode(blob) {
                Ok(response) => response,
                Err(_) => {
                    self.fail_login();
                    return;
                }
            },
            _ => {
                self.send_line("-ERR usage: AUTH <response>");
                return;
            }
        };

        match self.ctx.verifier.finish(&user, &challenge, &response) {
            Step::Done(principal) => {
                self.finish_login(principal);
                hooks.cancel_login_timer();
            }
            _ => self.fail_login(),
        }
    }

    fn finish_login(&mut self, principal: Principal) {
        logging::info!(self.log, "login"; "principal" => %principal.name, "admin" => principal.admin);

        self.stats.borrow_mut().principal = Some(principal.name.clone());
        self.send_line(&format!("+OK welcome {}", principal.name));
        self.auth = AuthState::Idle(principal);
    }

    fn fail_login(&mut self) {
        logging::warn!(self.log, "login failed");

        self.auth = AuthState::LoginFail;
        self.send_line("-ERR authentication failed");
        // Terminal state: the reply drains, then the connection closes.
        self.closing = true;
    }

    fn features(&self) -> String {
        if self.ctx.statistics {
            format!("{},statistics", FEATURES)
        } else {
            FEATURES.into()
        }
    }

    fn cmd_list_models(&mut self) {
        let model = &self.ctx.registry.model;

        let periods: Vec<String> = model
            .sample_periods
            .iter()
            .map(|p| format!("{}", p))
            .collect();

        let entry = vec![
            ("name".to_string(), model.name.clone()),
            ("id".to_string(), model.id.to_string()),
            ("sample_times".to_string(), periods.join(" ")),
        ];

        self.send_list("models", &[entry]);
    }

    fn cmd_list_variables(&mut self, signals: bool) {
        let (title, table) = if signals {
            ("signals", &self.ctx.registry.signals)
        } else {
            ("parameters", &self.ctx.registry.parameters)
        };

        let entries: Vec<Vec<(String, String)>> = table
            .iter()
            .map(|var| {
                let mut entry = vec![
                    ("path".to_string(), var.path.clone()),
                    ("name".to_string(), var.name.clone()),
                ];

                if let Some(alias) = &var.alias {
                    entry.push(("alias".to_string(), alias.clone()));
                }

                entry.push(("type".to_string(), var.data_type.tag().to_string()));
                entry.push(("dims".to_string(), var.dim_string()));
                entry.push(("sample_time".to_string(), var.sample_time.to_string()));
                entry
            })
            .collect();

        self.send_list(title, &entries);
    }

    fn cmd_subscribe(&mut self, args: &[&str]) {
        let (path, block, decimation, encoding, precision, event) = match args {
            [path, block, decimation, encoding, precision, event] => {
                (path, block, decimation, encoding, precision, event)
            }
            _ => {
                self.send_line(
                    "-ERR usage: SUBSCRIBE <path> <block> <decimation> <encoding> <precision> <event>",
                );
                return;
            }
        };

        let encoding = match Encoding::parse(encoding) {
            Some(encoding) => encoding,
            None => {
                self.send_line("-ERR unknown encoding");
                return;
            }
        };

        let options = match (
            block.parse::<usize>(),
            decimation.parse::<usize>(),
            precision.parse::<usize>(),
            event.parse::<u8>(),
        ) {
            (Ok(block_size), Ok(decimation), Ok(precision), Ok(event)) => SubscriptionOptions {
                block_size,
                decimation,
                encoding,
                precision,
                event_only: event != 0,
            },
            _ => {
                self.send_line("-ERR malformed subscription options");
                return;
            }
        };

        if let Err(reason) = options.validate() {
            self.send_line(&format!("-ERR {}", reason));
            return;
        }

        let variable = match self.ctx.registry.signals.lookup(path) {
            Some(variable) => variable.clone(),
            None => {
                self.send_line(&format!("-ERR unknown signal {}", path));
                return;
            }
        };

        let channel = self.channels.subscribe(&variable, options);
        self.send_line(&format!("+OK channel {}", channel));
    }

    fn cmd_unsubscribe(&mut self, args: &[&str]) {
        match args {
            [path] => {
                if self.channels.unsubscribe(path) {
                    self.send_line(&format!("+OK unsubscribed {}", path));
                } else {
                    self.send_line(&format!("-ERR not subscribed {}", path));
                }
            }
            _ => self.send_line("-ERR usage: UNSUBSCRIBE <path>"),
        }
    }

    fn cmd_poll(&mut self, args: &[&str]) {
        let (path, raw) = match args {
            [path] => (*path, false),
            [path, "base64"] => (*path, true),
            _ => {
                self.send_line("-ERR usage: POLL <path> [base64]");
                return;
            }
        };

        let (variable, bytes) = if let Some(var) = self.ctx.registry.signals.lookup(path) {
            (var, self.ctx.snapshot.read_signal(var))
        } else if let Some(var) = self.ctx.registry.parameters.lookup(path) {
            (var, self.ctx.snapshot.read_param(var))
        } else {
            self.send_line(&format!("-ERR unknown path {}", path));
            return;
        };

        let value = if raw {
            codec::encode_raw(&bytes)
        } else {
            let mut text = String::new();
            codec::format_ascii(variable, &bytes, POLL_PRECISION, &mut text);
            text
        };

        let line = format!("+OK {} {}", path, value);
        self.send_line(&line);
    }

    fn cmd_write(&mut self, args: &[&str]) {
        if !self.write_access() {
            self.send_line("-ERR write access denied");
            return;
        }

        let (path, value_tokens) = match args.split_first() {
            Some((path, rest)) if !rest.is_empty() => (*path, rest),
            _ => {
                self.send_line("-ERR usage: WRITE <path> <value>");
                return;
            }
        };

        let variable = match self.ctx.registry.parameters.lookup(path) {
            Some(variable) => variable,
            None => {
                self.send_line(&format!("-ERR unknown parameter {}", path));
                return;
            }
        };

        let value = if value_tokens.len() == 1 && value_tokens[0].starts_with("base64:") {
            codec::decode_raw(variable, &value_tokens[0]["base64:".len()..])
        } else {
            codec::parse_ascii(variable, value_tokens)
        };

        let value = match value {
            Ok(value) => value,
            Err(CodecError::WrongLength { expected, got }) => {
                self.send_line(&format!(
                    "-ERR value shape mismatch: expected {}, got {}",
                    expected, got
                ));
                return;
            }
            Err(_) => {
                self.send_line("-ERR malformed value");
                return;
            }
        };

        let request = ControlRequest::ParamWrite {
            id: variable.id,
            value,
        };

        match self.ctx.control.push(request) {
            Ok(()) => self.send_line(&format!("+OK write queued {}", path)),
            Err(_) => self.send_line("-ERR parameter queue full"),
        }
    }

    fn cmd_start_stream(&mut self, hooks: &mut dyn SessionHooks) {
        if !self.streaming {
            self.streaming = true;
            self.ring_cursor = self.ctx.ring.write_pos();
            self.ctx.streaming_sessions.fetch_add(1, Ordering::Relaxed);
            hooks.enable_streaming(true);
        }

        self.send_line("+OK streaming");
    }

    fn cmd_stop_stream(&mut self, hooks: &mut dyn SessionHooks) {
        if self.streaming {
            self.streaming = false;
            self.ctx.streaming_sessions.fetch_sub(1, Ordering::Relaxed);
            hooks.enable_streaming(false);
            self.channels.flush_all();
        }

        self.send_line("+OK stopped");
    }

    fn cmd_ident(&mut self, args: &[&str]) {
        match args {
            [host, application] => {
                let mut stats = self.stats.borrow_mut();
                stats.host = host.to_string();
                stats.application = application.to_string();
                drop(stats);

                self.send_line("+OK identified");
            }
            _ => self.send_line("-ERR usage: IDENT <host> <application>"),
        }
    }

    fn cmd_halt(&mut self) {
        if !self.write_access() {
            self.send_line("-ERR write access denied");
            return;
        }

        match self.ctx.control.push(ControlRequest::Halt) {
            Ok(()) => self.send_line("+OK halt requested"),
            Err(_) => self.send_line("-ERR parameter queue full"),
        }
    }

    fn cmd_statistics(&mut self) {
        if !self.ctx.statistics {
            self.send_line("-ERR not supported");
            return;
        }

        let entries: Vec<Vec<(String, String)>> = self
            .ctx
            .sessions
            .borrow()
            .iter()
            .map(|stats| {
                let stats = stats.borrow();
                vec![
                    (
                        "principal".to_string(),
                        stats.principal.clone().unwrap_or_else(|| "-".into()),
                    ),
                    ("host".to_string(), stats.host.clone()),
                    ("application".to_string(), stats.application.clone()),
                    ("bytes_in".to_string(), stats.bytes_in.to_string()),
                    ("bytes_out".to_string(), stats.bytes_out.to_string()),
                    ("overruns".to_string(), stats.overruns.to_string()),
                    ("connected_at".to_string(), stats.connected_at.to_string()),
                ]
            })
            .collect();

        self.send_list("sessions", &entries);
    }

    fn write_access(&self) -> bool {
        match &self.auth {
            AuthState::Idle(principal) => principal.write_access,
            _ => false,
        }
    }

    // -----------------------------------------------------------------
    // Streaming path
    // -----------------------------------------------------------------

    /// Pumps records from the global ring into data frames. Driven by the
    /// producer wakeup.
    fn pump(&mut self, hooks: &mut dyn SessionHooks) -> i32 {
        let _ = hooks;

        if !self.streaming {
            return 1;
        }

        if self.ctx.ring.is_overrun(self.ring_cursor) {
            self.recover_overrun();
        }

        loop {
            let record = {
                let ring = &self.ctx.ring;
                match read_record(ring, &mut self.ring_cursor) {
                    Some(record) => record,
                    None => break,
                }
            };

            // A lap during the copy means the bytes cannot be trusted.
            if self.ctx.ring.is_overrun(self.ring_cursor) {
                self.recover_overrun();
                continue;
            }

            match record.header.kind {
                RecordKind::Data => {
                    let sample_time = record.header.sample_time as usize;
                    let tick = record.header.tick;

                    let mut frames: Vec<DataFrame> = Vec::new();
                    for sub in self.channels.iter_sample_time(sample_time) {
                        let var = sub.variable();
                        let end = var.offset + var.byte_len();

                        if end > record.payload.len() {
                            continue;
                        }

                        if let Some(frame) = sub.offer(tick, &record.payload[var.offset..end]) {
                            frames.push(frame);
                        }
                    }

                    for frame in frames {
                        self.send_data_frame(frame);
                    }
                }
                RecordKind::ParamChange => self.push_param_change(&record.payload),
                RecordKind::Halt => self.send_line("=EVENT halt"),
            }
        }

        self.finish_io()
    }

    /// Reports a parameter change on the command channel:
    /// `=EVENT parameter <path> <value>`.
    fn push_param_change(&mut self, payload: &[u8]) {
        if payload.len() < 4 {
            return;
        }

        let id = LittleEndian::read_u32(&payload[..4]) as usize;

        let line = match self.ctx.registry.parameters.get(id) {
            Some(var) if payload.len() - 4 == var.byte_len() => {
                let mut text = String::new();
                codec::format_ascii(var, &payload[4..], POLL_PRECISION, &mut text);
                format!("=EVENT parameter {} {}", var.path, text)
            }
            _ => return,
        };

        self.send_line(&line);
    }

    /// Overrun recovery: flush partial blocks, notify once, snap the
    /// cursor to the writer.
    fn recover_overrun(&mut self) {
        logging::warn!(self.log, "session overrun; resynchronising");

        self.stats.borrow_mut().overruns += 1;
        self.channels.flush_all();
        self.ring_cursor = self.ctx.ring.write_pos();
        self.send_line("=EVENT overrun");
    }

    // -----------------------------------------------------------------
    // Outbound path
    // -----------------------------------------------------------------

    fn send_line(&mut self, text: &str) {
        let mut buf = self.stack.new_buffer(PROCESS_LAYER);
        buf.append_u32(0);
        buf.append(text.as_bytes());
        buf.append(b"\n");
        self.transmit(buf);
    }

    /// List reply: title line, `key: value` lines per entry, blank line
    /// between entries, a lone `.` at the end.
    fn send_list(&mut self, title: &str, entries: &[Vec<(String, String)>]) {
        let mut body = format!("+OK {}:\n", title);

        for (index, entry) in entries.iter().enumerate() {
            if index > 0 {
                body.push('\n');
            }
            for (key, value) in entry {
                body.push_str(key);
                body.push_str(": ");
                body.push_str(value);
                body.push('\n');
            }
        }

        body.push_str(".\n");

        let mut buf = self.stack.new_buffer(PROCESS_LAYER);
        buf.append_u32(0);
        buf.append(body.as_bytes());
        self.transmit(buf);
    }

    fn send_data_frame(&mut self, frame: DataFrame) {
        let mut buf = self.stack.new_buffer(PROCESS_LAYER);
        buf.append_u32(frame.wire_channel);
        buf.append(&[frame.encoding_tag]);

        let mut count = [0u8; 4];
        LittleEndian::write_u32(&mut count, frame.sample_count);
        buf.append(&count);

        let mut first = [0u8; 8];
        LittleEndian::write_u64(&mut first, frame.first_index);
        buf.append(&first);

        buf.append(&frame.payload);
        self.transmit(buf);
    }

    /// Seals the buffer through the layer stack and queues it on the
    /// socket, flushing eagerly.
    fn transmit(&mut self, mut buf: IOBuffer) {
        self.stack.seal(&mut buf);
        self.outbound_bytes += buf.len();
        self.outbound.push_back(PendingBuf { buf, offset: 0 });
        self.flush_outbound();
    }

    /// Drains the outbound queue as far as the socket accepts. `0` means
    /// a graceful close finished; `-1` is a transport error.
    fn flush_outbound(&mut self) -> i32 {
        while let Some(front) = self.outbound.front_mut() {
            let bytes = front.buf.as_bytes();

            match self.stream.write(&bytes[front.offset..]) {
                Ok(0) => return -1,
                Ok(count) => {
                    front.offset += count;
                    self.stats.borrow_mut().bytes_out += count as u64;

                    if front.offset == bytes.len() {
                        let finished = self.outbound.pop_front().expect("queue head vanished");
                        self.outbound_bytes -= finished.buf.len();
                    }
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    logging::debug!(self.log, "write error"; "error" => %error);
                    return -1;
                }
            }
        }

        if self.closing && self.outbound.is_empty() {
            return 0;
        }

        1
    }

    fn finish_io(&mut self) -> i32 {
        let rv = self.flush_outbound();
        if rv <= 0 {
            return rv;
        }

        if self.outbound_bytes > MAX_OUTBOUND_BYTES {
            logging::warn!(self.log, "outbound queue overflow; dropping client");
            return -1;
        }

        1
    }

    fn login_timed_out(&mut self, hooks: &mut dyn SessionHooks) -> i32 {
        match self.auth {
            AuthState::Idle(_) => {
                // Already authenticated; the timer has no further job.
                hooks.cancel_login_timer();
                1
            }
            _ => {
                logging::warn!(self.log, "login timeout");
                0
            }
        }
    }
}

impl<S: SessionStream> Task for Session<S> {
    fn read(&mut self, cx: &mut Context) -> i32 {
        let mut chunk = [0u8; 4096];

        loop {
            match self.stream.read(&mut chunk) {
                // EOF: the peer closed; the parent reaps us.
                Ok(0) => return 0,
                Ok(count) => {
                    let rv = {
                        let mut hooks = CxHooks { cx: &mut *cx };
                        self.ingest(&mut hooks, &chunk[..count])
                    };
                    if rv <= 0 {
                        return rv;
                    }
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return -1,
            }
        }

        self.finish_io()
    }

    fn write(&mut self, _cx: &mut Context) -> i32 {
        self.flush_outbound()
    }

    fn timeout(&mut self, cx: &mut Context) -> i32 {
        let mut hooks = CxHooks { cx };
        self.login_timed_out(&mut hooks)
    }

    fn wake(&mut self, cx: &mut Context) -> i32 {
        let mut hooks = CxHooks { cx };
        self.pump(&mut hooks)
    }

    fn evented(&self) -> Option<&dyn mio::Evented> {
        self.stream.evented()
    }
}

impl<S: SessionStream> Drop for Session<S> {
    fn drop(&mut self) {
        if self.streaming {
            self.ctx.streaming_sessions.fetch_sub(1, Ordering::Relaxed);
        }

        self.ctx
            .sessions
            .borrow_mut()
            .retain(|stats| !Rc::ptr_eq(stats, &self.stats));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::{control_queue, ControlReceiver, ImageSource, Producer};
    use crate::registry::{DataType, ModelInfo, Registry, Variable, VariableTable};
    use rtkit::auth::{self, KeyStore};
    use std::convert::TryInto;
    use std::sync::atomic::AtomicBool;

    const TEST_KEY: [u8; auth::KEY_SIZE] = [0x5a; auth::KEY_SIZE];

    struct NoHooks;

    impl SessionHooks for NoHooks {
        fn enable_streaming(&mut self, _enabled: bool) {}
        fn cancel_login_timer(&mut self) {}
    }

    /// In-memory stream: collects written bytes, optionally accepting only
    /// a bounded number per call.
    struct MockStream {
        written: Vec<u8>,
        /// Max bytes accepted per write call.
        chunk: usize,
        /// Total byte budget before WouldBlock; usize::MAX = unlimited.
        budget: usize,
    }

    impl MockStream {
        fn new() -> MockStream {
            MockStream {
                written: Vec::new(),
                chunk: usize::max_value(),
                budget: usize::max_value(),
            }
        }
    }

    impl io::Read for MockStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl io::Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = buf.len().min(self.chunk).min(self.budget);
            self.written.extend_from_slice(&buf[..count]);
            self.budget -= count;
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SessionStream for MockStream {}

    struct FixedImage {
        image: Vec<u8>,
    }

    impl ImageSource for FixedImage {
        fn image_len(&self) -> usize {
            self.image.len()
        }

        fn sample(&mut self, _tick: u64, dst: &mut [u8]) {
            dst.copy_from_slice(&self.image);
        }
    }

    struct Fixture {
        ctx: Rc<ServerCtx>,
        control_rx: ControlReceiver,
        ring: Arc<SampleRing>,
        snapshot: Arc<Snapshot>,
    }

    fn fixture() -> Fixture {
        fixture_with(SampleRing::new(64 * 1024), false)
    }

    fn fixture_with(ring: Arc<SampleRing>, statistics: bool) -> Fixture {
        let signals = Arc::new(
            VariableTable::build(
                vec![Variable {
                    id: 0,
                    path: "/osc/out".into(),
                    name: "out".into(),
                    alias: None,
                    data_type: DataType::F64,
                    dims: vec![],
                    offset: 0,
                    sample_time: 0,
                }],
                8,
            )
            .unwrap(),
        );

        let parameters = Arc::new(
            VariableTable::build(
                vec![Variable {
                    id: 0,
                    path: "/osc/gain".into(),
                    name: "gain".into(),
                    alias: None,
                    data_type: DataType::F64,
                    dims: vec![],
                    offset: 0,
                    sample_time: 0,
                }],
                8,
            )
            .unwrap(),
        );

        let mut verifier = KeyStore::new();
        verifier
            .add_user("operator", &base64::encode(&TEST_KEY[..]), false, true)
            .ok()
            .unwrap();
        verifier
            .add_user("viewer", &base64::encode(&TEST_KEY[..]), false, false)
            .ok()
            .unwrap();

        let (control_tx, control_rx) = control_queue(16);
        let snapshot = Snapshot::new(8, 8);

        let ctx = Rc::new(ServerCtx {
            registry: Registry {
                model: ModelInfo {
                    name: "osc".into(),
                    id: 1,
                    sample_periods: vec![0.001],
                },
                signals,
                parameters,
            },
            ring: ring.clone(),
            snapshot: snapshot.clone(),
            control: control_tx,
            verifier: Box::new(verifier),
            streaming_sessions: Arc::new(AtomicUsize::new(0)),
            statistics,
            login_timeout: Duration::from_secs(30),
            sessions: RefCell::new(Vec::new()),
        });

        Fixture {
            ctx,
            control_rx,
            ring,
            snapshot,
        }
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut wire = vec![0u8; 4];
        BigEndian::write_u32(&mut wire, (body.len() + 4) as u32);
        wire.extend_from_slice(&[0, 0, 0, 0]);
        wire.extend_from_slice(body);
        wire
    }

    fn command(text: &str) -> Vec<u8> {
        frame(text.as_bytes())
    }

    /// Splits captured wire bytes into (channel, payload) frames.
    fn parse_frames(wire: &[u8]) -> Vec<(u32, Vec<u8>)> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset + 4 <= wire.len() {
            let len = BigEndian::read_u32(&wire[offset..offset + 4]) as usize;
            assert!(offset + 4 + len <= wire.len(), "truncated frame in capture");

            let payload = &wire[offset + 4..offset + 4 + len];
            let channel = BigEndian::read_u32(&payload[..4]);
            frames.push((channel, payload[4..].to_vec()));

            offset += 4 + len;
        }

        assert_eq!(offset, wire.len(), "trailing garbage in capture");
        frames
    }

    fn command_lines(wire: &[u8]) -> Vec<String> {
        parse_frames(wire)
            .into_iter()
            .filter(|(channel, _)| *channel == 0)
            .map(|(_, body)| String::from_utf8(body).unwrap())
            .collect()
    }

    fn login(session: &mut Session<MockStream>) {
        session.ingest(&mut NoHooks, &command("LOGIN operator\n"));

        let challenge = {
            let lines = command_lines(&session.stream.written);
            let line = lines.last().unwrap().clone();
            let token = line
                .trim_end()
                .rsplit(' ')
                .next()
                .expect("challenge token missing")
                .to_string();
            base64::decode(&token).unwrap()
        };

        let response = auth::mac(&challenge, &TEST_KEY);
        let auth_line = format!("AUTH {}\n", base64::encode(&response[..]));
        session.ingest(&mut NoHooks, &command(&auth_line));

        let lines = command_lines(&session.stream.written);
        assert_eq!(lines.last().unwrap(), "+OK welcome operator\n");

        session.stream.written.clear();
    }

    #[test]
    fn test_capabilities_before_login() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);

        let rv = session.ingest(&mut NoHooks, &command("CAPABILITIES\n"));
        assert_eq!(rv, 1);

        let lines = command_lines(&session.stream.written);
        assert_eq!(
            lines,
            vec!["+OK pushparameters,binparameters,maschinehalt,eventchannels\n"]
        );
    }

    #[test]
    fn test_unauthenticated_subscribe_rejected() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);

        session.ingest(&mut NoHooks, &command("SUBSCRIBE /x 1 1 ascii 3 0\n"));

        let lines = command_lines(&session.stream.written);
        assert_eq!(lines, vec!["-ERR not authenticated\n"]);
    }

    #[test]
    fn test_login_exchange() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);

        login(&mut session);

        assert!(session.write_access());
        assert_eq!(
            fx.ctx.sessions.borrow()[0].borrow().principal.as_deref(),
            Some("operator")
        );
    }

    #[test]
    fn test_login_failure_is_terminal() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);

        session.ingest(&mut NoHooks, &command("LOGIN operator\n"));
        session.stream.written.clear();

        let bogus = base64::encode(&[0u8; auth::MAC_SIZE][..]);
        let rv = session.ingest(&mut NoHooks, &command(&format!("AUTH {}\n", bogus)));

        let lines = command_lines(&session.stream.written);
        assert_eq!(lines, vec!["-ERR authentication failed\n"]);
        // Reply drained, then the session asks to be closed.
        assert_eq!(rv, 0);
    }

    #[test]
    fn test_subscribe_then_stream_decimated() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);

        session.ingest(
            &mut NoHooks,
            &command("SUBSCRIBE /osc/out 1 2 ascii 3 0\n"),
        );
        session.ingest(&mut NoHooks, &command("START_STREAM\n"));
        session.stream.written.clear();

        // Drive the producer for ticks 0..9 with value == tick.
        let (_tx, control_rx) = control_queue(4);
        let (_registration, readiness) = mio::Registration::new2();

        struct TickImage;
        impl ImageSource for TickImage {
            fn image_len(&self) -> usize {
                8
            }
            fn sample(&mut self, tick: u64, dst: &mut [u8]) {
                LittleEndian::write_f64(dst, tick as f64);
            }
        }

        let mut producer = Producer::new(
            fx.ring.clone(),
            control_rx,
            fx.snapshot.clone(),
            Box::new(TickImage),
            fx.ctx.registry.parameters.clone(),
            vec![1],
            Duration::from_millis(1),
            fx.ctx.streaming_sessions.clone(),
            readiness,
            Arc::new(AtomicBool::new(false)),
            rtkit::logging::discard_logger(),
        )
        .unwrap();

        for _ in 0..10 {
            producer.tick();
        }

        assert_eq!(session.pump(&mut NoHooks), 1);

        let frames = parse_frames(&session.stream.written);
        let data: Vec<&(u32, Vec<u8>)> = frames.iter().filter(|(c, _)| *c != 0).collect();

        assert_eq!(data.len(), 5);

        for (offset, (channel, body)) in data.iter().enumerate() {
            assert_eq!(*channel, 1);
            assert_eq!(body[0], 0, "ascii encoding tag");
            assert_eq!(LittleEndian::read_u32(&body[1..5]), 1, "sample count");

            let first = LittleEndian::read_u64(&body[5..13]);
            assert_eq!(first, (offset * 2) as u64);

            let text = std::str::from_utf8(&body[13..]).unwrap();
            assert_eq!(text, format!("{}.000\n", first));
        }
    }

    #[test]
    fn test_identical_subscriptions_emit_identical_frames() {
        let fx = fixture();

        let mut first = Session::new(MockStream::new(), fx.ctx.clone(), None);
        let mut second = Session::new(MockStream::new(), fx.ctx.clone(), None);

        for session in vec![&mut first, &mut second] {
            login(session);
            session.ingest(
                &mut NoHooks,
                &command("SUBSCRIBE /osc/out 2 3 base64 0 0\n"),
            );
            session.ingest(&mut NoHooks, &command("START_STREAM\n"));
            session.stream.written.clear();
        }

        let mut writer = crate::ring::SampleWriter::new(fx.ring.clone());
        for tick in 0u64..12 {
            let mut record = [0u8; 15 + 8];
            crate::producer::RecordHeader {
                kind: RecordKind::Data,
                sample_time: 0,
                tick,
                len: 8,
            }
            .encode((&mut record[..15]).try_into().unwrap());
            LittleEndian::write_f64(&mut record[15..], (tick * 7) as f64);
            writer.write(&record);
            writer.publish();
        }

        first.pump(&mut NoHooks);
        second.pump(&mut NoHooks);

        assert!(!first.stream.written.is_empty());
        assert_eq!(first.stream.written, second.stream.written);
    }

    #[test]
    fn test_overrun_event_emitted_once_and_cursor_snapped() {
        // A 1 KiB ring overruns quickly.
        let fx = fixture_with(SampleRing::new(1024), false);
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);

        session.ingest(
            &mut NoHooks,
            &command("SUBSCRIBE /osc/out 1 1 ascii 3 0\n"),
        );
        session.ingest(&mut NoHooks, &command("START_STREAM\n"));
        session.stream.written.clear();

        // Lap the session: write far more than the ring holds without
        // letting it read.
        let mut writer = crate::ring::SampleWriter::new(fx.ring.clone());
        for tick in 0u64..60 {
            let mut record = [0u8; 15 + 8];
            crate::producer::RecordHeader {
                kind: RecordKind::Data,
                sample_time: 0,
                tick,
                len: 8,
            }
            .encode((&mut record[..15]).try_into().unwrap());
            LittleEndian::write_f64(&mut record[15..], 1.0);
            writer.write(&record);
            writer.publish();
        }

        session.pump(&mut NoHooks);

        let lines = command_lines(&session.stream.written);
        let overruns = lines.iter().filter(|l| l.as_str() == "=EVENT overrun\n").count();
        assert_eq!(overruns, 1, "overrun reported exactly once");

        // Cursor snapped: nothing left to read.
        assert_eq!(fx.ring.available(session.ring_cursor), 0);
        assert_eq!(session.stats.borrow().overruns, 1);
    }

    #[test]
    fn test_partial_write_delivers_eventually() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);

        // Only 7 bytes fit initially.
        session.stream.budget = 7;

        session.ingest(&mut NoHooks, &command("CAPABILITIES\n"));

        assert_eq!(session.stream.written.len(), 7);
        assert!(!session.outbound.is_empty());

        // Writability returns; the rest must drain byte-identically.
        session.stream.budget = usize::max_value();
        assert_eq!(session.flush_outbound(), 1);

        let lines = command_lines(&session.stream.written);
        assert_eq!(
            lines,
            vec!["+OK pushparameters,binparameters,maschinehalt,eventchannels\n"]
        );
        assert!(session.outbound.is_empty());
    }

    #[test]
    fn test_quit_drains_then_closes() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);

        let rv = session.ingest(&mut NoHooks, &command("QUIT\n"));

        assert_eq!(rv, 0, "session asks for teardown after the drain");
        let lines = command_lines(&session.stream.written);
        assert_eq!(lines, vec!["+OK bye\n"]);
    }

    #[test]
    fn test_short_frame_and_unknown_channel_are_survivable() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);

        // Frame shorter than a channel id, then a frame addressed to a
        // data channel, then a healthy command.
        let mut wire = vec![0u8, 0, 0, 2, b'h', b'i'];
        wire.extend_from_slice(&[0, 0, 0, 5, 0, 0, 0, 9, b'x']);
        wire.extend_from_slice(&command("CAPABILITIES\n"));

        let rv = session.ingest(&mut NoHooks, &wire);
        assert_eq!(rv, 1);

        let lines = command_lines(&session.stream.written);
        assert_eq!(lines[0], "-ERR short frame\n");
        assert_eq!(lines[1], "-ERR unknown channel\n");
        assert!(lines[2].starts_with("+OK pushparameters"));
    }

    #[test]
    fn test_write_requires_access_and_reaches_queue() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);

        session.ingest(&mut NoHooks, &command("WRITE /osc/gain 2.5\n"));

        let lines = command_lines(&session.stream.written);
        assert_eq!(lines.last().unwrap(), "+OK write queued /osc/gain\n");

        match fx.control_rx.pop() {
            Some(ControlRequest::ParamWrite { id, value }) => {
                assert_eq!(id, 0);
                assert_eq!(LittleEndian::read_f64(&value), 2.5);
            }
            other => panic!("expected parameter write, got {:?}", other),
        }
    }

    #[test]
    fn test_write_denied_without_access() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);

        // viewer has no write access.
        session.ingest(&mut NoHooks, &command("LOGIN viewer\n"));
        let challenge = {
            let lines = command_lines(&session.stream.written);
            let token = lines
                .last()
                .unwrap()
                .trim_end()
                .rsplit(' ')
                .next()
                .unwrap()
                .to_string();
            base64::decode(&token).unwrap()
        };
        let response = auth::mac(&challenge, &TEST_KEY);
        session.ingest(
            &mut NoHooks,
            &command(&format!("AUTH {}\n", base64::encode(&response[..]))),
        );
        session.stream.written.clear();

        session.ingest(&mut NoHooks, &command("WRITE /osc/gain 1.0\n"));
        session.ingest(&mut NoHooks, &command("HALT\n"));

        let lines = command_lines(&session.stream.written);
        assert_eq!(
            lines,
            vec![
                "-ERR write access denied\n".to_string(),
                "-ERR write access denied\n".to_string()
            ]
        );
        assert!(fx.control_rx.pop().is_none());
    }

    #[test]
    fn test_poll_reads_snapshot() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);

        let mut bytes = [0u8; 8];
        LittleEndian::write_f64(&mut bytes, 3.25);
        fx.snapshot.update(0, &bytes);

        session.ingest(&mut NoHooks, &command("POLL /osc/out\n"));

        let lines = command_lines(&session.stream.written);
        assert_eq!(lines.last().unwrap(), "+OK /osc/out 3.250000\n");
    }

    #[test]
    fn test_poll_base64() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);

        let mut bytes = [0u8; 8];
        LittleEndian::write_f64(&mut bytes, 1.0);
        fx.snapshot.update(0, &bytes);

        session.ingest(&mut NoHooks, &command("POLL /osc/out base64\n"));

        let lines = command_lines(&session.stream.written);
        let expected = format!("+OK /osc/out {}\n", base64::encode(&bytes[..]));
        assert_eq!(lines.last().unwrap(), &expected);
    }

    #[test]
    fn test_param_change_pushed_as_event() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);
        session.ingest(&mut NoHooks, &command("START_STREAM\n"));
        session.stream.written.clear();

        let mut writer = crate::ring::SampleWriter::new(fx.ring.clone());
        let mut payload = vec![0u8; 12];
        LittleEndian::write_u32(&mut payload[..4], 0);
        LittleEndian::write_f64(&mut payload[4..], 9.5);

        let mut header_bytes = [0u8; 15];
        crate::producer::RecordHeader {
            kind: RecordKind::ParamChange,
            sample_time: 0,
            tick: 0,
            len: 12,
        }
        .encode(&mut header_bytes);

        writer.write(&header_bytes);
        writer.write(&payload);
        writer.publish();

        session.pump(&mut NoHooks);

        let lines = command_lines(&session.stream.written);
        assert_eq!(
            lines,
            vec!["=EVENT parameter /osc/gain 9.500000\n".to_string()]
        );
    }

    #[test]
    fn test_statistics_gated_on_capability() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);

        session.ingest(&mut NoHooks, &command("STATISTICS\n"));
        let lines = command_lines(&session.stream.written);
        assert_eq!(lines.last().unwrap(), "-ERR not supported\n");

        // With the capability enabled the feature string grows and the
        // listing answers.
        let fx = fixture_with(SampleRing::new(64 * 1024), true);
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);

        session.ingest(&mut NoHooks, &command("IDENT lab42 scope\n"));
        session.ingest(&mut NoHooks, &command("CAPABILITIES\n"));
        session.ingest(&mut NoHooks, &command("STATISTICS\n"));

        let lines = command_lines(&session.stream.written);
        assert_eq!(lines[0], "+OK identified\n");
        assert_eq!(
            lines[1],
            "+OK pushparameters,binparameters,maschinehalt,eventchannels,statistics\n"
        );
        assert!(lines[2].contains("host: lab42\n"));
        assert!(lines[2].contains("application: scope\n"));
        assert!(lines[2].ends_with(".\n"));
    }

    #[test]
    fn test_list_signals_format() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);

        session.ingest(&mut NoHooks, &command("LIST_SIGNALS\n"));

        let lines = command_lines(&session.stream.written);
        let body = lines.last().unwrap();

        assert!(body.starts_with("+OK signals:\n"));
        assert!(body.contains("path: /osc/out\n"));
        assert!(body.contains("type: f64\n"));
        assert!(body.contains("dims: 1\n"));
        assert!(body.ends_with(".\n"));
    }

    #[test]
    fn test_session_drop_releases_stats_and_stream_count() {
        let fx = fixture();

        {
            let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
            login(&mut session);
            session.ingest(&mut NoHooks, &command("START_STREAM\n"));

            assert_eq!(fx.ctx.streaming_sessions.load(Ordering::Relaxed), 1);
            assert_eq!(fx.ctx.sessions.borrow().len(), 1);
        }

        assert_eq!(fx.ctx.streaming_sessions.load(Ordering::Relaxed), 0);
        assert!(fx.ctx.sessions.borrow().is_empty());
    }

    #[test]
    fn test_unknown_verb() {
        let fx = fixture();
        let mut session = Session::new(MockStream::new(), fx.ctx.clone(), None);
        login(&mut session);

        session.ingest(&mut NoHooks, &command("FROBNICATE\n"));

        let lines = command_lines(&session.stream.written);
        assert_eq!(lines.last().unwrap(), "-ERR unknown command FROBNICATE\n");
    }
}
