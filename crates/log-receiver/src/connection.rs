//! The per-connection receive state machine (C5).
//!
//! A [`Connection`] owns no socket; the reactor feeds it raw bytes read off
//! the wire and drains whatever it queues for writing. The transport filter
//! itself lives inside the `AuthSession` it owns (the component that
//! negotiates and installs it during the handshake), so `on_read` unwraps
//! ciphertext and `enqueue` wraps outbound frames before either ever touches
//! `read_buf` or `write_backlog`. This split is what makes the state machine
//! testable without a live `TcpStream`: everything here operates on buffers
//! and the collaborator traits (`AuthContext`, `LogWriter`), exactly like
//! `crate::block` and `crate::framed` operate on buffers alone.
//!
//! Event contracts mirror the source one-for-one: `on_read` is `READ`,
//! `on_wrote` is `WROTE`, `on_write_completed` is `CMD_DONE`, `fail` covers
//! both `NET_ERROR` and `INACTIVITY_TIMEOUT` (the distinction is which
//! message the caller passes).

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use mio::Token;
use tracing::warn;

use crate::auth::{AuthContext, AuthSession, AuthState, AuthenticateRequest};
use crate::block::{self, BlockOutcome};
use crate::checksum::BlockChecksum;
use crate::error::ConnectionError;
use crate::framed::{self, BlockAnnounce, MAX_RPC_HEADER_LEN};
use crate::receiver::{ReceiverCore, SubmitOutcome};
use crate::writer::LogWriter;

/// Bit 0 of the ack flags word: the peer must re-authenticate.
const FLAG_REAUTH_REQUIRED: u32 = 1 << 0;
/// Bit 1: this ack carries the `<server_id> <cksum>` suffix.
const FLAG_HAS_SERVER_ID: u32 = 1 << 1;

/// What the connection is currently buffering bytes for.
enum ReadMode {
    /// Waiting for a complete CRLF-terminated RPC frame.
    Rpc,
    /// The RPC frame named an `AUTHENTICATE` request; waiting for
    /// `content_len` more raw bytes carrying the credential payload.
    AuthBody { method: String, filter_requested: bool, content_len: usize },
    /// The RPC frame announced a block; waiting for `announce.block_len`
    /// more raw bytes carrying the header+body.
    BlockBody { announce: BlockAnnounce },
}

/// Per-connection state: everything tracked for one peer that isn't the
/// socket itself.
pub struct Connection {
    pub token: Token,
    pub peer_addr: SocketAddr,

    read_buf: Vec<u8>,
    mode: ReadMode,
    max_read_ahead: usize,

    auth: AuthSession,
    auth_write_pending: bool,

    /// The contiguity frontier for *this connection's* blocks, independent
    /// of the receiver-wide `last_write_seq`. Sentinel `-1` before any block
    /// has been accepted.
    previous_end_seq: i64,

    /// Submitted-but-uncompleted write ops. The connection cannot be
    /// destroyed while this is nonzero.
    pending_ops: usize,
    down: bool,
    server_id_sent: bool,

    write_backlog: Vec<u8>,
    last_activity: Instant,
}

impl Connection {
    #[must_use]
    pub fn new(token: Token, peer_addr: SocketAddr, max_read_ahead: usize, now: Instant) -> Self {
        Self {
            token,
            peer_addr,
            read_buf: Vec::new(),
            mode: ReadMode::Rpc,
            max_read_ahead,
            auth: AuthSession::new(),
            auth_write_pending: false,
            previous_end_seq: -1,
            pending_ops: 0,
            down: false,
            server_id_sent: false,
            write_backlog: Vec::new(),
            last_activity: now,
        }
    }

    #[must_use]
    pub const fn is_down(&self) -> bool {
        self.down
    }

    #[must_use]
    pub const fn pending_ops(&self) -> usize {
        self.pending_ops
    }

    /// The read-ahead ceiling this connection was constructed with: the
    /// reactor caps how much unprocessed data it will hand to `on_read` at
    /// once against this limit.
    #[must_use]
    pub const fn max_read_ahead(&self) -> usize {
        self.max_read_ahead
    }

    /// A connection is destroyed only once both its ops have drained and it
    /// has been marked down.
    #[must_use]
    pub const fn can_be_destroyed(&self) -> bool {
        self.down && self.pending_ops == 0
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Bytes queued for the reactor to write to the socket. The reactor
    /// drains this on every `WROTE`-armed writable poll.
    pub fn take_write_backlog(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.write_backlog)
    }

    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.write_backlog.is_empty()
    }

    fn enqueue(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let wire_bytes = self.auth.encrypt(bytes)?;
        if self.auth.is_reauthenticating() {
            self.auth.queue_response(wire_bytes);
        } else {
            self.write_backlog.extend_from_slice(&wire_bytes);
        }
        Ok(())
    }

    /// `NET_ERROR` / `INACTIVITY_TIMEOUT`: logs once, marks the connection
    /// down. Idempotent — a connection already down logs nothing further,
    /// matching the source's `Error()` guard.
    pub fn fail(&mut self, err: &ConnectionError) {
        if self.down {
            return;
        }
        warn!(
            peer = %self.peer_addr,
            last_end_seq = self.previous_end_seq,
            "{}, closing connection", err.wire_message()
        );
        self.auth.mark_down();
        self.down = true;
    }

    /// `READ`: unwraps newly received bytes through the transport filter (a
    /// no-op until a filter has been negotiated) and processes as many
    /// complete frames as are now available.
    pub fn on_read(
        &mut self,
        data: &[u8],
        core: &mut ReceiverCore,
        writer: &dyn LogWriter,
        auth_ctx: &dyn AuthContext,
        reauth_timeout: Duration,
        now: SystemTime,
    ) -> Result<(), ConnectionError> {
        let plaintext = self.auth.decrypt(data)?;
        self.read_buf.extend_from_slice(&plaintext);

        loop {
            match &self.mode {
                ReadMode::Rpc => {
                    let Some(frame_len) = framed::find_rpc_frame(&self.read_buf) else {
                        if self.read_buf.len() > MAX_RPC_HEADER_LEN {
                            return Err(ConnectionError::HeaderTooLarge);
                        }
                        return Ok(());
                    };
                    let header = self.read_buf[..frame_len - 4].to_vec();
                    self.read_buf.drain(..frame_len);
                    self.begin_rpc(&header, core, auth_ctx, reauth_timeout, now)?;
                }
                ReadMode::AuthBody { content_len, .. } => {
                    if self.read_buf.len() < *content_len {
                        return Ok(());
                    }
                    let ReadMode::AuthBody { method, filter_requested, content_len } =
                        std::mem::replace(&mut self.mode, ReadMode::Rpc)
                    else {
                        unreachable!("matched AuthBody above")
                    };
                    let content: Vec<u8> = self.read_buf.drain(..content_len).collect();
                    self.finish_authenticate(method, filter_requested, content, auth_ctx)?;
                }
                ReadMode::BlockBody { announce } => {
                    let block_len = announce.block_len;
                    if self.read_buf.len() < block_len {
                        return Ok(());
                    }
                    let ReadMode::BlockBody { announce } = std::mem::replace(&mut self.mode, ReadMode::Rpc) else {
                        unreachable!("matched BlockBody above")
                    };
                    let raw: Vec<u8> = self.read_buf.drain(..block_len).collect();
                    self.finish_block(&raw, announce.block_cksum, core, writer, auth_ctx, reauth_timeout, now)?;
                }
            }
        }
    }

    /// Dispatches on a fully-buffered RPC header line: either the start of
    /// an `AUTHENTICATE` handshake or a block announcement. Both are the
    /// only two messages this wire protocol defines.
    fn begin_rpc(
        &mut self,
        header: &[u8],
        core: &ReceiverCore,
        auth_ctx: &dyn AuthContext,
        reauth_timeout: Duration,
        now: SystemTime,
    ) -> Result<(), ConnectionError> {
        if let Some(announce) = framed::parse_block_announce(header) {
            if matches!(self.auth.state(), AuthState::Authenticating | AuthState::Reauthenticating) {
                return Err(ConnectionError::OutOfOrderData);
            }
            if auth_ctx.is_auth_required() && self.auth.principal_name().unwrap_or("").is_empty() {
                return Err(ConnectionError::AuthenticationRequired);
            }
            if announce.block_len == 0 {
                // No header, no body to wait for: validate the (necessarily
                // empty) checksum right away. A heartbeat carries no write
                // to ride the completion-broadcast path, so the ack goes out
                // synchronously instead of waiting for the next dispatch().
                return match block::validate_block(&[], announce.block_cksum, self.previous_end_seq)? {
                    BlockOutcome::Empty => {
                        self.send_ack(
                            core.committed_seq(),
                            core.last_write_seq(),
                            core.server_id,
                            auth_ctx,
                            reauth_timeout,
                            now,
                        );
                        Ok(())
                    }
                    BlockOutcome::Block(_) => unreachable!("an empty slice can only validate to Empty"),
                };
            }
            self.mode = ReadMode::BlockBody { announce };
            return Ok(());
        }

        let request = parse_authenticate_header(header)?;
        self.auth.begin()?;
        self.mode = ReadMode::AuthBody {
            method: request.method,
            filter_requested: request.filter_requested,
            content_len: request.content_len,
        };
        Ok(())
    }

    fn finish_authenticate(
        &mut self,
        method: String,
        filter_requested: bool,
        content: Vec<u8>,
        auth_ctx: &dyn AuthContext,
    ) -> Result<(), ConnectionError> {
        let request = AuthenticateRequest { method, content, filter_requested };
        let response = match auth_ctx.authenticate(&request) {
            Ok(response) => response,
            Err(err) => {
                self.auth.fail();
                return Err(err);
            }
        };
        let response_bytes = response.content.clone();
        if let Err(err) = self.auth.validate_and_stage(response, auth_ctx.get_update_count()) {
            self.auth.fail();
            return Err(err);
        }

        self.enqueue(&response_bytes)?;
        self.auth_write_pending = true;
        Ok(())
    }

    /// `WROTE`: if a handshake response just finished writing, advance the
    /// deferred filter install (which may need to be called again on a
    /// later `WROTE` if the old filter hasn't drained yet).
    pub fn on_wrote(&mut self) {
        if self.auth_write_pending {
            self.auth_write_pending = !self.auth.finish_write();
            if !self.auth_write_pending {
                for response in self.auth.take_pending_responses() {
                    self.write_backlog.extend_from_slice(&response);
                }
            }
        }
    }

    fn finish_block(
        &mut self,
        raw: &[u8],
        declared_cksum: u32,
        core: &mut ReceiverCore,
        writer: &dyn LogWriter,
        auth_ctx: &dyn AuthContext,
        reauth_timeout: Duration,
        now: SystemTime,
    ) -> Result<(), ConnectionError> {
        match block::validate_block(raw, declared_cksum, self.previous_end_seq)? {
            // Header consumed the whole declared length: same "no write,
            // ack now" heartbeat as the outer `block_len == 0` case in
            // `begin_rpc`, just reached after buffering a (now known to be
            // header-only) body instead of short-circuiting on the
            // announcement line.
            BlockOutcome::Empty => {
                self.send_ack(core.committed_seq(), core.last_write_seq(), core.server_id, auth_ctx, reauth_timeout, now);
                Ok(())
            }
            BlockOutcome::Block(validated) => {
                self.previous_end_seq = validated.end_seq;
                match core.submit_block(
                    writer,
                    self.token,
                    validated.start_seq,
                    validated.end_seq,
                    &validated.payload,
                    validated.line_lengths,
                ) {
                    SubmitOutcome::Submitted => {
                        self.pending_ops += 1;
                        Ok(())
                    }
                    SubmitOutcome::Rejected { last_write_seq } => {
                        Err(ConnectionError::BlockRejected { last_write_seq })
                    }
                }
            }
        }
    }

    /// Called by the reactor when a write this connection submitted has
    /// completed (`CMD_DONE`).
    pub fn on_write_completed(&mut self) {
        debug_assert!(self.pending_ops > 0, "write completion with no outstanding op");
        self.pending_ops = self.pending_ops.saturating_sub(1);
    }

    /// Builds and enqueues an ack frame for the current frontier, deciding
    /// whether a re-auth should be requested and whether the server-id
    /// suffix (sent exactly once per connection) is due. This is the single
    /// "send ack" entry point; nothing else builds or enqueues an ack frame.
    pub fn send_ack(
        &mut self,
        committed_seq: i64,
        last_write_seq: i64,
        server_id: u64,
        auth_ctx: &dyn AuthContext,
        reauth_timeout: Duration,
        now: SystemTime,
    ) {
        if self.down {
            return;
        }
        let reauth_required = self.auth.needs_reauth(auth_ctx, reauth_timeout, now);
        let lag = (last_write_seq - committed_seq).max(0);

        let mut flags = 0u32;
        if reauth_required {
            flags |= FLAG_REAUTH_REQUIRED;
        }
        let first_emission = !self.server_id_sent;
        if first_emission {
            flags |= FLAG_HAS_SERVER_ID;
        }

        let mut frame = format!("A {committed_seq:x} {lag:x} {flags:x}").into_bytes();
        if first_emission {
            self.server_id_sent = true;
            frame.extend_from_slice(format!(" {server_id:x} ").as_bytes());
            let cksum = BlockChecksum::compute(&frame).value();
            frame.extend_from_slice(format!("{cksum:x}").as_bytes());
        }
        frame.extend_from_slice(b"\r\n\r\n");
        if let Err(err) = self.enqueue(&frame) {
            self.fail(&err);
        }
    }
}

/// Parses the header block of an `AUTHENTICATE` RPC:
/// `AUTHENTICATE\r\nMethod: <name>\r\nContent-length: <n>\r\nFilter: <yes|no>\r\n`
/// (the blank-line terminator has already been stripped by the caller).
struct ParsedAuthHeader {
    method: String,
    content_len: usize,
    filter_requested: bool,
}

fn parse_authenticate_header(header: &[u8]) -> Result<ParsedAuthHeader, ConnectionError> {
    let text = std::str::from_utf8(header).map_err(|_| ConnectionError::RequestParseError)?;
    let mut lines = text.split("\r\n");
    let verb = lines.next().ok_or(ConnectionError::RequestParseError)?;
    if !verb.eq_ignore_ascii_case("AUTHENTICATE") {
        return Err(ConnectionError::RequestParseError);
    }

    let mut method = None;
    let mut content_len = None;
    let mut filter_requested = false;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or(ConnectionError::RequestParseError)?;
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "method" => method = Some(value.to_string()),
            "content-length" => {
                content_len = Some(value.parse::<usize>().map_err(|_| ConnectionError::RequestParseError)?);
            }
            "filter" => filter_requested = value.eq_ignore_ascii_case("yes") || value.eq_ignore_ascii_case("tls"),
            _ => {}
        }
    }

    Ok(ParsedAuthHeader {
        method: method.ok_or(ConnectionError::RequestParseError)?,
        content_len: content_len.unwrap_or(0),
        filter_requested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DisabledAuth;
    use crate::checksum;
    use crate::writer::WriteRequest;
    use std::sync::mpsc;

    struct RecordingWriter {
        tx: mpsc::Sender<WriteRequest>,
    }
    impl LogWriter for RecordingWriter {
        fn submit(&self, request: WriteRequest) {
            self.tx.send(request).unwrap();
        }
    }

    fn block_announce_frame(end_seq: i64, seq_len: i64, body: &[u8]) -> (Vec<u8>, u32) {
        let hdr = format!("{end_seq:x} {seq_len:x} ").into_bytes();
        let mut raw = hdr.clone();
        raw.extend_from_slice(body);
        let hdr_cksum = BlockChecksum::compute(&hdr);
        let body_cksum = BlockChecksum::compute(body);
        let cksum = checksum::compose(hdr_cksum, body_cksum);
        (raw, cksum)
    }

    #[test]
    fn happy_path_block_submits_and_advances_previous_end_seq() {
        let mut conn = Connection::new(Token(0), "127.0.0.1:1".parse().unwrap(), 1 << 16, Instant::now());
        let mut core = ReceiverCore::new(0x10, 8);
        let (tx, _rx) = mpsc::channel();
        let writer = RecordingWriter { tx };
        let auth_ctx = DisabledAuth;

        let (raw, cksum) = block_announce_frame(5, 5, b"a\nb\nc\nd\ne/");
        let mut wire = format!("l:{:x} {:x}\r\n\r\n", raw.len(), cksum).into_bytes();
        wire.extend_from_slice(&raw);

        conn.on_read(&wire, &mut core, &writer, &auth_ctx, Duration::from_secs(300), SystemTime::now()).unwrap();

        assert_eq!(conn.pending_ops(), 1);
        assert_eq!(conn.previous_end_seq, 5);
        assert_eq!(core.last_write_seq(), 5);
    }

    #[test]
    fn out_of_order_block_is_rejected_by_connection_contiguity() {
        let mut conn = Connection::new(Token(0), "127.0.0.1:1".parse().unwrap(), 1 << 16, Instant::now());
        conn.previous_end_seq = 5;
        let mut core = ReceiverCore::new(0x10, 8);
        let (tx, _rx) = mpsc::channel();
        let writer = RecordingWriter { tx };
        let auth_ctx = DisabledAuth;

        let (raw, cksum) = block_announce_frame(4, 1, b"a/");
        let mut wire = format!("l:{:x} {:x}\r\n\r\n", raw.len(), cksum).into_bytes();
        wire.extend_from_slice(&raw);

        let err = conn.on_read(&wire, &mut core, &writer, &auth_ctx, Duration::from_secs(300), SystemTime::now());
        assert!(matches!(err, Err(ConnectionError::InvalidBlockSequence)));
    }

    #[test]
    fn heartbeat_block_acks_immediately_without_a_write() {
        let mut conn = Connection::new(Token(0), "127.0.0.1:1".parse().unwrap(), 1 << 16, Instant::now());
        let mut core = ReceiverCore::new(0x10, 8);
        let (tx, rx) = mpsc::channel();
        let writer = RecordingWriter { tx };
        let auth_ctx = DisabledAuth;

        let empty_cksum = BlockChecksum::new().value();
        let wire = format!("l:0 {empty_cksum:x}\r\n\r\n").into_bytes();

        conn.on_read(&wire, &mut core, &writer, &auth_ctx, Duration::from_secs(300), SystemTime::now()).unwrap();

        assert!(rx.try_recv().is_err(), "a heartbeat must not submit a write");
        let bytes = conn.take_write_backlog();
        assert!(!bytes.is_empty(), "a heartbeat must still produce an ack");
        assert!(String::from_utf8(bytes).unwrap().starts_with("A 0 0 2"));
    }

    #[test]
    fn first_ack_carries_server_id_and_checksum() {
        let mut conn = Connection::new(Token(0), "127.0.0.1:1".parse().unwrap(), 1 << 16, Instant::now());
        let auth_ctx = DisabledAuth;
        conn.send_ack(5, 5, 0x10, &auth_ctx, Duration::from_secs(300), SystemTime::now());
        let bytes = conn.take_write_backlog();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("A 5 0 2 10 "));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn block_before_authentication_is_rejected_when_auth_required() {
        use crate::auth::SharedSecretAuth;
        use std::collections::HashMap;

        let mut conn = Connection::new(Token(0), "127.0.0.1:1".parse().unwrap(), 1 << 16, Instant::now());
        let mut core = ReceiverCore::new(0x10, 8);
        let (tx, _rx) = mpsc::channel();
        let writer = RecordingWriter { tx };
        let mut secrets = HashMap::new();
        secrets.insert("alice".to_string(), b"sekrit".to_vec());
        let auth_ctx = SharedSecretAuth::new(secrets, Duration::from_secs(3600));

        let (raw, cksum) = block_announce_frame(5, 5, b"a\nb\nc\nd\ne/");
        let mut wire = format!("l:{:x} {:x}\r\n\r\n", raw.len(), cksum).into_bytes();
        wire.extend_from_slice(&raw);

        let err = conn.on_read(&wire, &mut core, &writer, &auth_ctx, Duration::from_secs(300), SystemTime::now());
        assert!(matches!(err, Err(ConnectionError::AuthenticationRequired)));
    }

    #[test]
    fn second_ack_omits_server_id() {
        let mut conn = Connection::new(Token(0), "127.0.0.1:1".parse().unwrap(), 1 << 16, Instant::now());
        let auth_ctx = DisabledAuth;
        conn.send_ack(5, 5, 0x10, &auth_ctx, Duration::from_secs(300), SystemTime::now());
        conn.take_write_backlog();
        conn.send_ack(5, 5, 0x10, &auth_ctx, Duration::from_secs(300), SystemTime::now());
        let bytes = conn.take_write_backlog();
        assert_eq!(bytes, b"A 5 0 0\r\n\r\n");
    }
}
