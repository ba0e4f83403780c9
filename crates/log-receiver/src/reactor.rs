//! The reactor (C8): the single-threaded `mio` poll loop that connections
//! and the receiver core run on top of.
//!
//! Owns the listening socket, the `Token`-indexed connection table, and the
//! waker the background log writer uses to signal completions back onto
//! this thread. Everything else is delegated: [`ReceiverCore`] drives the
//! frontier, [`Connection`] drives per-socket protocol state, the log
//! writer persists accepted blocks. Modeled on `flux_network`'s
//! `TcpConnector`/`ConnectionManager`, narrowed to the single listener and
//! single cross-thread waker this receiver needs.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Socket, Type};
use tracing::{info, warn};

use crate::auth::AuthContext;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{ConnectionError, StartError};
use crate::receiver::{NullRequestDispatcher, ReceiverCore};
use crate::replay::{ReplayEngine, SequenceReplayer};
use crate::writer::FileLogWriter;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;

const READ_CHUNK: usize = 64 * 1024;
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

fn slot_index(token: Token) -> Option<usize> {
    token.0.checked_sub(FIRST_CONNECTION_TOKEN)
}

/// Per-connection socket state: the raw stream plus whatever bytes are
/// queued for it that the kernel hasn't accepted yet.
struct Slot {
    stream: TcpStream,
    conn: Connection,
    send_buf: Vec<u8>,
    send_offset: usize,
    writable_armed: bool,
}

/// Drives acceptance and IO for every live connection, the timeout sweep,
/// and the writer-completion wakeup, until a shutdown signal arrives and
/// every in-flight op has drained.
struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,

    core: ReceiverCore,
    writer: FileLogWriter,
    replay: Box<dyn ReplayEngine>,
    dispatcher: NullRequestDispatcher,
    auth_ctx: Box<dyn AuthContext>,

    max_read_ahead: usize,
    reauth_timeout: Duration,
    idle_timeout: Duration,

    stop: Arc<AtomicBool>,
    shutting_down: bool,
}

/// Binds, accepts, and services connections until the process receives
/// `SIGINT`/`SIGTERM` and every connection has torn down cleanly.
pub fn run(config: Config, auth_ctx: Box<dyn AuthContext>) -> Result<(), StartError> {
    let stop = install_signal_handlers()?;
    run_until(config, auth_ctx, stop)
}

/// Same as [`run`], but driven by a caller-supplied stop flag instead of
/// installing process-wide signal handlers. This is what lets integration
/// tests start a reactor on a thread and shut it down deterministically by
/// flipping an `AtomicBool`, rather than sending the process a signal.
pub fn run_until(
    config: Config,
    auth_ctx: Box<dyn AuthContext>,
    stop: Arc<AtomicBool>,
) -> Result<(), StartError> {
    let mut poll = Poll::new()?;
    let mut listener = bind_listener(&config)
        .map_err(|source| StartError::BindFailed { addr: config.listen_on, source })?;
    poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let mut core = ReceiverCore::new(config.id, config.max_connection_count);
    let writer = FileLogWriter::spawn(config.log_file.clone(), core.completion_sender(), Arc::clone(&waker))?;

    let mut reactor = Reactor {
        poll,
        events: Events::with_capacity(256),
        listener,
        slots: Vec::new(),
        free_slots: Vec::new(),
        core,
        writer,
        replay: Box::new(SequenceReplayer::new()),
        dispatcher: NullRequestDispatcher,
        auth_ctx,
        max_read_ahead: config.max_read_ahead,
        reauth_timeout: config.re_auth_timeout,
        idle_timeout: config.timeout,
        stop,
        shutting_down: false,
    };

    info!(listen_on = %config.listen_on, id = config.id, "log receiver starting");
    reactor.event_loop()
}

/// Binds the listening socket through `socket2` so `config.ipv6_only` can set
/// `IPV6_V6ONLY` before the socket is handed to `mio` (`mio::net::TcpListener`
/// exposes no such knob, and the default on most platforms is dual-stack).
fn bind_listener(config: &Config) -> io::Result<TcpListener> {
    let domain = if config.listen_on.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(config.ipv6_only)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&config.listen_on.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn install_signal_handlers() -> Result<Arc<AtomicBool>, StartError> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;
    Ok(stop)
}

impl Reactor {
    fn event_loop(&mut self) -> Result<(), StartError> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                self.begin_shutdown();
            }
            if self.shutting_down && self.core.connection_count() == 0 {
                info!("all connections drained, shutting down");
                return Ok(());
            }

            match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(StartError::Io(err)),
            }

            let mut accept_pending = false;
            let mut woken = false;
            let mut ready: Vec<(Token, bool, bool)> = Vec::new();
            for event in self.events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept_pending = true,
                    WAKER_TOKEN => woken = true,
                    token => ready.push((token, event.is_readable(), event.is_writable())),
                }
            }

            if accept_pending && !self.shutting_down {
                self.accept_all();
            }
            for (token, readable, writable) in ready {
                let Some(index) = slot_index(token) else { continue };
                if readable {
                    self.readable(index);
                }
                if writable {
                    self.flush_slot(index);
                }
            }
            if woken {
                self.pump_writer_completions();
            }

            self.sweep_timeouts();
            self.sweep_destroyed();
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.accept_one(stream, peer_addr),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }

    fn accept_one(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(err) = self.core.accept() {
            warn!(?err, %peer_addr, "rejecting connection, at capacity");
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }

        let index = self.free_slots.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });
        let token = Token(index + FIRST_CONNECTION_TOKEN);

        if let Err(err) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
            warn!(?err, %peer_addr, "failed to register accepted connection");
            self.core.release_connection();
            return;
        }

        let conn = Connection::new(token, peer_addr, self.max_read_ahead, Instant::now());
        self.slots[index] =
            Some(Slot { stream, conn, send_buf: Vec::new(), send_offset: 0, writable_armed: false });
        info!(%peer_addr, ?token, "accepted connection");
    }

    fn readable(&mut self, index: usize) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let Some(slot) = &mut self.slots[index] else { return };
            match slot.stream.read(&mut buf) {
                Ok(0) => {
                    slot.conn.fail(&ConnectionError::Io(io::Error::from(io::ErrorKind::ConnectionReset)));
                    break;
                }
                Ok(n) => {
                    slot.conn.touch(Instant::now());
                    if let Err(err) = slot.conn.on_read(
                        &buf[..n],
                        &mut self.core,
                        &self.writer,
                        self.auth_ctx.as_ref(),
                        self.reauth_timeout,
                        SystemTime::now(),
                    ) {
                        slot.conn.fail(&err);
                        break;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    slot.conn.fail(&ConnectionError::Io(err));
                    break;
                }
            }
        }
        self.flush_slot(index);
    }

    /// Drains whatever the connection has queued for writing, writes as
    /// much as the kernel accepts, and arms/disarms `WRITABLE` interest
    /// depending on whether anything is left over. Runs `on_wrote` once a
    /// full drain completes, since that may itself enqueue more bytes (a
    /// deferred filter install finishing up).
    fn flush_slot(&mut self, index: usize) {
        loop {
            {
                let Some(slot) = &mut self.slots[index] else { return };
                if slot.conn.has_pending_writes() {
                    let pending = slot.conn.take_write_backlog();
                    slot.send_buf.extend_from_slice(&pending);
                }

                while slot.send_offset < slot.send_buf.len() {
                    match slot.stream.write(&slot.send_buf[slot.send_offset..]) {
                        Ok(0) => {
                            slot.conn.fail(&ConnectionError::Io(io::Error::from(io::ErrorKind::WriteZero)));
                            return;
                        }
                        Ok(n) => slot.send_offset += n,
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            drop(slot);
                            self.arm_writable(index);
                            return;
                        }
                        Err(err) => {
                            slot.conn.fail(&ConnectionError::Io(err));
                            return;
                        }
                    }
                }

                slot.send_buf.clear();
                slot.send_offset = 0;
            }
            self.disarm_writable(index);

            let Some(slot) = &mut self.slots[index] else { return };
            slot.conn.on_wrote();
            if !slot.conn.has_pending_writes() {
                return;
            }
        }
    }

    fn arm_writable(&mut self, index: usize) {
        let token = Token(index + FIRST_CONNECTION_TOKEN);
        if let Some(slot) = &mut self.slots[index] {
            if !slot.writable_armed {
                if let Err(err) =
                    self.poll.registry().reregister(&mut slot.stream, token, Interest::READABLE | Interest::WRITABLE)
                {
                    warn!(?err, ?token, "failed to arm writable interest");
                }
                slot.writable_armed = true;
            }
        }
    }

    fn disarm_writable(&mut self, index: usize) {
        let token = Token(index + FIRST_CONNECTION_TOKEN);
        if let Some(slot) = &mut self.slots[index] {
            if slot.writable_armed {
                if let Err(err) = self.poll.registry().reregister(&mut slot.stream, token, Interest::READABLE) {
                    warn!(?err, ?token, "failed to disarm writable interest");
                }
                slot.writable_armed = false;
            }
        }
    }

    /// Drains the receiver core's completion queue once, routing each
    /// completion back to the connection that submitted it and broadcasting
    /// a fresh ack to every live connection if anything completed.
    fn pump_writer_completions(&mut self) {
        let core = &mut self.core;
        let replay = self.replay.as_mut();
        let dispatcher = &mut self.dispatcher;
        let slots = &mut self.slots;
        let reauth_timeout = self.reauth_timeout;
        let auth_ctx = self.auth_ctx.as_ref();

        let mut acked = Vec::new();
        core.dispatch(
            replay,
            dispatcher,
            |token, _status| {
                if let Some(index) = slot_index(token) {
                    if let Some(Some(slot)) = slots.get_mut(index) {
                        slot.conn.on_write_completed();
                    }
                }
            },
            |committed_seq, last_write_seq, server_id| {
                let now = SystemTime::now();
                for (index, slot) in slots.iter_mut().enumerate() {
                    if let Some(slot) = slot {
                        slot.conn.send_ack(committed_seq, last_write_seq, server_id, auth_ctx, reauth_timeout, now);
                        acked.push(index);
                    }
                }
            },
        );

        for index in acked {
            self.flush_slot(index);
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        for slot in self.slots.iter_mut().flatten() {
            if !slot.conn.is_down() && slot.conn.idle_for(now) > idle_timeout {
                slot.conn.fail(&ConnectionError::InactivityTimeout);
            }
        }
    }

    /// Removes every connection that has both been marked down and drained
    /// its in-flight ops, deregistering its socket and releasing its slot
    /// for reuse.
    fn sweep_destroyed(&mut self) {
        for index in 0..self.slots.len() {
            let destroy = matches!(&self.slots[index], Some(slot) if slot.conn.can_be_destroyed());
            if !destroy {
                continue;
            }
            if let Some(mut slot) = self.slots[index].take() {
                let _ = self.poll.registry().deregister(&mut slot.stream);
            }
            self.core.release_connection();
            self.free_slots.push(index);
        }
    }

    /// Stops accepting new connections and synthesizes a `NET_ERROR` for
    /// every live one; actual destruction still waits for `pending_ops` to
    /// drain via the normal completion path.
    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!("shutdown signal received, draining connections");
        let _ = self.poll.registry().deregister(&mut self.listener);
        for slot in self.slots.iter_mut().flatten() {
            slot.conn.fail(&ConnectionError::Io(io::Error::from(io::ErrorKind::ConnectionAborted)));
        }
    }
}
