//! The receiver core (C6) and its dispatcher (C7): the authoritative
//! `committed_seq`/`last_write_seq` frontier, the four single-threaded
//! queues, and the free list of reusable write-descriptor buffers.
//!
//! Connections and the reactor's poll loop live elsewhere; this module only
//! owns frontier state and the two cross-thread queues. `dispatch()` is
//! generic over two callbacks supplied by the reactor, so it never needs to
//! know the concrete connection type.

use std::collections::VecDeque;
use std::sync::mpsc;

use flux_utils::safe_assert;
use mio::Token;
use tracing::{debug, warn};

use crate::error::ConnectionError;
use crate::replay::ReplayEngine;
use crate::writer::{LogWriter, WriteCompletion, WriteRequest};

/// A block that passed validation and the contiguity guard, pulled from the
/// free list and handed to the log writer.
#[derive(Debug, Default)]
pub struct WriteDescriptor {
    pub token: Token,
    pub start_seq: i64,
    pub end_seq: i64,
    pub payload: Vec<u8>,
}

/// Reusable pool of write-descriptor payload buffers, used as a stack to
/// avoid an allocation on every accepted block.
#[derive(Default)]
pub struct FreeList {
    descriptors: Vec<WriteDescriptor>,
}

impl FreeList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self) -> WriteDescriptor {
        self.descriptors.pop().unwrap_or_default()
    }

    pub fn release(&mut self, mut descriptor: WriteDescriptor) {
        descriptor.payload.clear();
        self.descriptors.push(descriptor);
    }
}

/// A non-block RPC queued for the external request dispatcher.
#[derive(Debug)]
pub struct PendingRequest {
    pub token: Token,
    pub payload: Vec<u8>,
}

/// External collaborator consuming non-block RPCs. No RPC besides
/// `AUTHENTICATE` is defined on this wire, and that one is intercepted by
/// the auth session before it would ever reach here; this trait exists so
/// the core's contract matches the source's, not because any concrete
/// caller needs it today.
pub trait RequestDispatcher: Send {
    fn dispatch(&mut self, request: PendingRequest);
}

/// Acknowledges every request immediately without doing anything with it.
#[derive(Debug, Default)]
pub struct NullRequestDispatcher;

impl RequestDispatcher for NullRequestDispatcher {
    fn dispatch(&mut self, _request: PendingRequest) {}
}

/// The result of attempting to submit a block to the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    Rejected { last_write_seq: i64 },
}

/// Holds the frontier, the free list, and the two cross-thread queues.
/// Everything else (connections, sockets, the poll loop) lives in the
/// reactor.
pub struct ReceiverCore {
    pub server_id: u64,
    committed_seq: i64,
    last_write_seq: i64,
    free_list: FreeList,
    submission_queue: VecDeque<PendingRequest>,
    completion_rx: mpsc::Receiver<WriteCompletion>,
    completion_tx: mpsc::Sender<WriteCompletion>,
    connection_count: usize,
    max_connection_count: usize,
}

impl ReceiverCore {
    #[must_use]
    pub fn new(server_id: u64, max_connection_count: usize) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel();
        Self {
            server_id,
            committed_seq: 0,
            last_write_seq: 0,
            free_list: FreeList::new(),
            submission_queue: VecDeque::new(),
            completion_rx,
            completion_tx,
            connection_count: 0,
            max_connection_count,
        }
    }

    /// The channel completions from the log writer are reported on. Given to
    /// the writer at construction time.
    #[must_use]
    pub fn completion_sender(&self) -> mpsc::Sender<WriteCompletion> {
        self.completion_tx.clone()
    }

    #[must_use]
    pub const fn committed_seq(&self) -> i64 {
        self.committed_seq
    }

    #[must_use]
    pub const fn last_write_seq(&self) -> i64 {
        self.last_write_seq
    }

    #[must_use]
    pub const fn connection_count(&self) -> usize {
        self.connection_count
    }

    /// Admits a new connection, or refuses it if the receiver is already at
    /// capacity.
    pub fn accept(&mut self) -> Result<(), ConnectionError> {
        if self.connection_count >= self.max_connection_count {
            return Err(ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::WouldBlock)));
        }
        self.connection_count += 1;
        Ok(())
    }

    /// Records a connection's destruction. Invariant: never underflows.
    pub fn release_connection(&mut self) {
        safe_assert!(self.connection_count > 0, "connection_count underflow on release");
        self.connection_count = self.connection_count.saturating_sub(1);
    }

    /// Acquires a reusable descriptor and fills it from a validated block,
    /// submitting it to `writer` only if it is contiguous with
    /// `last_write_seq`. Returns the descriptor to the free list immediately
    /// on rejection.
    pub fn submit_block(
        &mut self,
        writer: &dyn LogWriter,
        token: Token,
        start_seq: i64,
        end_seq: i64,
        payload: &[u8],
        line_lengths: Vec<usize>,
    ) -> SubmitOutcome {
        if start_seq != self.last_write_seq || end_seq <= self.last_write_seq {
            return SubmitOutcome::Rejected { last_write_seq: self.last_write_seq };
        }

        let mut descriptor = self.free_list.acquire();
        descriptor.token = token;
        descriptor.start_seq = start_seq;
        descriptor.end_seq = end_seq;
        descriptor.payload.clear();
        descriptor.payload.extend_from_slice(payload);

        self.last_write_seq = end_seq;
        writer.submit(WriteRequest {
            token: descriptor.token,
            start_seq: descriptor.start_seq,
            end_seq: descriptor.end_seq,
            payload: descriptor.payload,
            line_lengths,
        });
        SubmitOutcome::Submitted
    }

    /// Queues a non-block RPC for the external dispatcher.
    pub fn submit_request(&mut self, request: PendingRequest) {
        self.submission_queue.push_back(request);
    }

    /// Drains the completion queue and the submission queue exactly once,
    /// applying completions to the frontier in order and invoking the
    /// replay engine on every success. `on_completion` is called once per
    /// drained completion so the reactor can route it back to the owning
    /// connection (decrementing `pending_ops`, releasing the buffer).
    /// `broadcast_ack` is called at most once, after the drain, if any
    /// completion was processed.
    pub fn dispatch(
        &mut self,
        replay: &mut dyn ReplayEngine,
        dispatcher: &mut dyn RequestDispatcher,
        mut on_completion: impl FnMut(Token, i32),
        mut broadcast_ack: impl FnMut(i64, i64, u64),
    ) {
        let completions: Vec<WriteCompletion> = self.completion_rx.try_iter().collect();
        let any_completed = !completions.is_empty();

        if let Some(first) = completions.first() {
            let mut next = if first.status == 0 { self.committed_seq } else { first.start_seq };

            for completion in &completions {
                let expected = if completion.status == 0 { self.committed_seq } else { next };
                safe_assert!(
                    completion.start_seq == expected,
                    "completion out of submission order: expected {expected}, got {}",
                    completion.start_seq
                );
                safe_assert!(
                    completion.end_seq <= self.last_write_seq,
                    "completion end_seq {} exceeds last_write_seq {}",
                    completion.end_seq,
                    self.last_write_seq
                );
                safe_assert!(
                    completion.start_seq <= completion.end_seq,
                    "completion has inverted range {}..{}",
                    completion.start_seq,
                    completion.end_seq
                );

                next = completion.end_seq;

                if completion.status == 0 {
                    self.committed_seq = next;
                    replay.apply(
                        completion.start_seq,
                        completion.end_seq,
                        &completion.payload,
                        &completion.line_lengths,
                    );
                } else {
                    warn!(
                        token = ?completion.token,
                        status = completion.status,
                        start_seq = completion.start_seq,
                        end_seq = completion.end_seq,
                        "log write failed"
                    );
                }

                on_completion(completion.token, completion.status);
            }

            if self.committed_seq < next {
                debug!(
                    committed_seq = self.committed_seq,
                    last_write_seq = self.last_write_seq,
                    "demoting last_write_seq after failed completion"
                );
                self.last_write_seq = self.committed_seq;
            }
        }

        for descriptor in completions {
            self.free_list.release(WriteDescriptor {
                token: descriptor.token,
                start_seq: descriptor.start_seq,
                end_seq: descriptor.end_seq,
                payload: descriptor.payload,
            });
        }

        while let Some(request) = self.submission_queue.pop_front() {
            dispatcher.dispatch(request);
        }

        if any_completed {
            broadcast_ack(self.committed_seq, self.last_write_seq, self.server_id);
        }
    }
}
