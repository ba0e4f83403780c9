//! The log writer: the external collaborator that durably persists
//! accepted blocks. Runs off the receiver thread; completions cross back
//! over a channel and a shared waker, never a direct call.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use mio::Token;
use tracing::{error, warn};

/// A block handed to the writer after passing validation and the
/// contiguity guard.
#[derive(Debug)]
pub struct WriteRequest {
    pub token: Token,
    pub start_seq: i64,
    pub end_seq: i64,
    pub payload: Vec<u8>,
    pub line_lengths: Vec<usize>,
}

/// What the writer reports back once a request has been durably applied
/// (or failed).
#[derive(Debug)]
pub struct WriteCompletion {
    pub token: Token,
    pub start_seq: i64,
    pub end_seq: i64,
    /// `0` on success; a negative `errno`-shaped value on failure, matching
    /// the source's status convention.
    pub status: i32,
    /// The request's payload bytes, for the replay engine. The receiver
    /// core clears and returns this buffer to the free list once replay has
    /// consumed it, instead of allocating a fresh one for the next block.
    pub payload: Vec<u8>,
    pub line_lengths: Vec<usize>,
}

/// External collaborator that durably persists accepted blocks.
pub trait LogWriter: Send {
    fn submit(&self, request: WriteRequest);
}

/// Appends accepted blocks to a single file on a dedicated thread, reporting
/// completions through `completions` and waking the reactor via `waker`
/// after every batch drained from the channel.
pub struct FileLogWriter {
    tx: mpsc::Sender<WriteRequest>,
    _worker: thread::JoinHandle<()>,
}

impl FileLogWriter {
    pub fn spawn(
        path: PathBuf,
        completions: mpsc::Sender<WriteCompletion>,
        waker: Arc<mio::Waker>,
    ) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (tx, rx) = mpsc::channel::<WriteRequest>();

        let worker = thread::Builder::new()
            .name("log-receiver-writer".to_string())
            .spawn(move || {
                // Once one append fails, the file offset and the log's
                // sequence space have diverged: every subsequent queued
                // write must also be reported as failed, never attempted,
                // so the receiver's contiguity invariant never sees a
                // success sitting downstream of a failure.
                let mut poisoned = false;
                for request in rx {
                    let status = if poisoned {
                        -libc::EIO
                    } else {
                        match file.write_all(&request.payload).and_then(|()| file.flush()) {
                            Ok(()) => 0,
                            Err(err) => {
                                warn!(?err, path = ?path, "log writer append failed, poisoning writer");
                                poisoned = true;
                                -(err.raw_os_error().unwrap_or(libc::EIO))
                            }
                        }
                    };
                    // The payload travels back with the completion: the
                    // replayer still needs the bytes, and only after that is
                    // it safe to hand the buffer back to the free list.
                    let completion = WriteCompletion {
                        token: request.token,
                        start_seq: request.start_seq,
                        end_seq: request.end_seq,
                        status,
                        payload: request.payload,
                        line_lengths: request.line_lengths,
                    };
                    if completions.send(completion).is_err() {
                        // Receiver core is gone; nothing left to wake.
                        break;
                    }
                    if let Err(err) = waker.wake() {
                        error!(?err, "failed to wake reactor after write completion");
                    }
                }
            })?;

        Ok(Self { tx, _worker: worker })
    }
}

impl LogWriter for FileLogWriter {
    fn submit(&self, request: WriteRequest) {
        // The receiving end only goes away at process shutdown, by which
        // point there is nothing useful to do with a send failure.
        let _ = self.tx.send(request);
    }
}
