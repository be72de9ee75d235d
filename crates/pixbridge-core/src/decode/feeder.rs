//! Stream feeder: copies a source stream into one engine session.
//!
//! ```text
//! StreamFeeder::spawn(source)
//!   |
//!   +-- spawns "feeder-#n" thread
//!   |     loop:
//!   |       1. Check cancel flag
//!   |       2. Read one block (read error => EOF)
//!   |       3. Forward block via engine.feed
//!   |       4. Yield every N blocks
//!   |     Forward exactly one FeedBlock::End
//!   |     Send FeedOutcome on the completion channel
//!   |
//!   +-- Returns FeederHandle (cancel / wait)
//! ```
//!
//! In staging mode the same loop runs inline on the caller's thread through
//! [`StreamFeeder::run`], and the handle simply carries the finished outcome.

use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::engine::{DecodeEngine, FeedBlock};
use crate::pool::SessionId;

/// Summary of one feeder run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedOutcome {
    /// Source bytes forwarded to the engine.
    pub bytes_forwarded: u64,
    /// Data blocks forwarded.
    pub blocks: u64,
    /// The loop stopped because cancellation was requested.
    pub cancelled: bool,
    /// The single end-of-input signal was issued.
    pub terminal_sent: bool,
    /// A source read failed and was treated as end of input.
    pub read_error: Option<String>,
}

impl FeedOutcome {
    /// Returns true if the source failed before yielding any data.
    pub fn failed_before_data(&self) -> bool {
        self.read_error.is_some() && self.bytes_forwarded == 0
    }
}

/// Feeds one source stream into one engine session.
pub struct StreamFeeder<E: ?Sized> {
    engine: Arc<E>,
    session: SessionId,
    block_size: usize,
    yield_every: u32,
    cancel: Arc<AtomicBool>,
}

impl<E: DecodeEngine + ?Sized + 'static> StreamFeeder<E> {
    /// Build a feeder for `session` using the configured block size and
    /// yield interval.
    pub fn new(engine: Arc<E>, session: SessionId, config: &BridgeConfig) -> Self {
        Self {
            engine,
            session,
            block_size: config.feed_block_size.max(1),
            yield_every: config.yield_every_blocks,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the feed loop on a dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread could not be spawned. No input
    /// has been forwarded in that case.
    pub fn spawn<R: Read + Send + 'static>(self, source: R) -> io::Result<FeederHandle> {
        let (done_tx, done_rx) = channel::bounded::<FeedOutcome>(1);
        let cancel = self.cancel.clone();
        let session = self.session;

        let thread = std::thread::Builder::new()
            .name(format!("feeder-{session}"))
            .spawn(move || {
                let outcome = self.feed_loop(source);
                // The receiver only disappears if the handle was leaked.
                let _ = done_tx.send(outcome);
            })?;

        Ok(FeederHandle {
            cancel,
            state: HandleState::Spawned { done_rx, thread },
        })
    }

    /// Run the feed loop to completion on the calling thread.
    pub fn run<R: Read>(self, source: R) -> FeederHandle {
        let cancel = self.cancel.clone();
        let outcome = self.feed_loop(source);
        FeederHandle {
            cancel,
            state: HandleState::Finished(outcome),
        }
    }

    fn feed_loop<R: Read>(self, mut source: R) -> FeedOutcome {
        let session = self.session;
        let mut outcome = FeedOutcome::default();
        let mut buffer = vec![0u8; self.block_size];

        debug!(session = %session, block_size = self.block_size, "Feeder started");

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                info!(session = %session, blocks = outcome.blocks, "Feeder cancelled");
                outcome.cancelled = true;
                break;
            }

            let n = match read_block(&mut source, &mut buffer) {
                Ok(n) => n,
                Err(e) => {
                    warn!(session = %session, error = %e, "Source read failed, treating as end of input");
                    outcome.read_error = Some(e.to_string());
                    0
                }
            };
            if n == 0 {
                break;
            }

            if let Err(fault) = self.engine.feed(session, FeedBlock::Data(&buffer[..n])) {
                debug!(session = %session, error = %fault, "Engine refused input, stopping feeder");
                break;
            }
            outcome.blocks += 1;
            outcome.bytes_forwarded += n as u64;

            if self.yield_every > 0 && outcome.blocks % u64::from(self.yield_every) == 0 {
                std::thread::yield_now();
            }
        }

        // Exactly one terminal signal, whatever ended the loop.
        if let Err(fault) = self.engine.feed(session, FeedBlock::End) {
            debug!(session = %session, error = %fault, "End of input not accepted");
        }
        outcome.terminal_sent = true;

        debug!(
            session = %session,
            blocks = outcome.blocks,
            bytes = outcome.bytes_forwarded,
            cancelled = outcome.cancelled,
            "Feeder finished"
        );
        outcome
    }
}

fn read_block<R: Read>(source: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buffer) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

enum HandleState {
    Finished(FeedOutcome),
    Spawned {
        done_rx: Receiver<FeedOutcome>,
        thread: JoinHandle<()>,
    },
}

/// Handle to a running or finished feeder.
///
/// [`wait`](Self::wait) consumes the handle, so completion is observed
/// exactly once.
pub struct FeederHandle {
    cancel: Arc<AtomicBool>,
    state: HandleState,
}

impl FeederHandle {
    /// Ask the feeder to stop before its next read.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Returns true once the feeder has published its outcome.
    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Finished(_) => true,
            HandleState::Spawned { done_rx, .. } => !done_rx.is_empty(),
        }
    }

    /// Block until the feeder has finished and no longer touches its source.
    pub fn wait(self) -> FeedOutcome {
        match self.state {
            HandleState::Finished(outcome) => outcome,
            HandleState::Spawned { done_rx, thread } => {
                let outcome = done_rx.recv();
                if thread.join().is_err() {
                    error!("Feeder thread panicked");
                }
                outcome.unwrap_or_default()
            }
        }
    }
}

impl std::fmt::Debug for FeederHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeederHandle")
            .field("cancel_requested", &self.is_cancel_requested())
            .field("finished", &self.is_finished())
            .finish()
    }
}
