//! Per-engine write pipeline.
//!
//! Producers enqueue batches on a bounded queue; a single background loop owns
//! the write stream and feeds it in queue order:
//!
//! ```text
//!              open ok                      send ok
//! Disconnected ───────► Streaming ◄──────────────┐
//!   ▲   │ open err          │ │ send err         │
//!   │   │ fail snapshot,    │ └──────────────────┼──► Disconnected
//!   │   │ backoff           │ shutdown           │
//!   └───┘                   ▼ half-close         │
//!                        Closed ◄────────────────┘
//! ```
//!
//! A stream that ends while idle is dropped without touching any request. A
//! batch the dead stream never took is sent again, once, after a fresh header.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sql2kv_proto::{WriteBatch, WriteEngineRequest};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, error, info, warn};

use super::stream::{SendError, WriteStream, WriteStreamOpener};
use crate::engine::EngineId;
use crate::error::{ImportError, check_remote};

/// Default bound of the pending request queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// Default wait between failed stream establishment attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum number of pending write requests.
    pub queue_capacity: usize,
    /// Wait after a failed stream establishment.
    pub reconnect_backoff: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }
}

/// Lifecycle of a pipeline: Created → Open → Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    /// Accepting configuration, not yet accepting writes.
    Created = 0,
    /// Processing loop running.
    Open = 1,
    /// Shut down; terminal.
    Closed = 2,
}

impl From<u8> for PipelineState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::Closed,
            _ => Self::Created,
        }
    }
}

type WriteResult = Result<(), ImportError>;

/// A queued batch and the slot its single terminal result goes to.
struct WriteRequest {
    batch: WriteBatch,
    result: oneshot::Sender<WriteResult>,
}

impl WriteRequest {
    fn resolve(self, result: WriteResult) {
        // The submitter may have stopped waiting.
        let _ = self.result.send(result);
    }
}

type Queue = mpsc::Receiver<WriteRequest>;

/// Ordered, reconnecting writer for one engine.
pub struct EnginePipeline {
    engine: EngineId,
    config: WriterConfig,
    opener: Arc<dyn WriteStreamOpener>,
    sender: mpsc::Sender<WriteRequest>,
    /// Queue consumer until the loop takes it.
    pending: Mutex<Option<Queue>>,
    /// Loop task; hands the queue back on exit.
    worker: Mutex<Option<JoinHandle<Queue>>>,
    shutdown: CancellationToken,
    state: AtomicU8,
}

impl EnginePipeline {
    /// Create a pipeline for `engine`. Nothing runs until [`open`](Self::open).
    #[must_use]
    pub fn new(engine: EngineId, opener: Arc<dyn WriteStreamOpener>, config: WriterConfig) -> Self {
        let (sender, queue) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            engine,
            config,
            opener,
            sender,
            pending: Mutex::new(Some(queue)),
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
            state: AtomicU8::new(PipelineState::Created as u8),
        }
    }

    /// Engine this pipeline writes to.
    #[must_use]
    pub const fn engine(&self) -> EngineId {
        self.engine
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        PipelineState::from(self.state.load(Ordering::Acquire))
    }

    /// Number of requests waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Start the processing loop. Must be called from within a tokio runtime.
    ///
    /// Opening an open pipeline is a no-op.
    ///
    /// # Errors
    ///
    /// [`ImportError::Closing`] if the pipeline was already closed.
    pub fn open(&self) -> Result<(), ImportError> {
        // Held across the transition so close() always finds the handle.
        let mut worker = self.worker.lock();

        if let Err(current) = self.state.compare_exchange(
            PipelineState::Created as u8,
            PipelineState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return match PipelineState::from(current) {
                PipelineState::Closed => Err(ImportError::Closing),
                _ => {
                    debug!(engine = %self.engine, "engine writer already open");
                    Ok(())
                }
            };
        }

        let Some(queue) = self.pending.lock().take() else {
            return Err(ImportError::Closing);
        };

        let processor = StreamLoop {
            engine: self.engine,
            opener: Arc::clone(&self.opener),
            backoff: self.config.reconnect_backoff,
            shutdown: self.shutdown.clone(),
        };
        *worker = Some(tokio::spawn(processor.run(queue)));

        info!(
            engine = %self.engine,
            capacity = self.config.queue_capacity,
            "engine writer opened"
        );
        Ok(())
    }

    /// Enqueue `batch` and wait for its result.
    ///
    /// Blocks while the queue is full.
    ///
    /// # Errors
    ///
    /// [`ImportError::NotOpen`] before [`open`](Self::open),
    /// [`ImportError::Closing`] once shutdown started, otherwise the stream
    /// error observed for this batch.
    pub async fn submit(&self, batch: WriteBatch) -> WriteResult {
        self.submit_inner(batch, None).await
    }

    /// Like [`submit`](Self::submit), but gives up waiting with
    /// [`ImportError::Cancelled`] when `cancel` fires.
    ///
    /// A cancelled request that was already queued is still written.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit).
    pub async fn submit_with_cancel(&self, batch: WriteBatch, cancel: &CancellationToken) -> WriteResult {
        self.submit_inner(batch, Some(cancel)).await
    }

    async fn submit_inner(&self, batch: WriteBatch, cancel: Option<&CancellationToken>) -> WriteResult {
        match self.state() {
            PipelineState::Created => return Err(ImportError::NotOpen),
            PipelineState::Closed => return Err(ImportError::Closing),
            PipelineState::Open => {}
        }

        let (result, outcome) = oneshot::channel();
        let enqueue = self.sender.send(WriteRequest { batch, result });
        let enqueued = match cancel {
            Some(token) => tokio::select! {
                sent = enqueue => sent,
                () = token.cancelled() => return Err(ImportError::Cancelled),
            },
            None => enqueue.await,
        };
        if enqueued.is_err() {
            return Err(ImportError::Closing);
        }

        let outcome = match cancel {
            Some(token) => tokio::select! {
                outcome = outcome => outcome,
                () = token.cancelled() => return Err(ImportError::Cancelled),
            },
            None => outcome.await,
        };
        // A dropped slot means the loop died without resolving the request.
        outcome.unwrap_or(Err(ImportError::Closing))
    }

    /// Stop the loop, wait for it to exit, then fail every queued request
    /// with [`ImportError::Closing`]. Safe on a pipeline that was never
    /// opened and safe to call more than once.
    pub async fn close(&self) {
        let previous = self.state.swap(PipelineState::Closed as u8, Ordering::AcqRel);
        if PipelineState::from(previous) == PipelineState::Closed {
            return;
        }
        self.shutdown.cancel();

        let worker = self.worker.lock().take();
        let queue = match worker {
            Some(worker) => match worker.await {
                Ok(queue) => Some(queue),
                Err(err) => {
                    error!(engine = %self.engine, error = %err, "engine writer loop failed");
                    None
                }
            },
            None => self.pending.lock().take(),
        };

        let mut drained = 0usize;
        if let Some(mut queue) = queue {
            queue.close();
            while let Ok(request) = queue.try_recv() {
                request.resolve(Err(ImportError::Closing));
                drained += 1;
            }
        }
        info!(engine = %self.engine, drained, "engine writer closed");
    }
}

impl Drop for EnginePipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum LoopState {
    Disconnected,
    Streaming(Box<dyn WriteStream>),
    Closed,
}

/// What the streaming state woke up for.
enum Next {
    Request(WriteRequest),
    Ended(Status),
    Shutdown,
}

/// The single consumer of the queue and sole owner of the live stream.
struct StreamLoop {
    engine: EngineId,
    opener: Arc<dyn WriteStreamOpener>,
    backoff: Duration,
    shutdown: CancellationToken,
}

impl StreamLoop {
    async fn run(self, mut queue: Queue) -> Queue {
        let mut state = LoopState::Disconnected;
        // A request whose frame a dead stream never took; it goes out first
        // on the next stream.
        let mut resend = None;
        loop {
            state = match state {
                LoopState::Disconnected => self.connect(&mut queue, &mut resend).await,
                LoopState::Streaming(stream) => self.forward(stream, &mut queue, &mut resend).await,
                LoopState::Closed => break,
            };
        }
        if let Some(request) = resend {
            request.resolve(Err(ImportError::Closing));
        }
        info!(engine = %self.engine, "engine writer loop exited");
        queue
    }

    async fn connect(&self, queue: &mut Queue, resend: &mut Option<WriteRequest>) -> LoopState {
        let opened = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return LoopState::Closed,
            opened = self.open_stream() => opened,
        };

        match opened {
            Ok(stream) => {
                info!(engine = %self.engine, "write stream created");
                LoopState::Streaming(stream)
            }
            Err(err) => {
                let mut failed = fail_queued(queue, &err);
                if let Some(request) = resend.take() {
                    request.resolve(Err(err.clone()));
                    failed += 1;
                }
                warn!(
                    engine = %self.engine,
                    error = %err,
                    failed,
                    backoff_ms = self.backoff.as_millis(),
                    "failed to create write stream"
                );
                tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => LoopState::Closed,
                    () = tokio::time::sleep(self.backoff) => LoopState::Disconnected,
                }
            }
        }
    }

    async fn open_stream(&self) -> Result<Box<dyn WriteStream>, ImportError> {
        let mut stream = self.opener.open_stream().await?;
        stream
            .send(WriteEngineRequest::head(self.engine.to_vec()))
            .await
            .map_err(|err| ImportError::StreamOpenFailed(err.into_status()))?;
        Ok(stream)
    }

    async fn forward(
        &self,
        mut stream: Box<dyn WriteStream>,
        queue: &mut Queue,
        resend: &mut Option<WriteRequest>,
    ) -> LoopState {
        let (request, retry) = match resend.take() {
            Some(request) => (request, false),
            None => {
                let next = tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => Next::Shutdown,
                    status = stream.closed() => Next::Ended(status),
                    request = queue.recv() => request.map_or(Next::Shutdown, Next::Request),
                };
                match next {
                    Next::Request(request) => (request, true),
                    Next::Ended(status) => {
                        warn!(engine = %self.engine, error = %status, "write stream ended, reconnecting");
                        return LoopState::Disconnected;
                    }
                    Next::Shutdown => {
                        self.finish(stream).await;
                        return LoopState::Closed;
                    }
                }
            }
        };

        let WriteRequest { batch, result } = request;
        let mutations = batch.len();
        let commit_ts = batch.commit_ts;
        match stream.send(WriteEngineRequest::batch(batch.clone())).await {
            Ok(()) => {
                debug!(engine = %self.engine, commit_ts, mutations, "write batch sent");
                let _ = result.send(Ok(()));
                LoopState::Streaming(stream)
            }
            Err(SendError::Ended(status)) if retry => {
                warn!(
                    engine = %self.engine,
                    commit_ts,
                    error = %status,
                    "write stream ended before the batch was sent, resending on a new stream"
                );
                *resend = Some(WriteRequest { batch, result });
                LoopState::Disconnected
            }
            Err(err) => {
                warn!(
                    engine = %self.engine,
                    commit_ts,
                    error = %err,
                    "failed to send write batch, reconnecting"
                );
                let _ = result.send(Err(ImportError::SendFailed(err.into_status())));
                LoopState::Disconnected
            }
        }
    }

    /// Half-close the stream. Remote errors are logged and dropped.
    async fn finish(&self, stream: Box<dyn WriteStream>) {
        match stream.close().await {
            Ok(response) => match check_remote(response.error) {
                Ok(()) => info!(engine = %self.engine, "write stream closed"),
                Err(err) => error!(
                    engine = %self.engine,
                    error = %err,
                    "import service reported an error closing the write stream"
                ),
            },
            Err(status) => warn!(
                engine = %self.engine,
                error = %status,
                "failed to close write stream"
            ),
        }
    }
}

/// Fail the requests queued right now with `err`; later arrivals wait for the
/// next stream.
fn fail_queued(queue: &mut Queue, err: &ImportError) -> usize {
    let snapshot = queue.len();
    let mut failed = 0;
    while failed < snapshot {
        let Ok(request) = queue.try_recv() else {
            break;
        };
        request.resolve(Err(err.clone()));
        failed += 1;
    }
    failed
}
