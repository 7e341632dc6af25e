//! Write stream abstraction and its gRPC implementation.
//!
//! The processing loop only sees [`WriteStreamOpener`] and [`WriteStream`], so
//! the state machine can be driven by scripted streams in tests while the
//! server uses [`GrpcStreamOpener`].

use std::sync::Arc;

use async_trait::async_trait;
use sql2kv_proto::import_kv_client::ImportKvClient;
use sql2kv_proto::{WriteEngineRequest, WriteEngineResponse};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::debug;

use crate::error::ImportError;
use crate::pool::ConnectionPool;

/// Why a frame did not make it onto the stream.
#[derive(Debug, Error)]
pub enum SendError {
    /// The stream had ended before the transport took the frame. The frame
    /// can be sent again on a new stream.
    #[error("write stream ended before the frame was sent: {0}")]
    Ended(#[source] Status),

    /// The transport failed while taking the frame.
    #[error("failed to send frame: {0}")]
    Failed(#[source] Status),
}

impl SendError {
    /// Underlying status.
    #[must_use]
    pub fn into_status(self) -> Status {
        match self {
            Self::Ended(status) | Self::Failed(status) => status,
        }
    }
}

/// One open client-streaming `WriteEngine` call.
#[async_trait]
pub trait WriteStream: Send {
    /// Send one frame. Returns once the transport has taken it.
    async fn send(&mut self, frame: WriteEngineRequest) -> Result<(), SendError>;

    /// Resolves when the call ends on its own, with the reason. Streams that
    /// cannot observe this never resolve.
    async fn closed(&mut self) -> Status {
        std::future::pending().await
    }

    /// Half-close the stream and wait for the service's final response.
    async fn close(self: Box<Self>) -> Result<WriteEngineResponse, Status>;
}

/// Opens fresh write streams for the processing loop.
#[async_trait]
pub trait WriteStreamOpener: Send + Sync + 'static {
    /// Open a new stream. The caller sends the header.
    async fn open_stream(&self) -> Result<Box<dyn WriteStream>, ImportError>;
}

/// Opens `WriteEngine` calls on connections taken from the pool.
///
/// A connection is fetched on every (re)connect, so a reconnect after a
/// transport failure lands on the next connection of the set.
pub struct GrpcStreamOpener {
    pool: Arc<ConnectionPool>,
    addr: String,
    max_message_size: usize,
}

impl GrpcStreamOpener {
    /// Opener for the import service at `addr`.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, addr: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            pool,
            addr: addr.into(),
            max_message_size,
        }
    }
}

/// A frame plus the signal fired when the transport pulls it.
type Frame = (WriteEngineRequest, oneshot::Sender<()>);

#[async_trait]
impl WriteStreamOpener for GrpcStreamOpener {
    async fn open_stream(&self) -> Result<Box<dyn WriteStream>, ImportError> {
        let channel = self.pool.get_connection(&self.addr).await?;
        let mut client = ImportKvClient::new(channel)
            .max_encoding_message_size(self.max_message_size)
            .max_decoding_message_size(self.max_message_size);

        // One frame in flight: send() waits until the body pulls it.
        let (frames, rx) = mpsc::channel::<Frame>(1);
        let outbound = ReceiverStream::new(rx).map(|(frame, pulled)| {
            let _ = pulled.send(());
            frame
        });
        let call = tokio::spawn(async move {
            client
                .write_engine(outbound)
                .await
                .map(tonic::Response::into_inner)
        });

        debug!(addr = %self.addr, "write engine call started");
        Ok(Box::new(GrpcWriteStream {
            frames: Some(frames),
            call: Some(call),
        }))
    }
}

type CallHandle = JoinHandle<Result<WriteEngineResponse, Status>>;

/// Client side of a running `WriteEngine` call.
///
/// The call is only established once the request body is polled, which
/// happens after the connection is up, so a pulled header confirms the
/// stream is open.
struct GrpcWriteStream {
    frames: Option<mpsc::Sender<Frame>>,
    call: Option<CallHandle>,
}

impl GrpcWriteStream {
    /// Wait for the call to finish. Cancel safe: the handle is only released
    /// once the call has completed.
    async fn wait_call(&mut self) -> Result<WriteEngineResponse, Status> {
        let Some(call) = self.call.as_mut() else {
            return Err(Status::failed_precondition("write stream already finished"));
        };
        let result = match call.await {
            Ok(result) => result,
            Err(err) => Err(Status::internal(format!("write engine call aborted: {err}"))),
        };
        self.call = None;
        result
    }

    /// Status explaining why the call ended before the stream was closed.
    async fn ended_early(&mut self) -> Status {
        self.frames = None;
        ended_status(self.wait_call().await)
    }

    fn call_finished(&self) -> bool {
        self.call.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

fn ended_status(result: Result<WriteEngineResponse, Status>) -> Status {
    match result {
        Err(status) => status,
        Ok(response) => match response.error {
            Some(error) => Status::aborted(error.to_string()),
            None => Status::aborted("write stream ended by the service"),
        },
    }
}

#[async_trait]
impl WriteStream for GrpcWriteStream {
    async fn send(&mut self, frame: WriteEngineRequest) -> Result<(), SendError> {
        if self.call_finished() {
            return Err(SendError::Ended(self.ended_early().await));
        }
        let (pulled, mut taken) = oneshot::channel();
        let queued = match &self.frames {
            Some(frames) => frames.send((frame, pulled)).await.is_ok(),
            None => return Err(SendError::Ended(Status::failed_precondition("write stream already closed"))),
        };
        if !queued {
            return Err(SendError::Ended(self.ended_early().await));
        }

        let taken = tokio::select! {
            biased;
            taken = &mut taken => taken.is_ok(),
            result = self.wait_call() => {
                self.frames = None;
                return Err(SendError::Ended(ended_status(result)));
            }
        };
        if !taken {
            return Err(SendError::Ended(self.ended_early().await));
        }
        if self.call_finished() {
            return Err(SendError::Failed(self.ended_early().await));
        }
        Ok(())
    }

    async fn closed(&mut self) -> Status {
        let result = self.wait_call().await;
        self.frames = None;
        ended_status(result)
    }

    async fn close(mut self: Box<Self>) -> Result<WriteEngineResponse, Status> {
        self.frames = None;
        self.wait_call().await
    }
}

impl Drop for GrpcWriteStream {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            call.abort();
        }
    }
}
