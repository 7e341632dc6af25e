//! Error taxonomy shared by the connection pool, the engine write pipeline and
//! the import control client.
//!
//! Transport failures and remote application failures are kept apart: a
//! transport failure means the call never produced a response, while a remote
//! application failure is a structured error carried inside an otherwise
//! successful response (for example an unknown engine).

use std::sync::Arc;

use thiserror::Error;

/// Boxed transport cause shared between every request that observes it.
pub type TransportCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the bulk-load client side.
///
/// The type is `Clone` because a single stream-establishment failure is
/// delivered to every request queued at that moment.
#[derive(Debug, Clone, Error)]
pub enum ImportError {
    /// The connection pool was shut down.
    #[error("connection pool is closed")]
    PoolClosed,

    /// One of the connections of a connection set could not be established.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// Address that was dialed.
        addr: String,
        /// Underlying transport error.
        #[source]
        source: TransportCause,
    },

    /// The write stream could not be opened or its header could not be sent.
    #[error("failed to open write stream: {0}")]
    StreamOpenFailed(#[source] tonic::Status),

    /// A batch could not be sent on an established write stream.
    #[error("failed to send write batch: {0}")]
    SendFailed(#[source] tonic::Status),

    /// The service answered with a structured error.
    #[error("import service reported an error: {0}")]
    RemoteApplication(String),

    /// A unary call failed at the transport level.
    #[error("import rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// The pipeline is shutting down or already shut down.
    #[error("engine writer is closing")]
    Closing,

    /// The caller's own cancellation fired before a result was available.
    #[error("write request cancelled by caller")]
    Cancelled,

    /// `submit` was called before the pipeline was opened.
    #[error("engine writer is not open")]
    NotOpen,
}

impl ImportError {
    /// Wrap a connect failure for `addr`.
    pub fn connect_failed<E>(addr: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ConnectFailed {
            addr: addr.into(),
            source: Arc::new(source),
        }
    }

    /// Whether the failure happened below the application layer and a retry on
    /// a fresh stream or connection may succeed.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::StreamOpenFailed(_)
                | Self::SendFailed(_)
                | Self::Rpc(_)
        )
    }
}

/// Convert an optional remote error envelope into a local result.
pub(crate) fn check_remote(error: Option<sql2kv_proto::Error>) -> Result<(), ImportError> {
    match error {
        Some(error) => Err(ImportError::RemoteApplication(error.to_string())),
        None => Ok(()),
    }
}
