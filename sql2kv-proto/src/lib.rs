//! Protocol buffer definitions for the bulk-load import service.
//!
//! The service accepts key-value batches for an engine over a client-streaming
//! `WriteEngine` call and exposes unary calls that drive the engine lifecycle
//! (open, close, import, cleanup) and cluster-wide maintenance.

// Include the generated protobuf code
tonic::include_proto!("importkv.v1");

use std::fmt;

impl Mutation {
    /// Create a put mutation for `key`.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: mutation::Op::Put as i32,
            key: key.into(),
            value: value.into(),
        }
    }
}

impl WriteBatch {
    /// Create a batch committed at `commit_ts`.
    pub fn new(commit_ts: u64, mutations: Vec<Mutation>) -> Self {
        Self {
            commit_ts,
            mutations,
        }
    }

    /// Number of mutations carried by the batch.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Whether the batch carries no mutation.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

impl WriteEngineRequest {
    /// Stream header binding the stream to an engine.
    pub fn head(uuid: impl Into<Vec<u8>>) -> Self {
        Self {
            chunk: Some(write_engine_request::Chunk::Head(WriteHead {
                uuid: uuid.into(),
            })),
        }
    }

    /// Stream frame carrying one batch.
    pub fn batch(batch: WriteBatch) -> Self {
        Self {
            chunk: Some(write_engine_request::Chunk::Batch(batch)),
        }
    }

    /// Whether this frame is a stream header.
    pub fn is_head(&self) -> bool {
        matches!(self.chunk, Some(write_engine_request::Chunk::Head(_)))
    }
}

impl CompactRequest {
    /// Compact `[start, end)` down to the bottommost level.
    pub fn for_range(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            range: Some(Range {
                start: start.into(),
                end: end.into(),
            }),
            output_level: -1,
        }
    }
}

impl Error {
    /// Error reported for an engine the service does not know.
    pub fn engine_not_found(uuid: impl Into<Vec<u8>>) -> Self {
        Self {
            message: String::new(),
            engine_not_found: Some(error::EngineNotFound { uuid: uuid.into() }),
        }
    }

    /// Free form error reported by the service.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            engine_not_found: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(not_found) = &self.engine_not_found {
            write!(f, "engine not found: ")?;
            for byte in &not_found.uuid {
                write!(f, "{byte:02x}")?;
            }
            if !self.message.is_empty() {
                write!(f, " ({})", self.message)?;
            }
            return Ok(());
        }
        f.write_str(&self.message)
    }
}
