//! Streaming engine writer.
//!
//! - [`pipeline`]: bounded queue plus the single loop that owns the stream
//! - [`stream`]: stream traits and the tonic-backed implementation

pub mod pipeline;
pub mod stream;

pub use pipeline::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_RECONNECT_BACKOFF, EnginePipeline, PipelineState, WriterConfig,
};
pub use stream::{GrpcStreamOpener, SendError, WriteStream, WriteStreamOpener};
