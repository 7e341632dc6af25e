//! Client side of the bulk-load bridge: pooled connections to the import
//! service, per-engine streaming writers, statement encoding and write
//! sessions.

#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod catalog;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod import_client;
pub mod oracle;
pub mod pool;
pub mod session;
pub mod writer;

pub use catalog::{CatalogError, DdlSource, HttpTableIdResolver, MySqlDdlSource, TableIdResolver};
pub use encoder::tablecodec::KeyRange;
pub use encoder::{EncodeError, EncodedRows, Encoder, EncoderFactory, KvPair, SqlEncoderFactory};
pub use engine::EngineId;
pub use error::ImportError;
pub use import_client::ImportClient;
pub use oracle::LocalOracle;
pub use pool::{ConnectionPool, Connector, GrpcConnector, PoolConfig};
pub use session::{SessionDeps, SessionError, SessionInfo, SessionRegistry, WriteSession};
pub use writer::{
    EnginePipeline, GrpcStreamOpener, SendError, WriteStream, WriteStreamOpener, WriterConfig,
};
