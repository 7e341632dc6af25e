//! Write sessions.
//!
//! A session binds a caller-chosen id to one table and one engine: it owns an
//! encoder loaded with the table's DDL and an [`EnginePipeline`] streaming into
//! the engine. The registry is the only shared state; a single reader/writer
//! lock guards the whole map.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use sql2kv_proto::{Mutation, WriteBatch};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, DdlSource, TableIdResolver};
use crate::encoder::tablecodec::decode_record_key;
use crate::encoder::{EncodeError, Encoder, EncoderFactory};
use crate::engine::EngineId;
use crate::error::ImportError;
use crate::oracle::LocalOracle;
use crate::writer::{EnginePipeline, WriteStreamOpener, WriterConfig};

/// Errors raised by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session is registered under the id.
    #[error("session `{0}` does not exist")]
    NotFound(String),

    /// Table metadata lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Statement encoding failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The write pipeline rejected or failed the batch.
    #[error(transparent)]
    Import(#[from] ImportError),

    /// An encoded key does not belong to the session's table.
    #[error("invalid encoded key, table id {actual} should be {expected}")]
    TableMismatch {
        /// Table id of the session.
        expected: i64,
        /// Table id decoded from the key.
        actual: i64,
    },
}

/// Snapshot of a session for the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session id.
    pub session_id: String,
    /// Schema the table lives in.
    pub schema_name: String,
    /// Table name.
    pub table_name: String,
    /// Numeric table id.
    pub table_id: i64,
    /// DDL the encoder was loaded with.
    pub ddl: String,
    /// Engine receiving the writes.
    pub engine_id: EngineId,
    /// Batches waiting in the pipeline queue.
    pub queued_batches: usize,
}

/// One table writing into one engine.
pub struct WriteSession {
    id: String,
    schema: String,
    table: String,
    table_id: i64,
    ddl: String,
    encoder: Box<dyn Encoder>,
    pipeline: EnginePipeline,
}

impl fmt::Debug for WriteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSession")
            .field("id", &self.id)
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("table_id", &self.table_id)
            .field("engine", &self.pipeline.engine())
            .finish_non_exhaustive()
    }
}

impl WriteSession {
    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Numeric id of the session's table.
    #[must_use]
    pub const fn table_id(&self) -> i64 {
        self.table_id
    }

    /// Current snapshot.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            schema_name: self.schema.clone(),
            table_name: self.table.clone(),
            table_id: self.table_id,
            ddl: self.ddl.clone(),
            engine_id: self.pipeline.engine(),
            queued_batches: self.pipeline.queued(),
        }
    }

    /// Encode `statements` and write them as one batch at `commit_ts`.
    /// Returns the number of affected rows.
    ///
    /// # Errors
    ///
    /// Encoding failures, keys outside the session's table, or the pipeline
    /// result for the batch.
    pub async fn write(&self, statements: &[String], commit_ts: u64) -> Result<u64, SessionError> {
        let mut rows = 0;
        let mut mutations = Vec::new();
        for statement in statements {
            let encoded = self.encoder.encode(statement, self.table_id)?;
            rows += encoded.affected_rows;
            for pair in encoded.pairs {
                let (table_id, _) = decode_record_key(&pair.key)?;
                if table_id != self.table_id {
                    return Err(SessionError::TableMismatch {
                        expected: self.table_id,
                        actual: table_id,
                    });
                }
                mutations.push(Mutation::put(pair.key, pair.value));
            }
        }

        let batch = WriteBatch::new(commit_ts, mutations);
        debug!(
            session = %self.id,
            commit_ts,
            rows,
            mutations = batch.len(),
            "submitting session batch"
        );
        self.pipeline.submit(batch).await?;
        Ok(rows)
    }

    async fn close(&self) -> Result<(), SessionError> {
        let encoder = self.encoder.close();
        self.pipeline.close().await;
        encoder.map_err(SessionError::from)
    }
}

/// Collaborators a registry builds sessions from.
#[derive(Clone)]
pub struct SessionDeps {
    /// Table id lookup.
    pub tables: Arc<dyn TableIdResolver>,
    /// DDL lookup.
    pub ddl: Arc<dyn DdlSource>,
    /// Encoder construction.
    pub encoders: Arc<dyn EncoderFactory>,
    /// Write stream construction, shared by every pipeline.
    pub streams: Arc<dyn WriteStreamOpener>,
    /// Pipeline tuning.
    pub writer: WriterConfig,
}

/// Session id → [`WriteSession`].
pub struct SessionRegistry {
    deps: SessionDeps,
    oracle: LocalOracle,
    sessions: RwLock<HashMap<String, Arc<WriteSession>>>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            oracle: LocalOracle::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open session `id` for `schema`.`table` writing into `engine`.
    ///
    /// Opening an existing id returns the existing session unchanged.
    ///
    /// # Errors
    ///
    /// Catalog lookups, encoder creation or DDL, and pipeline start failures.
    /// The encoder is closed again when a later step fails.
    pub async fn open_session(
        &self,
        id: &str,
        engine: EngineId,
        schema: &str,
        table: &str,
    ) -> Result<Arc<WriteSession>, SessionError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(id) {
            debug!(session = id, "session already open");
            return Ok(Arc::clone(existing));
        }

        let table_id = self.deps.tables.resolve_table_id(schema, table).await?;
        let ddl = self.deps.ddl.fetch_ddl(schema, table).await?;

        let encoder = self.deps.encoders.create(schema)?;
        let pipeline = EnginePipeline::new(engine, Arc::clone(&self.deps.streams), self.deps.writer.clone());
        if let Err(err) = encoder
            .execute_ddl(&ddl)
            .map_err(SessionError::from)
            .and_then(|()| pipeline.open().map_err(SessionError::from))
        {
            if let Err(close_err) = encoder.close() {
                warn!(session = id, error = %close_err, "failed to close encoder");
            }
            return Err(err);
        }

        let session = Arc::new(WriteSession {
            id: id.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            table_id,
            ddl,
            encoder,
            pipeline,
        });
        sessions.insert(id.to_string(), Arc::clone(&session));
        info!(
            session = id,
            engine = %engine,
            schema,
            table,
            table_id,
            "session opened"
        );
        Ok(session)
    }

    /// Session registered under `id`.
    pub async fn get(&self, id: &str) -> Option<Arc<WriteSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Snapshot of session `id`.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] for unknown ids.
    pub async fn info(&self, id: &str) -> Result<SessionInfo, SessionError> {
        self.require(id).await.map(|session| session.info())
    }

    /// Write `statements` through session `id` at the next local timestamp.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] for unknown ids, otherwise see
    /// [`WriteSession::write`].
    pub async fn write(&self, id: &str, statements: &[String]) -> Result<u64, SessionError> {
        let session = self.require(id).await?;
        session.write(statements, self.oracle.timestamp()).await
    }

    async fn require(&self, id: &str) -> Result<Arc<WriteSession>, SessionError> {
        self.get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Remove and close session `id`. Returns whether it existed; closing an
    /// unknown id is a no-op.
    ///
    /// # Errors
    ///
    /// The first error among encoder close and pipeline close.
    pub async fn close_session(&self, id: &str) -> Result<bool, SessionError> {
        let removed = self.sessions.write().await.remove(id);
        let Some(session) = removed else {
            return Ok(false);
        };
        session.close().await?;
        info!(session = id, "session closed");
        Ok(true)
    }

    /// Close every session. Failures are logged.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        for (id, session) in sessions {
            if let Err(err) = session.close().await {
                warn!(session = %id, error = %err, "failed to close session");
            }
        }
        info!("all sessions closed");
    }

    /// Ids of the open sessions.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
