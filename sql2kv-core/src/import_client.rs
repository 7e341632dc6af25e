//! Unary control calls against the import service.

use std::sync::Arc;

use sql2kv_proto::import_kv_client::ImportKvClient;
use sql2kv_proto::{
    CleanupEngineRequest, CloseEngineRequest, CompactClusterRequest, CompactRequest,
    ImportEngineRequest, OpenEngineRequest, SwitchMode, SwitchModeRequest,
};
use tonic::transport::Channel;
use tracing::info;

use crate::encoder::tablecodec::KeyRange;
use crate::engine::EngineId;
use crate::error::{ImportError, check_remote};
use crate::pool::ConnectionPool;

/// Engine lifecycle and cluster maintenance calls.
///
/// Every call takes a connection from the pool; a structured error in the
/// response becomes [`ImportError::RemoteApplication`], a failed call
/// [`ImportError::Rpc`].
#[derive(Clone)]
pub struct ImportClient {
    pool: Arc<ConnectionPool>,
    addr: String,
    max_message_size: usize,
}

impl ImportClient {
    /// Client for the import service at `addr`.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, addr: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            pool,
            addr: addr.into(),
            max_message_size,
        }
    }

    /// Address of the import service.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Pool the client draws connections from.
    #[must_use]
    pub const fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    async fn client(&self) -> Result<ImportKvClient<Channel>, ImportError> {
        let channel = self.pool.get_connection(&self.addr).await?;
        Ok(ImportKvClient::new(channel)
            .max_encoding_message_size(self.max_message_size)
            .max_decoding_message_size(self.max_message_size))
    }

    /// Open `engine`, creating it on the service when absent.
    ///
    /// # Errors
    ///
    /// Pool, transport or remote application failures.
    pub async fn open_engine(&self, engine: EngineId) -> Result<(), ImportError> {
        let response = self
            .client()
            .await?
            .open_engine(OpenEngineRequest {
                uuid: engine.to_vec(),
            })
            .await?
            .into_inner();
        check_remote(response.error)?;
        info!(engine = %engine, "engine opened");
        Ok(())
    }

    /// Close `engine`; the service stops accepting writes for it.
    ///
    /// # Errors
    ///
    /// Pool, transport or remote application failures.
    pub async fn close_engine(&self, engine: EngineId) -> Result<(), ImportError> {
        let response = self
            .client()
            .await?
            .close_engine(CloseEngineRequest {
                uuid: engine.to_vec(),
            })
            .await?
            .into_inner();
        check_remote(response.error)?;
        info!(engine = %engine, "engine closed");
        Ok(())
    }

    /// Release the service-side resources of `engine`.
    ///
    /// # Errors
    ///
    /// Pool, transport or remote application failures.
    pub async fn cleanup_engine(&self, engine: EngineId) -> Result<(), ImportError> {
        let response = self
            .client()
            .await?
            .cleanup_engine(CleanupEngineRequest {
                uuid: engine.to_vec(),
            })
            .await?
            .into_inner();
        check_remote(response.error)?;
        info!(engine = %engine, "engine cleaned up");
        Ok(())
    }

    /// Ingest the closed `engine` into the cluster coordinated by `pd_addr`.
    ///
    /// # Errors
    ///
    /// Pool, transport or remote application failures.
    pub async fn import_engine(&self, engine: EngineId, pd_addr: &str) -> Result<(), ImportError> {
        let response = self
            .client()
            .await?
            .import_engine(ImportEngineRequest {
                uuid: engine.to_vec(),
                pd_addr: pd_addr.to_string(),
            })
            .await?
            .into_inner();
        check_remote(response.error)?;
        info!(engine = %engine, pd_addr, "engine imported");
        Ok(())
    }

    /// Switch every store of the cluster to `mode`.
    ///
    /// # Errors
    ///
    /// Pool, transport or remote application failures.
    pub async fn switch_mode(&self, pd_addr: &str, mode: SwitchMode) -> Result<(), ImportError> {
        let response = self
            .client()
            .await?
            .switch_mode(SwitchModeRequest {
                pd_addr: pd_addr.to_string(),
                mode: mode as i32,
            })
            .await?
            .into_inner();
        check_remote(response.error)?;
        info!(pd_addr, mode = mode.as_str_name(), "cluster mode switched");
        Ok(())
    }

    /// Compact `range` to the bottommost level on every store.
    ///
    /// # Errors
    ///
    /// Pool, transport or remote application failures.
    pub async fn compact_range(&self, pd_addr: &str, range: &KeyRange) -> Result<(), ImportError> {
        let response = self
            .client()
            .await?
            .compact_cluster(CompactClusterRequest {
                pd_addr: pd_addr.to_string(),
                request: Some(CompactRequest::for_range(range.start.clone(), range.end.clone())),
            })
            .await?
            .into_inner();
        check_remote(response.error)?;
        info!(pd_addr, "cluster range compacted");
        Ok(())
    }
}
