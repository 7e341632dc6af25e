//! Process wiring: collaborators, HTTP listener and graceful shutdown.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use sql2kv_core::{
    ConnectionPool, GrpcStreamOpener, HttpTableIdResolver, ImportClient, MySqlDdlSource,
    SessionDeps, SessionRegistry, SqlEncoderFactory,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api::{ApiState, create_api_routes};
use crate::config::ServerConfig;

/// Everything a running server owns.
pub struct Services {
    pub pool: Arc<ConnectionPool>,
    pub ddl: Arc<MySqlDdlSource>,
    pub state: ApiState,
}

impl Services {
    /// Build the pool, control client, catalog and session registry.
    ///
    /// # Errors
    ///
    /// An unusable `tidb-addr`.
    pub fn build(config: &ServerConfig) -> Result<Self> {
        let pool_config = config.pool_config();
        let max_message_size = pool_config.max_message_size;
        let pool = Arc::new(ConnectionPool::grpc(pool_config));

        let import = ImportClient::new(
            Arc::clone(&pool),
            config.importer_addr.clone(),
            max_message_size,
        );
        let ddl = Arc::new(
            MySqlDdlSource::new(&config.tidb_addr, &config.tidb_user, &config.tidb_password)
                .context("invalid tidb-addr")?,
        );
        let streams = Arc::new(GrpcStreamOpener::new(
            Arc::clone(&pool),
            config.importer_addr.clone(),
            max_message_size,
        ));
        let sessions = Arc::new(SessionRegistry::new(SessionDeps {
            tables: Arc::new(HttpTableIdResolver::new(&config.tidb_http_addr)),
            ddl: ddl.clone(),
            encoders: Arc::new(SqlEncoderFactory),
            streams,
            writer: config.writer_config(),
        }));

        Ok(Self {
            pool,
            ddl,
            state: ApiState::new(import, sessions),
        })
    }

    /// Dial the importer once so a bad address fails at startup.
    ///
    /// # Errors
    ///
    /// The importer could not be reached.
    pub async fn verify_importer(&self) -> Result<()> {
        let addr = self.state.import.addr();
        self.pool
            .get_connection(addr)
            .await
            .with_context(|| format!("import service at {addr} is unreachable"))?;
        info!(addr, "import service reachable");
        Ok(())
    }

    /// Close sessions first, then the catalog and the pool.
    pub async fn shutdown(&self) {
        self.state.sessions.close_all().await;
        self.ddl.close().await;
        self.pool.close().await;
        info!("services stopped");
    }
}

/// Serve until `shutdown` resolves, then release everything.
///
/// # Errors
///
/// Startup failures: bad config, unreachable importer, or the listen address
/// being unavailable.
pub async fn run<F>(config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;
    let services = Services::build(&config)?;
    if let Err(err) = services.verify_importer().await {
        services.shutdown().await;
        return Err(err);
    }

    let listener = match TcpListener::bind(&config.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            services.shutdown().await;
            return Err(err).with_context(|| format!("failed to bind {}", config.addr));
        }
    };
    info!(addr = %config.addr, importer = %config.importer_addr, "sql2kv listening");

    let app = create_api_routes().with_state(services.state.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    services.shutdown().await;
    served.context("http server failed")
}

/// Resolves on ctrl-c.
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
