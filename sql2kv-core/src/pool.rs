//! Multiplexed connection pool.
//!
//! Each remote address owns a fixed-size set of independent transport
//! connections. Spreading unrelated calls over several HTTP/2 connections
//! sidesteps per-connection flow-control windows and head-of-line blocking;
//! connections are handed out round robin without tracking their load.
//!
//! ```text
//! get_connection(addr)
//!     │ read lock: set exists? ──yes──► set.next()  (cursor += 1 mod N)
//!     │ no
//!     ▼
//! write lock: re-check, dial N connections (all or nothing), insert
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::error::ImportError;

/// Default number of connections kept per remote address.
pub const DEFAULT_CONNECTIONS_PER_ADDRESS: usize = 16;

/// Dials physical connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection handle handed out to callers. Clones share the underlying
    /// transport.
    type Connection: Clone + Send + Sync + 'static;

    /// Establish one connection to `addr`.
    async fn connect(&self, addr: &str) -> Result<Self::Connection, ImportError>;

    /// Release a connection owned by the pool. Dropping is enough for most
    /// transports.
    fn disconnect(&self, connection: Self::Connection) {
        drop(connection);
    }
}

/// Transport settings for pooled gRPC connections.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections dialed per remote address.
    pub connections_per_address: usize,
    /// Deadline for establishing one connection.
    pub connect_timeout: Duration,
    /// Interval between HTTP/2 keepalive pings.
    pub keepalive_interval: Duration,
    /// Time to wait for a keepalive acknowledgement before dropping the
    /// connection.
    pub keepalive_timeout: Duration,
    /// Initial HTTP/2 stream and connection window.
    pub window_size: u32,
    /// Largest message accepted or produced by pooled clients.
    pub max_message_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections_per_address: DEFAULT_CONNECTIONS_PER_ADDRESS,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(3),
            window_size: 1 << 30,
            max_message_size: (1 << 31) - 1,
        }
    }
}

/// Dials tonic channels with the keepalive and window settings of
/// [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    config: PoolConfig,
}

impl GrpcConnector {
    /// Create a connector using `config`.
    #[must_use]
    pub const fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    /// Settings applied to every dialed connection.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    type Connection = Channel;

    async fn connect(&self, addr: &str) -> Result<Channel, ImportError> {
        let uri = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };

        let endpoint = Endpoint::from_shared(uri)
            .map_err(|err| ImportError::connect_failed(addr, err))?
            .connect_timeout(self.config.connect_timeout)
            .http2_keep_alive_interval(self.config.keepalive_interval)
            .keep_alive_timeout(self.config.keepalive_timeout)
            .keep_alive_while_idle(true)
            .initial_stream_window_size(self.config.window_size)
            .initial_connection_window_size(self.config.window_size)
            .tcp_nodelay(true);

        endpoint
            .connect()
            .await
            .map_err(|err| ImportError::connect_failed(addr, err))
    }
}

/// Fixed set of connections to one address with a round-robin cursor.
struct ConnectionSet<T> {
    connections: Vec<T>,
    cursor: AtomicUsize,
}

impl<T: Clone> ConnectionSet<T> {
    fn new(connections: Vec<T>) -> Self {
        Self {
            connections,
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> T {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }
}

struct PoolState<T> {
    closed: bool,
    sets: HashMap<String, ConnectionSet<T>>,
}

/// Pool of connection sets keyed by remote address.
///
/// The pool is an owned object: the server creates one at startup, hands it
/// (behind an `Arc`) to every component that dials the import service, and
/// closes it on shutdown. A closed pool never accepts new entries.
pub struct ConnectionPool<C: Connector = GrpcConnector> {
    connector: C,
    connections_per_address: usize,
    state: RwLock<PoolState<C::Connection>>,
}

impl ConnectionPool<GrpcConnector> {
    /// Pool of tonic channels configured by `config`.
    #[must_use]
    pub fn grpc(config: PoolConfig) -> Self {
        let size = config.connections_per_address;
        Self::new(GrpcConnector::new(config), size)
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool dialing `connections_per_address` connections per
    /// address through `connector`.
    #[must_use]
    pub fn new(connector: C, connections_per_address: usize) -> Self {
        Self {
            connector,
            connections_per_address: connections_per_address.max(1),
            state: RwLock::new(PoolState {
                closed: false,
                sets: HashMap::new(),
            }),
        }
    }

    /// Number of connections kept per address.
    #[must_use]
    pub const fn connections_per_address(&self) -> usize {
        self.connections_per_address
    }

    /// Whether [`close`](Self::close) has run.
    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// Addresses that currently own a connection set.
    pub async fn addresses(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut addrs: Vec<String> = state.sets.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Return the next connection to `addr`, dialing the connection set on
    /// first use.
    ///
    /// The pool's write lock is held while a new set is dialed, so lookups of
    /// every other address wait for it, for up to `connections_per_address`
    /// connect timeouts. Concurrent first uses of one address dial it once.
    ///
    /// # Errors
    ///
    /// [`ImportError::PoolClosed`] once the pool is closed, or
    /// [`ImportError::ConnectFailed`] when any connection of a new set cannot
    /// be established. A failed set is torn down entirely.
    pub async fn get_connection(&self, addr: &str) -> Result<C::Connection, ImportError> {
        {
            let state = self.state.read().await;
            if state.closed {
                return Err(ImportError::PoolClosed);
            }
            if let Some(set) = state.sets.get(addr) {
                return Ok(set.next());
            }
        }

        let mut state = self.state.write().await;
        if state.closed {
            return Err(ImportError::PoolClosed);
        }
        if let Some(set) = state.sets.get(addr) {
            return Ok(set.next());
        }

        let set = self.dial_set(addr).await?;
        let connection = set.next();
        state.sets.insert(addr.to_string(), set);
        Ok(connection)
    }

    async fn dial_set(&self, addr: &str) -> Result<ConnectionSet<C::Connection>, ImportError> {
        let mut connections = Vec::with_capacity(self.connections_per_address);
        for slot in 0..self.connections_per_address {
            match self.connector.connect(addr).await {
                Ok(connection) => connections.push(connection),
                Err(err) => {
                    warn!(
                        addr,
                        slot,
                        error = %err,
                        "failed to dial connection set, tearing down {} connections",
                        connections.len()
                    );
                    for connection in connections {
                        self.connector.disconnect(connection);
                    }
                    return Err(err);
                }
            }
        }

        info!(
            addr,
            connections = self.connections_per_address,
            "connection set created"
        );
        Ok(ConnectionSet::new(connections))
    }

    /// Close the pool and every pooled connection. Calling it again is a
    /// no-op. In-flight calls are not awaited.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if state.closed {
            return;
        }
        state.closed = true;

        for (addr, set) in state.sets.drain() {
            debug!(addr = %addr, connections = set.connections.len(), "closing connection set");
            for connection in set.connections {
                self.connector.disconnect(connection);
            }
        }
        info!("connection pool closed");
    }
}
