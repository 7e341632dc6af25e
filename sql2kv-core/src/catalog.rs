//! Table metadata lookups against the SQL layer.
//!
//! The table id comes from the status HTTP endpoint, the DDL from
//! `SHOW CREATE TABLE` over the MySQL protocol.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::Row;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use thiserror::Error;
use tracing::debug;

/// Errors raised by catalog lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The HTTP request could not be completed.
    #[error("table info request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The HTTP endpoint answered with a non-success status.
    #[error("table info request failed with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The table info body could not be decoded.
    #[error("invalid table info: {0}")]
    Decode(#[from] serde_json::Error),

    /// The DDL query failed.
    #[error("failed to fetch table DDL: {0}")]
    Sql(#[from] sqlx::Error),

    /// A configured address could not be parsed.
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
}

/// Resolves the numeric id of a table.
#[async_trait]
pub trait TableIdResolver: Send + Sync {
    /// Id of `schema`.`table`.
    async fn resolve_table_id(&self, schema: &str, table: &str) -> Result<i64, CatalogError>;
}

/// Fetches the `CREATE TABLE` statement of a table.
#[async_trait]
pub trait DdlSource: Send + Sync {
    /// DDL of `schema`.`table`.
    async fn fetch_ddl(&self, schema: &str, table: &str) -> Result<String, CatalogError>;
}

#[derive(Deserialize)]
struct TableIdBody {
    id: i64,
}

/// Looks table ids up through `GET {endpoint}/schema/{schema}/{table}`.
#[derive(Debug, Clone)]
pub struct HttpTableIdResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTableIdResolver {
    /// Resolver for the status endpoint at `endpoint`. A missing scheme
    /// defaults to `http://`.
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        let endpoint = endpoint.trim_end_matches('/');
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `{endpoint}/schema/{schema}/{table}` with both names percent-encoded as
    /// single path segments.
    fn table_url(&self, schema: &str, table: &str) -> Result<reqwest::Url, CatalogError> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|_| CatalogError::InvalidAddress(self.endpoint.clone()))?;
        url.path_segments_mut()
            .map_err(|()| CatalogError::InvalidAddress(self.endpoint.clone()))?
            .pop_if_empty()
            .extend(["schema", schema, table]);
        Ok(url)
    }
}

#[async_trait]
impl TableIdResolver for HttpTableIdResolver {
    async fn resolve_table_id(&self, schema: &str, table: &str) -> Result<i64, CatalogError> {
        let url = self.table_url(schema, table)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let TableIdBody { id } = serde_json::from_str(&body)?;
        debug!(schema, table, table_id = id, "table id resolved");
        Ok(id)
    }
}

/// Reads DDL over a lazily connected MySQL pool.
#[derive(Debug, Clone)]
pub struct MySqlDdlSource {
    pool: MySqlPool,
}

impl MySqlDdlSource {
    /// Source for the SQL endpoint at `addr` (`host:port`). No connection is
    /// made until the first query. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`CatalogError::InvalidAddress`] when `addr` is not `host:port`.
    pub fn new(addr: &str, user: &str, password: &str) -> Result<Self, CatalogError> {
        let (host, port) = addr
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
            .filter(|(host, _)| !host.is_empty())
            .ok_or_else(|| CatalogError::InvalidAddress(addr.to_string()))?;

        let options = MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(user)
            .password(password);
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect_lazy_with(options);
        Ok(Self { pool })
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DdlSource for MySqlDdlSource {
    async fn fetch_ddl(&self, schema: &str, table: &str) -> Result<String, CatalogError> {
        let query = format!(
            "SHOW CREATE TABLE {}.{}",
            quote_identifier(schema),
            quote_identifier(table)
        );
        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let ddl: String = row.try_get(1)?;
        debug!(schema, table, "table DDL fetched");
        Ok(ddl)
    }
}

/// Backtick-quote a MySQL identifier.
fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_identifier("users"), "`users`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_endpoint_normalization() {
        assert_eq!(
            HttpTableIdResolver::new("127.0.0.1:10080").endpoint(),
            "http://127.0.0.1:10080"
        );
        assert_eq!(
            HttpTableIdResolver::new("https://tidb:10080/").endpoint(),
            "https://tidb:10080"
        );
    }

    #[tokio::test]
    async fn test_ddl_source_validates_address() {
        assert!(MySqlDdlSource::new("127.0.0.1:4000", "root", "").is_ok());
        assert!(matches!(
            MySqlDdlSource::new("127.0.0.1", "root", ""),
            Err(CatalogError::InvalidAddress(_))
        ));
        assert!(matches!(
            MySqlDdlSource::new(":4000", "root", ""),
            Err(CatalogError::InvalidAddress(_))
        ));
    }
}
