//! Statement to key-value encoding.
//!
//! An [`Encoder`] is created per write session from an [`EncoderFactory`],
//! learns the table layout from DDL and turns `INSERT` statements into record
//! key-value pairs.

pub mod codec;
pub mod sql;
pub mod tablecodec;

use thiserror::Error;

pub use sql::{SqlEncoder, SqlEncoderFactory};

/// One encoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// Record key.
    pub key: Vec<u8>,
    /// Encoded row.
    pub value: Vec<u8>,
}

/// Output of encoding one statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedRows {
    /// Pairs in statement order.
    pub pairs: Vec<KvPair>,
    /// Rows the statement affects.
    pub affected_rows: u64,
}

/// Errors raised while parsing or encoding statements.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The statement text did not parse.
    #[error("failed to parse statement: {0}")]
    Parse(#[from] sqlparser::parser::ParserError),

    /// The statement kind is not handled by this encoder.
    #[error("unsupported statement: {0}")]
    Unsupported(String),

    /// The statement references a table no DDL defined.
    #[error("table `{0}` is not defined")]
    UnknownTable(String),

    /// The statement references a column the table does not have.
    #[error("unknown column `{column}` in table `{table}`")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A row does not match its column list.
    #[error("row has {actual} values, expected {expected}")]
    ColumnCount {
        /// Columns named by the statement.
        expected: usize,
        /// Values present in the row.
        actual: usize,
    },

    /// A literal could not be converted into a datum.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// The integer primary key received a non-integer value.
    #[error("invalid row handle: {0}")]
    InvalidHandle(String),

    /// A key or row could not be decoded.
    #[error("malformed encoding: {0}")]
    Malformed(String),

    /// The encoder was closed.
    #[error("encoder is closed")]
    Closed,
}

/// Encodes statements for one schema.
pub trait Encoder: Send + Sync {
    /// Encode `statement` into record pairs for `table_id`.
    ///
    /// # Errors
    ///
    /// Parse failures, unknown tables or columns, and values that cannot be
    /// encoded.
    fn encode(&self, statement: &str, table_id: i64) -> Result<EncodedRows, EncodeError>;

    /// Apply a DDL statement to the encoder's catalog.
    ///
    /// # Errors
    ///
    /// Parse failures and unsupported DDL.
    fn execute_ddl(&self, statement: &str) -> Result<(), EncodeError>;

    /// Release the encoder. Later calls fail with [`EncodeError::Closed`].
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn close(&self) -> Result<(), EncodeError>;
}

/// Creates encoders bound to a schema.
pub trait EncoderFactory: Send + Sync {
    /// Create an encoder for `schema`.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn create(&self, schema: &str) -> Result<Box<dyn Encoder>, EncodeError>;
}
