//! SQL encoder backed by `sqlparser`.
//!
//! Understands `CREATE TABLE` for the table layout and `INSERT` / `REPLACE`
//! with a `VALUES` list for data. Rows become record keys keyed by the integer
//! primary key, or by an allocated handle when the table has none.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;
use sqlparser::ast::{
    ColumnOption, CreateTable, Expr, Insert, SetExpr, Statement, TableConstraint, UnaryOperator,
    Value,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use super::codec::{Datum, encode_row};
use super::tablecodec::encode_record_key;
use super::{EncodeError, EncodedRows, Encoder, EncoderFactory, KvPair};

const INTEGER_TYPES: &[&str] = &["TINYINT", "SMALLINT", "MEDIUMINT", "INT", "INTEGER", "BIGINT"];

#[derive(Debug, Clone)]
struct ColumnInfo {
    id: i64,
    name: String,
}

#[derive(Debug, Clone)]
struct TableInfo {
    name: String,
    columns: Vec<ColumnInfo>,
    /// Index of the integer primary key column used as the row handle.
    handle_column: Option<usize>,
}

impl TableInfo {
    fn from_ddl(create: &CreateTable) -> Result<Self, EncodeError> {
        let name = table_key(&create.name.0)?;
        let columns: Vec<ColumnInfo> = create
            .columns
            .iter()
            .zip(1..)
            .map(|(column, id)| ColumnInfo {
                id,
                name: column.name.value.to_ascii_lowercase(),
            })
            .collect();

        let mut primary: Vec<String> = create
            .columns
            .iter()
            .filter(|column| {
                column.options.iter().any(|option| {
                    matches!(option.option, ColumnOption::Unique { is_primary: true, .. })
                })
            })
            .map(|column| column.name.value.to_ascii_lowercase())
            .collect();
        for constraint in &create.constraints {
            if let TableConstraint::PrimaryKey { columns, .. } = constraint {
                primary.extend(columns.iter().map(|ident| ident.value.to_ascii_lowercase()));
            }
        }

        let handle_column = match primary.as_slice() {
            [single] => create
                .columns
                .iter()
                .position(|column| column.name.value.eq_ignore_ascii_case(single))
                .filter(|&index| is_integer_type(&create.columns[index].data_type.to_string())),
            _ => None,
        };

        Ok(Self {
            name,
            columns,
            handle_column,
        })
    }

    fn column_index(&self, name: &str) -> Result<usize, EncodeError> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| EncodeError::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }
}

fn is_integer_type(data_type: &str) -> bool {
    let base = data_type
        .split(['(', ' '])
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    INTEGER_TYPES.contains(&base.as_str())
}

fn table_key(parts: &[sqlparser::ast::Ident]) -> Result<String, EncodeError> {
    parts
        .last()
        .map(|ident| ident.value.to_ascii_lowercase())
        .ok_or_else(|| EncodeError::Unsupported("statement without table name".to_string()))
}

/// Encoder for one schema.
pub struct SqlEncoder {
    schema: String,
    tables: RwLock<HashMap<String, TableInfo>>,
    last_handle: AtomicI64,
    closed: AtomicBool,
}

impl SqlEncoder {
    /// Empty encoder for `schema`.
    #[must_use]
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            tables: RwLock::new(HashMap::new()),
            last_handle: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Schema the encoder was created for.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn ensure_open(&self) -> Result<(), EncodeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EncodeError::Closed);
        }
        Ok(())
    }

    fn allocate_handle(&self) -> i64 {
        self.last_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Keep allocated handles above explicit ones.
    fn observe_handle(&self, handle: i64) {
        self.last_handle.fetch_max(handle, Ordering::Relaxed);
    }

    fn encode_insert(
        &self,
        insert: &Insert,
        table_id: i64,
        out: &mut EncodedRows,
    ) -> Result<(), EncodeError> {
        let tables = self.tables.read();
        let name = table_key(&insert.table_name.0)?;
        let table = tables
            .get(&name)
            .ok_or_else(|| EncodeError::UnknownTable(name.clone()))?;

        let targets: Vec<usize> = if insert.columns.is_empty() {
            (0..table.columns.len()).collect()
        } else {
            insert
                .columns
                .iter()
                .map(|ident| table.column_index(&ident.value))
                .collect::<Result<_, _>>()?
        };

        let Some(source) = &insert.source else {
            return Err(EncodeError::Unsupported("INSERT without VALUES".to_string()));
        };
        let SetExpr::Values(values) = source.body.as_ref() else {
            return Err(EncodeError::Unsupported(format!(
                "INSERT source `{}`",
                source.body
            )));
        };

        for row in &values.rows {
            if row.len() != targets.len() {
                return Err(EncodeError::ColumnCount {
                    expected: targets.len(),
                    actual: row.len(),
                });
            }

            let mut handle = None;
            let mut datums = Vec::with_capacity(row.len());
            for (&index, expr) in targets.iter().zip(row) {
                let datum = expr_to_datum(expr)?;
                if table.handle_column == Some(index) {
                    handle = match datum {
                        Datum::Int(value) => Some(value),
                        Datum::Null => None,
                        other => return Err(EncodeError::InvalidHandle(format!("{other:?}"))),
                    };
                    continue;
                }
                datums.push((table.columns[index].id, datum));
            }
            datums.sort_by_key(|(id, _)| *id);

            let handle = match handle {
                Some(value) => {
                    self.observe_handle(value);
                    value
                }
                None => self.allocate_handle(),
            };
            out.pairs.push(KvPair {
                key: encode_record_key(table_id, handle),
                value: encode_row(&datums),
            });
            out.affected_rows += 1;
        }
        Ok(())
    }
}

impl Encoder for SqlEncoder {
    fn encode(&self, statement: &str, table_id: i64) -> Result<EncodedRows, EncodeError> {
        self.ensure_open()?;
        let statements = Parser::parse_sql(&MySqlDialect {}, statement)?;

        let mut rows = EncodedRows::default();
        for parsed in &statements {
            match parsed {
                Statement::Insert(insert) => self.encode_insert(insert, table_id, &mut rows)?,
                other => {
                    return Err(EncodeError::Unsupported(format!("{other}")));
                }
            }
        }
        debug!(
            schema = %self.schema,
            table_id,
            rows = rows.affected_rows,
            "statement encoded"
        );
        Ok(rows)
    }

    fn execute_ddl(&self, statement: &str) -> Result<(), EncodeError> {
        self.ensure_open()?;
        let statements = Parser::parse_sql(&MySqlDialect {}, statement)?;
        for parsed in &statements {
            let Statement::CreateTable(create) = parsed else {
                return Err(EncodeError::Unsupported(format!("DDL `{parsed}`")));
            };
            let table = TableInfo::from_ddl(create)?;
            debug!(
                schema = %self.schema,
                table = %table.name,
                columns = table.columns.len(),
                int_handle = table.handle_column.is_some(),
                "table registered"
            );
            self.tables.write().insert(table.name.clone(), table);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), EncodeError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.tables.write().clear();
        }
        Ok(())
    }
}

fn expr_to_datum(expr: &Expr) -> Result<Datum, EncodeError> {
    match expr {
        Expr::Value(value) => value_to_datum(value, false),
        Expr::Nested(inner) => expr_to_datum(inner),
        Expr::UnaryOp {
            op: UnaryOperator::Plus,
            expr,
        } => expr_to_datum(expr),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(value) => value_to_datum(value, true),
            other => match expr_to_datum(other)? {
                Datum::Int(value) => value
                    .checked_neg()
                    .map(Datum::Int)
                    .ok_or_else(|| EncodeError::UnsupportedValue(format!("-{other}"))),
                Datum::Float(value) => Ok(Datum::Float(-value)),
                _ => Err(EncodeError::UnsupportedValue(format!("-{other}"))),
            },
        },
        other => Err(EncodeError::UnsupportedValue(other.to_string())),
    }
}

fn value_to_datum(value: &Value, negative: bool) -> Result<Datum, EncodeError> {
    let sign = if negative { "-" } else { "" };
    match value {
        Value::Number(text, _) => {
            let text = format!("{sign}{text}");
            if let Ok(int) = text.parse::<i64>() {
                return Ok(Datum::Int(int));
            }
            text.parse::<f64>()
                .map(Datum::Float)
                .map_err(|_| EncodeError::UnsupportedValue(text))
        }
        Value::Null if !negative => Ok(Datum::Null),
        Value::Boolean(flag) if !negative => Ok(Datum::Int(i64::from(*flag))),
        Value::SingleQuotedString(text) | Value::DoubleQuotedString(text) if !negative => {
            Ok(Datum::Bytes(text.as_bytes().to_vec()))
        }
        other => Err(EncodeError::UnsupportedValue(format!("{sign}{other}"))),
    }
}

/// Creates a fresh [`SqlEncoder`] per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlEncoderFactory;

impl EncoderFactory for SqlEncoderFactory {
    fn create(&self, schema: &str) -> Result<Box<dyn Encoder>, EncodeError> {
        Ok(Box::new(SqlEncoder::new(schema)))
    }
}
