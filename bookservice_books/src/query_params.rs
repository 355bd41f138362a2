//! Named query parameters.
//!
//! Queries built at runtime are written with `:name` placeholders and rewritten
//! into the positional `$n` syntax understood by postgres, together with the
//! argument list in matching order.

use std::collections::HashMap;
use std::error::Error;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

/// Value bound to a query parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Text(String),
    Int(i32),
    BigInt(i64),
    Timestamp(DateTime<Utc>),
    Null,
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Text(value) => value.to_sql_checked(ty, out),
            SqlValue::Int(value) => value.to_sql_checked(ty, out),
            SqlValue::BigInt(value) => value.to_sql_checked(ty, out),
            SqlValue::Timestamp(value) => value.to_sql_checked(ty, out),
            SqlValue::Null => Ok(IsNull::Yes),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <String as ToSql>::accepts(ty)
            || <i32 as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
            || <DateTime<Utc> as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::BigInt(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Parameter values keyed by placeholder name. Names are static so they can
/// only come from code, never from a request.
pub type QueryParams = HashMap<&'static str, SqlValue>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueryParamsError {
    #[error("Query parameter :{0} is not defined")]
    Undefined(String),
}

/// Query rewritten to positional placeholders with its aligned arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQuery {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl BoundQuery {
    pub fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.args
            .iter()
            .map(|arg| arg as &(dyn ToSql + Sync))
            .collect()
    }
}

/// Replaces every `:name` placeholder with `$n`, numbering names in the order
/// they first appear. A name used more than once keeps its first position.
/// Entries of `params` the query does not mention are ignored.
///
/// `::type` casts and text inside single quoted literals are left untouched.
/// Backslash escapes of `E'...'` strings are not recognised, a `\'` inside one
/// ends the literal for this scan.
pub fn replace_query_params(
    query: &str,
    params: &QueryParams,
) -> Result<BoundQuery, QueryParamsError> {
    let bytes = query.as_bytes();
    let mut sql = String::with_capacity(query.len());
    let mut names: Vec<&str> = Vec::new();
    let mut args = Vec::new();

    let mut in_literal = false;
    let mut copied_up_to = 0;
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        if in_literal {
            in_literal = byte != b'\'';
            i += 1;
            continue;
        }
        match byte {
            b'\'' => {
                in_literal = true;
                i += 1;
            }
            b':' if bytes.get(i + 1) == Some(&b':') => i += 2,
            b':' if bytes.get(i + 1).is_some_and(|next| is_name_start(*next)) => {
                let start = i + 1;
                let end = start
                    + bytes[start..]
                        .iter()
                        .take_while(|byte| is_name_char(**byte))
                        .count();
                let name = &query[start..end];

                let position = match names.iter().position(|known| *known == name) {
                    Some(position) => position,
                    None => {
                        let value = params
                            .get(name)
                            .ok_or_else(|| QueryParamsError::Undefined(name.to_string()))?;
                        names.push(name);
                        args.push(value.clone());
                        names.len() - 1
                    }
                };

                sql.push_str(&query[copied_up_to..i]);
                sql.push('$');
                sql.push_str(&(position + 1).to_string());
                copied_up_to = end;
                i = end;
            }
            _ => i += 1,
        }
    }
    sql.push_str(&query[copied_up_to..]);

    Ok(BoundQuery { sql, args })
}

fn is_name_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_name_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}
