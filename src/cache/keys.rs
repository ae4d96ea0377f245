//! Cache key codec.
//!
//! Turns `(endpoint, args)` into a stable string key. Arguments are written in
//! canonical JSON (object keys sorted at every depth) so that structurally equal
//! arguments collide regardless of field order.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::error::CacheError;

/// Opaque identifier of one `(endpoint, args)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encoded arguments together with their key.
///
/// The canonical value is kept so the entry can re-issue its own fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedQuery {
    pub key: CacheKey,
    pub args: Value,
}

/// Encode a query into its cache key.
///
/// # Errors
/// Returns [`CacheError::Validation`] for an empty endpoint name and
/// [`CacheError::Serialization`] when `args` cannot be represented as JSON.
pub fn encode<A>(endpoint: &str, args: &A) -> Result<EncodedQuery, CacheError>
where
    A: Serialize + ?Sized,
{
    let args = to_plain_value(endpoint, args)?;
    let key = encode_value(endpoint, &args)?;
    Ok(EncodedQuery { key, args })
}

/// Encode a query whose arguments are already JSON.
///
/// # Errors
/// Returns [`CacheError::Validation`] for an empty endpoint name.
pub fn encode_value(endpoint: &str, args: &Value) -> Result<CacheKey, CacheError> {
    if endpoint.trim().is_empty() {
        return Err(CacheError::validation(endpoint, "endpoint name must not be empty"));
    }

    let mut key = String::with_capacity(endpoint.len() + 16);
    key.push_str(endpoint);
    key.push('(');
    write_canonical(args, &mut key);
    key.push(')');
    Ok(CacheKey(key))
}

/// Serialize `args` into a JSON value, naming the offending type on failure.
///
/// # Errors
/// Returns [`CacheError::Serialization`] when the value's `Serialize` impl fails,
/// e.g. maps with non-string keys.
pub fn to_plain_value<A>(context: &str, args: &A) -> Result<Value, CacheError>
where
    A: Serialize + ?Sized,
{
    serde_json::to_value(args).map_err(|err| {
        CacheError::serialization(
            context,
            format!(
                "arguments of type `{}` are not plain data: {err}",
                std::any::type_name::<A>()
            ),
        )
    })
}

/// Write `value` as JSON with object keys sorted at every depth.
pub fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => {
            let _ = write!(out, "{number}");
        }
        Value::String(text) => write_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (name, field)) in fields.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
    }
}

fn write_string(text: &str, out: &mut String) {
    // Serializing a `&str` cannot fail.
    match serde_json::to_string(text) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => out.push_str("\"\""),
    }
}
