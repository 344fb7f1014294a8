//! Query fingerprints
//!
//! A fingerprint is the SHA-256 of the data source, the normalized SQL text,
//! the bound parameters and the execution context, hex encoded. It only
//! depends on its inputs, so it is stable across processes and restarts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic identity of a logical query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFingerprint(String);

impl QueryFingerprint {
    /// Fingerprint of a SQL query against a data source in an execution
    /// context (tenant, security scope)
    pub fn of_query(data_source: &str, sql: &str, params: &[Value], context: &Value) -> Self {
        let material = serde_json::json!([data_source, normalize_sql(sql), params, context]);
        Self::of(&material)
    }

    /// Fingerprint of any serializable key material
    pub fn of(material: &impl Serialize) -> Self {
        let bytes = serde_json::to_vec(material).unwrap_or_default();
        Self(hash_hex(&bytes))
    }

    /// Wrap an already computed fingerprint
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueryFingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hex encoded SHA-256
pub fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Collapse whitespace runs outside string literals and quoted identifiers,
/// and trim the ends
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for ch in sql.trim().chars() {
        if let Some(open) = quote {
            out.push(ch);
            if ch == open {
                quote = None;
            }
            continue;
        }

        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }

        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        if ch == '\'' || ch == '"' {
            quote = Some(ch);
        }
        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_sql() {
        assert_eq!(
            normalize_sql("  SELECT *\n   FROM orders\tWHERE a = 1  "),
            "SELECT * FROM orders WHERE a = 1"
        );
        // Literals are left alone
        assert_eq!(
            normalize_sql("SELECT 'a    b'   FROM t"),
            "SELECT 'a    b' FROM t"
        );
        assert_eq!(
            normalize_sql("SELECT \"order  total\"\n  FROM \"my   table\""),
            "SELECT \"order  total\" FROM \"my   table\""
        );
    }

    #[test]
    fn test_quoted_identifiers_keep_their_spacing() {
        let spaced = QueryFingerprint::of_query("t", "SELECT \"a  b\" FROM t", &[], &Value::Null);
        let single = QueryFingerprint::of_query("t", "SELECT \"a b\" FROM t", &[], &Value::Null);
        assert_ne!(spaced, single);
    }

    #[test]
    fn test_fingerprint_stability() {
        let context = json!({"tenant": "x"});
        let a = QueryFingerprint::of_query("default", "SELECT 1\nFROM t", &[json!(1)], &context);
        let b = QueryFingerprint::of_query("default", "SELECT 1 FROM t", &[json!(1)], &context);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_inputs() {
        let base = QueryFingerprint::of_query("a", "SELECT ?", &[json!(1)], &Value::Null);
        let other_param = QueryFingerprint::of_query("a", "SELECT ?", &[json!(2)], &Value::Null);
        let other_tenant =
            QueryFingerprint::of_query("a", "SELECT ?", &[json!(1)], &json!({"tenant": "y"}));
        let other_source = QueryFingerprint::of_query("b", "SELECT ?", &[json!(1)], &Value::Null);
        assert_ne!(base, other_param);
        assert_ne!(base, other_tenant);
        assert_ne!(base, other_source);
    }
}
