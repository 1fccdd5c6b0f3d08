use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical database, backed physically by `org_<org>__<db>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseInstance {
    pub id: String,
    pub org_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A table within a database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub id: String,
    pub db_id: String,
    pub name: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub schema: Vec<ColumnDef>,
    pub created_at: DateTime<Utc>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub r#enum: Vec<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub mask: bool,
}

/// The scope an [`AuditEvent`] applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditScope {
    Db,
    Table,
    Row,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    pub scope: AuditScope,
    pub scope_id: String,
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub diff: Option<serde_json::Value>,
    pub ts: DateTime<Utc>,
}

/// A single changefeed notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangefeedEvent {
    #[serde(rename = "type")]
    pub kind: ChangefeedKind,
    pub table_id: String,
    #[serde(default)]
    pub row_id: Option<String>,
    #[serde(default)]
    pub before: Option<serde_json::Value>,
    #[serde(default)]
    pub after: Option<serde_json::Value>,
    pub cursor: u64,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub pending: Option<usize>,
    #[serde(default)]
    pub snapshot: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangefeedKind {
    Init,
    Insert,
    Update,
    Delete,
    Snapshot,
    Error,
    Paused,
}

/// A raw before/after pair, as produced by the underlying store's changefeed
/// cursor, before it is classified and assigned a sequence number.
#[derive(Debug, Clone)]
pub struct RawChange {
    pub row_id: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

impl RawChange {
    /// Classify as insert (no `before`), update (both present) or delete (no `after`).
    pub fn classify(&self) -> ChangefeedKind {
        match (&self.before, &self.after) {
            (None, Some(_)) => ChangefeedKind::Insert,
            (Some(_), Some(_)) => ChangefeedKind::Update,
            (Some(_), None) => ChangefeedKind::Delete,
            (None, None) => ChangefeedKind::Update,
        }
    }
}

/// A page of rows plus the cursor to pass to the next call, if any.
pub struct RowPage {
    pub rows: Vec<BTreeMap<String, serde_json::Value>>,
    pub next: Option<String>,
}

/// Transient/permanent classification of a backend error, used to decide
/// whether an operation should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    None,
    Transient,
    Auth,
    Schema,
    Fatal,
}

/// Classify a backend error message by substring match, per the runtime
/// design's fixed vocabulary of known-transient/auth/schema phrases.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    const TRANSIENT: &[&str] = &[
        "no primary replica",
        "not available",
        "connection reset",
        "broken pipe",
        "timed out",
        "eof",
    ];
    const AUTH: &[&str] = &["auth", "unauthorized", "permission"];
    const SCHEMA: &[&str] = &["no such table", "no such database", "missing"];

    if TRANSIENT.iter().any(|p| lower.contains(p)) {
        ErrorClass::Transient
    } else if AUTH.iter().any(|p| lower.contains(p)) {
        ErrorClass::Auth
    } else if SCHEMA.iter().any(|p| lower.contains(p)) {
        ErrorClass::Schema
    } else {
        ErrorClass::Fatal
    }
}

/// Map arbitrary identifiers (org, db, table names) to the `[a-z0-9_-]`
/// charset RethinkDB-shaped physical names are restricted to.
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// The physical database name for `org_id`/`db_name`: `org_<org>__<db>`.
pub fn physical_db_name(org_id: &str, db_name: &str) -> String {
    format!(
        "org_{}__{}",
        sanitize_identifier(org_id),
        sanitize_identifier(db_name)
    )
}

pub const META_TABLE_SCHEMAS: &str = "_schemas";
pub const META_TABLE_AUDIT: &str = "_audit";
pub const META_TABLE_INFO: &str = "_info";
pub const META_TABLES: &[&str] = &[META_TABLE_SCHEMAS, META_TABLE_AUDIT, META_TABLE_INFO];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_error_matches_known_phrases() {
        assert_eq!(classify_error("Connection reset by peer"), ErrorClass::Transient);
        assert_eq!(classify_error("no primary replica for shard"), ErrorClass::Transient);
        assert_eq!(classify_error("Permission denied"), ErrorClass::Auth);
        assert_eq!(classify_error("no such table: widgets"), ErrorClass::Schema);
        assert_eq!(classify_error("something exploded"), ErrorClass::Fatal);
    }

    #[test]
    fn physical_db_name_sanitizes_both_parts() {
        assert_eq!(physical_db_name("Acme Corp", "my db!"), "org_acme_corp__my_db_");
    }

    #[test]
    fn raw_change_classification() {
        let insert = RawChange {
            row_id: Some("1".into()),
            before: None,
            after: Some(serde_json::json!({"a": 1})),
        };
        assert_eq!(insert.classify(), ChangefeedKind::Insert);

        let update = RawChange {
            row_id: Some("1".into()),
            before: Some(serde_json::json!({"a": 1})),
            after: Some(serde_json::json!({"a": 2})),
        };
        assert_eq!(update.classify(), ChangefeedKind::Update);

        let delete = RawChange {
            row_id: Some("1".into()),
            before: Some(serde_json::json!({"a": 1})),
            after: None,
        };
        assert_eq!(delete.classify(), ChangefeedKind::Delete);
    }
}
