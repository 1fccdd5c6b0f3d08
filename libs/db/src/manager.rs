use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::backend::RawBackend;
use crate::error::{Error, Result};
use crate::types::{
    AuditEvent, AuditScope, ChangefeedEvent, ChangefeedKind, ColumnDef, DatabaseInstance,
    META_TABLES, META_TABLE_AUDIT, META_TABLE_SCHEMAS, Table, physical_db_name,
    sanitize_identifier,
};

const ENSURE_DATABASE_ATTEMPTS: usize = 5;
const ENSURE_DATABASE_BACKOFF_UNIT: Duration = Duration::from_millis(250);
/// Backpressure cap on a single subscriber's changefeed channel (§5).
const CHANGEFEED_CHANNEL_CAPACITY: usize = 256;

/// A live handle on a table's changefeed. Dropping it (or calling
/// [`Subscription::cancel`]) stops the background forwarder task and closes
/// the channel.
pub struct Subscription {
    pub events: mpsc::Receiver<ChangefeedEvent>,
    cancel_token: Arc<AtomicBool>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.cancel_token.store(true, Ordering::SeqCst);
    }
}

/// The RethinkDB-shaped database manager (C3). Backend-agnostic: all I/O
/// goes through a [`RawBackend`] capability, so tests run against
/// [`crate::fake::FakeBackend`] with identical manager logic to production.
pub struct DbManager {
    backend: Arc<dyn RawBackend>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl DbManager {
    pub fn new(backend: Arc<dyn RawBackend>) -> Self {
        Self {
            backend,
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Resolve an address via C4 when `addr_override` is empty, then connect.
    /// Errors if no address can be discovered in-cluster (the spec's chosen
    /// `AutoDiscoverAddr` variant rejects loopback/external fallback).
    #[cfg(feature = "rethinkdb")]
    pub async fn connect_for_k8s(
        client: &kube::Client,
        addr_override: Option<&str>,
        namespace: &str,
        service_name: &str,
        user: &str,
        pass: &str,
    ) -> Result<Self> {
        let addr = match addr_override {
            Some(addr) if !addr.is_empty() => addr.to_string(),
            _ => guildnet_discovery::discover(
                client,
                namespace,
                service_name,
                guildnet_discovery::PreferredPort::default(),
            )
            .await
            .map_err(|e| Error::backend(e.to_string()))?
            .ok_or(Error::NoAddressDiscovered)?,
        };
        let backend = crate::rethinkdb::RethinkDbBackend::connect(&addr, user, pass).await?;
        Ok(Self::new(Arc::new(backend)))
    }

    /// Idempotently create the physical database and its meta tables.
    /// Retries transient errors a bounded number of times with linear
    /// backoff; auth/schema/fatal errors are surfaced immediately.
    pub async fn ensure_database(&self, org_id: &str, db_name: &str) -> Result<DatabaseInstance> {
        let physical = physical_db_name(org_id, db_name);
        let backend = self.backend.clone();
        let physical_for_retry = physical.clone();

        (move || {
            let backend = backend.clone();
            let physical = physical_for_retry.clone();
            async move {
                let existing = backend.list_databases().await?;
                if !existing.contains(&physical) {
                    backend.create_database(&physical).await?;
                }
                for meta_table in META_TABLES {
                    let tables = backend.list_tables(&physical).await?;
                    if !tables.iter().any(|t| t == meta_table) {
                        backend.create_table(&physical, meta_table, "id").await?;
                    }
                }
                Ok::<(), Error>(())
            }
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(ENSURE_DATABASE_BACKOFF_UNIT)
                .with_max_times(ENSURE_DATABASE_ATTEMPTS),
        )
        .when(|e: &Error| e.class() == crate::types::ErrorClass::Transient)
        .await?;

        Ok(DatabaseInstance {
            id: sanitize_identifier(db_name),
            org_id: org_id.to_string(),
            name: db_name.to_string(),
            description: None,
            created_at: Utc::now(),
        })
    }

    pub async fn drop_database(&self, org_id: &str, db_name: &str) -> Result<()> {
        let physical = physical_db_name(org_id, db_name);
        self.backend.drop_database(&physical).await
    }

    /// List the logical database names owned by `org_id`, derived from the
    /// physical `org_<org>__<db>` naming convention.
    pub async fn list_databases(&self, org_id: &str) -> Result<Vec<String>> {
        let prefix = format!("org_{}__", sanitize_identifier(org_id));
        Ok(self
            .backend
            .list_databases()
            .await?
            .into_iter()
            .filter_map(|name| name.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub async fn list_tables(&self, org_id: &str, db_name: &str) -> Result<Vec<Table>> {
        let physical = physical_db_name(org_id, db_name);
        let mut out = Vec::new();
        for row in self.read_all(&physical, META_TABLE_SCHEMAS).await? {
            if let Ok(table) = serde_json::from_value::<Table>(serde_json::Value::Object(
                row.into_iter().collect(),
            )) {
                out.push(table);
            }
        }
        Ok(out)
    }

    /// Create the physical table, upsert its schema record, and emit a
    /// `create_table` audit event.
    pub async fn create_table(
        &self,
        org_id: &str,
        db_name: &str,
        table_name: &str,
        primary_key: &str,
        schema: Vec<ColumnDef>,
        actor: &str,
    ) -> Result<Table> {
        let physical = physical_db_name(org_id, db_name);
        self.backend
            .create_table(&physical, table_name, primary_key)
            .await?;

        let table = Table {
            id: sanitize_identifier(table_name),
            db_id: sanitize_identifier(db_name),
            name: table_name.to_string(),
            primary_key: primary_key.to_string(),
            ttl: None,
            schema,
            created_at: Utc::now(),
        };
        self.upsert_schema(&physical, &table).await?;
        self.write_audit(&physical, AuditScope::Table, &table.id, actor, "create_table", None)
            .await;
        Ok(table)
    }

    /// Replace a table's schema record; no data migration is performed.
    pub async fn update_table_schema(
        &self,
        org_id: &str,
        db_name: &str,
        table_name: &str,
        primary_key: Option<String>,
        schema: Vec<ColumnDef>,
        actor: &str,
    ) -> Result<Table> {
        let physical = physical_db_name(org_id, db_name);
        let table_id = sanitize_identifier(table_name);
        let mut table = self
            .read_all(&physical, META_TABLE_SCHEMAS)
            .await?
            .into_iter()
            .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(table_id.as_str()))
            .and_then(|row| {
                serde_json::from_value::<Table>(serde_json::Value::Object(row.into_iter().collect()))
                    .ok()
            })
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;

        table.schema = schema;
        if let Some(pk) = primary_key {
            table.primary_key = pk;
        }
        self.upsert_schema(&physical, &table).await?;
        self.write_audit(&physical, AuditScope::Table, &table.id, actor, "update_schema", None)
            .await;
        Ok(table)
    }

    async fn upsert_schema(&self, physical: &str, table: &Table) -> Result<()> {
        let row = serde_json::to_value(table)?;
        let row = row.as_object().cloned().unwrap_or_default().into_iter().collect();
        let existing = self
            .backend
            .get_row(physical, META_TABLE_SCHEMAS, "id", &table.id)
            .await?;
        if existing.is_some() {
            self.backend
                .update_row(physical, META_TABLE_SCHEMAS, "id", &table.id, row)
                .await
        } else {
            self.backend
                .insert_rows(physical, META_TABLE_SCHEMAS, "id", vec![row])
                .await
                .map(|_| ())
        }
    }

    /// Paginated row listing, ordered by `primary_key`. Fetches `limit + 1`
    /// rows to decide whether another page exists.
    pub async fn query_rows(
        &self,
        org_id: &str,
        db_name: &str,
        table_name: &str,
        primary_key: &str,
        limit: usize,
        cursor: Option<String>,
        ascending: bool,
    ) -> Result<crate::types::RowPage> {
        let physical = physical_db_name(org_id, db_name);
        let mut rows = self
            .backend
            .query_rows(&physical, table_name, primary_key, limit + 1, cursor, ascending)
            .await?;

        let next = if rows.len() > limit {
            rows.truncate(limit);
            rows.last()
                .and_then(|r| r.get(primary_key))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        } else {
            None
        };

        Ok(crate::types::RowPage { rows, next })
    }

    pub async fn insert_rows(
        &self,
        org_id: &str,
        db_name: &str,
        table_name: &str,
        primary_key: &str,
        rows: Vec<crate::backend::Row>,
        actor: &str,
    ) -> Result<Vec<String>> {
        let physical = physical_db_name(org_id, db_name);
        let ids = self
            .backend
            .insert_rows(&physical, table_name, primary_key, rows)
            .await?;
        for id in &ids {
            self.write_audit(&physical, AuditScope::Row, id, actor, "insert_row", None)
                .await;
        }
        Ok(ids)
    }

    pub async fn update_row(
        &self,
        org_id: &str,
        db_name: &str,
        table_name: &str,
        primary_key: &str,
        id: &str,
        patch: crate::backend::Row,
        actor: &str,
    ) -> Result<()> {
        let physical = physical_db_name(org_id, db_name);
        let diff = serde_json::to_value(&patch).ok();
        self.backend
            .update_row(&physical, table_name, primary_key, id, patch)
            .await?;
        self.write_audit(&physical, AuditScope::Row, id, actor, "update_row", diff)
            .await;
        Ok(())
    }

    pub async fn delete_row(
        &self,
        org_id: &str,
        db_name: &str,
        table_name: &str,
        primary_key: &str,
        id: &str,
        actor: &str,
    ) -> Result<()> {
        let physical = physical_db_name(org_id, db_name);
        self.backend
            .delete_row(&physical, table_name, primary_key, id)
            .await?;
        self.write_audit(&physical, AuditScope::Row, id, actor, "delete_row", None)
            .await;
        Ok(())
    }

    pub async fn list_audit(
        &self,
        org_id: &str,
        db_name: &str,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        let physical = physical_db_name(org_id, db_name);
        let mut rows = self
            .backend
            .query_rows(&physical, META_TABLE_AUDIT, "id", limit, None, false)
            .await?;
        rows.truncate(limit);
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                serde_json::from_value(serde_json::Value::Object(row.into_iter().collect())).ok()
            })
            .collect())
    }

    /// Best-effort: audit write failures are logged, never propagated, so a
    /// broken `_audit` table cannot fail the mutation that triggered it.
    async fn write_audit(
        &self,
        physical: &str,
        scope: AuditScope,
        scope_id: &str,
        actor: &str,
        action: &str,
        diff: Option<serde_json::Value>,
    ) {
        let event = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            scope,
            scope_id: scope_id.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            diff,
            ts: Utc::now(),
        };
        let row = match serde_json::to_value(&event) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => return,
        };
        if let Err(e) = self
            .backend
            .insert_rows(physical, META_TABLE_AUDIT, "id", vec![row])
            .await
        {
            warn!(msg = "audit write failed", %physical, scope_id, action, error = %e);
        }
    }

    async fn read_all(
        &self,
        physical: &str,
        table: &str,
    ) -> Result<Vec<crate::backend::Row>> {
        self.backend
            .query_rows(physical, table, "id", usize::MAX, None, true)
            .await
    }

    /// Subscribe to a table's changefeed. The returned [`Subscription`]
    /// applies backpressure via a bounded channel (capacity 256): once full,
    /// the forwarder either waits for the consumer or exits when the
    /// consumer's receiver (or `cancel`) signals it should stop.
    pub async fn subscribe_table(
        &self,
        org_id: &str,
        db_name: &str,
        table_name: &str,
    ) -> Result<Subscription> {
        let physical = physical_db_name(org_id, db_name);
        let mut raw = self.backend.subscribe_table(&physical, table_name).await?;
        let (tx, rx) = mpsc::channel(CHANGEFEED_CHANNEL_CAPACITY);
        let cancel_token = Arc::new(AtomicBool::new(false));
        let table_id = sanitize_identifier(table_name);

        let init = ChangefeedEvent {
            kind: ChangefeedKind::Init,
            table_id: table_id.clone(),
            row_id: None,
            before: None,
            after: None,
            cursor: 0,
            ts: Utc::now(),
            pending: None,
            snapshot: Some(true),
            error: None,
        };
        let _ = tx.send(init).await;

        let seq = Arc::new(AtomicU64::new(1));
        let cancel_for_task = cancel_token.clone();
        tokio::spawn(async move {
            while let Some(item) = raw.next().await {
                if cancel_for_task.load(Ordering::SeqCst) {
                    break;
                }
                let event = match item {
                    Ok(change) => ChangefeedEvent {
                        kind: change.classify(),
                        table_id: table_id.clone(),
                        row_id: change.row_id.clone(),
                        before: change.before.clone(),
                        after: change.after.clone(),
                        cursor: seq.fetch_add(1, Ordering::SeqCst),
                        ts: Utc::now(),
                        pending: None,
                        snapshot: None,
                        error: None,
                    },
                    Err(e) => {
                        let event = ChangefeedEvent {
                            kind: ChangefeedKind::Error,
                            table_id: table_id.clone(),
                            row_id: None,
                            before: None,
                            after: None,
                            cursor: seq.fetch_add(1, Ordering::SeqCst),
                            ts: Utc::now(),
                            pending: None,
                            snapshot: None,
                            error: Some(e.to_string()),
                        };
                        let _ = tx.send(event).await;
                        break;
                    }
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            trace!(msg = "changefeed forwarder exiting");
        });

        Ok(Subscription {
            events: rx,
            cancel_token,
        })
    }

    pub async fn ping(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.backend.ping().await
    }

    /// Safe to call multiple times; a second call is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(msg = "closing database manager");
        self.backend.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeBackend;
    use crate::types::ColumnType;

    fn manager() -> DbManager {
        DbManager::new(Arc::new(FakeBackend::new()))
    }

    #[tokio::test]
    async fn ensure_database_is_idempotent() {
        let mgr = manager();
        mgr.ensure_database("acme", "widgets").await.unwrap();
        mgr.ensure_database("acme", "widgets").await.unwrap();
        let dbs = mgr.backend.list_databases().await.unwrap();
        assert_eq!(dbs.iter().filter(|d| *d == "org_acme__widgets").count(), 1);
    }

    #[tokio::test]
    async fn create_table_and_insert_emits_audit() {
        let mgr = manager();
        mgr.ensure_database("acme", "widgets").await.unwrap();
        mgr.create_table(
            "acme",
            "widgets",
            "events",
            "id",
            vec![ColumnDef {
                name: "msg".into(),
                column_type: ColumnType::String,
                required: false,
                unique: false,
                indexed: false,
                default: None,
                r#enum: vec![],
                regex: None,
                mask: false,
            }],
            "alice",
        )
        .await
        .unwrap();

        let mut row = crate::backend::Row::new();
        row.insert("id".into(), serde_json::json!("1"));
        row.insert("msg".into(), serde_json::json!("hi"));
        let ids = mgr
            .insert_rows("acme", "widgets", "events", "id", vec![row], "alice")
            .await
            .unwrap();
        assert_eq!(ids, vec!["1".to_string()]);

        let audit = mgr.list_audit("acme", "widgets", 200).await.unwrap();
        assert!(audit.iter().any(|e| e.scope == AuditScope::Row && e.scope_id == "1"));
    }

    #[tokio::test]
    async fn query_rows_paginates_with_next_cursor() {
        let mgr = manager();
        mgr.ensure_database("acme", "widgets").await.unwrap();
        mgr.create_table("acme", "widgets", "events", "id", vec![], "alice")
            .await
            .unwrap();

        for i in 0..5 {
            let mut row = crate::backend::Row::new();
            row.insert("id".into(), serde_json::json!(format!("{i}")));
            mgr.insert_rows("acme", "widgets", "events", "id", vec![row], "alice")
                .await
                .unwrap();
        }

        let page = mgr
            .query_rows("acme", "widgets", "events", "id", 2, None, true)
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.next, Some("1".to_string()));
    }

    #[tokio::test]
    async fn subscribe_table_emits_init_then_inserts() {
        let mgr = manager();
        mgr.ensure_database("acme", "widgets").await.unwrap();
        mgr.create_table("acme", "widgets", "events", "id", vec![], "alice")
            .await
            .unwrap();

        let mut sub = mgr.subscribe_table("acme", "widgets", "events").await.unwrap();
        let init = sub.events.recv().await.unwrap();
        assert_eq!(init.kind, ChangefeedKind::Init);

        let mut row = crate::backend::Row::new();
        row.insert("id".into(), serde_json::json!("1"));
        mgr.insert_rows("acme", "widgets", "events", "id", vec![row], "alice")
            .await
            .unwrap();

        let inserted = sub.events.recv().await.unwrap();
        assert_eq!(inserted.kind, ChangefeedKind::Insert);
        sub.cancel();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mgr = manager();
        mgr.close().await.unwrap();
        mgr.close().await.unwrap();
        assert!(matches!(mgr.ping().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn close_ends_changefeed_subscribers() {
        let mgr = manager();
        mgr.ensure_database("acme", "widgets").await.unwrap();
        mgr.create_table("acme", "widgets", "events", "id", vec![], "alice")
            .await
            .unwrap();

        let mut sub = mgr.subscribe_table("acme", "widgets", "events").await.unwrap();
        let init = sub.events.recv().await.unwrap();
        assert_eq!(init.kind, ChangefeedKind::Init);

        mgr.close().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if sub.events.recv().await.is_none() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "forwarder did not exit after close");
        }
    }
}
