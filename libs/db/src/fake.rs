//! An in-memory [`RawBackend`] used by unit tests and by callers that want a
//! `DbManager` without a live cluster (e.g. local development).

use std::collections::BTreeMap;
use std::sync::Mutex;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChangeStream, RawBackend, Row};
use crate::error::{Error, Result};
use crate::types::RawChange;

#[derive(Default)]
struct DbState {
    tables: BTreeMap<String, (String, Vec<Row>)>,
}

pub struct FakeBackend {
    dbs: Mutex<BTreeMap<String, DbState>>,
    changes: Mutex<BTreeMap<(String, String), broadcast::Sender<RawChange>>>,
    /// Cancelled on [`FakeBackend::close`], ending every stream handed out by
    /// [`FakeBackend::subscribe_table`] so their forwarder tasks exit.
    closed: CancellationToken,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            dbs: Mutex::new(BTreeMap::new()),
            changes: Mutex::new(BTreeMap::new()),
            closed: CancellationToken::new(),
        }
    }

    fn notify(&self, physical_db: &str, table: &str, change: RawChange) {
        let changes = self.changes.lock().unwrap();
        if let Some(tx) = changes.get(&(physical_db.to_string(), table.to_string())) {
            let _ = tx.send(change);
        }
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RawBackend for FakeBackend {
    async fn create_database(&self, physical_db: &str) -> Result<()> {
        self.dbs
            .lock()
            .unwrap()
            .entry(physical_db.to_string())
            .or_default();
        Ok(())
    }

    async fn drop_database(&self, physical_db: &str) -> Result<()> {
        self.dbs.lock().unwrap().remove(physical_db);
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.dbs.lock().unwrap().keys().cloned().collect())
    }

    async fn create_table(&self, physical_db: &str, table: &str, primary_key: &str) -> Result<()> {
        let mut dbs = self.dbs.lock().unwrap();
        let db = dbs
            .get_mut(physical_db)
            .ok_or_else(|| Error::DatabaseNotFound(physical_db.to_string()))?;
        db.tables
            .entry(table.to_string())
            .or_insert_with(|| (primary_key.to_string(), Vec::new()));
        Ok(())
    }

    async fn drop_table(&self, physical_db: &str, table: &str) -> Result<()> {
        if let Some(db) = self.dbs.lock().unwrap().get_mut(physical_db) {
            db.tables.remove(table);
        }
        Ok(())
    }

    async fn list_tables(&self, physical_db: &str) -> Result<Vec<String>> {
        let dbs = self.dbs.lock().unwrap();
        let db = dbs
            .get(physical_db)
            .ok_or_else(|| Error::DatabaseNotFound(physical_db.to_string()))?;
        Ok(db.tables.keys().cloned().collect())
    }

    async fn insert_rows(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        rows: Vec<Row>,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(rows.len());
        {
            let mut dbs = self.dbs.lock().unwrap();
            let db = dbs
                .get_mut(physical_db)
                .ok_or_else(|| Error::DatabaseNotFound(physical_db.to_string()))?;
            let (pk, stored) = db
                .tables
                .get_mut(table)
                .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
            let _ = pk;
            for row in rows {
                let id = row
                    .get(primary_key)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                ids.push(id.clone());
                stored.push(row.clone());
                self.notify(
                    physical_db,
                    table,
                    RawChange {
                        row_id: Some(id),
                        before: None,
                        after: Some(serde_json::Value::Object(row.into_iter().collect())),
                    },
                );
            }
        }
        Ok(ids)
    }

    async fn get_row(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        id: &str,
    ) -> Result<Option<Row>> {
        let dbs = self.dbs.lock().unwrap();
        let db = dbs
            .get(physical_db)
            .ok_or_else(|| Error::DatabaseNotFound(physical_db.to_string()))?;
        let (_, stored) = db
            .tables
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        Ok(stored
            .iter()
            .find(|r| r.get(primary_key).and_then(|v| v.as_str()) == Some(id))
            .cloned())
    }

    async fn update_row(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        id: &str,
        patch: Row,
    ) -> Result<()> {
        let (before, after) = {
            let mut dbs = self.dbs.lock().unwrap();
            let db = dbs
                .get_mut(physical_db)
                .ok_or_else(|| Error::DatabaseNotFound(physical_db.to_string()))?;
            let (_, stored) = db
                .tables
                .get_mut(table)
                .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
            let row = stored
                .iter_mut()
                .find(|r| r.get(primary_key).and_then(|v| v.as_str()) == Some(id))
                .ok_or_else(|| Error::RowNotFound(id.to_string()))?;
            let before = serde_json::Value::Object(row.clone().into_iter().collect());
            for (k, v) in patch {
                row.insert(k, v);
            }
            let after = serde_json::Value::Object(row.clone().into_iter().collect());
            (before, after)
        };
        self.notify(
            physical_db,
            table,
            RawChange {
                row_id: Some(id.to_string()),
                before: Some(before),
                after: Some(after),
            },
        );
        Ok(())
    }

    async fn delete_row(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        id: &str,
    ) -> Result<()> {
        let before = {
            let mut dbs = self.dbs.lock().unwrap();
            let db = dbs
                .get_mut(physical_db)
                .ok_or_else(|| Error::DatabaseNotFound(physical_db.to_string()))?;
            let (_, stored) = db
                .tables
                .get_mut(table)
                .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
            let idx = stored
                .iter()
                .position(|r| r.get(primary_key).and_then(|v| v.as_str()) == Some(id))
                .ok_or_else(|| Error::RowNotFound(id.to_string()))?;
            let row = stored.remove(idx);
            serde_json::Value::Object(row.into_iter().collect())
        };
        self.notify(
            physical_db,
            table,
            RawChange {
                row_id: Some(id.to_string()),
                before: Some(before),
                after: None,
            },
        );
        Ok(())
    }

    async fn query_rows(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        limit: usize,
        cursor: Option<String>,
        ascending: bool,
    ) -> Result<Vec<Row>> {
        let dbs = self.dbs.lock().unwrap();
        let db = dbs
            .get(physical_db)
            .ok_or_else(|| Error::DatabaseNotFound(physical_db.to_string()))?;
        let (_, stored) = db
            .tables
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;

        let mut rows: Vec<Row> = stored.clone();
        rows.sort_by(|a, b| {
            let ka = a.get(primary_key).and_then(|v| v.as_str()).unwrap_or("");
            let kb = b.get(primary_key).and_then(|v| v.as_str()).unwrap_or("");
            if ascending { ka.cmp(kb) } else { kb.cmp(ka) }
        });

        let start = match &cursor {
            Some(c) => rows
                .iter()
                .position(|r| r.get(primary_key).and_then(|v| v.as_str()) == Some(c.as_str()))
                .map(|idx| idx + 1)
                .unwrap_or(0),
            None => 0,
        };

        Ok(rows.into_iter().skip(start).take(limit).collect())
    }

    async fn subscribe_table(&self, physical_db: &str, table: &str) -> Result<ChangeStream> {
        let mut changes = self.changes.lock().unwrap();
        let tx = changes
            .entry((physical_db.to_string(), table.to_string()))
            .or_insert_with(|| broadcast::channel(256).0)
            .clone();
        let rx = tx.subscribe();
        let closed = self.closed.clone();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok().map(Ok) })
            .take_until(closed.cancelled_owned());
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Ends every outstanding [`FakeBackend::subscribe_table`] stream, so the
    /// forwarder task reading it (spawned by
    /// [`crate::manager::DbManager::subscribe_table`]) exits instead of
    /// hanging open past `Close` (spec §8's changefeed cancellation scenario).
    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_query_round_trips() {
        let backend = FakeBackend::new();
        backend.create_database("org_a__b").await.unwrap();
        backend.create_table("org_a__b", "t", "id").await.unwrap();

        let mut row = Row::new();
        row.insert("id".into(), serde_json::json!("1"));
        backend
            .insert_rows("org_a__b", "t", "id", vec![row])
            .await
            .unwrap();

        let rows = backend
            .query_rows("org_a__b", "t", "id", 10, None, true)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn missing_table_is_an_error() {
        let backend = FakeBackend::new();
        backend.create_database("org_a__b").await.unwrap();
        let err = backend
            .query_rows("org_a__b", "missing", "id", 10, None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
    }
}
