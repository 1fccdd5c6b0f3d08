//! Production [`RawBackend`] speaking RethinkDB's wire protocol via `reql`.
//!
//! This backend is deliberately thin: it translates each [`RawBackend`]
//! method into the equivalent ReQL term and maps driver errors into
//! [`Error::backend`], which classifies them by message for the manager's
//! retry logic. All naming, retry and audit policy lives in
//! [`crate::manager::DbManager`].

use futures::StreamExt;
use reql::{Client, Run, types::WriteStatus};

use crate::backend::{ChangeStream, RawBackend, Row};
use crate::error::{Error, Result};
use crate::types::RawChange;

pub struct RethinkDbBackend {
    session: reql::Session,
}

impl RethinkDbBackend {
    pub async fn connect(addr: &str, user: &str, pass: &str) -> Result<Self> {
        let session = Client::new()
            .set_addresses(addr)
            .set_user(user, pass)
            .connect()
            .await
            .map_err(|e| Error::backend(e.to_string()))?;
        Ok(Self { session })
    }
}

#[async_trait::async_trait]
impl RawBackend for RethinkDbBackend {
    async fn create_database(&self, physical_db: &str) -> Result<()> {
        reql::r
            .db_create(physical_db)
            .run(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?;
        Ok(())
    }

    async fn drop_database(&self, physical_db: &str) -> Result<()> {
        reql::r
            .db_drop(physical_db)
            .run(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?;
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut cursor = reql::r
            .db_list()
            .run::<_, Vec<String>>(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?
            .ok_or_else(|| Error::backend("empty db_list response"))?;
        Ok(std::mem::take(&mut cursor))
    }

    async fn create_table(&self, physical_db: &str, table: &str, primary_key: &str) -> Result<()> {
        reql::r
            .db(physical_db)
            .table_create(table)
            .with_primary_key(primary_key)
            .run(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?;
        Ok(())
    }

    async fn drop_table(&self, physical_db: &str, table: &str) -> Result<()> {
        reql::r
            .db(physical_db)
            .table_drop(table)
            .run(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?;
        Ok(())
    }

    async fn list_tables(&self, physical_db: &str) -> Result<Vec<String>> {
        let cursor = reql::r
            .db(physical_db)
            .table_list()
            .run::<_, Vec<String>>(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?
            .unwrap_or_default();
        Ok(cursor)
    }

    async fn insert_rows(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        rows: Vec<Row>,
    ) -> Result<Vec<String>> {
        let docs: Vec<serde_json::Value> = rows
            .into_iter()
            .map(|r| serde_json::Value::Object(r.into_iter().collect()))
            .collect();
        let supplied_ids: Vec<String> = docs
            .iter()
            .filter_map(|d| d.get(primary_key).and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();

        let status: WriteStatus = reql::r
            .db(physical_db)
            .table(table)
            .insert(docs)
            .run(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?
            .ok_or_else(|| Error::backend("empty insert response"))?;

        let generated: Vec<String> = status
            .generated_keys
            .unwrap_or_default()
            .into_iter()
            .map(|k| k.to_string())
            .collect();

        Ok(if generated.is_empty() { supplied_ids } else { generated })
    }

    async fn get_row(
        &self,
        physical_db: &str,
        table: &str,
        _primary_key: &str,
        id: &str,
    ) -> Result<Option<Row>> {
        let doc = reql::r
            .db(physical_db)
            .table(table)
            .get(id)
            .run::<_, serde_json::Value>(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?;
        Ok(doc.and_then(|v| v.as_object().cloned()).map(|m| m.into_iter().collect()))
    }

    async fn update_row(
        &self,
        physical_db: &str,
        table: &str,
        _primary_key: &str,
        id: &str,
        patch: Row,
    ) -> Result<()> {
        let doc = serde_json::Value::Object(patch.into_iter().collect());
        reql::r
            .db(physical_db)
            .table(table)
            .get(id)
            .update(doc)
            .run(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?;
        Ok(())
    }

    async fn delete_row(
        &self,
        physical_db: &str,
        table: &str,
        _primary_key: &str,
        id: &str,
    ) -> Result<()> {
        reql::r
            .db(physical_db)
            .table(table)
            .get(id)
            .delete(())
            .run(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?;
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
        let index = reql::r.db(physical_db).table(table).order_by(primary_key);
        let index = if ascending { index } else { index.desc() };
        let mut term = index;
        if let Some(cursor) = cursor {
            term = term.filter(move |row| {
                if ascending {
                    row.clone().bracket(primary_key.as_str()).gt(cursor.clone())
                } else {
                    row.clone().bracket(primary_key.as_str()).lt(cursor.clone())
                }
            });
        }
        let mut docs = term
            .limit(limit as i64)
            .run::<_, Vec<serde_json::Value>>(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?
            .unwrap_or_default();

        Ok(docs
            .drain(..)
            .filter_map(|v| v.as_object().cloned())
            .map(|m| m.into_iter().collect())
            .collect())
    }

    async fn subscribe_table(&self, physical_db: &str, table: &str) -> Result<ChangeStream> {
        let changes = reql::r
            .db(physical_db)
            .table(table)
            .changes()
            .run::<_, reql::types::Change<serde_json::Value>>(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?;

        let stream = changes.map(|item| {
            let change = item.map_err(|e| Error::backend(e.to_string()))?;
            let row_id = change
                .new_val
                .as_ref()
                .or(change.old_val.as_ref())
                .and_then(|v| v.get("id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Ok(RawChange {
                row_id,
                before: change.old_val,
                after: change.new_val,
            })
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> Result<()> {
        reql::r
            .db("rethinkdb")
            .table("server_status")
            .limit(1)
            .run::<_, serde_json::Value>(&self.session)
            .await
            .map_err(|e| Error::backend(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.session
            .close()
            .await
            .map_err(|e| Error::backend(e.to_string()))
    }
}
