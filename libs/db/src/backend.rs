use std::collections::BTreeMap;
use std::pin::Pin;

use futures::Stream;
use serde_json::Value;

use crate::error::Result;
use crate::types::RawChange;

pub type Row = BTreeMap<String, Value>;
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<RawChange>> + Send>>;

/// The capability set a concrete store (RethinkDB-shaped networked database,
/// or a test fake) must provide. [`crate::manager::DbManager`] is written
/// entirely against this trait — it never knows which backend it is driving.
///
/// This is deliberately primitive: physical naming, meta-table bookkeeping,
/// audit logging, retry/backoff and changefeed sequencing all live in
/// [`crate::manager::DbManager`], not here.
#[async_trait::async_trait]
pub trait RawBackend: Send + Sync {
    async fn create_database(&self, physical_db: &str) -> Result<()>;
    async fn drop_database(&self, physical_db: &str) -> Result<()>;
    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn create_table(&self, physical_db: &str, table: &str, primary_key: &str) -> Result<()>;
    async fn drop_table(&self, physical_db: &str, table: &str) -> Result<()>;
    async fn list_tables(&self, physical_db: &str) -> Result<Vec<String>>;

    async fn insert_rows(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        rows: Vec<Row>,
    ) -> Result<Vec<String>>;

    async fn get_row(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        id: &str,
    ) -> Result<Option<Row>>;

    async fn update_row(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        id: &str,
        patch: Row,
    ) -> Result<()>;

    async fn delete_row(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        id: &str,
    ) -> Result<()>;

    /// Fetch up to `limit` rows ordered by `primary_key`, starting strictly
    /// after `cursor` (or before it, when `ascending` is false).
    async fn query_rows(
        &self,
        physical_db: &str,
        table: &str,
        primary_key: &str,
        limit: usize,
        cursor: Option<String>,
        ascending: bool,
    ) -> Result<Vec<Row>>;

    async fn subscribe_table(&self, physical_db: &str, table: &str) -> Result<ChangeStream>;

    async fn ping(&self) -> Result<()>;

    /// Backends that hold no closable resource (e.g. the fake) can leave
    /// this a no-op; networked backends close their session here.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
