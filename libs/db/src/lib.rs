//! The RethinkDB-shaped per-cluster database manager (C3): databases,
//! tables, rows, audit logging and changefeeds, built against a
//! backend-agnostic [`backend::RawBackend`] capability.

pub mod backend;
pub mod error;
pub mod fake;
pub mod manager;
#[cfg(feature = "rethinkdb")]
pub mod rethinkdb;
pub mod types;

pub use backend::{ChangeStream, RawBackend, Row};
pub use error::{Error, Result};
pub use manager::{DbManager, Subscription};
#[cfg(feature = "rethinkdb")]
pub use rethinkdb::RethinkDbBackend;
pub use types::{
    AuditEvent, AuditScope, ChangefeedEvent, ChangefeedKind, ColumnDef, ColumnType,
    DatabaseInstance, ErrorClass, RawChange, RowPage, Table, classify_error, physical_db_name,
    sanitize_identifier,
};

/// Test-only in-memory backend, exposed for other crates' unit tests
/// (e.g. `guildnet-rbac`, `guildnet-api`) to build a `DbManager` without a
/// live cluster.
pub mod testing {
    pub use crate::fake::FakeBackend;
}
