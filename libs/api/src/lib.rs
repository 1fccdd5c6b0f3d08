//! HTTP API and SSE changefeed surface (C9): one `axum::Router` exposing
//! the database/table/row/audit/permission endpoints over
//! [`guildnet_db::DbManager`] and [`guildnet_rbac::Rbac`].

pub mod error;
pub mod request_id;
pub mod router;
pub mod routes;
pub mod sse;
pub mod state;

pub use error::ApiError;
pub use router::router;
pub use state::{ApiMetrics, AppState};
