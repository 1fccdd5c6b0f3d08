//! Shared state threaded through every route handler: the database manager,
//! the RBAC table, and the SSE changefeed gauge.

use std::sync::Arc;

use guildnet_db::DbManager;
use guildnet_rbac::Rbac;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone)]
pub struct ApiMetrics {
    pub active_changefeeds: Gauge,
}

impl ApiMetrics {
    pub fn register(registry: &mut Registry) -> Arc<Self> {
        let active_changefeeds = Gauge::default();
        registry.register(
            "guildnet_api_active_changefeeds",
            "Number of open SSE changefeed subscriptions",
            active_changefeeds.clone(),
        );
        Arc::new(Self { active_changefeeds })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbManager>,
    pub rbac: Arc<Rbac>,
    pub metrics: Arc<ApiMetrics>,
}

impl AppState {
    pub fn new(db: Arc<DbManager>, rbac: Arc<Rbac>, metrics: Arc<ApiMetrics>) -> Self {
        Self { db, rbac, metrics }
    }
}
