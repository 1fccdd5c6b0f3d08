//! Assembles the full `axum::Router`: every `/db` route from spec §4.8, the
//! `/sse` changefeed route, and the request-id middleware every response
//! carries.

use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::routes::db;
use crate::sse;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let db_routes = Router::new()
        .route("/db", get(db::list_databases).post(db::create_database))
        .route("/db/health", get(db::health))
        .route("/db/{db}", get(db::get_database).delete(db::delete_database))
        .route("/db/{db}/tables", get(db::list_tables).post(db::create_table))
        .route("/db/{db}/tables/{table}", get(db::get_table).patch(db::update_table))
        .route(
            "/db/{db}/tables/{table}/rows",
            get(db::list_rows).post(db::insert_rows),
        )
        .route(
            "/db/{db}/tables/{table}/rows/{id}",
            patch(db::update_row).delete(db::delete_row),
        )
        .route("/db/{db}/tables/{table}/import", post(db::import_rows))
        .route("/db/{db}/tables/{table}/export", get(db::export_rows))
        .route("/db/{db}/audit", get(db::list_audit))
        .route(
            "/db/{db}/permissions",
            get(db::list_permissions).post(db::grant_permission).delete(db::revoke_permission),
        );

    let sse_routes = Router::new().route("/sse/db/{db}/tables/{table}/changes", get(sse::changes));

    Router::new()
        .merge(db_routes)
        .merge(sse_routes)
        .layer(axum::middleware::from_fn(crate::request_id::middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
