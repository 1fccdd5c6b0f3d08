//! Database/table/row/audit/permission handlers (spec §4.8's route table).
//! Single-org mode: the org is resolved once per request from the
//! `x-org-id` header (defaulting to `"default"`) and threaded through every
//! call into [`guildnet_db::DbManager`]. A cluster-scoped deployment nests
//! this same router under `/api/cluster/:cluster_id` and injects the
//! cluster's org id upstream; the handlers below are unaware of the
//! distinction.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use guildnet_db::{ColumnDef, DatabaseInstance};
use guildnet_rbac::{Action, Role, Scope};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::request_id::RequestId;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_AUDIT_LIMIT: usize = 200;
const DEFAULT_EXPORT_LIMIT: usize = 10_000;
/// Cap on the rows echoed back in a dry-run import's `preview`; the
/// `imported` count still reflects the full parsed body.
const IMPORT_PREVIEW_LIMIT: usize = 20;

struct Principal {
    id: String,
    org_id: String,
}

fn principal(headers: &HeaderMap) -> Principal {
    let id = headers
        .get("x-principal")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    let org_id = headers
        .get("x-org-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default")
        .to_string();
    Principal { id, org_id }
}

fn require(
    state: &AppState,
    principal: &Principal,
    action: Action,
    table_id: Option<&str>,
    db_id: Option<&str>,
    request_id: &str,
) -> Result<Role, ApiError> {
    let role = state
        .rbac
        .role_for(&principal.id, table_id, db_id, Some(&principal.org_id))
        .unwrap_or(Role::Viewer);
    if guildnet_rbac::allow(role, action) {
        Ok(role)
    } else {
        Err(ApiError::forbidden(&format!("{action:?}"), request_id))
    }
}

fn rid(ext: &RequestId) -> &str {
    &ext.0
}

// ---- databases ------------------------------------------------------

#[derive(Serialize)]
struct DatabaseList {
    databases: Vec<String>,
}

pub async fn list_databases(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<Json<DatabaseList>, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::RowRead, None, None, rid(&request_id))?;
    let databases = state
        .db
        .list_databases(&p.org_id)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok(Json(DatabaseList { databases }))
}

#[derive(Deserialize)]
pub struct CreateDatabaseRequest {
    pub name: String,
}

pub async fn create_database(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Json(body): Json<CreateDatabaseRequest>,
) -> Result<(StatusCode, Json<DatabaseInstance>), ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::DbManage, None, Some(&body.name), rid(&request_id))?;
    let instance = state
        .db
        .ensure_database(&p.org_id, &body.name)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn get_database(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::RowRead, None, Some(&db_name), rid(&request_id))?;
    let databases = state
        .db
        .list_databases(&p.org_id)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    if databases.iter().any(|d| d == &db_name) {
        Ok(Json(serde_json::json!({ "name": db_name })))
    } else {
        Err(ApiError::not_found("database", rid(&request_id)))
    }
}

pub async fn delete_database(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<StatusCode, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::DbManage, None, Some(&db_name), rid(&request_id))?;
    state
        .db
        .drop_database(&p.org_id, &db_name)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- tables -----------------------------------------------------------

pub async fn list_tables(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<Json<Vec<guildnet_db::Table>>, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::RowRead, None, Some(&db_name), rid(&request_id))?;
    let tables = state
        .db
        .list_tables(&p.org_id, &db_name)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok(Json(tables))
}

#[derive(Deserialize)]
pub struct CreateTableRequest {
    pub name: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub schema: Vec<ColumnDef>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

pub async fn create_table(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Json(body): Json<CreateTableRequest>,
) -> Result<(StatusCode, Json<guildnet_db::Table>), ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::TableManage, None, Some(&db_name), rid(&request_id))?;
    let table = state
        .db
        .create_table(&p.org_id, &db_name, &body.name, &body.primary_key, body.schema, &p.id)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok((StatusCode::CREATED, Json(table)))
}

pub async fn get_table(
    State(state): State<AppState>,
    Path((db_name, table_name)): Path<(String, String)>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<Json<guildnet_db::Table>, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::RowRead, Some(&table_name), Some(&db_name), rid(&request_id))?;
    let tables = state
        .db
        .list_tables(&p.org_id, &db_name)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    tables
        .into_iter()
        .find(|t| t.name == table_name)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("table", rid(&request_id)))
}

#[derive(Deserialize)]
pub struct UpdateTableRequest {
    pub primary_key: Option<String>,
    #[serde(default)]
    pub schema: Vec<ColumnDef>,
}

pub async fn update_table(
    State(state): State<AppState>,
    Path((db_name, table_name)): Path<(String, String)>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Json(body): Json<UpdateTableRequest>,
) -> Result<Json<guildnet_db::Table>, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::TableManage, Some(&table_name), Some(&db_name), rid(&request_id))?;
    let table = state
        .db
        .update_table_schema(&p.org_id, &db_name, &table_name, body.primary_key, body.schema, &p.id)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok(Json(table))
}

// ---- rows ---------------------------------------------------------------

#[derive(Serialize)]
pub struct RowPageResponse {
    rows: Vec<guildnet_db::backend::Row>,
    next: Option<String>,
}

pub async fn list_rows(
    State(state): State<AppState>,
    Path((db_name, table_name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<Json<RowPageResponse>, ApiError> {
    let p = principal(&headers);
    let role = require(&state, &p, Action::RowRead, Some(&table_name), Some(&db_name), rid(&request_id))?;

    let table = find_table(&state, &p, &db_name, &table_name, rid(&request_id)).await?;
    let limit: usize = query
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(1000);
    let ascending = query.get("ascending").map(|v| v != "0" && v != "false").unwrap_or(true);
    let cursor = query.get("cursor").cloned();

    let page = state
        .db
        .query_rows(&p.org_id, &db_name, &table_name, &table.primary_key, limit, cursor, ascending)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;

    let rows = page
        .rows
        .into_iter()
        .map(|row| guildnet_rbac::mask_row(role, &table.schema, row.into_iter().collect()))
        .collect();
    Ok(Json(RowPageResponse { rows, next: page.next }))
}

async fn find_table(
    state: &AppState,
    p: &Principal,
    db_name: &str,
    table_name: &str,
    request_id: &str,
) -> Result<guildnet_db::Table, ApiError> {
    let tables = state
        .db
        .list_tables(&p.org_id, db_name)
        .await
        .map_err(|e| ApiError::from_db_error(&e, request_id))?;
    tables
        .into_iter()
        .find(|t| t.name == table_name)
        .ok_or_else(|| ApiError::not_found("table", request_id))
}

#[derive(Deserialize)]
pub struct InsertRowsRequest {
    pub rows: Vec<guildnet_db::backend::Row>,
}

#[derive(Serialize)]
pub struct InsertRowsResponse {
    ids: Vec<String>,
}

pub async fn insert_rows(
    State(state): State<AppState>,
    Path((db_name, table_name)): Path<(String, String)>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Json(body): Json<InsertRowsRequest>,
) -> Result<(StatusCode, Json<InsertRowsResponse>), ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::RowWrite, Some(&table_name), Some(&db_name), rid(&request_id))?;
    let table = find_table(&state, &p, &db_name, &table_name, rid(&request_id)).await?;
    let ids = state
        .db
        .insert_rows(&p.org_id, &db_name, &table_name, &table.primary_key, body.rows, &p.id)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok((StatusCode::CREATED, Json(InsertRowsResponse { ids })))
}

pub async fn update_row(
    State(state): State<AppState>,
    Path((db_name, table_name, row_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Json(patch): Json<guildnet_db::backend::Row>,
) -> Result<StatusCode, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::RowWrite, Some(&table_name), Some(&db_name), rid(&request_id))?;
    let table = find_table(&state, &p, &db_name, &table_name, rid(&request_id)).await?;
    state
        .db
        .update_row(&p.org_id, &db_name, &table_name, &table.primary_key, &row_id, patch, &p.id)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_row(
    State(state): State<AppState>,
    Path((db_name, table_name, row_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<StatusCode, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::RowWrite, Some(&table_name), Some(&db_name), rid(&request_id))?;
    let table = find_table(&state, &p, &db_name, &table_name, rid(&request_id)).await?;
    state
        .db
        .delete_row(&p.org_id, &db_name, &table_name, &table.primary_key, &row_id, &p.id)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- import / export ----------------------------------------------------

#[derive(Serialize)]
pub struct ImportPreviewRow {
    row_number: usize,
    row: guildnet_db::backend::Row,
}

#[derive(Serialize)]
pub struct ImportResponse {
    imported: usize,
    dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview: Option<Vec<ImportPreviewRow>>,
}

/// Splits one CSV line into fields, honoring double-quote-escaped quotes
/// and commas/newlines embedded in a quoted field — the inverse of
/// [`value_to_csv_field`].
fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => fields.push(std::mem::take(&mut field)),
                _ => field.push(c),
            }
        }
    }
    fields.push(field);
    fields
}

/// Parses a full CSV body into rows, renaming header columns through
/// `mapping` (CSV column name -> target field name) before building each
/// row. Every CSV value is imported as a JSON string; callers relying on
/// typed columns should follow up with a schema-aware `update_row`.
fn parse_csv_rows(body: &str, mapping: &HashMap<String, String>) -> Result<Vec<guildnet_db::backend::Row>, String> {
    let mut lines = body.lines();
    let header_line = lines.next().ok_or_else(|| "CSV body is empty".to_string())?;
    let headers: Vec<String> = parse_csv_line(header_line)
        .into_iter()
        .map(|h| mapping.get(&h).cloned().unwrap_or(h))
        .collect();

    let mut rows = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let fields = parse_csv_line(line);
        if fields.len() != headers.len() {
            return Err(format!(
                "row has {} fields, expected {} (matching the header)",
                fields.len(),
                headers.len()
            ));
        }
        let mut row = guildnet_db::backend::Row::new();
        for (header, field) in headers.iter().zip(fields) {
            row.insert(header.clone(), serde_json::Value::String(field));
        }
        rows.push(row);
    }
    Ok(rows)
}

pub async fn import_rows(
    State(state): State<AppState>,
    Path((db_name, table_name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
    body: axum::body::Bytes,
) -> Result<Json<ImportResponse>, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::RowWrite, Some(&table_name), Some(&db_name), rid(&request_id))?;
    let dry_run = query.get("dry_run").map(|v| v == "1" || v == "true").unwrap_or(false);

    let is_csv = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/csv"))
        .unwrap_or(false);

    let rows = if is_csv {
        let mapping: HashMap<String, String> = match query.get("mapping") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| ApiError::bad_request(format!("invalid mapping: {e}"), rid(&request_id)))?,
            None => HashMap::new(),
        };
        let body_str = std::str::from_utf8(&body)
            .map_err(|e| ApiError::bad_request(format!("CSV body is not valid utf-8: {e}"), rid(&request_id)))?;
        parse_csv_rows(body_str, &mapping).map_err(|e| ApiError::bad_request(e, rid(&request_id)))?
    } else {
        let parsed: InsertRowsRequest = serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}"), rid(&request_id)))?;
        parsed.rows
    };

    if dry_run {
        let preview = rows
            .iter()
            .take(IMPORT_PREVIEW_LIMIT)
            .enumerate()
            .map(|(i, row)| ImportPreviewRow { row_number: i + 1, row: row.clone() })
            .collect();
        return Ok(Json(ImportResponse { imported: rows.len(), dry_run: true, preview: Some(preview) }));
    }

    let table = find_table(&state, &p, &db_name, &table_name, rid(&request_id)).await?;
    let ids = state
        .db
        .insert_rows(&p.org_id, &db_name, &table_name, &table.primary_key, rows, &p.id)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok(Json(ImportResponse { imported: ids.len(), dry_run: false, preview: None }))
}

pub async fn export_rows(
    State(state): State<AppState>,
    Path((db_name, table_name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<Response, ApiError> {
    let p = principal(&headers);
    let role = require(&state, &p, Action::RowRead, Some(&table_name), Some(&db_name), rid(&request_id))?;
    let table = find_table(&state, &p, &db_name, &table_name, rid(&request_id)).await?;
    let limit: usize = query
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_EXPORT_LIMIT);
    let format = query.get("format").map(String::as_str).unwrap_or("json");

    let page = state
        .db
        .query_rows(&p.org_id, &db_name, &table_name, &table.primary_key, limit, None, true)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    let rows: Vec<_> = page
        .rows
        .into_iter()
        .map(|row| guildnet_rbac::mask_row(role, &table.schema, row.into_iter().collect()))
        .collect();

    match format {
        "csv" => Ok((StatusCode::OK, [("content-type", "text/csv")], rows_to_csv(&table.schema, &rows)).into_response()),
        _ => Ok(Json(rows).into_response()),
    }
}

fn rows_to_csv(schema: &[ColumnDef], rows: &[guildnet_db::backend::Row]) -> String {
    let columns: Vec<&str> = schema.iter().map(|c| c.name.as_str()).collect();
    let mut out = columns.join(",");
    out.push('\n');
    for row in rows {
        let line: Vec<String> = columns
            .iter()
            .map(|c| row.get(*c).map(value_to_csv_field).unwrap_or_default())
            .collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn value_to_csv_field(value: &serde_json::Value) -> String {
    let raw = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}

// ---- audit ---------------------------------------------------------------

pub async fn list_audit(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<Json<Vec<guildnet_db::AuditEvent>>, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::TableManage, None, Some(&db_name), rid(&request_id))?;
    let limit: usize = query
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .min(DEFAULT_AUDIT_LIMIT);
    let events = state
        .db
        .list_audit(&p.org_id, &db_name, limit)
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok(Json(events))
}

// ---- permissions -----------------------------------------------------

#[derive(Serialize)]
pub struct BindingResponse {
    principal: String,
    role: Role,
}

pub async fn list_permissions(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<Json<Vec<BindingResponse>>, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::DbManage, None, Some(&db_name), rid(&request_id))?;
    let bindings = state
        .rbac
        .list(&Scope::Db(db_name))
        .into_iter()
        .map(|b| BindingResponse { principal: b.principal, role: b.role })
        .collect();
    Ok(Json(bindings))
}

#[derive(Deserialize)]
pub struct GrantRequest {
    pub principal: String,
    pub role: Role,
}

pub async fn grant_permission(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Json(body): Json<GrantRequest>,
) -> Result<StatusCode, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::DbManage, None, Some(&db_name), rid(&request_id))?;
    state.rbac.grant(Scope::Db(db_name), &body.principal, body.role);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct RevokeQuery {
    pub principal: String,
}

pub async fn revoke_permission(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    Query(query): Query<RevokeQuery>,
    headers: HeaderMap,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<StatusCode, ApiError> {
    let p = principal(&headers);
    require(&state, &p, Action::DbManage, None, Some(&db_name), rid(&request_id))?;
    state.rbac.revoke(&Scope::Db(db_name), &query.principal);
    Ok(StatusCode::NO_CONTENT)
}

// ---- health ---------------------------------------------------------------

pub async fn health(
    State(state): State<AppState>,
    axum::Extension(request_id): axum::Extension<RequestId>,
) -> Result<StatusCode, ApiError> {
    state
        .db
        .ping()
        .await
        .map_err(|e| ApiError::from_db_error(&e, rid(&request_id)))?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv_line_splits_on_commas() {
        assert_eq!(parse_csv_line("a,b,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_csv_line_honors_quoted_commas_and_escaped_quotes() {
        let fields = parse_csv_line(r#"a,"b, c",he said ""hi"""#);
        assert_eq!(fields, vec!["a", "b, c", r#"he said "hi""#]);
    }

    #[test]
    fn parse_csv_rows_renames_headers_via_mapping() {
        let mut mapping = HashMap::new();
        mapping.insert("Name".to_string(), "name".to_string());

        let rows = parse_csv_rows("Name,age\nalice,30\nbob,40\n", &mapping).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("name").and_then(|v| v.as_str()), Some("alice"));
        assert_eq!(rows[0].get("age").and_then(|v| v.as_str()), Some("30"));
    }

    #[test]
    fn parse_csv_rows_rejects_ragged_rows() {
        let err = parse_csv_rows("a,b\n1\n", &HashMap::new()).unwrap_err();
        assert!(err.contains("expected"));
    }
}
