//! In-memory RBAC (C8): role bindings keyed by scope, table→db→org fallback,
//! and row masking.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Editor,
    Maintainer,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RowRead,
    RowWrite,
    TableManage,
    DbManage,
}

/// A binding scope: an org, a database, or a table, each identified by its
/// tenant-visible name (the spec fixes `id == name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Scope {
    Org(String),
    Db(String),
    Table(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub principal: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Allow matrix from the spec's RBAC table. `Admin` and `Maintainer`
/// implicitly allow everything below them.
pub fn allow(role: Role, action: Action) -> bool {
    match action {
        Action::RowRead => true,
        Action::RowWrite => role >= Role::Editor,
        Action::TableManage | Action::DbManage => role >= Role::Maintainer,
    }
}

#[derive(Default)]
pub struct Rbac {
    bindings: RwLock<HashMap<Scope, Vec<Binding>>>,
}

impl Rbac {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Upsert a binding for `(scope, principal)`.
    pub fn grant(&self, scope: Scope, principal: &str, role: Role) {
        let mut bindings = self.bindings.write().unwrap();
        let entries = bindings.entry(scope).or_default();
        if let Some(existing) = entries.iter_mut().find(|b| b.principal == principal) {
            existing.role = role;
        } else {
            entries.push(Binding {
                principal: principal.to_string(),
                role,
                created_at: Utc::now(),
            });
        }
    }

    pub fn revoke(&self, scope: &Scope, principal: &str) {
        let mut bindings = self.bindings.write().unwrap();
        if let Some(entries) = bindings.get_mut(scope) {
            entries.retain(|b| b.principal != principal);
        }
    }

    pub fn list(&self, scope: &Scope) -> Vec<Binding> {
        self.bindings
            .read()
            .unwrap()
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    fn role_at(&self, scope: &Scope, principal: &str) -> Option<Role> {
        self.bindings
            .read()
            .unwrap()
            .get(scope)?
            .iter()
            .find(|b| b.principal == principal)
            .map(|b| b.role)
    }

    /// Most specific role for `principal`, falling back table → db → org.
    /// The API layer is responsible for supplying the org scope fallback
    /// when no cluster/db context narrows it further.
    pub fn role_for(
        &self,
        principal: &str,
        table_id: Option<&str>,
        db_id: Option<&str>,
        org_id: Option<&str>,
    ) -> Option<Role> {
        if let Some(table_id) = table_id {
            if let Some(role) = self.role_at(&Scope::Table(table_id.to_string()), principal) {
                return Some(role);
            }
        }
        if let Some(db_id) = db_id {
            if let Some(role) = self.role_at(&Scope::Db(db_id.to_string()), principal) {
                return Some(role);
            }
        }
        if let Some(org_id) = org_id {
            if let Some(role) = self.role_at(&Scope::Org(org_id.to_string()), principal) {
                return Some(role);
            }
        }
        None
    }
}

/// Mask a row's values for columns flagged `mask: true`, unless the role is
/// maintainer/admin. Columns not present in `schema` are left unchanged.
pub fn mask_row(
    role: Role,
    schema: &[guildnet_db::ColumnDef],
    row: guildnet_db::backend::Row,
) -> guildnet_db::backend::Row {
    if role >= Role::Maintainer {
        return row;
    }
    let masked: std::collections::HashSet<&str> = schema
        .iter()
        .filter(|c| c.mask)
        .map(|c| c.name.as_str())
        .collect();
    row.into_iter()
        .map(|(k, v)| {
            if masked.contains(k.as_str()) {
                (k, serde_json::Value::String("***".to_string()))
            } else {
                (k, v)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use guildnet_db::ColumnType;

    fn schema() -> Vec<guildnet_db::ColumnDef> {
        vec![
            guildnet_db::ColumnDef {
                name: "email".into(),
                column_type: ColumnType::String,
                required: false,
                unique: false,
                indexed: false,
                default: None,
                r#enum: vec![],
                regex: None,
                mask: true,
            },
            guildnet_db::ColumnDef {
                name: "name".into(),
                column_type: ColumnType::String,
                required: false,
                unique: false,
                indexed: false,
                default: None,
                r#enum: vec![],
                regex: None,
                mask: false,
            },
        ]
    }

    fn row() -> guildnet_db::backend::Row {
        let mut r = guildnet_db::backend::Row::new();
        r.insert("email".into(), serde_json::json!("a@b.com"));
        r.insert("name".into(), serde_json::json!("Alice"));
        r
    }

    #[test]
    fn allow_matrix_matches_spec_table() {
        assert!(allow(Role::Viewer, Action::RowRead));
        assert!(!allow(Role::Viewer, Action::RowWrite));
        assert!(allow(Role::Editor, Action::RowWrite));
        assert!(!allow(Role::Editor, Action::TableManage));
        assert!(allow(Role::Maintainer, Action::TableManage));
        assert!(allow(Role::Admin, Action::DbManage));
    }

    #[test]
    fn role_for_falls_back_table_then_db_then_org() {
        let rbac = Rbac::new();
        rbac.grant(Scope::Org("acme".into()), "alice", Role::Viewer);
        assert_eq!(
            rbac.role_for("alice", Some("events"), Some("widgets"), Some("acme")),
            Some(Role::Viewer)
        );

        rbac.grant(Scope::Db("widgets".into()), "alice", Role::Editor);
        assert_eq!(
            rbac.role_for("alice", Some("events"), Some("widgets"), Some("acme")),
            Some(Role::Editor)
        );

        rbac.grant(Scope::Table("events".into()), "alice", Role::Admin);
        assert_eq!(
            rbac.role_for("alice", Some("events"), Some("widgets"), Some("acme")),
            Some(Role::Admin)
        );
    }

    #[test]
    fn mask_row_hides_masked_columns_for_viewer_and_editor() {
        let masked = mask_row(Role::Viewer, &schema(), row());
        assert_eq!(masked.get("email").unwrap(), "***");
        assert_eq!(masked.get("name").unwrap(), "Alice");
    }

    #[test]
    fn mask_row_passes_through_for_maintainer_and_admin() {
        let untouched = mask_row(Role::Admin, &schema(), row());
        assert_eq!(untouched.get("email").unwrap(), "a@b.com");
    }

    #[test]
    fn revoke_removes_binding() {
        let rbac = Rbac::new();
        let scope = Scope::Org("acme".into());
        rbac.grant(scope.clone(), "alice", Role::Viewer);
        rbac.revoke(&scope, "alice");
        assert_eq!(rbac.role_for("alice", None, None, Some("acme")), None);
    }
}
