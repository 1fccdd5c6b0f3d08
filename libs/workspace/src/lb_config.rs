//! Polls the `guildnet-cluster-settings` ConfigMap for `workspace_lb_enabled`
//! and keeps an in-memory flag that every Workspace reconcile reads fresh.
//! When the flag actually changes value, every Workspace gets a
//! `guildnet.io/config-hash` annotation bump so the next reconcile re-applies
//! its Service with the new exposure default.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{trace, warn};

use crate::crd::Workspace;
use crate::reconcile::OPERATOR_NAME;

const CONFIGMAP_NAMESPACE: &str = "guildnet-system";
const CONFIGMAP_NAME: &str = "guildnet-cluster-settings";
const CONFIGMAP_KEY: &str = "workspace_lb_enabled";
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const ENV_DEFAULT: &str = "WORKSPACE_LB_DEFAULT";

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn env_default() -> bool {
    std::env::var(ENV_DEFAULT)
        .ok()
        .and_then(|v| parse_flag(&v))
        .unwrap_or(false)
}

async fn read_configmap_flag(client: &Client) -> Option<bool> {
    let api = Api::<k8s_openapi::api::core::v1::ConfigMap>::namespaced(client.clone(), CONFIGMAP_NAMESPACE);
    let configmap = api.get_opt(CONFIGMAP_NAME).await.ok().flatten()?;
    let raw = configmap.data?.get(CONFIGMAP_KEY)?.clone();
    parse_flag(&raw)
}

async fn bump_config_hash(client: &Client, timestamp: i64) {
    let api = Api::<Workspace>::all(client.clone());
    let workspaces = match api.list(&Default::default()).await {
        Ok(list) => list,
        Err(e) => {
            warn!(msg = "failed to list workspaces for config-hash bump", %e);
            return;
        }
    };
    for workspace in workspaces {
        let namespace = match workspace.namespace() {
            Some(ns) => ns,
            None => continue,
        };
        let namespaced = Api::<Workspace>::namespaced(client.clone(), &namespace);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { "guildnet.io/config-hash": timestamp.to_string() }
            }
        });
        if let Err(e) = namespaced
            .patch(
                &workspace.name_any(),
                &PatchParams::apply(OPERATOR_NAME).force(),
                &Patch::Merge(patch),
            )
            .await
        {
            warn!(msg = "failed to bump config-hash annotation", name = %workspace.name_any(), %e);
        }
    }
}

/// Runs until the process exits. Intended to be spawned once per process,
/// not per cluster, since `workspace_lb_enabled` is a cluster-wide default.
pub async fn run(client: Client, flag: Arc<AtomicBool>, now_unix: impl Fn() -> i64 + Send + 'static) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        interval.tick().await;
        let desired = match read_configmap_flag(&client).await {
            Some(v) => v,
            None => env_default(),
        };
        let previous = flag.swap(desired, Ordering::Relaxed);
        if previous != desired {
            trace!(msg = "workspace_lb_enabled changed", previous, desired);
            bump_config_hash(&client, now_unix()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flag_accepts_known_spellings() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("true"), Some(true));
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("false"), Some(false));
        assert_eq!(parse_flag("no"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
