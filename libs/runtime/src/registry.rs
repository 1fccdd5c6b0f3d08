use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use guildnet_kvstore::KvStore;
use kube::{Client, Config};
use prometheus_client::registry::Registry as MetricsRegistry;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::instance::{DbDialer, Instance, KV_BUCKETS};
use crate::mesh::MeshDialer;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no kubeconfig available for cluster {0:?}")]
    MissingKubeconfig(String),
    #[error("failed to build kubeconfig: {0}")]
    InvalidKubeconfig(String),
    #[error("failed to open local state store: {0}")]
    Kv(#[from] guildnet_kvstore::Error),
    #[error("failed to build kubernetes client: {0}")]
    Kube(#[from] kube::Error),
}

/// Resolves a normalized cluster ID to raw kubeconfig bytes. The Registry
/// never guesses a kubeconfig path on its own — callers (the CLI, a
/// database-backed cluster store) own that policy.
#[async_trait::async_trait]
pub trait KubeconfigResolver: Send + Sync {
    async fn resolve(&self, id: &str) -> Option<Vec<u8>>;
}

/// Constructs a mesh connector for a cluster's settings, if its settings
/// carry a login server or auth key. Returning `None` is the common case
/// (no mesh configured) and is not an error.
#[async_trait::async_trait]
pub trait MeshFactory: Send + Sync {
    async fn build(&self, id: &str) -> Option<Arc<dyn MeshDialer>>;
}

/// Process-wide, singleton-per-process cluster registry (C6), guarded by a
/// single read/write lock over normalized cluster IDs.
pub struct Registry {
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    state_dir: std::path::PathBuf,
    resolver: Arc<dyn KubeconfigResolver>,
    mesh_factory: Arc<dyn MeshFactory>,
    dialer: DbDialer,
    ping_interval: Duration,
    metrics: Arc<tokio::sync::Mutex<MetricsRegistry>>,
}

impl Registry {
    pub fn new(
        state_dir: std::path::PathBuf,
        resolver: Arc<dyn KubeconfigResolver>,
        mesh_factory: Arc<dyn MeshFactory>,
        dialer: DbDialer,
        ping_interval: Duration,
        metrics: Arc<tokio::sync::Mutex<MetricsRegistry>>,
    ) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            state_dir,
            resolver,
            mesh_factory,
            dialer,
            ping_interval,
            metrics,
        }
    }

    /// Fast path: read-lock and return an existing Instance. Slow path:
    /// write-lock, double-check, then build one from scratch.
    pub async fn get(&self, raw_id: &str) -> Result<Arc<Instance>, Error> {
        let id = guildnet_sanitize::normal_id(raw_id);

        if let Some(existing) = self.instances.read().await.get(&id) {
            return Ok(existing.clone());
        }

        let mut instances = self.instances.write().await;
        if let Some(existing) = instances.get(&id) {
            return Ok(existing.clone());
        }

        let kubeconfig = self
            .resolver
            .resolve(&id)
            .await
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::MissingKubeconfig(id.clone()))?;

        let kv = KvStore::open(&self.state_dir, &id).await?;
        kv.ensure_buckets(KV_BUCKETS).await?;

        let mesh = self.mesh_factory.build(&id).await;

        let kube_config = Config::from_custom_kubeconfig(
            kube::config::Kubeconfig::from_yaml(
                std::str::from_utf8(&kubeconfig).map_err(|e| Error::InvalidKubeconfig(e.to_string()))?,
            )
            .map_err(|e| Error::InvalidKubeconfig(e.to_string()))?,
            &Default::default(),
        )
        .await
        .map_err(|e| Error::InvalidKubeconfig(e.to_string()))?;

        let client = {
            let mut registry = self.metrics.lock().await;
            guildnet_k8s_util::client::new_client_with_metrics(kube_config, &mut registry).await?
        };

        let instance = Arc::new(Instance::new(
            id.clone(),
            client,
            kv,
            mesh,
            self.dialer.clone(),
            self.ping_interval,
        ));

        let monitor_handle = tokio::spawn(instance.clone().run_monitor());
        instance.set_monitor_handle(monitor_handle).await;

        info!(msg = "cluster instance started", cluster = %id);
        instances.insert(id, instance.clone());
        Ok(instance)
    }

    /// Cancel, close and remove the Instance for `id`, if present.
    pub async fn close(&self, raw_id: &str) {
        let id = guildnet_sanitize::normal_id(raw_id);
        let instance = self.instances.write().await.remove(&id);
        if let Some(instance) = instance {
            instance.close().await;
            info!(msg = "cluster instance closed", cluster = %id);
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticResolver(Option<Vec<u8>>);

    #[async_trait::async_trait]
    impl KubeconfigResolver for StaticResolver {
        async fn resolve(&self, _id: &str) -> Option<Vec<u8>> {
            self.0.clone()
        }
    }

    struct NoMesh;

    #[async_trait::async_trait]
    impl MeshFactory for NoMesh {
        async fn build(&self, _id: &str) -> Option<Arc<dyn MeshDialer>> {
            None
        }
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Registry::new(
            tmp.path().to_path_buf(),
            Arc::new(StaticResolver(None)),
            Arc::new(NoMesh),
            Arc::new(|_addr: String, _user: String, _pass: String| {
                Box::pin(async { Err(guildnet_db::Error::NotConnected) })
                    as std::pin::Pin<
                        Box<dyn std::future::Future<Output = Result<guildnet_db::DbManager, guildnet_db::Error>> + Send>,
                    >
            }),
            Duration::from_secs(5),
            Arc::new(tokio::sync::Mutex::new(MetricsRegistry::default())),
        );

        let err = registry.get("missing").await.unwrap_err();
        assert!(matches!(err, Error::MissingKubeconfig(_)));
    }
}
