//! Glue between the multi-cluster runtime and the two traits
//! `guildnet-runtime` and `guildnet-proxy` leave for the binary to supply:
//! where a cluster's kubeconfig comes from, and how a logical workspace id
//! resolves to a concrete proxy target.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use guildnet_proxy::ResolveServer;
use guildnet_runtime::{KubeconfigResolver, MeshDialer, MeshFactory};
use kube::api::Api;
use kube::Client;
use tracing::debug;

/// Reads `<dir>/<id>.yaml` kubeconfig files from disk. A database-backed
/// resolver (reading from the cluster-settings KV bucket) is the production
/// path; this one covers single-operator and development deployments.
pub struct FileKubeconfigResolver {
    dir: PathBuf,
}

impl FileKubeconfigResolver {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl KubeconfigResolver for FileKubeconfigResolver {
    async fn resolve(&self, id: &str) -> Option<Vec<u8>> {
        let path = self.dir.join(format!("{id}.yaml"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(msg = "no kubeconfig on disk for cluster", cluster = id, error = %e);
                None
            }
        }
    }
}

/// No cluster in this deployment has a mesh sidecar configured yet; every
/// proxy request for it falls back to the direct/API-server-proxy
/// transport. A real factory would read the cluster's settings bucket for
/// a login server and auth key.
pub struct NoMeshFactory;

#[async_trait]
impl MeshFactory for NoMeshFactory {
    async fn build(&self, _id: &str) -> Option<Arc<dyn MeshDialer>> {
        None
    }
}

/// Resolves a workspace name (the proxy's form-3 logical id) to the
/// `scheme://host:port` its reconciler already computed and wrote to
/// `status.proxy_target`, by reading the `Workspace`'s status subresource
/// directly.
pub struct WorkspaceResolver {
    pub client: Client,
    pub namespace: String,
}

#[async_trait]
impl ResolveServer for WorkspaceResolver {
    async fn resolve(&self, id: &str, sub_path: &str) -> Option<(String, String, String)> {
        let api: Api<guildnet_workspace::Workspace> = Api::namespaced(self.client.clone(), &self.namespace);
        let workspace = api.get(id).await.ok()?;
        let status = workspace.status?;
        let target = status.proxy_target?;
        let (scheme, hostport) = target.split_once("://")?;
        Some((scheme.to_string(), hostport.to_string(), format!("/{sub_path}")))
    }
}
