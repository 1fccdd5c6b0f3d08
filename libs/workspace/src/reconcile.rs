use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use guildnet_core::controller::context::{BackoffContext, Context, KubeOperations};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, trace, warn};

use crate::crd::{Phase, Workspace, WorkspaceStatus};
use crate::desired::{self, DesiredDeployment};
use crate::error::{Error, Result};

pub const OPERATOR_NAME: &str = "workspaces.guildnet.io";
const VERIFY_ATTEMPTS: u32 = 5;
const VERIFY_INTERVAL: Duration = Duration::from_millis(500);
const RECREATE_POLL_ATTEMPTS: u32 = 20;
const RECREATE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// `Context<Workspace>` plus the live `workspace_lb_enabled` flag maintained
/// by the ConfigMap poller (`lb_config`). The flag is read fresh on every
/// reconcile so a ConfigMap change takes effect without restarting pods.
#[derive(Clone)]
pub struct WorkspaceCtx {
    pub inner: Arc<Context<Workspace>>,
    pub lb_default: Arc<AtomicBool>,
}

impl BackoffContext<Workspace> for WorkspaceCtx {
    fn metrics(&self) -> &Arc<guildnet_core::metrics::ControllerMetrics> {
        self.inner.metrics()
    }

    async fn get_backoff(&self, obj_ref: ObjectRef<Workspace>) -> Duration {
        self.inner.get_backoff(obj_ref).await
    }

    async fn reset_backoff(&self, obj_ref: ObjectRef<Workspace>) {
        self.inner.reset_backoff(obj_ref).await
    }
}

fn pod_spec_matches(current: &Deployment, desired: &Deployment) -> bool {
    let current_pod = current
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref());
    let desired_pod = desired.spec.as_ref().and_then(|s| s.template.spec.as_ref());
    let (current_pod, desired_pod) = match (current_pod, desired_pod) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };

    if current_pod.init_containers.is_some() != desired_pod.init_containers.is_some() {
        return false;
    }
    if current_pod.security_context != desired_pod.security_context {
        return false;
    }

    let current_container = current_pod.containers.first();
    let desired_container = desired_pod.containers.first();
    match (current_container, desired_container) {
        (Some(a), Some(b)) => a.image == b.image && a.security_context == b.security_context,
        _ => false,
    }
}

fn set_owner_reference(workspace: &Workspace, meta: &mut kube::api::ObjectMeta) {
    if let Some(owner_ref) = workspace.controller_owner_ref(&()) {
        meta.owner_references = Some(vec![owner_ref]);
    }
}

async fn ensure_deployment(
    workspace: &Workspace,
    ctx: &WorkspaceCtx,
    desired: &DesiredDeployment,
) -> Result<Deployment> {
    let namespace = workspace
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(workspace.name_any()))?;
    let client = ctx.inner.client.clone();
    let metrics = ctx.inner.metrics();

    let mut wanted = desired.deployment.clone();
    set_owner_reference(workspace, &mut wanted.metadata);

    let mut applied = workspace
        .kube_apply(client.clone(), metrics, wanted.clone(), OPERATOR_NAME)
        .await?;

    let api = Api::<Deployment>::namespaced(client.clone(), &namespace);
    for attempt in 0..VERIFY_ATTEMPTS {
        if pod_spec_matches(&applied, &wanted) {
            return Ok(applied);
        }
        trace!(
            msg = "deployment drifted from desired state, repairing",
            name = %workspace.name_any(),
            attempt,
        );
        tokio::time::sleep(VERIFY_INTERVAL).await;
        applied = workspace
            .kube_apply(client.clone(), metrics, wanted.clone(), OPERATOR_NAME)
            .await?;
    }

    if pod_spec_matches(&applied, &wanted) {
        return Ok(applied);
    }

    warn!(
        msg = "deployment would not converge after repeated apply, recreating",
        name = %workspace.name_any(),
    );
    let name = wanted.name_any();
    api.delete(&name, &kube::api::DeleteParams::foreground())
        .await
        .ok();
    for _ in 0..RECREATE_POLL_ATTEMPTS {
        if api.get_opt(&name).await?.is_none() {
            break;
        }
        tokio::time::sleep(RECREATE_POLL_INTERVAL).await;
    }
    workspace
        .kube_apply(client, metrics, wanted, OPERATOR_NAME)
        .await
        .map_err(Error::from)
}

async fn ensure_service(
    workspace: &Workspace,
    ctx: &WorkspaceCtx,
    first_port: i32,
) -> Result<Service> {
    let lb_default = ctx.lb_default.load(Ordering::Relaxed);
    let mut wanted = desired::build_service(workspace, first_port, lb_default);
    set_owner_reference(workspace, &mut wanted.metadata);
    workspace
        .kube_apply(ctx.inner.client.clone(), ctx.inner.metrics(), wanted, OPERATOR_NAME)
        .await
        .map_err(Error::from)
}

fn status_from(deployment: &Deployment, service: &Service, terminating: bool, first_port: i32) -> WorkspaceStatus {
    let ready_replicas = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let phase = if terminating {
        Phase::Terminating
    } else if ready_replicas > 0 {
        Phase::Running
    } else {
        Phase::Pending
    };
    let service_ip = service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .filter(|ip| ip != "None");
    let service_dns = service
        .metadata
        .name
        .as_ref()
        .zip(service.metadata.namespace.as_ref())
        .map(|(name, namespace)| format!("{name}.{namespace}.svc"));
    let proxy_target = service_dns
        .as_ref()
        .map(|dns| format!("http://{dns}:{first_port}"));

    WorkspaceStatus {
        phase,
        ready_replicas,
        service_dns,
        service_ip,
        proxy_target,
    }
}

async fn patch_status(workspace: &Workspace, ctx: &WorkspaceCtx, status: WorkspaceStatus) -> Result<()> {
    let namespace = workspace
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(workspace.name_any()))?;
    let api = Api::<Workspace>::namespaced(ctx.inner.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &workspace.name_any(),
        &PatchParams::apply(OPERATOR_NAME).force(),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}

#[instrument(skip(ctx, workspace))]
pub async fn reconcile_workspace(workspace: Arc<Workspace>, ctx: Arc<WorkspaceCtx>) -> Result<Action> {
    let _timer = ctx.metrics().reconcile_count_and_measure();
    info!(msg = "reconciling workspace", name = %workspace.name_any());

    let desired_deployment = desired::build_deployment(&workspace, ctx.lb_default.load(Ordering::Relaxed));
    let deployment = ensure_deployment(&workspace, &ctx, &desired_deployment).await?;
    let service = ensure_service(&workspace, &ctx, desired_deployment.first_port).await?;

    let terminating = workspace.meta().deletion_timestamp.is_some();
    let status = status_from(&deployment, &service, terminating, desired_deployment.first_port);
    patch_status(&workspace, &ctx, status).await?;

    Ok(Action::requeue(guildnet_core::controller::DEFAULT_RECONCILE_INTERVAL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::WorkspaceSpec;
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    fn workspace() -> Workspace {
        let mut ws = Workspace::new(
            "demo",
            WorkspaceSpec {
                image: "codercom/code-server:latest".to_string(),
                ..Default::default()
            },
        );
        ws.meta_mut().namespace = Some("default".to_string());
        ws
    }

    #[test]
    fn pod_spec_matches_detects_image_drift() {
        let ws = workspace();
        let desired = desired::build_deployment(&ws, false).deployment;
        let mut drifted = desired.clone();
        drifted.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].image =
            Some("other:latest".to_string());
        assert!(!pod_spec_matches(&drifted, &desired));
        assert!(pod_spec_matches(&desired, &desired));
    }

    #[test]
    fn status_is_running_once_replicas_are_ready() {
        let mut deployment = Deployment::default();
        deployment.status = Some(DeploymentStatus {
            ready_replicas: Some(1),
            ..Default::default()
        });
        let mut service = Service::default();
        service.metadata.name = Some("demo".to_string());
        service.metadata.namespace = Some("default".to_string());

        let status = status_from(&deployment, &service, false, 8080);
        assert_eq!(status.phase, Phase::Running);
        assert_eq!(status.service_dns.as_deref(), Some("demo.default.svc"));
        assert_eq!(status.proxy_target.as_deref(), Some("http://demo.default.svc:8080"));
    }

    #[test]
    fn status_is_terminating_when_deletion_timestamp_is_set() {
        let deployment = Deployment::default();
        let service = Service::default();
        let status = status_from(&deployment, &service, true, 8080);
        assert_eq!(status.phase, Phase::Terminating);
    }
}
