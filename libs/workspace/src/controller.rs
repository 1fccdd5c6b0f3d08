use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use guildnet_core::backoff_reconciler;
use guildnet_core::controller::context::BackoffContext;
use guildnet_core::controller::{check_api_queryable, ControllerId, State};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use tracing::info;

use crate::crd::Workspace;
use crate::error::Error;
use crate::lb_config;
use crate::reconcile::{reconcile_workspace, WorkspaceCtx};

pub const CONTROLLER_ID: ControllerId = "workspace";

fn error_policy(_obj: Arc<Workspace>, _error: &Error, _ctx: Arc<WorkspaceCtx>) -> Action {
    unreachable!("handled inside backoff_reconciler!")
}

/// Starts the Workspace controller and the `workspace_lb_enabled` ConfigMap
/// poller. Runs until the process receives a shutdown signal.
pub async fn run(state: State, client: Client, now_unix: impl Fn() -> i64 + Send + 'static) {
    let workspace = check_api_queryable::<Workspace>(client.clone()).await;
    let deployment = check_api_queryable::<Deployment>(client.clone()).await;
    let service = check_api_queryable::<Service>(client.clone()).await;

    let lb_default = Arc::new(AtomicBool::new(false));
    let lb_poller = lb_config::run(client.clone(), lb_default.clone(), now_unix);

    let inner_ctx = state.to_context::<Workspace>(client.clone(), CONTROLLER_ID);
    let ctx = Arc::new(WorkspaceCtx {
        inner: Arc::new(inner_ctx),
        lb_default,
    });

    info!(msg = "starting workspace controller");
    let workspace_controller = Controller::new(workspace, watcher::Config::default())
        .owns(deployment, watcher::Config::default())
        .owns(service, watcher::Config::default())
        .shutdown_on_signal()
        .run(backoff_reconciler!(reconcile_workspace), error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics().ready_set(true);
    tokio::select! {
        _ = workspace_controller => {},
        _ = lb_poller => {},
    }
}
