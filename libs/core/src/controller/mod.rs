pub mod context;

use self::context::Context;
use crate::error::Error;
use crate::metrics::ControllerMetrics;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use kube::Resource;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::Lookup;
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use tracing::error;

pub type ControllerId = &'static str;
pub const DEFAULT_RECONCILE_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(300);

/// Process-wide state shared between every controller and the HTTP server:
/// the metrics registry and each controller's derived metric handles.
#[derive(Clone)]
pub struct State {
    registry: Arc<Registry>,
    controllers: Arc<HashMap<ControllerId, Arc<ControllerMetrics>>>,
}

impl State {
    pub fn new(mut registry: Registry, controller_names: &[ControllerId]) -> Self {
        let controllers = controller_names
            .iter()
            .map(|&id| (id, ControllerMetrics::register(id, &mut registry)))
            .collect();
        Self {
            registry: Arc::new(registry),
            controllers: Arc::new(controllers),
        }
    }

    pub fn metrics_text(&self) -> crate::error::Result<String> {
        crate::metrics::encode(&self.registry)
    }

    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId) -> Context<K>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        Context::new(
            controller_id,
            client.clone(),
            self.controllers
                .get(controller_id)
                .expect("all controller ids must be registered in State::new")
                .clone(),
            Recorder::new(client, controller_id.into()),
        )
    }
}

/// Fail fast at startup if the controller's RBAC doesn't permit listing its
/// watched resource type.
pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions",
            guildnet_k8s_util::types::short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

pub fn error_policy<K>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Context<K>>) -> Action
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    unreachable!("handled inside backoff_reconciler!")
}

/// Wrap a reconciler function so that every error is logged, counted, and
/// turned into a requeue after the object's backoff duration — reconcile
/// functions never choose their own retry interval.
#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            use $crate::controller::context::BackoffContext;
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    Ok(action)
                }
                Err(error) => {
                    let namespace = kube::ResourceExt::namespace(obj.as_ref()).unwrap_or_default();
                    let name = kube::ResourceExt::name_any(obj.as_ref());
                    tracing::error!(msg = "failed reconciliation", %namespace, %name, %error);
                    ctx.metrics().reconcile_failure_inc();
                    let backoff_duration = ctx
                        .get_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    tracing::trace!(
                        msg = format!("backoff duration: {backoff_duration:?}"),
                        %namespace,
                        %name,
                    );
                    Ok(kube::runtime::controller::Action::requeue(backoff_duration))
                }
            }
        }
    };
}
