use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A containerised workspace (code-server, or a generic HTTP workload) that
/// the operator runs as a Deployment + Service pair.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "guildnet.io",
    version = "v1alpha1",
    kind = "Workspace",
    plural = "workspaces",
    singular = "workspace",
    namespaced,
    status = "WorkspaceStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Container image to run, e.g. `codercom/code-server:latest`.
    pub image: String,
    #[serde(default)]
    pub env: Vec<WorkspaceEnvVar>,
    #[serde(default)]
    pub ports: Vec<WorkspacePort>,
    #[serde(default)]
    pub exposure: Exposure,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct WorkspaceEnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl From<&WorkspaceEnvVar> for EnvVar {
    fn from(v: &WorkspaceEnvVar) -> Self {
        EnvVar {
            name: v.name.clone(),
            value: Some(v.value.clone()),
            value_from: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct WorkspacePort {
    pub name: String,
    pub container_port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Exposure {
    #[serde(default)]
    pub r#type: ExposureType,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ExposureType {
    #[default]
    ClusterIP,
    LoadBalancer,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub service_dns: Option<String>,
    #[serde(default)]
    pub service_ip: Option<String>,
    #[serde(default)]
    pub proxy_target: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Terminating,
}
