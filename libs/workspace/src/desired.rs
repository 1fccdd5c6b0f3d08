//! Pure construction of the desired Deployment + Service for a Workspace.
//! No I/O: given the same `(spec, lb_default, name, namespace)` this always
//! produces byte-identical objects (§8 invariant 11).

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, ExecAction, HTTPGetAction,
    Probe, PodSecurityContext, PodSpec, PodTemplateSpec, SeccompProfile, SecurityContext, Service,
    ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use crate::crd::{Exposure, ExposureType, Workspace, WorkspacePort};

const LABEL_WORKSPACE: &str = "guildnet.io/workspace";
const DEFAULT_PORT_NAME: &str = "http";
const DEFAULT_CONTAINER_PORT: i32 = 8080;
const NGINX_UNPRIVILEGED_IMAGE: &str = "nginxinc/nginx-unprivileged:1.25";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFamily {
    CodeServer,
    Nginx,
    Alpine,
    Other,
}

pub fn classify_image(image: &str) -> ImageFamily {
    if image.contains("code-server") {
        ImageFamily::CodeServer
    } else if image.contains("nginx") {
        ImageFamily::Nginx
    } else if image.contains("alpine") {
        ImageFamily::Alpine
    } else {
        ImageFamily::Other
    }
}

fn desired_ports(spec_ports: &[WorkspacePort]) -> Vec<WorkspacePort> {
    if spec_ports.is_empty() {
        vec![WorkspacePort {
            name: DEFAULT_PORT_NAME.to_string(),
            container_port: DEFAULT_CONTAINER_PORT,
            protocol: "TCP".to_string(),
        }]
    } else {
        spec_ports.to_vec()
    }
}

fn desired_env(spec_env: &[crate::crd::WorkspaceEnvVar], family: ImageFamily) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = spec_env
        .iter()
        .filter(|e| !e.name.is_empty())
        .map(EnvVar::from)
        .collect();

    if !env.iter().any(|e| e.name == "PORT") {
        env.push(EnvVar {
            name: "PORT".to_string(),
            value: Some(DEFAULT_CONTAINER_PORT.to_string()),
            value_from: None,
        });
    }
    if family == ImageFamily::CodeServer && !env.iter().any(|e| e.name == "PASSWORD") {
        env.push(EnvVar {
            name: "PASSWORD".to_string(),
            value: Some("changeme".to_string()),
            value_from: None,
        });
    }
    env
}

fn desired_args(family: ImageFamily) -> Option<Vec<String>> {
    match family {
        ImageFamily::CodeServer => Some(vec![
            "--bind-addr".to_string(),
            "0.0.0.0:8080".to_string(),
            "--auth".to_string(),
            "password".to_string(),
        ]),
        _ => None,
    }
}

fn probe(port: i32, family: ImageFamily) -> Probe {
    if family == ImageFamily::Alpine {
        Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("nc -z 127.0.0.1 {port}"),
                ]),
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            timeout_seconds: Some(2),
            failure_threshold: Some(3),
            ..Default::default()
        }
    } else {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            timeout_seconds: Some(2),
            failure_threshold: Some(3),
            ..Default::default()
        }
    }
}

fn container_security_context(family: ImageFamily) -> Option<SecurityContext> {
    if family == ImageFamily::Nginx {
        return None;
    }
    Some(SecurityContext {
        allow_privilege_escalation: Some(family == ImageFamily::CodeServer),
        run_as_non_root: Some(family != ImageFamily::CodeServer),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn pod_security_context(family: ImageFamily) -> PodSecurityContext {
    let (uid, gid, fsgroup) = if family == ImageFamily::Nginx {
        (101, 101, 101)
    } else {
        (1000, 1000, 1000)
    };
    PodSecurityContext {
        run_as_user: Some(uid),
        run_as_group: Some(gid),
        fs_group: Some(fsgroup),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn resolved_image(image: &str, family: ImageFamily) -> String {
    if family == ImageFamily::Nginx && !image.to_lowercase().contains("unprivileged") {
        NGINX_UNPRIVILEGED_IMAGE.to_string()
    } else {
        image.to_string()
    }
}

/// Whether `lb_default` (the operator's ConfigMap/env fallback) or the
/// Workspace's own `spec.exposure.type` should expose the service as a
/// LoadBalancer.
pub fn wants_load_balancer(exposure: &Exposure, lb_default: bool) -> bool {
    exposure.r#type == ExposureType::LoadBalancer || lb_default
}

pub struct DesiredDeployment {
    pub deployment: Deployment,
    pub family: ImageFamily,
    pub image: String,
    pub first_port: i32,
}

/// Build the desired Deployment for `workspace`. Pure: given the same
/// `(workspace, lb_default)` this always returns a byte-identical spec.
pub fn build_deployment(workspace: &Workspace, lb_default: bool) -> DesiredDeployment {
    let name = workspace.metadata.name.clone().unwrap_or_default();
    let namespace = workspace.metadata.namespace.clone().unwrap_or_default();
    let family = classify_image(&workspace.spec.image);
    let image = resolved_image(&workspace.spec.image, family);
    let ports = desired_ports(&workspace.spec.ports);
    let first_port = ports.first().map(|p| p.container_port).unwrap_or(DEFAULT_CONTAINER_PORT);

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_WORKSPACE.to_string(), name.clone());

    let container_ports: Vec<ContainerPort> = ports
        .iter()
        .map(|p| ContainerPort {
            name: Some(p.name.clone()),
            container_port: p.container_port,
            protocol: Some(p.protocol.clone()),
            ..Default::default()
        })
        .collect();

    let mut volume_mounts = Vec::new();
    let mut volumes = Vec::new();
    let mut init_containers = Vec::new();

    if family == ImageFamily::Nginx {
        volumes.push(Volume {
            name: "cache".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "cache".to_string(),
            mount_path: "/var/cache/nginx".to_string(),
            ..Default::default()
        });
        init_containers.push(Container {
            name: "fix-cache-perms".to_string(),
            image: Some("busybox".to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "chown -R 101:101 /var/cache/nginx".to_string(),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: "cache".to_string(),
                mount_path: "/var/cache/nginx".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    let container = Container {
        name: "workspace".to_string(),
        image: Some(image.clone()),
        ports: Some(container_ports),
        env: Some(desired_env(&workspace.spec.env, family)),
        args: desired_args(family),
        security_context: container_security_context(family),
        readiness_probe: Some(probe(first_port, family)),
        liveness_probe: Some(probe(first_port, family)),
        volume_mounts: if volume_mounts.is_empty() {
            None
        } else {
            Some(volume_mounts)
        },
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        init_containers: if init_containers.is_empty() {
            None
        } else {
            Some(init_containers)
        },
        volumes: if volumes.is_empty() { None } else { Some(volumes) },
        security_context: Some(pod_security_context(family)),
        tolerations: Some(vec![Toleration {
            key: Some("node-role.kubernetes.io/control-plane".to_string()),
            effect: Some("NoSchedule".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("25%".to_string())),
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let _ = lb_default; // exposure decision lives in service.rs; kept for signature symmetry
    DesiredDeployment {
        deployment,
        family,
        image,
        first_port,
    }
}

/// Build the desired Service for `workspace`.
pub fn build_service(workspace: &Workspace, first_port: i32, lb_default: bool) -> Service {
    let name = workspace.metadata.name.clone().unwrap_or_default();
    let namespace = workspace.metadata.namespace.clone().unwrap_or_default();
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_WORKSPACE.to_string(), name.clone());

    let service_type = if wants_load_balancer(&workspace.spec.exposure, lb_default) {
        "LoadBalancer"
    } else {
        "ClusterIP"
    };

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            type_: Some(service_type.to_string()),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![ServicePort {
                name: Some(DEFAULT_PORT_NAME.to_string()),
                port: first_port,
                target_port: Some(IntOrString::Int(first_port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::WorkspaceSpec;

    fn workspace(image: &str) -> Workspace {
        Workspace::new(
            "demo",
            WorkspaceSpec {
                image: image.to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn desired_deployment_is_pure() {
        let ws = workspace("codercom/code-server:latest");
        let a = build_deployment(&ws, false);
        let b = build_deployment(&ws, false);
        assert_eq!(
            serde_json::to_value(&a.deployment).unwrap(),
            serde_json::to_value(&b.deployment).unwrap()
        );
    }

    #[test]
    fn code_server_gets_password_env_and_auth_args() {
        let ws = workspace("codercom/code-server:latest");
        let desired = build_deployment(&ws, false);
        let container = &desired.deployment.spec.unwrap().template.spec.unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "PASSWORD"));
        assert!(container.args.is_some());
    }

    #[test]
    fn nginx_gets_unprivileged_image_and_init_container() {
        let ws = workspace("nginx:1.25");
        let desired = build_deployment(&ws, false);
        assert_eq!(desired.image, NGINX_UNPRIVILEGED_IMAGE);
        let pod = desired.deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod.init_containers.is_some());
        assert_eq!(pod.security_context.unwrap().run_as_user, Some(101));
    }

    #[test]
    fn other_images_get_default_uid_and_strict_security_context() {
        let ws = workspace("myorg/myapp:latest");
        let desired = build_deployment(&ws, false);
        let pod = desired.deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.security_context.unwrap().run_as_user, Some(1000));
        assert!(pod.containers[0].security_context.is_some());
    }

    #[test]
    fn load_balancer_exposure_follows_spec_or_operator_default() {
        let mut ws = workspace("myorg/myapp:latest");
        assert_eq!(
            build_service(&ws, 8080, false).spec.unwrap().type_,
            Some("ClusterIP".to_string())
        );
        assert_eq!(
            build_service(&ws, 8080, true).spec.unwrap().type_,
            Some("LoadBalancer".to_string())
        );
        ws.spec.exposure.r#type = ExposureType::LoadBalancer;
        assert_eq!(
            build_service(&ws, 8080, false).spec.unwrap().type_,
            Some("LoadBalancer".to_string())
        );
    }
}
