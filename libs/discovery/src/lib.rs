//! Resolve a named Kubernetes `Service` to a `host:port` pair, preferring a
//! `LoadBalancer` ingress, then `NodePort`, then `ClusterIP` (C4).
//!
//! The pure [`resolve`] function takes an already-fetched `Service` (and,
//! for the `NodePort` case, an already-fetched node list) so it is
//! unit-testable without a live cluster; [`discover`] is the thin
//! `kube::Client`-driven wrapper the runtime actually calls.

use k8s_openapi::api::core::v1::{Node, Service};
use kube::{Api, Client};

/// Which service port to resolve. RethinkDB's default client-driver port is
/// `28015`; callers may also look up a named port (commonly `"client"`).
#[derive(Debug, Clone)]
pub enum PreferredPort {
    Number(i32),
    Name(String),
}

impl Default for PreferredPort {
    fn default() -> Self {
        PreferredPort::Number(28015)
    }
}

fn port_matches(port: &k8s_openapi::api::core::v1::ServicePort, preferred: &PreferredPort) -> bool {
    match preferred {
        PreferredPort::Number(n) => port.port == *n,
        PreferredPort::Name(name) => port.name.as_deref() == Some(name.as_str()),
    }
}

/// Resolve `service` to a `host:port` string, consulting `nodes` only for
/// the `NodePort` case. Returns `None` if nothing could be discovered.
pub fn resolve(service: &Service, nodes: &[Node], preferred: &PreferredPort) -> Option<String> {
    let spec = service.spec.as_ref()?;
    let ports = spec.ports.as_ref()?;
    let matched = ports.iter().find(|p| port_matches(p, preferred))?;

    if let Some(status) = &service.status {
        if let Some(lb) = &status.load_balancer {
            if let Some(ingress) = lb.ingress.as_ref().and_then(|v| v.first()) {
                let host = ingress
                    .ip
                    .clone()
                    .or_else(|| ingress.hostname.clone())?;
                return Some(format!("{host}:{}", matched.port));
            }
        }
    }

    if spec.type_.as_deref() == Some("NodePort") {
        if let Some(node_port) = matched.node_port {
            let external_ip = nodes.iter().find_map(node_external_ip);
            let internal_ip = nodes.iter().find_map(node_internal_ip);
            if let Some(host) = external_ip.or(internal_ip) {
                return Some(format!("{host}:{node_port}"));
            }
        }
    }

    if let Some(cluster_ip) = spec.cluster_ip.as_deref() {
        if !cluster_ip.is_empty() && cluster_ip != "None" {
            return Some(format!("{cluster_ip}:{}", matched.port));
        }
    }

    None
}

fn node_external_ip(node: &Node) -> Option<String> {
    node_address(node, "ExternalIP")
}

fn node_internal_ip(node: &Node) -> Option<String> {
    node_address(node, "InternalIP")
}

fn node_address(node: &Node, address_type: &str) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == address_type)
        .map(|a| a.address.clone())
}

/// Fetch `namespace/svc_name` and any `Node`s needed, then [`resolve`].
pub async fn discover(
    client: &Client,
    namespace: &str,
    svc_name: &str,
    preferred: PreferredPort,
) -> kube::Result<Option<String>> {
    let svc_api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let service = svc_api.get(svc_name).await?;

    let nodes = if service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        == Some("NodePort")
    {
        let node_api: Api<Node> = Api::all(client.clone());
        node_api.list(&Default::default()).await?.items
    } else {
        Vec::new()
    };

    let addr = resolve(&service, &nodes, &preferred);
    if addr.is_none() {
        tracing::debug!(msg = "no address discovered for service", namespace, svc_name);
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, NodeAddress, NodeStatus, ServicePort,
        ServiceSpec, ServiceStatus,
    };

    fn port(name: &str, port: i32, node_port: Option<i32>) -> ServicePort {
        ServicePort {
            name: Some(name.to_string()),
            port,
            node_port,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_load_balancer_ingress() {
        let svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                cluster_ip: Some("10.0.0.5".to_string()),
                ports: Some(vec![port("client", 28015, Some(31000))]),
                ..Default::default()
            }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some("203.0.113.9".to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve(&svc, &[], &PreferredPort::default()),
            Some("203.0.113.9:28015".to_string())
        );
    }

    #[test]
    fn falls_back_to_node_port_external_ip() {
        let svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                cluster_ip: Some("10.0.0.5".to_string()),
                ports: Some(vec![port("client", 28015, Some(31000))]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let node = Node {
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "192.168.1.5".to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve(&svc, &[node], &PreferredPort::default()),
            Some("192.168.1.5:31000".to_string())
        );
    }

    #[test]
    fn falls_back_to_cluster_ip() {
        let svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                cluster_ip: Some("10.0.0.5".to_string()),
                ports: Some(vec![port("client", 28015, None)]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve(&svc, &[], &PreferredPort::default()),
            Some("10.0.0.5:28015".to_string())
        );
    }

    #[test]
    fn headless_service_with_no_cluster_ip_returns_none() {
        let svc = Service {
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                cluster_ip: Some("None".to_string()),
                ports: Some(vec![port("client", 28015, None)]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(resolve(&svc, &[], &PreferredPort::default()), None);
    }

    #[test]
    fn named_port_lookup() {
        let svc = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.5".to_string()),
                ports: Some(vec![port("client", 28015, None), port("admin", 29015, None)]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve(&svc, &[], &PreferredPort::Name("admin".to_string())),
            Some("10.0.0.5:29015".to_string())
        );
    }
}
