//! The mesh connector capability (C5): a dialer that routes TCP connections
//! over an overlay network instead of the host's default route. Concrete
//! mesh implementations (e.g. a Tailscale/WireGuard client) live outside
//! this crate; the reverse proxy (C10) and, optionally, the per-cluster
//! Kubernetes client consume this trait object without knowing which.

use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

pub trait MeshConn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> MeshConn for T {}

#[async_trait::async_trait]
pub trait MeshDialer: Send + Sync {
    /// Dial `addr` ("host:port") over the mesh. `network` is always "tcp"
    /// today; kept for parity with the dial-context shape this is grounded on.
    async fn dial(&self, network: &str, addr: &str) -> io::Result<Pin<Box<dyn MeshConn>>>;

    /// Whether the connector believes it has an active session. Instance
    /// construction is non-blocking: a connector can exist and report
    /// `false` here while it establishes its session in the background.
    fn is_ready(&self) -> bool;
}
