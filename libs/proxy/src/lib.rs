//! Reverse proxy (C10): resolves the three request-addressing shapes,
//! selects between the mesh transport and the Kubernetes API-server-proxy
//! transport, and rewrites responses for safe iframe embedding.

pub mod address;
pub mod director;
pub mod error;
pub mod handler;
pub mod rewrite;
pub mod transport;

pub use error::{Error, Result};
pub use handler::{ApiServerProxyTransport, ProxyState, ResolveServer, proxy_handler};
