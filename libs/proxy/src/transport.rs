//! Dual transport: outbound proxy traffic either dials through a cluster's
//! mesh connector, or (for `/api/`, `/apis/` paths) is handed to the
//! Kubernetes API-server-proxy transport the caller already has.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use guildnet_runtime::{MeshConn, MeshDialer};
use http::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tower::Service;
use tower::timeout::Timeout;

const TLS_HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Wraps a mesh-dialed connection so `hyper_util::client::legacy::Client`
/// accepts it as a transport. TLS verification is intentionally not
/// performed here — workspaces carry self-signed certificates and the proxy
/// sits behind the operator's own authentication (spec §4.9).
pub struct MeshIo(Pin<Box<dyn MeshConn>>);

impl Connection for MeshIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for MeshIo {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for MeshIo {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.0).poll_shutdown(cx)
    }
}

/// `tower::Service<Uri>` connector that dials through a cluster's mesh
/// instead of the proxy process's own network namespace.
#[derive(Clone)]
pub struct MeshConnector {
    dialer: Arc<dyn MeshDialer>,
}

impl MeshConnector {
    pub fn new(dialer: Arc<dyn MeshDialer>) -> Self {
        Self { dialer }
    }
}

impl Service<Uri> for MeshConnector {
    type Response = MeshIo;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = std::io::Result<MeshIo>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            let host = uri.host().unwrap_or_default().to_string();
            let port = uri.port_u16().unwrap_or(80);
            let conn = dialer.dial("tcp", &format!("{host}:{port}")).await?;
            Ok(MeshIo(conn))
        })
    }
}

/// `true` when the mesh connector should be preferred for this request:
/// always, unless the path is under `/api/` or `/apis/` and an
/// API-server-proxy transport is actually available.
pub fn use_mesh_transport(is_api_server_proxy_path: bool, api_proxy_available: bool) -> bool {
    !(is_api_server_proxy_path && api_proxy_available)
}

pub fn tls_handshake_timeout() -> std::time::Duration {
    TLS_HANDSHAKE_TIMEOUT
}

/// Accepts any server certificate. Workspace pods serve self-signed
/// certificates (the same reason [`MeshIo`] skips verification), and the
/// proxy already sits behind the operator's own authentication.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Builds the HTTPS-capable connector used for both the mesh-unavailable
/// fallback and the direct (non-API-server-proxy) transport, since
/// `address.rs` happily produces `https://` targets for workspaces that
/// terminate TLS themselves. Wrapped in a [`Timeout`] bounding the TLS
/// handshake so a hung workspace can't wedge a proxy worker indefinitely.
pub fn build_https_connector() -> Timeout<hyper_rustls::HttpsConnector<HttpConnector>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("rustls default protocol versions are always valid")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build();

    Timeout::new(https, TLS_HANDSHAKE_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_server_proxy_path_with_available_transport_skips_mesh() {
        assert!(!use_mesh_transport(true, true));
    }

    #[test]
    fn non_api_path_always_uses_mesh() {
        assert!(use_mesh_transport(false, true));
        assert!(use_mesh_transport(false, false));
    }

    #[test]
    fn api_path_without_available_transport_falls_back_to_mesh() {
        assert!(use_mesh_transport(true, false));
    }
}
