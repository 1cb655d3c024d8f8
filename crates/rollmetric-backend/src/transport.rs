//! Minimal HTTP/1.1 client used by the backends.
//!
//! One TCP connection per request, optionally wrapped in TLS. The hyper
//! connection task is aborted when the exchange finishes or is dropped,
//! so nothing outlives the request on any exit path.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;

use rollmetric_core::{MetricError, MetricResult};

const USER_AGENT: &str = "rollmetric/0.1";

/// Validate a configured endpoint before any network call.
///
/// `what` names the setting in error messages ("opensearch address").
pub fn parse_endpoint(raw: &str, what: &str) -> MetricResult<Uri> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(MetricError::Configuration(format!("{what} is not configured")));
    }

    let uri: Uri = raw.parse().map_err(|e| {
        debug!(error = %e, endpoint = raw, "endpoint did not parse");
        MetricError::Configuration(format!("{what} is not in url format"))
    })?;

    match (uri.scheme_str(), uri.host()) {
        (Some("http" | "https"), Some(host)) if !host.is_empty() => {
            debug!(%uri, "parsed endpoint");
            Ok(uri)
        }
        _ => Err(MetricError::Configuration(format!(
            "{what} is not in url format"
        ))),
    }
}

/// Append `path_and_query` to the path of `base`.
pub fn join(base: &Uri, path_and_query: &str) -> MetricResult<Uri> {
    let base = base.to_string();
    let joined = format!("{}{}", base.trim_end_matches('/'), path_and_query);
    joined
        .parse()
        .map_err(|e| MetricError::Configuration(format!("invalid request url {joined}: {e}")))
}

/// Status and fully-read body of a response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Sends single requests over fresh connections.
#[derive(Clone)]
pub struct HttpTransport {
    tls: Arc<rustls::ClientConfig>,
}

impl HttpTransport {
    /// Transport that verifies server certificates against the Mozilla roots.
    pub fn new() -> MetricResult<Self> {
        Self::with_verification(true)
    }

    /// `verify = false` accepts any server certificate.
    pub fn with_verification(verify: bool) -> MetricResult<Self> {
        let builder = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| MetricError::Configuration(format!("tls protocol version error: {e}")))?;

        let config = if verify {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::SkipChainVerifier::new()))
                .with_no_client_auth()
        };

        Ok(Self {
            tls: Arc::new(config),
        })
    }

    /// Send `req` and read the whole response body.
    ///
    /// `req` must carry an absolute URI; it is rewritten to origin form
    /// with a `Host` header before it goes on the wire.
    pub async fn send(&self, req: Request<Full<Bytes>>) -> MetricResult<HttpResponse> {
        let (mut parts, body) = req.into_parts();
        let uri = parts.uri.clone();

        let host = uri
            .host()
            .ok_or_else(|| MetricError::Configuration(format!("request url {uri} has no host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        parts.uri = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|e| MetricError::Transport(format!("failed to create request: {e}")))?;
        if let Some(authority) = uri.authority() {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| MetricError::Transport(format!("failed to create request: {e}")))?;
            parts.headers.entry(header::HOST).or_insert(value);
        }
        parts
            .headers
            .entry(header::USER_AGENT)
            .or_insert(HeaderValue::from_static(USER_AGENT));
        let req = Request::from_parts(parts, body);

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| {
                debug!(error = %e, %uri, "connection failed");
                MetricError::Transport(format!("failed to connect to {host}:{port}: {e}"))
            })?;

        if https {
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| MetricError::Configuration(format!("invalid tls server name {host}: {e}")))?;
            let connector = tokio_rustls::TlsConnector::from(Arc::clone(&self.tls));
            let tls = connector.connect(server_name, stream).await.map_err(|e| {
                debug!(error = %e, %uri, "tls handshake failed");
                MetricError::Transport(format!("tls handshake with {host}:{port} failed: {e}"))
            })?;
            exchange(tls, req, &uri).await
        } else {
            exchange(stream, req, &uri).await
        }
    }
}

/// Aborts the connection task when the exchange ends, including on drop.
struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn exchange<S>(stream: S, req: Request<Full<Bytes>>, uri: &Uri) -> MetricResult<HttpResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| MetricError::Transport(format!("http handshake failed: {e}")))?;

    let _guard = ConnectionGuard(tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "connection closed with error");
        }
    }));

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| MetricError::Transport(format!("failed to execute request: {e}")))?;

    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| MetricError::Transport(format!("failed to read response body: {e}")))?
        .to_bytes();

    debug!(%uri, %status, bytes = body.len(), "response received");
    Ok(HttpResponse { status, body })
}

// ── Unverified TLS ───────────────────────────────────────────────────

/// DANGER: skips certificate chain and host name checks.
/// Only installed when a payload sets `insecureSkipVerify`.
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Trusts any presented certificate. Handshake signatures are still
    /// checked against it, so the peer must hold the matching key.
    #[derive(Debug)]
    pub struct SkipChainVerifier {
        algorithms: WebPkiSupportedAlgorithms,
    }

    impl SkipChainVerifier {
        pub fn new() -> Self {
            Self {
                algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
            }
        }
    }

    impl ServerCertVerifier for SkipChainVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(message, cert, dss, &self.algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(message, cert, dss, &self.algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.algorithms.supported_schemes()
        }
    }
}
