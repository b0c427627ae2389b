//! Outbound HTTP client used by forward actions and the proxy fallback.
//!
//! One shared instance per dispatcher; the connection pool lives inside the
//! hyper client and is tuned from [`ConnectionPoolConfig`].

use crate::config::{ConnectionPoolConfig, UpstreamProxyConfig};
use crate::error::ClientError;
use crate::model::{HttpRequest, HttpResponse};
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Handle to a response that completes later. `Ok(None)` stands for an
/// empty reply from the origin.
pub type PendingResponse =
    Pin<Box<dyn Future<Output = Result<Option<HttpResponse>, ClientError>> + Send + 'static>>;

/// Contract consumed by the dispatcher: send a request to an origin,
/// optionally through the configured upstream proxy, within `timeout`.
pub trait OriginClient: Send + Sync {
    fn send(
        &self,
        request: HttpRequest,
        remote: Option<SocketAddr>,
        timeout: Duration,
    ) -> PendingResponse;
}

type PooledClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// hyper-backed [`OriginClient`] with connection pooling and rustls for
/// https origins.
pub struct HyperOriginClient {
    client: PooledClient,
    upstream_proxy: Option<UpstreamProxyConfig>,
}

impl HyperOriginClient {
    pub fn new(
        pool: &ConnectionPoolConfig,
        upstream_proxy: Option<UpstreamProxyConfig>,
    ) -> anyhow::Result<Self> {
        let mut http_connector = HttpConnector::new();
        http_connector.set_keepalive(Some(Duration::from_secs(pool.keepalive_timeout_secs)));
        http_connector.set_connect_timeout(Some(Duration::from_secs(pool.connect_timeout_secs)));
        http_connector.enforce_http(false);

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(pool.idle_timeout_secs))
            .pool_max_idle_per_host(pool.max_idle_per_host)
            .build(https_connector);

        Ok(Self {
            client,
            upstream_proxy,
        })
    }

    fn build_wire_request(
        &self,
        request: &HttpRequest,
        target: &str,
    ) -> Result<hyper::Request<Full<Bytes>>, ClientError> {
        // With an upstream proxy the connection is dialed to the proxy (in
        // the clear) and the target stays in the Host header; otherwise dial
        // the target directly.
        let (scheme, dial) = match &self.upstream_proxy {
            Some(proxy) => ("http", proxy.address()),
            None if request.secure => ("https", target.to_string()),
            None => ("http", target.to_string()),
        };
        let uri: hyper::Uri = format!("{}://{}{}", scheme, dial, request.uri())
            .parse()
            .map_err(|e| ClientError::Protocol(format!("invalid target uri: {e}")))?;

        let method = hyper::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ClientError::Protocol(format!("invalid method: {e}")))?;

        let mut builder = hyper::Request::builder().method(method).uri(uri);
        let mut has_host = false;
        for (name, value) in request.headers.iter() {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if name.eq_ignore_ascii_case("host") {
                has_host = true;
            }
            builder = builder.header(name, value);
        }
        if !has_host {
            builder = builder.header("host", target);
        }
        if let Some(proxy) = &self.upstream_proxy {
            if let Some(credentials) = proxy.basic_credentials() {
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
                builder = builder.header("proxy-authorization", format!("Basic {encoded}"));
            }
        }

        builder
            .body(Full::new(Bytes::from(request.body.clone().into_bytes())))
            .map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

impl OriginClient for HyperOriginClient {
    fn send(
        &self,
        request: HttpRequest,
        remote: Option<SocketAddr>,
        timeout: Duration,
    ) -> PendingResponse {
        let target = remote
            .map(|addr| addr.to_string())
            .or_else(|| request.host_header().map(str::to_string));

        let target = match target {
            Some(t) => t,
            None => {
                return Box::pin(async {
                    Err(ClientError::Protocol(
                        "no remote address and no Host header to resolve the target".into(),
                    ))
                })
            }
        };

        let wire_request = match self.build_wire_request(&request, &target) {
            Ok(r) => r,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let client = self.client.clone();
        Box::pin(async move {
            debug!("sending {} {} to {}", request.method, request.uri(), target);
            let response = match tokio::time::timeout(timeout, client.request(wire_request)).await
            {
                Err(_) => return Err(ClientError::ConnectionTimeout(target)),
                Ok(Err(err)) => return Err(classify(&target, err)),
                Ok(Ok(response)) => response,
            };

            let status = response.status().as_u16();
            let mut headers = crate::model::Headers::new();
            for (name, value) in response.headers() {
                match value.to_str() {
                    Ok(v) => headers.add(name.as_str(), v),
                    Err(_) => warn!("dropping non-utf8 header '{}' from {}", name, target),
                }
            }
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::Communication(target.clone(), e.to_string()))?
                .to_bytes();

            Ok(Some(HttpResponse {
                status,
                headers,
                body: String::from_utf8_lossy(&body).into_owned(),
            }))
        })
    }
}

/// Map a hyper transport error onto the typed taxonomy by walking the
/// source chain down to the io error, when one is there.
fn classify(target: &str, err: hyper_util::client::legacy::Error) -> ClientError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    ClientError::ConnectionRefused(target.to_string())
                }
                std::io::ErrorKind::TimedOut => ClientError::ConnectionTimeout(target.to_string()),
                _ => ClientError::Communication(target.to_string(), io.to_string()),
            };
        }
        source = current.source();
    }
    if err.is_connect() {
        ClientError::ConnectionRefused(target.to_string())
    } else {
        ClientError::Communication(target.to_string(), err.to_string())
    }
}
