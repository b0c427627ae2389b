//! Thin HTTP front-end: accepts connections, adapts wire requests to the
//! model, and hands them to the dispatcher.
//!
//! Each accepted socket is duplicated before hyper takes ownership, so a
//! `fault` action can shut the connection down or write raw bytes past the
//! HTTP encoder while the request is still being served.

use crate::audit::AuditLog;
use crate::callback::{CallbackRegistry, InProcessRemoteCallbacks, RemoteCallbacks};
use crate::config::Config;
use crate::dispatch::{ConnectionHandle, Dispatcher};
use crate::model::{ExpectationStore, Headers, HttpRequest, HttpResponse};
use crate::proxy::client::HyperOriginClient;
use crate::template::PlaceholderTemplateEngine;
use crate::writer::ChannelResponseWriter;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashSet;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// The assembled server: dispatcher plus its collaborators, ready to serve.
pub struct MockServer {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    expectations: Arc<ExpectationStore>,
    audit: Arc<AuditLog>,
    callbacks: Arc<CallbackRegistry>,
}

impl MockServer {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let expectations = Arc::new(ExpectationStore::with_expectations(
            config.expectations.clone(),
        ));
        let audit = Arc::new(AuditLog::new());
        let callbacks = Arc::new(CallbackRegistry::new());
        let remotes: Arc<dyn RemoteCallbacks> = Arc::new(InProcessRemoteCallbacks::new());
        let client = Arc::new(HyperOriginClient::new(
            &config.connection_pool,
            config.upstream_proxy.clone(),
        )?);
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            expectations.clone(),
            audit.clone(),
            client,
            Arc::new(PlaceholderTemplateEngine::new()),
            callbacks.clone(),
            remotes,
        ));
        Ok(Self {
            config,
            dispatcher,
            expectations,
            audit,
            callbacks,
        })
    }

    /// Store to install expectations into at runtime (library use).
    pub fn expectations(&self) -> Arc<ExpectationStore> {
        self.expectations.clone()
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    pub fn callbacks(&self) -> Arc<CallbackRegistry> {
        self.callbacks.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.listen.bind_address, self.config.listen.port
        )
        .parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.run_on_listener(listener).await
    }

    /// Serve on an already-bound listener; lets tests bind port 0 first.
    pub async fn run_on_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let local_addresses = Arc::new(local_addresses_for(
            local_addr,
            &self.config.local_addresses,
        ));
        info!("decoy listening on http://{}", local_addr);
        info!("{} expectation(s) installed", self.expectations.len());

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let dispatcher = self.dispatcher.clone();
            let config = self.config.clone();
            let local_addresses = local_addresses.clone();

            tokio::spawn(async move {
                if let Err(err) =
                    serve_connection(stream, remote_addr, dispatcher, config, local_addresses)
                        .await
                {
                    debug!("connection from {} ended: {}", remote_addr, err);
                }
            });
        }
    }
}

/// Host values that mean "this server", with and without the port.
fn local_addresses_for(bound: SocketAddr, extra: &[String]) -> HashSet<String> {
    let port = bound.port();
    let mut addresses = HashSet::new();
    for host in ["localhost", "127.0.0.1", bound.ip().to_string().as_str()] {
        addresses.insert(host.to_string());
        addresses.insert(format!("{host}:{port}"));
    }
    addresses.extend(extra.iter().cloned());
    addresses
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
    local_addresses: Arc<HashSet<String>>,
) -> anyhow::Result<()> {
    // Duplicate the socket before hyper owns it; the duplicate is the fault
    // handle's way to the raw stream.
    let std_stream = stream.into_std()?;
    let raw = std_stream.try_clone()?;
    let stream = TcpStream::from_std(std_stream)?;
    let fault_handle = Arc::new(SocketFaultHandle::new(raw));

    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let dispatcher = dispatcher.clone();
        let config = config.clone();
        let local_addresses = local_addresses.clone();
        let fault_handle = fault_handle.clone();
        async move {
            handle_request(
                req,
                remote_addr,
                dispatcher,
                config,
                local_addresses,
                fault_handle,
            )
            .await
        }
    });

    http1::Builder::new().serve_connection(io, service).await?;
    Ok(())
}

/// Why a request produced no wire response.
#[derive(Debug, Error)]
enum ServeInterrupted {
    #[error("channel fault emitted")]
    Fault,
    #[error("no response was produced")]
    NoResponse,
}

async fn handle_request(
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
    local_addresses: Arc<HashSet<String>>,
    fault_handle: Arc<SocketFaultHandle>,
) -> Result<hyper::Response<Full<Bytes>>, ServeInterrupted> {
    let request = into_model_request(req, remote_addr).await;
    debug!("received {} {} from {}", request.method, request.uri(), remote_addr);

    let (writer, receiver) = ChannelResponseWriter::new(config.cors_policy());
    dispatcher
        .process_action(
            request,
            Arc::new(writer),
            Some(fault_handle.clone() as Arc<dyn ConnectionHandle>),
            None,
            &local_addresses,
            config.explicit_proxy,
            false,
        )
        .await;

    tokio::select! {
        response = receiver => match response {
            Ok(response) => Ok(into_wire_response(response)),
            // Every writer is gone without a write; let the connection close.
            Err(_) => Err(ServeInterrupted::NoResponse),
        },
        _ = fault_handle.wait() => Err(ServeInterrupted::Fault),
    }
}

async fn into_model_request(
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
) -> HttpRequest {
    let (parts, body) = req.into_parts();
    let mut headers = Headers::new();
    for (name, value) in &parts.headers {
        match value.to_str() {
            Ok(v) => headers.add(name.as_str(), v),
            Err(_) => debug!("dropping non-utf8 header '{}'", name),
        }
    }
    let body = match body.collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(err) => {
            debug!("failed to read request body: {}", err);
            String::new()
        }
    };
    HttpRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers,
        body,
        secure: false,
        remote_socket: Some(remote_addr),
    }
}

fn into_wire_response(response: HttpResponse) -> hyper::Response<Full<Bytes>> {
    let mut builder = hyper::Response::builder().status(response.status);
    for (name, value) in response.headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(Bytes::from(response.body.into_bytes())))
        .unwrap_or_else(|err| {
            error!("failed to build wire response: {}", err);
            hyper::Response::builder()
                .status(500)
                .body(Full::new(Bytes::new()))
                .unwrap()
        })
}

/// Fault access to the raw socket through a duplicated handle.
struct SocketFaultHandle {
    socket: std::net::TcpStream,
    fired: AtomicBool,
    notify: Notify,
}

impl SocketFaultHandle {
    fn new(socket: std::net::TcpStream) -> Self {
        Self {
            socket,
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    async fn wait(&self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }

    fn mark_fired(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

impl ConnectionHandle for SocketFaultHandle {
    fn close(&self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        self.mark_fired();
    }

    fn send_raw(&self, bytes: &[u8]) {
        // The duplicate shares the nonblocking flag with the tokio half;
        // flip it so a short raw write completes in one call.
        let _ = self.socket.set_nonblocking(false);
        if let Err(err) = (&self.socket).write_all(bytes) {
            debug!("raw fault write failed: {}", err);
        }
        let _ = self.socket.set_nonblocking(true);
        self.mark_fired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_addresses_cover_loopback_forms() {
        let bound: SocketAddr = "127.0.0.1:2080".parse().unwrap();
        let addresses = local_addresses_for(bound, &["mock.internal".to_string()]);
        assert!(addresses.contains("localhost:2080"));
        assert!(addresses.contains("localhost"));
        assert!(addresses.contains("127.0.0.1:2080"));
        assert!(addresses.contains("mock.internal"));
        assert!(!addresses.contains("elsewhere.example"));
    }

    #[test]
    fn test_wire_response_conversion_keeps_status_headers_body() {
        let response = HttpResponse::new(201)
            .with_header("X-One", "1")
            .with_body("created");
        let wire = into_wire_response(response);
        assert_eq!(wire.status(), 201);
        assert_eq!(wire.headers().get("x-one").unwrap(), "1");
    }

    #[test]
    fn test_invalid_header_falls_back_to_500() {
        let response = HttpResponse::new(200).with_header("bad\nname", "x");
        let wire = into_wire_response(response);
        assert_eq!(wire.status(), 500);
    }
}
