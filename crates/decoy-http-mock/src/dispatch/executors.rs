//! Stateless per-kind action executors.
//!
//! Each executor turns the action's payload into either a response, a
//! request shaped for forwarding, or a pending origin exchange. Control
//! flow, scheduling and logging stay in the dispatcher.

use super::ConnectionHandle;
use crate::callback::CallbackRegistry;
use crate::error::ActionError;
use crate::model::{FaultBehavior, HttpRequest, HttpResponse, Scheme, Template};
use crate::proxy::client::{OriginClient, PendingResponse};
use crate::proxy::strip_hop_by_hop_headers;
use crate::template::TemplateEngine;
use std::time::Duration;

/// A canned response is served as stored.
pub fn canned_response(prototype: &HttpResponse) -> HttpResponse {
    prototype.clone()
}

pub fn templated_response(
    engine: &dyn TemplateEngine,
    template: &Template,
    request: &HttpRequest,
) -> Result<HttpResponse, ActionError> {
    engine.render_response(template, request)
}

pub fn templated_request(
    engine: &dyn TemplateEngine,
    template: &Template,
    request: &HttpRequest,
) -> Result<HttpRequest, ActionError> {
    engine.render_request(template, request)
}

pub fn callback_response(
    registry: &CallbackRegistry,
    name: &str,
    request: &HttpRequest,
) -> Result<HttpResponse, ActionError> {
    registry.response_callback(name)?.handle(request)
}

pub fn callback_request(
    registry: &CallbackRegistry,
    name: &str,
    request: &HttpRequest,
) -> Result<HttpRequest, ActionError> {
    registry.request_callback(name)?.handle(request)
}

/// Re-target the request at `host:port` and send it, verbatim apart from
/// hop-by-hop headers and the rewritten `Host`.
pub fn forward_to_origin(
    client: &dyn OriginClient,
    request: &HttpRequest,
    host: &str,
    port: u16,
    scheme: Scheme,
    timeout: Duration,
) -> PendingResponse {
    let mut outbound = strip_hop_by_hop_headers(request);
    outbound.secure = scheme.is_secure();
    outbound.headers.set("host", format!("{host}:{port}"));
    client.send(outbound, None, timeout)
}

/// Send an already-shaped request (template, callback or override output);
/// the target comes from its `Host` header.
pub fn forward_shaped_request(
    client: &dyn OriginClient,
    request: &HttpRequest,
    timeout: Duration,
) -> PendingResponse {
    let outbound = strip_hop_by_hop_headers(request);
    client.send(outbound, None, timeout)
}

/// Emit a transport-level fault on the client channel.
pub fn apply_fault(behavior: &FaultBehavior, connection: &dyn ConnectionHandle) {
    if let Some(bytes) = &behavior.response_bytes {
        connection.send_raw(bytes.as_bytes());
    }
    if behavior.drop_connection {
        connection.close();
    }
}
