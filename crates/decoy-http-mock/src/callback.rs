//! Callback seams for the two callback action families.
//!
//! *Named* callbacks run in-process and are registered up front under a
//! name. *Remote* callbacks round-trip to a connected callback client; the
//! broker owns that exchange and hands back a pending result. Tests and the
//! stand-alone binary use the in-process broker, which serves remote
//! exchanges from locally registered handlers.

use crate::error::ActionError;
use crate::model::{HttpRequest, HttpResponse};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// In-process callback producing a response for a matched request.
pub trait ResponseCallback: Send + Sync {
    fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, ActionError>;
}

/// In-process callback producing the request to forward.
pub trait RequestCallback: Send + Sync {
    fn handle(&self, request: &HttpRequest) -> Result<HttpRequest, ActionError>;
}

impl<F> ResponseCallback for F
where
    F: Fn(&HttpRequest) -> Result<HttpResponse, ActionError> + Send + Sync,
{
    fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, ActionError> {
        self(request)
    }
}

/// Named registry of in-process callbacks.
#[derive(Default)]
pub struct CallbackRegistry {
    response_callbacks: RwLock<HashMap<String, Arc<dyn ResponseCallback>>>,
    request_callbacks: RwLock<HashMap<String, Arc<dyn RequestCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_response(&self, name: impl Into<String>, callback: Arc<dyn ResponseCallback>) {
        self.response_callbacks.write().insert(name.into(), callback);
    }

    pub fn register_request(&self, name: impl Into<String>, callback: Arc<dyn RequestCallback>) {
        self.request_callbacks.write().insert(name.into(), callback);
    }

    pub fn response_callback(&self, name: &str) -> Result<Arc<dyn ResponseCallback>, ActionError> {
        self.response_callbacks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::CallbackNotFound(name.to_string()))
    }

    pub fn request_callback(&self, name: &str) -> Result<Arc<dyn RequestCallback>, ActionError> {
        self.request_callbacks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::CallbackNotFound(name.to_string()))
    }
}

pub type PendingCallbackResponse =
    Pin<Box<dyn Future<Output = Result<HttpResponse, ActionError>> + Send + 'static>>;
pub type PendingCallbackRequest =
    Pin<Box<dyn Future<Output = Result<HttpRequest, ActionError>> + Send + 'static>>;

/// Exchange with a remote callback client identified by `client_id`.
pub trait RemoteCallbacks: Send + Sync {
    /// Ask the client for the response to serve.
    fn response_exchange(&self, client_id: &str, request: &HttpRequest) -> PendingCallbackResponse;

    /// Ask the client for the request to forward.
    fn request_exchange(&self, client_id: &str, request: &HttpRequest) -> PendingCallbackRequest;
}

/// Broker that serves remote exchanges from locally registered handlers.
#[derive(Default)]
pub struct InProcessRemoteCallbacks {
    registry: CallbackRegistry,
}

impl InProcessRemoteCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }
}

impl RemoteCallbacks for InProcessRemoteCallbacks {
    fn response_exchange(&self, client_id: &str, request: &HttpRequest) -> PendingCallbackResponse {
        let callback = self.registry.response_callback(client_id);
        let request = request.clone();
        Box::pin(async move { callback?.handle(&request) })
    }

    fn request_exchange(&self, client_id: &str, request: &HttpRequest) -> PendingCallbackRequest {
        let callback = self.registry.request_callback(client_id);
        let request = request.clone();
        Box::pin(async move { callback?.handle(&request) })
    }
}
