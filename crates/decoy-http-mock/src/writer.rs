//! Response writing back to the client channel.

use crate::cors::{add_cors_headers, CorsPolicy};
use crate::model::{HttpRequest, HttpResponse};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

/// Sink for the single response of one request. Implementations serialize
/// writes on the client channel; a second write is a no-op.
pub trait ResponseWriter: Send + Sync {
    fn write_response(&self, request: &HttpRequest, response: HttpResponse, suppress_cors: bool);

    fn write_status(&self, request: &HttpRequest, status: u16) {
        self.write_response(request, HttpResponse::new(status), false);
    }
}

/// Writer backed by a oneshot channel to the connection task.
///
/// Applies the CORS policy before handing the response over. If the client
/// channel is already gone the write quietly becomes a no-op.
pub struct ChannelResponseWriter {
    sender: Mutex<Option<oneshot::Sender<HttpResponse>>>,
    cors: CorsPolicy,
}

impl ChannelResponseWriter {
    pub fn new(cors: CorsPolicy) -> (Self, oneshot::Receiver<HttpResponse>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(sender)),
                cors,
            },
            receiver,
        )
    }
}

impl ResponseWriter for ChannelResponseWriter {
    fn write_response(&self, request: &HttpRequest, mut response: HttpResponse, suppress_cors: bool) {
        if !suppress_cors && self.cors.enabled() && self.cors.applies_to(request) {
            add_cors_headers(&mut response);
        }
        let sender = self.sender.lock().take();
        match sender {
            Some(sender) => {
                if sender.send(response).is_err() {
                    // Client went away mid-delay; the action already ran.
                    warn!("client channel closed before the response was written");
                }
            }
            None => warn!(
                "response already written for {} {}, dropping extra write",
                request.method, request.path
            ),
        }
    }
}
