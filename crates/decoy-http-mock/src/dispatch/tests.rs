//! End-to-end dispatch scenarios against stub collaborators.

use super::*;
use crate::audit::AuditEntry;
use crate::callback::{CallbackRegistry, InProcessRemoteCallbacks, RequestCallback};
use crate::error::ActionError;
use crate::model::{
    Action, Delay, Expectation, ExpectationStore, FaultBehavior, Headers, RequestMatcher,
    RequestOverride, ResponseOverride, Scheme, Template,
};
use crate::proxy::client::PendingResponse;
use crate::template::PlaceholderTemplateEngine;
use parking_lot::Mutex;
use std::time::Instant;

struct RecordingWriter {
    responses: Mutex<Vec<HttpResponse>>,
}

impl RecordingWriter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(Vec::new()),
        })
    }

    fn single(&self) -> HttpResponse {
        let responses = self.responses.lock();
        assert_eq!(responses.len(), 1, "expected exactly one written response");
        responses[0].clone()
    }

    fn count(&self) -> usize {
        self.responses.lock().len()
    }
}

impl ResponseWriter for RecordingWriter {
    fn write_response(&self, _request: &HttpRequest, response: HttpResponse, _suppress_cors: bool) {
        self.responses.lock().push(response);
    }
}

type SentRequest = (HttpRequest, Option<SocketAddr>, Duration);

struct StubOriginClient {
    reply: Result<Option<HttpResponse>, ClientError>,
    sent: Mutex<Vec<SentRequest>>,
}

impl StubOriginClient {
    fn replying(response: HttpResponse) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(Some(response)),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn empty_reply() -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn failing(err: ClientError) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(err),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }
}

impl OriginClient for StubOriginClient {
    fn send(
        &self,
        request: HttpRequest,
        remote: Option<SocketAddr>,
        timeout: Duration,
    ) -> PendingResponse {
        self.sent.lock().push((request, remote, timeout));
        let reply = self.reply.clone();
        Box::pin(async move { reply })
    }
}

struct Harness {
    dispatcher: Dispatcher,
    audit: Arc<AuditLog>,
    callbacks: Arc<CallbackRegistry>,
    remotes: Arc<InProcessRemoteCallbacks>,
}

fn harness(
    config: Config,
    expectations: Vec<Expectation>,
    client: Arc<dyn OriginClient>,
) -> Harness {
    let audit = Arc::new(AuditLog::new());
    let callbacks = Arc::new(CallbackRegistry::new());
    let remotes = Arc::new(InProcessRemoteCallbacks::new());
    let dispatcher = Dispatcher::new(
        Arc::new(config),
        Arc::new(ExpectationStore::with_expectations(expectations)),
        audit.clone(),
        client,
        Arc::new(PlaceholderTemplateEngine::new()),
        callbacks.clone(),
        remotes.clone(),
    );
    Harness {
        dispatcher,
        audit,
        callbacks,
        remotes,
    }
}

fn no_locals() -> HashSet<String> {
    HashSet::new()
}

fn locals(addresses: &[&str]) -> HashSet<String> {
    addresses.iter().map(|a| a.to_string()).collect()
}

fn match_count(audit: &AuditLog) -> usize {
    audit
        .snapshot()
        .iter()
        .filter(|e| matches!(e, AuditEntry::ExpectationMatch { .. }))
        .count()
}

fn request_only_count(audit: &AuditLog) -> usize {
    audit
        .snapshot()
        .iter()
        .filter(|e| matches!(e, AuditEntry::Request { .. }))
        .count()
}

fn request_response_count(audit: &AuditLog) -> usize {
    audit
        .snapshot()
        .iter()
        .filter(|e| matches!(e, AuditEntry::RequestResponse { .. }))
        .count()
}

#[tokio::test]
async fn test_direct_response_with_delay_blocks_in_synchronous_mode() {
    let expectation = Expectation::new(
        "exp-a",
        RequestMatcher::method_and_path("GET", "/a"),
        Action::Respond {
            response: HttpResponse::new(200).with_body("ok"),
            delay: Delay::milliseconds(50),
        },
    );
    let h = harness(Config::default(), vec![expectation], StubOriginClient::empty_reply());
    let writer = RecordingWriter::new();

    let start = Instant::now();
    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/a"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    assert!(start.elapsed() >= Duration::from_millis(50));
    let response = writer.single();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "ok");
    assert_eq!(match_count(&h.audit), 1);
    assert_eq!(h.audit.len(), 1);
}

#[tokio::test]
async fn test_loop_guard_short_circuits_even_with_a_matching_expectation() {
    let expectation = Expectation::new(
        "exp-x",
        RequestMatcher::any(),
        Action::Respond {
            response: HttpResponse::new(200),
            delay: Delay::none(),
        },
    );
    let h = harness(Config::default(), vec![expectation], StubOriginClient::empty_reply());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("GET", "/x").with_header("X-Forwarded-By", "decoy");
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), false, true)
        .await;

    let response = writer.single();
    assert_eq!(response.status, 404);
    assert_eq!(
        response.first_header(FORWARDED_BY_HEADER),
        Some(FORWARDED_BY_VALUE)
    );
    assert!(h.audit.is_empty());
}

#[tokio::test]
async fn test_cors_preflight_bypasses_not_found_when_enabled() {
    let config = Config {
        enable_cors_for_all_responses: true,
        ..Config::default()
    };
    let h = harness(config, Vec::new(), StubOriginClient::empty_reply());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("OPTIONS", "/anything")
        .with_header("Access-Control-Request-Method", "POST");
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), false, true)
        .await;

    assert_eq!(writer.single().status, 200);
    assert_eq!(request_only_count(&h.audit), 0);
}

#[tokio::test]
async fn test_preflight_still_404s_when_cors_disabled() {
    let h = harness(Config::default(), Vec::new(), StubOriginClient::empty_reply());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("OPTIONS", "/anything")
        .with_header("Access-Control-Request-Method", "POST");
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), false, true)
        .await;

    assert_eq!(writer.single().status, 404);
    assert_eq!(request_only_count(&h.audit), 1);
}

#[tokio::test]
async fn test_exploratory_proxy_connection_refused_returns_404() {
    let client = StubOriginClient::failing(ClientError::ConnectionRefused(
        "unreachable.invalid:1".into(),
    ));
    let h = harness(Config::default(), Vec::new(), client.clone());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("GET", "/")
        .with_header("Host", "unreachable.invalid:1")
        .with_header("Connection", "keep-alive");
    let start = Instant::now();
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), false, true)
        .await;

    assert!(start.elapsed() < Duration::from_millis(1500));
    assert_eq!(writer.single().status, 404);
    assert_eq!(request_only_count(&h.audit), 1);

    let sent = client.sent();
    assert_eq!(sent.len(), 1, "exploratory proxy must not retry");
    let (outbound, _, timeout) = &sent[0];
    assert_eq!(
        outbound.first_header(FORWARDED_BY_HEADER),
        Some(FORWARDED_BY_VALUE)
    );
    assert!(!outbound.headers.contains("connection"));
    assert_eq!(*timeout, Duration::from_millis(EXPLORATORY_TIMEOUT_MS));
}

#[tokio::test]
async fn test_requests_to_local_addresses_are_not_proxied() {
    let h = harness(Config::default(), Vec::new(), StubOriginClient::empty_reply());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("GET", "/missing").with_header("Host", "localhost:2080");
    h.dispatcher
        .process_action(
            request,
            writer.clone(),
            None,
            None,
            &locals(&["localhost:2080"]),
            false,
            true,
        )
        .await;

    assert_eq!(writer.single().status, 404);
    assert_eq!(request_only_count(&h.audit), 1);
}

#[tokio::test]
async fn test_explicit_forward_serves_origin_response() {
    let client = StubOriginClient::replying(HttpResponse::new(201).with_body("created"));
    let expectation = Expectation::new(
        "exp-fwd",
        RequestMatcher::method_and_path("GET", "/relay"),
        Action::Forward {
            host: "origin".into(),
            port: 80,
            scheme: Scheme::Http,
            delay: Delay::none(),
        },
    );
    let h = harness(Config::default(), vec![expectation], client.clone());
    let writer = RecordingWriter::new();

    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/relay"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    let response = writer.single();
    assert_eq!(response.status, 201);
    assert_eq!(response.body, "created");

    // A plain forward records the exchange, not the match.
    assert_eq!(request_response_count(&h.audit), 1);
    assert_eq!(match_count(&h.audit), 0);

    let sent = client.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.host_header(), Some("origin:80"));
}

#[tokio::test]
async fn test_forward_replace_applies_response_override() {
    let client = StubOriginClient::replying(HttpResponse::new(200).with_body("origin body"));
    let expectation = Expectation::new(
        "exp-replace",
        RequestMatcher::method_and_path("GET", "/edit"),
        Action::ForwardReplace {
            request_override: RequestOverride {
                headers: Headers::from_pairs([("Host", "origin.example:8080")]),
                path: Some("/rewritten".into()),
                ..Default::default()
            },
            response_override: Some(ResponseOverride {
                headers: Headers::from_pairs([("X-Edited", "1")]),
                ..Default::default()
            }),
            delay: Delay::none(),
        },
    );
    let h = harness(Config::default(), vec![expectation], client.clone());
    let writer = RecordingWriter::new();

    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/edit"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    let response = writer.single();
    assert_eq!(response.status, 200);
    assert_eq!(response.first_header("x-edited"), Some("1"));

    // Replace-forwards log the match up front, unlike plain forwards.
    assert_eq!(match_count(&h.audit), 1);

    let sent = client.sent();
    assert_eq!(sent[0].0.path, "/rewritten");
    assert_eq!(sent[0].0.host_header(), Some("origin.example:8080"));
}

#[tokio::test]
async fn test_response_template_renders_against_the_request() {
    let expectation = Expectation::new(
        "exp-tmpl",
        RequestMatcher::method_and_path("GET", "/echo"),
        Action::RespondTemplate {
            template: Template::new("status: 200\nbody: 'saw ${request.query.name}'"),
            delay: Delay::none(),
        },
    );
    let h = harness(Config::default(), vec![expectation], StubOriginClient::empty_reply());
    let writer = RecordingWriter::new();

    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/echo").with_query("name=ada"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    assert_eq!(writer.single().body, "saw ada");
    assert_eq!(match_count(&h.audit), 1);
}

#[tokio::test]
async fn test_forward_template_targets_the_rendered_host() {
    let client = StubOriginClient::replying(HttpResponse::new(200).with_body("relayed"));
    let expectation = Expectation::new(
        "exp-fwd-tmpl",
        RequestMatcher::method_and_path("GET", "/outer"),
        Action::ForwardTemplate {
            template: Template::new(
                "method: POST\npath: /inner${request.path}\nheaders:\n  - [host, 'origin:9090']",
            ),
            delay: Delay::none(),
        },
    );
    let h = harness(Config::default(), vec![expectation], client.clone());
    let writer = RecordingWriter::new();

    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/outer"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    assert_eq!(writer.single().body, "relayed");
    assert_eq!(request_response_count(&h.audit), 1);
    assert_eq!(match_count(&h.audit), 0);

    let sent = client.sent();
    assert_eq!(sent[0].0.method, "POST");
    assert_eq!(sent[0].0.path, "/inner/outer");
    assert_eq!(sent[0].0.host_header(), Some("origin:9090"));
}

#[tokio::test]
async fn test_response_callback_is_invoked_by_name() {
    let expectation = Expectation::new(
        "exp-cb",
        RequestMatcher::method_and_path("GET", "/cb"),
        Action::RespondViaCallback {
            name: "echo-method".into(),
        },
    );
    let h = harness(Config::default(), vec![expectation], StubOriginClient::empty_reply());
    h.callbacks.register_response(
        "echo-method",
        Arc::new(|request: &HttpRequest| -> Result<HttpResponse, ActionError> {
            Ok(HttpResponse::new(200).with_body(request.method.clone()))
        }),
    );
    let writer = RecordingWriter::new();

    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/cb"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    assert_eq!(writer.single().body, "GET");
    assert_eq!(match_count(&h.audit), 1);
}

#[tokio::test]
async fn test_missing_callback_writes_nothing_but_logs_the_match() {
    let expectation = Expectation::new(
        "exp-missing",
        RequestMatcher::any(),
        Action::RespondViaCallback {
            name: "never-registered".into(),
        },
    );
    let h = harness(Config::default(), vec![expectation], StubOriginClient::empty_reply());
    let writer = RecordingWriter::new();

    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/cb"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    // The channel is left to close without a response.
    assert_eq!(writer.count(), 0);
    assert_eq!(match_count(&h.audit), 1);
}

#[tokio::test]
async fn test_remote_response_callback_owns_completion() {
    let expectation = Expectation::new(
        "exp-remote",
        RequestMatcher::method_and_path("GET", "/remote"),
        Action::RespondViaRemote {
            client_id: "client-7".into(),
        },
    );
    let h = harness(Config::default(), vec![expectation], StubOriginClient::empty_reply());
    h.remotes.registry().register_response(
        "client-7",
        Arc::new(|_request: &HttpRequest| -> Result<HttpResponse, ActionError> {
            Ok(HttpResponse::new(202).with_body("from the peer"))
        }),
    );
    let writer = RecordingWriter::new();

    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/remote"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    let response = writer.single();
    assert_eq!(response.status, 202);
    assert_eq!(response.body, "from the peer");
    assert_eq!(match_count(&h.audit), 1);
}

struct RelayToOrigin;

impl RequestCallback for RelayToOrigin {
    fn handle(&self, request: &HttpRequest) -> Result<HttpRequest, ActionError> {
        Ok(request
            .clone()
            .with_header("Host", "origin.internal:7070")
            .with_header("X-Relayed", "1"))
    }
}

#[tokio::test]
async fn test_forward_callback_shapes_the_outbound_request() {
    let client = StubOriginClient::replying(HttpResponse::new(200).with_body("ok"));
    let expectation = Expectation::new(
        "exp-fwd-cb",
        RequestMatcher::method_and_path("GET", "/shape"),
        Action::ForwardViaCallback {
            name: "relay".into(),
        },
    );
    let h = harness(Config::default(), vec![expectation], client.clone());
    h.callbacks.register_request("relay", Arc::new(RelayToOrigin));
    let writer = RecordingWriter::new();

    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/shape"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    assert_eq!(writer.single().status, 200);
    assert_eq!(match_count(&h.audit), 1);
    // Callback forwards do not append a request/response audit entry.
    assert_eq!(request_response_count(&h.audit), 0);

    let sent = client.sent();
    assert_eq!(sent[0].0.first_header("x-relayed"), Some("1"));
    assert_eq!(sent[0].0.host_header(), Some("origin.internal:7070"));
}

#[derive(Default)]
struct RecordingConnection {
    closed: Mutex<bool>,
    raw: Mutex<Vec<u8>>,
}

impl ConnectionHandle for RecordingConnection {
    fn close(&self) {
        *self.closed.lock() = true;
    }

    fn send_raw(&self, bytes: &[u8]) {
        self.raw.lock().extend_from_slice(bytes);
    }
}

#[tokio::test]
async fn test_fault_action_acts_on_the_connection() {
    let expectation = Expectation::new(
        "exp-fault",
        RequestMatcher::method_and_path("GET", "/broken"),
        Action::Fault {
            behavior: FaultBehavior {
                response_bytes: Some("garbage".into()),
                drop_connection: true,
            },
            delay: Delay::none(),
        },
    );
    let h = harness(Config::default(), vec![expectation], StubOriginClient::empty_reply());
    let writer = RecordingWriter::new();
    let connection = Arc::new(RecordingConnection::default());

    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/broken"),
            writer.clone(),
            Some(connection.clone()),
            None,
            &no_locals(),
            false,
            true,
        )
        .await;

    assert_eq!(writer.count(), 0);
    assert_eq!(connection.raw.lock().as_slice(), b"garbage");
    assert!(*connection.closed.lock());
    assert_eq!(match_count(&h.audit), 1);
}

#[tokio::test]
async fn test_exploratory_proxy_success_records_the_exchange() {
    let client = StubOriginClient::replying(HttpResponse::new(200).with_body("real origin"));
    let h = harness(Config::default(), Vec::new(), client.clone());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("GET", "/real").with_header("Host", "elsewhere.example");
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), false, true)
        .await;

    assert_eq!(writer.single().body, "real origin");
    assert_eq!(request_response_count(&h.audit), 1);
    assert_eq!(request_only_count(&h.audit), 0);
}

#[tokio::test]
async fn test_proxying_to_ourselves_falls_back_and_strips_the_sentinel() {
    // The "origin" is this server: its 404 echoes the sentinel back.
    let self_reply = HttpResponse::new(404).with_header(FORWARDED_BY_HEADER, FORWARDED_BY_VALUE);
    let client = StubOriginClient::replying(self_reply);
    let h = harness(Config::default(), Vec::new(), client.clone());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("GET", "/loop").with_header("Host", "also-us.example");
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), false, true)
        .await;

    let response = writer.single();
    assert_eq!(response.status, 404);
    assert!(!response.headers.contains(FORWARDED_BY_HEADER));
    assert_eq!(request_only_count(&h.audit), 1);
    assert_eq!(request_response_count(&h.audit), 0);
}

#[tokio::test]
async fn test_empty_origin_reply_becomes_404() {
    let client = StubOriginClient::empty_reply();
    let h = harness(Config::default(), Vec::new(), client.clone());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("GET", "/void").with_header("Host", "elsewhere.example");
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), false, true)
        .await;

    assert_eq!(writer.single().status, 404);
}

#[tokio::test]
async fn test_explicit_proxy_uses_the_configured_timeout() {
    let client = StubOriginClient::replying(HttpResponse::new(200));
    let config = Config {
        socket_connection_timeout_ms: 7000,
        ..Config::default()
    };
    let h = harness(config, Vec::new(), client.clone());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("GET", "/via-proxy").with_header("Host", "target.example");
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), true, true)
        .await;

    let sent = client.sent();
    assert_eq!(sent[0].2, Duration::from_millis(7000));
    // Explicit proxying adds no sentinel.
    assert!(!sent[0].0.headers.contains(FORWARDED_BY_HEADER));
}

#[tokio::test]
async fn test_communication_failure_returns_404_in_any_proxy_mode() {
    let client = StubOriginClient::failing(ClientError::Communication(
        "target.example".into(),
        "connection reset".into(),
    ));
    let h = harness(Config::default(), Vec::new(), client.clone());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("GET", "/x").with_header("Host", "target.example");
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), true, true)
        .await;

    assert_eq!(writer.single().status, 404);
}

#[tokio::test]
async fn test_explicit_proxy_connection_error_writes_nothing() {
    let client = StubOriginClient::failing(ClientError::ConnectionRefused("target:80".into()));
    let h = harness(Config::default(), Vec::new(), client.clone());
    let writer = RecordingWriter::new();

    let request = HttpRequest::new("GET", "/x").with_header("Host", "target:80");
    h.dispatcher
        .process_action(request, writer.clone(), None, None, &no_locals(), true, true)
        .await;

    // The connection is allowed to close without a response.
    assert_eq!(writer.count(), 0);
    assert_eq!(request_only_count(&h.audit), 0);
}

#[tokio::test]
async fn test_asynchronous_mode_releases_the_caller_before_the_delay() {
    let expectation = Expectation::new(
        "exp-async",
        RequestMatcher::method_and_path("GET", "/slow"),
        Action::Respond {
            response: HttpResponse::new(200).with_body("late"),
            delay: Delay::milliseconds(60),
        },
    );
    let h = harness(Config::default(), vec![expectation], StubOriginClient::empty_reply());
    let writer = RecordingWriter::new();

    let start = Instant::now();
    h.dispatcher
        .process_action(
            HttpRequest::new("GET", "/slow"),
            writer.clone(),
            None,
            None,
            &no_locals(),
            false,
            false,
        )
        .await;
    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(writer.count(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(writer.single().body, "late");
    assert_eq!(match_count(&h.audit), 1);
}
