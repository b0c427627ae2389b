//! The action dispatch core: match the request, run the action under its
//! timing discipline, fall back to transparent proxying, audit everything.

pub mod executors;
#[cfg(test)]
mod tests;

use crate::audit::AuditLog;
use crate::callback::{CallbackRegistry, RemoteCallbacks};
use crate::config::Config;
use crate::cors::is_preflight_request;
use crate::curl;
use crate::error::ClientError;
use crate::model::{Action, Expectation, ExpectationStore, HttpRequest, HttpResponse};
use crate::proxy::client::OriginClient;
use crate::proxy::strip_hop_by_hop_headers;
use crate::scheduler::Scheduler;
use crate::template::TemplateEngine;
use crate::writer::ResponseWriter;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Loop-detection sentinel. Written exact-case on outbound exploratory
/// forwards, read case-insensitively everywhere.
pub const FORWARDED_BY_HEADER: &str = "x-forwarded-by";
pub const FORWARDED_BY_VALUE: &str = "Decoy";

/// Budget for a best-effort forward when the client probably meant a real
/// host but the server was not configured as a proxy.
pub const EXPLORATORY_TIMEOUT_MS: u64 = 1000;

/// Transport-level access to the client channel, for `fault` actions.
pub trait ConnectionHandle: Send + Sync {
    /// Tear the connection down without a response.
    fn close(&self);

    /// Write raw bytes to the channel, bypassing the HTTP encoder.
    fn send_raw(&self, bytes: &[u8]);
}

/// Re-entrant, stateless-per-call dispatcher. One instance serves every
/// connection; the shared collaborators are behind `Arc`s.
pub struct Dispatcher {
    config: Arc<Config>,
    expectations: Arc<ExpectationStore>,
    scheduler: Scheduler,
    audit: Arc<AuditLog>,
    client: Arc<dyn OriginClient>,
    templates: Arc<dyn TemplateEngine>,
    callbacks: Arc<CallbackRegistry>,
    remote_callbacks: Arc<dyn RemoteCallbacks>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        expectations: Arc<ExpectationStore>,
        audit: Arc<AuditLog>,
        client: Arc<dyn OriginClient>,
        templates: Arc<dyn TemplateEngine>,
        callbacks: Arc<CallbackRegistry>,
        remote_callbacks: Arc<dyn RemoteCallbacks>,
    ) -> Self {
        Self {
            config,
            expectations,
            scheduler: Scheduler::new(),
            audit,
            client,
            templates,
            callbacks,
            remote_callbacks,
        }
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    /// Handle one request end to end.
    ///
    /// With `synchronous=true` the call only returns once the action chain,
    /// including its delay, has completed and the response is written; with
    /// `synchronous=false` the I/O task is released as soon as the work is
    /// scheduled.
    #[allow(clippy::too_many_arguments)]
    pub async fn process_action(
        &self,
        request: HttpRequest,
        writer: Arc<dyn ResponseWriter>,
        connection: Option<Arc<dyn ConnectionHandle>>,
        original_destination: Option<SocketAddr>,
        local_addresses: &HashSet<String>,
        proxy_this_request: bool,
        synchronous: bool,
    ) {
        let expectation = self.expectations.first_matching(&request);

        if request
            .headers
            .contains_value(FORWARDED_BY_HEADER, FORWARDED_BY_VALUE)
        {
            // This request is the server talking to itself through the
            // exploratory proxy; it must not recurse.
            debug!(
                "request carries '{}: {}' from our own exploratory proxy, not recursing",
                FORWARDED_BY_HEADER, FORWARDED_BY_VALUE
            );
            write_not_found(&self.audit, writer.as_ref(), &request);
        } else if let Some(expectation) = expectation {
            self.apply_action(expectation, request, writer, connection, synchronous)
                .await;
        } else if (self.config.enable_cors_for_api || self.config.enable_cors_for_all_responses)
            && is_preflight_request(&request)
        {
            writer.write_status(&request, 200);
        } else if proxy_this_request
            || request
                .host_header()
                .is_some_and(|host| !host.is_empty() && !local_addresses.contains(host))
        {
            self.proxy_request(
                request,
                writer,
                original_destination,
                !proxy_this_request,
                synchronous,
            )
            .await;
        } else {
            write_not_found(&self.audit, writer.as_ref(), &request);
        }
    }

    /// The ten-arm action branch of a matched expectation.
    async fn apply_action(
        &self,
        expectation: Expectation,
        request: HttpRequest,
        writer: Arc<dyn ResponseWriter>,
        connection: Option<Arc<dyn ConnectionHandle>>,
        synchronous: bool,
    ) {
        let expectation_id = expectation.id.clone();
        let timeout = self.config.socket_connection_timeout();
        let scheduler = self.scheduler;

        match expectation.action {
            Action::Respond { response, delay } => {
                self.audit.expectation_match(&request, &expectation_id);
                let writer = writer.clone();
                let req = request;
                self.scheduler
                    .schedule(delay, synchronous, async move {
                        let rendered = executors::canned_response(&response);
                        writer.write_response(&req, rendered.clone(), false);
                        log_expectation_response(&expectation_id, &req, &rendered);
                    })
                    .await;
            }

            Action::RespondTemplate { template, delay } => {
                self.audit.expectation_match(&request, &expectation_id);
                let templates = self.templates.clone();
                let writer = writer.clone();
                let req = request;
                self.scheduler
                    .schedule(delay, synchronous, async move {
                        match executors::templated_response(templates.as_ref(), &template, &req) {
                            Ok(rendered) => {
                                writer.write_response(&req, rendered.clone(), false);
                                log_expectation_response(&expectation_id, &req, &rendered);
                            }
                            Err(err) => error!(
                                expectation = %expectation_id,
                                "response template failed: {err}"
                            ),
                        }
                    })
                    .await;
            }

            Action::RespondViaCallback { name } => {
                self.audit.expectation_match(&request, &expectation_id);
                let callbacks = self.callbacks.clone();
                let writer = writer.clone();
                let req = request;
                self.scheduler
                    .submit(synchronous, async move {
                        match executors::callback_response(callbacks.as_ref(), &name, &req) {
                            Ok(rendered) => {
                                writer.write_response(&req, rendered.clone(), false);
                                log_expectation_response(&expectation_id, &req, &rendered);
                            }
                            Err(err) => error!(
                                expectation = %expectation_id,
                                "response callback '{name}' failed: {err}"
                            ),
                        }
                    })
                    .await;
            }

            Action::RespondViaRemote { client_id } => {
                self.audit.expectation_match(&request, &expectation_id);
                let remotes = self.remote_callbacks.clone();
                let writer = writer.clone();
                let req = request;
                // The remote peer owns response completion, so the writer is
                // handed to the executor task wholesale.
                self.scheduler
                    .submit(synchronous, async move {
                        match remotes.response_exchange(&client_id, &req).await {
                            Ok(rendered) => {
                                writer.write_response(&req, rendered.clone(), false);
                                log_expectation_response(&expectation_id, &req, &rendered);
                            }
                            Err(err) => error!(
                                expectation = %expectation_id,
                                "remote callback '{client_id}' failed: {err}"
                            ),
                        }
                    })
                    .await;
            }

            Action::Forward {
                host,
                port,
                scheme,
                delay,
            } => {
                // No expectation-match entry here: for a plain forward the
                // recorded event is the origin's response.
                let client = self.client.clone();
                let audit = self.audit.clone();
                let writer = writer.clone();
                let req = request;
                self.scheduler
                    .schedule(delay, synchronous, async move {
                        let pending = executors::forward_to_origin(
                            client.as_ref(),
                            &req,
                            &host,
                            port,
                            scheme,
                            timeout,
                        );
                        scheduler
                            .submit_on_complete(pending, synchronous, move |outcome| async move {
                                match outcome {
                                    Ok(response) => {
                                        let response =
                                            response.unwrap_or_else(HttpResponse::not_found);
                                        writer.write_response(&req, response.clone(), false);
                                        audit.request_response(&req, &response);
                                        log_expectation_response(&expectation_id, &req, &response);
                                    }
                                    Err(err) => error!(
                                        expectation = %expectation_id,
                                        "forward to {host}:{port} failed: {err}"
                                    ),
                                }
                            })
                            .await;
                    })
                    .await;
            }

            Action::ForwardTemplate { template, delay } => {
                // Same audit shape as a plain forward.
                let client = self.client.clone();
                let audit = self.audit.clone();
                let templates = self.templates.clone();
                let writer = writer.clone();
                let req = request;
                self.scheduler
                    .schedule(delay, synchronous, async move {
                        let shaped = match executors::templated_request(
                            templates.as_ref(),
                            &template,
                            &req,
                        ) {
                            Ok(shaped) => shaped,
                            Err(err) => {
                                error!(
                                    expectation = %expectation_id,
                                    "forward template failed: {err}"
                                );
                                return;
                            }
                        };
                        let pending =
                            executors::forward_shaped_request(client.as_ref(), &shaped, timeout);
                        scheduler
                            .submit_on_complete(pending, synchronous, move |outcome| async move {
                                match outcome {
                                    Ok(response) => {
                                        let response =
                                            response.unwrap_or_else(HttpResponse::not_found);
                                        writer.write_response(&req, response.clone(), false);
                                        audit.request_response(&req, &response);
                                        log_expectation_response(&expectation_id, &req, &response);
                                    }
                                    Err(err) => error!(
                                        expectation = %expectation_id,
                                        "templated forward failed: {err}"
                                    ),
                                }
                            })
                            .await;
                    })
                    .await;
            }

            Action::ForwardViaCallback { name } => {
                self.audit.expectation_match(&request, &expectation_id);
                let client = self.client.clone();
                let callbacks = self.callbacks.clone();
                let writer = writer.clone();
                let req = request;
                self.scheduler
                    .submit(synchronous, async move {
                        let shaped =
                            match executors::callback_request(callbacks.as_ref(), &name, &req) {
                                Ok(shaped) => shaped,
                                Err(err) => {
                                    error!(
                                        expectation = %expectation_id,
                                        "forward callback '{name}' failed: {err}"
                                    );
                                    return;
                                }
                            };
                        let pending =
                            executors::forward_shaped_request(client.as_ref(), &shaped, timeout);
                        scheduler
                            .submit_on_complete(pending, synchronous, move |outcome| async move {
                                match outcome {
                                    Ok(response) => {
                                        let response =
                                            response.unwrap_or_else(HttpResponse::not_found);
                                        writer.write_response(&req, response.clone(), false);
                                        log_expectation_response(&expectation_id, &req, &response);
                                    }
                                    Err(err) => error!(
                                        expectation = %expectation_id,
                                        "callback forward failed: {err}"
                                    ),
                                }
                            })
                            .await;
                    })
                    .await;
            }

            Action::ForwardViaRemote { client_id } => {
                self.audit.expectation_match(&request, &expectation_id);
                let client = self.client.clone();
                let remotes = self.remote_callbacks.clone();
                let writer = writer.clone();
                let req = request;
                // The executor owns the full lifecycle: remote exchange,
                // forward, response write.
                self.scheduler
                    .submit(synchronous, async move {
                        let shaped = match remotes.request_exchange(&client_id, &req).await {
                            Ok(shaped) => shaped,
                            Err(err) => {
                                error!(
                                    expectation = %expectation_id,
                                    "remote callback '{client_id}' failed: {err}"
                                );
                                return;
                            }
                        };
                        match executors::forward_shaped_request(client.as_ref(), &shaped, timeout)
                            .await
                        {
                            Ok(response) => {
                                let response = response.unwrap_or_else(HttpResponse::not_found);
                                writer.write_response(&req, response.clone(), false);
                                log_expectation_response(&expectation_id, &req, &response);
                            }
                            Err(err) => error!(
                                expectation = %expectation_id,
                                "remote callback forward failed: {err}"
                            ),
                        }
                    })
                    .await;
            }

            Action::ForwardReplace {
                request_override,
                response_override,
                delay,
            } => {
                self.audit.expectation_match(&request, &expectation_id);
                let client = self.client.clone();
                let writer = writer.clone();
                let req = request;
                self.scheduler
                    .schedule(delay, synchronous, async move {
                        let shaped = request_override.apply(&req);
                        let pending =
                            executors::forward_shaped_request(client.as_ref(), &shaped, timeout);
                        scheduler
                            .submit_on_complete(pending, synchronous, move |outcome| async move {
                                match outcome {
                                    Ok(response) => {
                                        let response =
                                            response.unwrap_or_else(HttpResponse::not_found);
                                        let response = match &response_override {
                                            Some(over) => over.apply(response),
                                            None => response,
                                        };
                                        writer.write_response(&req, response.clone(), false);
                                        log_expectation_response(&expectation_id, &req, &response);
                                    }
                                    Err(err) => error!(
                                        expectation = %expectation_id,
                                        "override forward failed: {err}"
                                    ),
                                }
                            })
                            .await;
                    })
                    .await;
            }

            Action::Fault { behavior, delay } => {
                self.audit.expectation_match(&request, &expectation_id);
                let req = request;
                self.scheduler
                    .schedule(delay, synchronous, async move {
                        match connection {
                            Some(connection) => {
                                executors::apply_fault(&behavior, connection.as_ref());
                                info!(
                                    kind = "EXPECTATION_RESPONSE",
                                    expectation = %expectation_id,
                                    "emitted channel fault for {} {}",
                                    req.method,
                                    req.uri()
                                );
                            }
                            None => warn!(
                                expectation = %expectation_id,
                                "fault action has no connection handle to act on"
                            ),
                        }
                    })
                    .await;
            }
        }
    }

    /// Forward an unmatched request: explicitly when configured as a proxy,
    /// exploratorily when the Host header points away from this server.
    async fn proxy_request(
        &self,
        request: HttpRequest,
        writer: Arc<dyn ResponseWriter>,
        original_destination: Option<SocketAddr>,
        exploratory: bool,
        synchronous: bool,
    ) {
        let mut outbound = strip_hop_by_hop_headers(&request);
        if exploratory {
            outbound = outbound.with_header(FORWARDED_BY_HEADER, FORWARDED_BY_VALUE);
        }
        let timeout = if exploratory {
            Duration::from_millis(EXPLORATORY_TIMEOUT_MS)
        } else {
            self.config.socket_connection_timeout()
        };

        let pending = self.client.send(outbound, original_destination, timeout);
        let audit = self.audit.clone();
        self.scheduler
            .submit_on_complete(pending, synchronous, move |outcome| async move {
                match outcome {
                    Ok(response) => {
                        let response = response.unwrap_or_else(HttpResponse::not_found);
                        if response
                            .headers
                            .contains_value(FORWARDED_BY_HEADER, FORWARDED_BY_VALUE)
                        {
                            // The origin was this server itself. The sentinel
                            // stays off the wire to the real client.
                            let mut to_client = response;
                            to_client.headers.remove(FORWARDED_BY_HEADER);
                            writer.write_response(&request, to_client, false);
                            audit.request(&request);
                            info!(
                                kind = "EXPECTATION_NOT_MATCHED",
                                "no matching expectation for {} {}, returning 404",
                                request.method,
                                request.uri()
                            );
                        } else {
                            writer.write_response(&request, response.clone(), false);
                            audit.request_response(&request, &response);
                            info!(
                                kind = "FORWARDED_REQUEST",
                                curl = %curl::to_curl(&request, original_destination),
                                "forwarded {} {} with status {}",
                                request.method,
                                request.uri(),
                                response.status
                            );
                        }
                    }
                    Err(ClientError::Communication(target, reason)) => {
                        debug!("communication with {target} broke down: {reason}");
                        write_not_found(&audit, writer.as_ref(), &request);
                    }
                    Err(err) if exploratory && err.is_connection_error() => {
                        debug!(
                            "exploratory proxy could not reach the origin for {} {} ({err}), \
                             falling back to no proxy",
                            request.method,
                            request.uri()
                        );
                        write_not_found(&audit, writer.as_ref(), &request);
                    }
                    Err(err) => error!(
                        "proxy forward for {} {} failed: {err}",
                        request.method,
                        request.uri()
                    ),
                }
            })
            .await;
    }
}

fn log_expectation_response(expectation_id: &str, request: &HttpRequest, response: &HttpResponse) {
    info!(
        kind = "EXPECTATION_RESPONSE",
        expectation = %expectation_id,
        "returning response with status {} for {} {}",
        response.status,
        request.method,
        request.uri()
    );
}

/// Write a 404. A sentinel-bearing request gets the sentinel echoed and no
/// audit entry, so the exploratory sender knows to fall back quietly.
fn write_not_found(audit: &AuditLog, writer: &dyn ResponseWriter, request: &HttpRequest) {
    let mut response = HttpResponse::not_found();
    if request
        .headers
        .contains_value(FORWARDED_BY_HEADER, FORWARDED_BY_VALUE)
    {
        response.headers.add(FORWARDED_BY_HEADER, FORWARDED_BY_VALUE);
    } else {
        audit.request(request);
        info!(
            kind = "EXPECTATION_NOT_MATCHED",
            "no matching expectation for {} {}, returning 404",
            request.method,
            request.uri()
        );
    }
    writer.write_response(request, response, false);
}
