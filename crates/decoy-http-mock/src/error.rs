//! Error taxonomies for outbound transport and action execution.

use thiserror::Error;

/// Failure modes of an outbound forward to an origin server.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("connection to {0} timed out")]
    ConnectionTimeout(String),

    #[error("communication with {0} failed: {1}")]
    Communication(String, String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// True for failures that mean the remote socket could not be reached at
    /// all, as opposed to failures mid-exchange.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionRefused(_) | ClientError::ConnectionTimeout(_)
        )
    }
}

/// Failure modes of executing a matched action.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    #[error("template render failed: {0}")]
    TemplateRender(String),

    #[error("callback '{0}' is not registered")]
    CallbackNotFound(String),

    #[error("callback '{0}' failed: {1}")]
    CallbackFailed(String, String),

    #[error("remote callback '{0}' timed out")]
    CallbackTimeout(String),
}
