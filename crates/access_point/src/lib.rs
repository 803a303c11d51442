use async_trait::async_trait;
use ec_einv_core::access_key::AccessKey;
use ec_einv_core::models::Environment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mock;
pub mod sri_service;
pub mod sri_types;

/// One entry of the authority's message list, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityMessage {
    pub identifier: String,
    pub message: String,
    #[serde(default)]
    pub additional_info: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

impl AuthorityMessage {
    pub fn new(identifier: &str, message: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            message: message.to_string(),
            additional_info: None,
            kind: None,
        }
    }
}

impl std::fmt::Display for AuthorityMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.identifier, self.message)?;
        if let Some(info) = &self.additional_info {
            write!(f, " ({info})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReceptionResult {
    /// Structurally valid and queued for authorization.
    Accepted {
        messages: Vec<AuthorityMessage>,
        raw_response: String,
    },
    /// Failed structural checks. Must not be resubmitted unchanged.
    Returned {
        messages: Vec<AuthorityMessage>,
        raw_response: String,
    },
}

impl ReceptionResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReceptionResult::Accepted { .. })
    }

    pub fn messages(&self) -> &[AuthorityMessage] {
        match self {
            ReceptionResult::Accepted { messages, .. }
            | ReceptionResult::Returned { messages, .. } => messages,
        }
    }

    pub fn raw_response(&self) -> &str {
        match self {
            ReceptionResult::Accepted { raw_response, .. }
            | ReceptionResult::Returned { raw_response, .. } => raw_response,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuthorizationResult {
    Authorized {
        authorization_number: String,
        authorization_date: Option<String>,
        authorized_document: Option<String>,
        messages: Vec<AuthorityMessage>,
        raw_response: String,
    },
    NotAuthorized {
        messages: Vec<AuthorityMessage>,
        raw_response: String,
    },
    /// Not decided yet; query again later.
    Pending {
        messages: Vec<AuthorityMessage>,
        raw_response: String,
    },
}

impl AuthorizationResult {
    pub fn messages(&self) -> &[AuthorityMessage] {
        match self {
            AuthorizationResult::Authorized { messages, .. }
            | AuthorizationResult::NotAuthorized { messages, .. }
            | AuthorizationResult::Pending { messages, .. } => messages,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AuthorizationResult::Pending { .. })
    }
}

/// Failures below the protocol level. Rejections by the authority are results, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authority server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },
    #[error("authority refused request (HTTP {status}): {body}")]
    Http { status: u16, body: String },
    #[error("malformed authority response: {0}")]
    MalformedResponse(String),
}

impl TransportError {
    /// Timeouts, connection failures and 5xx may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Connection(_)
                | TransportError::Server { .. }
        )
    }
}

#[async_trait]
pub trait FiscalTransport: Send + Sync {
    async fn submit_for_reception(
        &self,
        signed_xml: &str,
        environment: Environment,
    ) -> Result<ReceptionResult, TransportError>;

    async fn query_authorization(
        &self,
        access_key: &AccessKey,
        environment: Environment,
    ) -> Result<AuthorizationResult, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(TransportError::Timeout("15s".into()).is_retryable());
        assert!(TransportError::Connection("refused".into()).is_retryable());
        assert!(TransportError::Server { status: 503, body: String::new() }.is_retryable());
        assert!(!TransportError::Http { status: 404, body: String::new() }.is_retryable());
        assert!(!TransportError::MalformedResponse("x".into()).is_retryable());
    }

    #[test]
    fn message_display_includes_details() {
        let mut msg = AuthorityMessage::new("35", "ARCHIVO NO CUMPLE ESTRUCTURA XML");
        msg.additional_info = Some("campo fechaEmision".into());
        assert_eq!(msg.to_string(), "[35] ARCHIVO NO CUMPLE ESTRUCTURA XML (campo fechaEmision)");
    }
}
