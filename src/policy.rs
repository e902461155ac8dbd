//! Authorization policy for a single device
//!
//! A verified credential only proves the holder has the device key. The policy
//! additionally binds the connection to exactly one identity path, the
//! sentinel username, and exactly one topic. Matching is byte equality; there
//! are no wildcards and no prefix matches.

use crate::identity::{IdentityPath, TopicKind, DEVICE_USERNAME};
use crate::packet::connack::ConnectReturnCode;
use thiserror::Error;
use tracing::debug;

/// Why a request was denied
///
/// The `Display` text of the credential variants is what the broker logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    #[error("missing credential")]
    MissingCredential,

    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    #[error("algorithm mismatch: expected {expected}, found {found}")]
    AlgorithmMismatch { expected: String, found: String },

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("audience mismatch")]
    AudienceMismatch { expected: String, found: String },

    #[error("expired")]
    Expired { expired_at: i64, now: i64 },

    #[error("not yet valid")]
    NotYetValid { issued_at: i64, now: i64 },

    #[error("identity mismatch: {presented}")]
    IdentityMismatch { presented: String },

    #[error("username mismatch")]
    UsernameMismatch,

    #[error("topic not allowed: {topic}")]
    TopicNotAllowed { topic: String },
}

impl DenyReason {
    /// CONNACK return code used when this reason refuses a connection
    #[must_use]
    pub fn connect_return_code(&self) -> ConnectReturnCode {
        match self {
            Self::MissingCredential | Self::MalformedCredential(_) | Self::UsernameMismatch => {
                ConnectReturnCode::BadUsernameOrPassword
            }
            _ => ConnectReturnCode::NotAuthorized,
        }
    }
}

/// Outcome of one authorization check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(DenyReason),
}

impl AuthDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Converts to a `Result` so checks can be chained with `?`
    ///
    /// # Errors
    ///
    /// Returns the deny reason if the decision is `Deny`.
    pub fn into_result(self) -> Result<(), DenyReason> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(reason) => Err(reason),
        }
    }
}

impl From<Result<(), DenyReason>> for AuthDecision {
    fn from(result: Result<(), DenyReason>) -> Self {
        match result {
            Ok(()) => Self::Allow,
            Err(reason) => Self::Deny(reason),
        }
    }
}

/// Kind of access being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Publish,
    Subscribe,
}

/// Per-device authorization policy
#[derive(Debug, Clone)]
pub struct AuthorizationPolicy {
    identity: IdentityPath,
    allowed_topic: String,
    allow_subscribe: bool,
}

impl AuthorizationPolicy {
    /// Policy allowing `identity` to use its own events topic
    #[must_use]
    pub fn new(identity: IdentityPath) -> Self {
        let allowed_topic = identity.topic(TopicKind::Events);
        Self {
            identity,
            allowed_topic,
            allow_subscribe: true,
        }
    }

    /// Whether the device may also subscribe to its events topic
    #[must_use]
    pub fn with_subscribe(mut self, allow: bool) -> Self {
        self.allow_subscribe = allow;
        self
    }

    #[must_use]
    pub fn identity(&self) -> &IdentityPath {
        &self.identity
    }

    #[must_use]
    pub fn allowed_topic(&self) -> &str {
        &self.allowed_topic
    }

    /// Checks the client id and username presented in CONNECT
    #[must_use]
    pub fn authorize_connect(&self, client_id: &str, username: Option<&str>) -> AuthDecision {
        if client_id != self.identity.as_str() {
            debug!(client_id = %client_id, expected = %self.identity, "Identity mismatch");
            return AuthDecision::Deny(DenyReason::IdentityMismatch {
                presented: client_id.to_string(),
            });
        }
        if username != Some(DEVICE_USERNAME) {
            return AuthDecision::Deny(DenyReason::UsernameMismatch);
        }
        AuthDecision::Allow
    }

    /// Checks a publish topic or subscribe filter for an already connected client
    #[must_use]
    pub fn authorize_topic(&self, client_id: &str, topic: &str, access: AccessType) -> AuthDecision {
        if client_id != self.identity.as_str() {
            return AuthDecision::Deny(DenyReason::IdentityMismatch {
                presented: client_id.to_string(),
            });
        }
        if access == AccessType::Subscribe && !self.allow_subscribe {
            return AuthDecision::Deny(DenyReason::TopicNotAllowed {
                topic: topic.to_string(),
            });
        }
        if topic != self.allowed_topic {
            debug!(client_id = %client_id, topic = %topic, ?access, "Topic not allowed");
            return AuthDecision::Deny(DenyReason::TopicNotAllowed {
                topic: topic.to_string(),
            });
        }
        AuthDecision::Allow
    }
}
