//! Authentication and authorization hooks for the MQTT broker

use crate::error::Result;
use crate::packet::connack::ConnectReturnCode;
use crate::packet::connect::ConnectPacket;
use crate::policy::{AuthDecision, DenyReason};
use async_trait::async_trait;
use std::net::SocketAddr;

/// Authentication result from an auth provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub authenticated: bool,
    /// Return code for CONNACK
    pub return_code: ConnectReturnCode,
    /// Why the connection was refused, when the provider knows
    pub reason: Option<DenyReason>,
    /// Identity established by the provider
    pub user_id: Option<String>,
}

impl AuthResult {
    #[must_use]
    pub fn success() -> Self {
        Self {
            authenticated: true,
            return_code: ConnectReturnCode::Accepted,
            reason: None,
            user_id: None,
        }
    }

    #[must_use]
    pub fn success_with_user(user_id: String) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::success()
        }
    }

    #[must_use]
    pub fn fail(return_code: ConnectReturnCode) -> Self {
        Self {
            authenticated: false,
            return_code,
            reason: None,
            user_id: None,
        }
    }

    /// Refusal carrying the deny reason and its matching return code
    #[must_use]
    pub fn deny(reason: DenyReason) -> Self {
        Self {
            authenticated: false,
            return_code: reason.connect_return_code(),
            reason: Some(reason),
            user_id: None,
        }
    }
}

/// Authentication provider trait
///
/// A denial is a value, not an error: `Err` is reserved for failures of the
/// check itself. The broker keeps serving other clients either way.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Authenticate a client connection
    ///
    /// # Errors
    ///
    /// Returns an error if the check itself fails (not an auth failure)
    async fn authenticate(
        &self,
        connect: &ConnectPacket,
        client_addr: SocketAddr,
    ) -> Result<AuthResult>;

    /// Check whether a connected client may publish to a topic
    ///
    /// # Errors
    ///
    /// Returns an error if the check itself fails
    async fn authorize_publish(
        &self,
        client_id: &str,
        user_id: Option<&str>,
        topic: &str,
    ) -> Result<AuthDecision>;

    /// Check whether a connected client may subscribe to a topic filter
    ///
    /// # Errors
    ///
    /// Returns an error if the check itself fails
    async fn authorize_subscribe(
        &self,
        client_id: &str,
        user_id: Option<&str>,
        topic_filter: &str,
    ) -> Result<AuthDecision>;
}

/// Allow all authentication provider (for testing/development)
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthProvider;

#[async_trait]
impl AuthProvider for AllowAllAuthProvider {
    async fn authenticate(
        &self,
        _connect: &ConnectPacket,
        _client_addr: SocketAddr,
    ) -> Result<AuthResult> {
        Ok(AuthResult::success())
    }

    async fn authorize_publish(
        &self,
        _client_id: &str,
        _user_id: Option<&str>,
        _topic: &str,
    ) -> Result<AuthDecision> {
        Ok(AuthDecision::Allow)
    }

    async fn authorize_subscribe(
        &self,
        _client_id: &str,
        _user_id: Option<&str>,
        _topic_filter: &str,
    ) -> Result<AuthDecision> {
        Ok(AuthDecision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all_provider() {
        let provider = AllowAllAuthProvider;
        let connect = ConnectPacket::new("test-client");
        let addr = "127.0.0.1:12345".parse().unwrap();

        let result = provider.authenticate(&connect, addr).await.unwrap();
        assert!(result.authenticated);
        assert_eq!(result.return_code, ConnectReturnCode::Accepted);

        assert!(provider
            .authorize_publish("test", None, "/devices/d1/state")
            .await
            .unwrap()
            .is_allowed());
        assert!(provider
            .authorize_subscribe("test", None, "/devices/d1/events")
            .await
            .unwrap()
            .is_allowed());
    }

    #[test]
    fn test_auth_result_builders() {
        let result = AuthResult::success_with_user("d1".to_string());
        assert!(result.authenticated);
        assert_eq!(result.user_id.as_deref(), Some("d1"));

        let result = AuthResult::fail(ConnectReturnCode::ServerUnavailable);
        assert!(!result.authenticated);
        assert!(result.reason.is_none());

        let result = AuthResult::deny(DenyReason::SignatureInvalid);
        assert_eq!(result.return_code, ConnectReturnCode::NotAuthorized);
        assert_eq!(result.reason, Some(DenyReason::SignatureInvalid));

        let result = AuthResult::deny(DenyReason::MissingCredential);
        assert_eq!(result.return_code, ConnectReturnCode::BadUsernameOrPassword);
    }
}
