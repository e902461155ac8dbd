//! Token authentication provider
//!
//! Plugs a [`CredentialVerifier`] and an [`AuthorizationPolicy`] into the
//! broker. CONNECT is accepted only when the password is a valid credential
//! for the configured project and the client id and username match the
//! policy; every publish and subscribe is then checked against the policy's
//! single allowed topic.

use crate::broker::auth::{AuthProvider, AuthResult};
use crate::credential::CredentialVerifier;
use crate::error::Result;
use crate::packet::connect::ConnectPacket;
use crate::policy::{AccessType, AuthDecision, AuthorizationPolicy, DenyReason};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TokenAuthProvider {
    verifier: Arc<CredentialVerifier>,
    policy: Arc<AuthorizationPolicy>,
}

impl TokenAuthProvider {
    #[must_use]
    pub fn new(verifier: CredentialVerifier, policy: AuthorizationPolicy) -> Self {
        Self {
            verifier: Arc::new(verifier),
            policy: Arc::new(policy),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &AuthorizationPolicy {
        &self.policy
    }

    /// Verifies the credential, then the identity binding
    fn check_connect(&self, connect: &ConnectPacket) -> std::result::Result<(), DenyReason> {
        let token = match (&connect.password, connect.password_str()) {
            (None, _) => return Err(DenyReason::MissingCredential),
            (Some(_), None) => {
                return Err(DenyReason::MalformedCredential(
                    "password is not UTF-8".to_string(),
                ))
            }
            (Some(_), Some(token)) => token,
        };

        let claims = self.verifier.verify(token)?;
        debug!(
            client_id = %connect.client_id,
            iat = claims.iat,
            exp = claims.exp,
            "Credential verified"
        );

        self.policy
            .authorize_connect(&connect.client_id, connect.username.as_deref())
            .into_result()
    }
}

#[async_trait]
impl AuthProvider for TokenAuthProvider {
    async fn authenticate(
        &self,
        connect: &ConnectPacket,
        client_addr: SocketAddr,
    ) -> Result<AuthResult> {
        match self.check_connect(connect) {
            Ok(()) => Ok(AuthResult::success_with_user(connect.client_id.clone())),
            Err(reason) => {
                warn!(
                    client_id = %connect.client_id,
                    addr = %client_addr,
                    %reason,
                    "Connection denied"
                );
                Ok(AuthResult::deny(reason))
            }
        }
    }

    async fn authorize_publish(
        &self,
        client_id: &str,
        _user_id: Option<&str>,
        topic: &str,
    ) -> Result<AuthDecision> {
        Ok(self
            .policy
            .authorize_topic(client_id, topic, AccessType::Publish))
    }

    async fn authorize_subscribe(
        &self,
        client_id: &str,
        _user_id: Option<&str>,
        topic_filter: &str,
    ) -> Result<AuthDecision> {
        Ok(self
            .policy
            .authorize_topic(client_id, topic_filter, AccessType::Subscribe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{Algorithm, CredentialMinter, SigningKey, VerifyingKey};
    use crate::identity::IdentityPath;
    use crate::packet::connack::ConnectReturnCode;

    const RSA_PRIVATE: &[u8] = include_bytes!("../../tests/fixtures/rsa_private.pem");
    const RSA_PUBLIC: &[u8] = include_bytes!("../../tests/fixtures/rsa_public.pem");
    const RSA_OTHER_PRIVATE: &[u8] = include_bytes!("../../tests/fixtures/rsa_other_private.pem");

    fn identity() -> IdentityPath {
        IdentityPath::new("p1", "us-central1", "r1", "d1").unwrap()
    }

    fn provider() -> TokenAuthProvider {
        let key = VerifyingKey::from_pem(Algorithm::Rs256, RSA_PUBLIC).unwrap();
        TokenAuthProvider::new(
            CredentialVerifier::new(key, "p1"),
            AuthorizationPolicy::new(identity()),
        )
    }

    fn token(private_pem: &[u8], audience: &str) -> String {
        let key = SigningKey::from_pem(Algorithm::Rs256, private_pem).unwrap();
        CredentialMinter::new(key, audience)
            .mint()
            .unwrap()
            .expose_token()
            .to_string()
    }

    fn connect(client_id: &str, password: Option<String>) -> ConnectPacket {
        let mut connect = ConnectPacket::new(client_id);
        if let Some(password) = password {
            connect = connect.with_credentials("unused", password.into_bytes());
        }
        connect
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_valid_device_accepted() {
        let packet = connect(identity().as_str(), Some(token(RSA_PRIVATE, "p1")));
        let result = provider().authenticate(&packet, addr()).await.unwrap();
        assert!(result.authenticated);
        assert_eq!(result.user_id.as_deref(), Some(identity().as_str()));
    }

    #[tokio::test]
    async fn test_missing_password() {
        let packet = connect(identity().as_str(), None);
        let result = provider().authenticate(&packet, addr()).await.unwrap();
        assert_eq!(result.reason, Some(DenyReason::MissingCredential));
        assert_eq!(result.return_code, ConnectReturnCode::BadUsernameOrPassword);
    }

    #[tokio::test]
    async fn test_wrong_key_refused() {
        let packet = connect(identity().as_str(), Some(token(RSA_OTHER_PRIVATE, "p1")));
        let result = provider().authenticate(&packet, addr()).await.unwrap();
        assert_eq!(result.reason, Some(DenyReason::SignatureInvalid));
        assert_eq!(result.return_code, ConnectReturnCode::NotAuthorized);
    }

    #[tokio::test]
    async fn test_wrong_identity_refused() {
        let other = IdentityPath::new("p1", "us-central1", "r1", "d2").unwrap();
        let packet = connect(other.as_str(), Some(token(RSA_PRIVATE, "p1")));
        let result = provider().authenticate(&packet, addr()).await.unwrap();
        assert!(matches!(
            result.reason,
            Some(DenyReason::IdentityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_topic_checks() {
        let provider = provider();
        let id = identity();
        assert!(provider
            .authorize_publish(id.as_str(), None, "/devices/d1/events")
            .await
            .unwrap()
            .is_allowed());
        assert!(!provider
            .authorize_publish(id.as_str(), None, "/devices/d1/state")
            .await
            .unwrap()
            .is_allowed());
        assert!(!provider
            .authorize_subscribe(id.as_str(), None, "/devices/+/events")
            .await
            .unwrap()
            .is_allowed());
    }
}
