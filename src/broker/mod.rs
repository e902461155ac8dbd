//! Verifying MQTT 3.1.1 broker
//!
//! A small TLS broker that authenticates every CONNECT through an
//! [`AuthProvider`] and checks every PUBLISH and SUBSCRIBE against it.
//! [`TokenAuthProvider`] plugs the credential verifier and the authorization
//! policy in.
//!
//! # Example
//!
//! ```rust,no_run
//! use iotcore_mqtt::broker::{BrokerConfig, MqttBroker, TokenAuthProvider};
//! use iotcore_mqtt::{AuthorizationPolicy, CredentialVerifier, IdentityPath, VerifyingKey};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = VerifyingKey::from_pem_file("RS256".parse()?, "rsa_public.pem")?;
//!     let verifier = CredentialVerifier::new(key, "p1");
//!     let identity = IdentityPath::new("p1", "us-central1", "r1", "d1")?;
//!     let policy = AuthorizationPolicy::new(identity);
//!     let auth = TokenAuthProvider::new(verifier, policy);
//!
//!     let config = BrokerConfig::new().with_tls_files("cert.pem", "key.pem");
//!     let mut broker = MqttBroker::bind(config).await?.with_auth_provider(Arc::new(auth));
//!
//!     let handle = broker.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         handle.shutdown();
//!     });
//!     broker.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client_handler;
pub mod config;
pub mod events;
pub mod router;
pub mod server;
pub mod tls_acceptor;
pub mod token_auth;

pub use auth::{AllowAllAuthProvider, AuthProvider, AuthResult};
pub use config::{BrokerConfig, BrokerTlsConfig};
pub use events::BrokerEvent;
pub use router::MessageRouter;
pub use server::{MqttBroker, ShutdownHandle};
pub use tls_acceptor::TlsAcceptorConfig;
pub use token_auth::TokenAuthProvider;

pub use crate::QoS;
