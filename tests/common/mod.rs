//! Shared fixtures for integration tests

#![allow(dead_code)]

use iotcore_mqtt::{
    Algorithm, AuthorizationPolicy, CredentialMinter, CredentialVerifier, DeviceConfig,
    IdentityPath, SigningKey, VerifyingKey,
};
use std::path::PathBuf;
use std::time::Duration;

pub const PROJECT: &str = "p1";
pub const REGION: &str = "us-central1";
pub const REGISTRY: &str = "r1";
pub const DEVICE: &str = "d1";
pub const CLIENT_ID: &str = "projects/p1/locations/us-central1/registries/r1/devices/d1";
pub const EVENTS_TOPIC: &str = "/devices/d1/events";

/// Default timeout for test operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Private and public key fixture names for an algorithm
pub fn key_files(algorithm: Algorithm) -> (&'static str, &'static str) {
    match algorithm {
        Algorithm::Rs256 => ("rsa_private.pem", "rsa_public.pem"),
        Algorithm::Es256 => ("ec_private.pem", "ec_public.pem"),
    }
}

pub fn minter(algorithm: Algorithm, audience: &str) -> CredentialMinter {
    let (private, _) = key_files(algorithm);
    let key = SigningKey::from_pem_file(algorithm, fixture(private)).expect("signing key");
    CredentialMinter::new(key, audience)
}

pub fn verifier(algorithm: Algorithm, audience: &str) -> CredentialVerifier {
    let (_, public) = key_files(algorithm);
    let key = VerifyingKey::from_pem_file(algorithm, fixture(public)).expect("verifying key");
    CredentialVerifier::new(key, audience)
}

pub fn identity() -> IdentityPath {
    IdentityPath::new(PROJECT, REGION, REGISTRY, DEVICE).expect("identity")
}

pub fn policy() -> AuthorizationPolicy {
    AuthorizationPolicy::new(identity())
}

/// Self-test device configuration with a fast publish interval
pub fn self_test_config(algorithm: Algorithm) -> DeviceConfig {
    let (private, public) = key_files(algorithm);
    DeviceConfig::new(PROJECT, REGISTRY, DEVICE, algorithm)
        .with_private_key_file(fixture(private))
        .with_public_key_file(fixture(public))
        .with_self_test(true)
        .with_publish_interval(Duration::from_millis(20))
        .with_disconnect_grace(Duration::from_millis(200))
}

/// Routes library logs to the test output; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("iotcore_mqtt=debug")),
        )
        .with_test_writer()
        .try_init();
}
