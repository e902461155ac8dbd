//! Mint and verify scenarios across both algorithms

mod common;

use common::{minter, policy, verifier, CLIENT_ID, EVENTS_TOPIC};
use iotcore_mqtt::{
    AccessType, Algorithm, AuthDecision, CredentialVerifier, DenyReason, VerifyingKey,
};
use proptest::prelude::*;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn t0() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

#[test]
fn test_round_trip_both_algorithms() {
    for algorithm in [Algorithm::Rs256, Algorithm::Es256] {
        let credential = minter(algorithm, "p1").mint().unwrap();
        let claims = verifier(algorithm, "p1")
            .verify(credential.expose_token())
            .unwrap();
        assert_eq!(claims.aud, "p1");
        assert_eq!(claims.exp - claims.iat, 20 * 60);
        assert_eq!(credential.algorithm(), algorithm);
    }
}

#[test]
fn test_valid_inside_window() {
    let credential = minter(Algorithm::Es256, "p1").mint_at(t0()).unwrap();
    let verifier = verifier(Algorithm::Es256, "p1");

    for offset in [0, 60, 20 * 60] {
        assert!(verifier
            .verify_at(credential.expose_token(), t0() + Duration::from_secs(offset))
            .is_ok());
    }
}

#[test]
fn test_expired_after_lifetime() {
    let credential = minter(Algorithm::Rs256, "p1").mint_at(t0()).unwrap();
    let err = verifier(Algorithm::Rs256, "p1")
        .verify_at(credential.expose_token(), t0() + Duration::from_secs(21 * 60))
        .unwrap_err();
    assert!(matches!(err, DenyReason::Expired { .. }));
    assert_eq!(err.to_string(), "expired");
}

#[test]
fn test_audience_mismatch() {
    let credential = minter(Algorithm::Es256, "p1").mint().unwrap();
    let err = verifier(Algorithm::Es256, "p2")
        .verify(credential.expose_token())
        .unwrap_err();
    assert_eq!(err.to_string(), "audience mismatch");
}

#[test]
fn test_wrong_key_is_signature_invalid() {
    let other = VerifyingKey::from_pem_file(
        Algorithm::Es256,
        common::fixture("ec_other_public.pem"),
    )
    .unwrap();
    let verifier = CredentialVerifier::new(other, "p1");

    let credential = minter(Algorithm::Es256, "p1").mint().unwrap();
    let err = verifier.verify(credential.expose_token()).unwrap_err();
    assert_eq!(err, DenyReason::SignatureInvalid);
}

#[test]
fn test_algorithm_mismatch() {
    let credential = minter(Algorithm::Es256, "p1").mint().unwrap();
    let err = verifier(Algorithm::Rs256, "p1")
        .verify(credential.expose_token())
        .unwrap_err();
    assert!(matches!(err, DenyReason::AlgorithmMismatch { .. }));
}

#[test]
fn test_issued_in_future_needs_leeway() {
    let credential = minter(Algorithm::Es256, "p1")
        .mint_at(t0() + Duration::from_secs(30))
        .unwrap();

    let strict = verifier(Algorithm::Es256, "p1");
    assert!(matches!(
        strict.verify_at(credential.expose_token(), t0()),
        Err(DenyReason::NotYetValid { .. })
    ));

    let lenient = verifier(Algorithm::Es256, "p1").with_leeway(Duration::from_secs(60));
    assert!(lenient.verify_at(credential.expose_token(), t0()).is_ok());
}

#[test]
fn test_policy_scenario() {
    let policy = policy();
    assert_eq!(policy.identity().as_str(), CLIENT_ID);
    assert_eq!(policy.allowed_topic(), EVENTS_TOPIC);

    assert_eq!(
        policy.authorize_connect(CLIENT_ID, Some("unused")),
        AuthDecision::Allow
    );
    assert_eq!(
        policy.authorize_topic(CLIENT_ID, EVENTS_TOPIC, AccessType::Publish),
        AuthDecision::Allow
    );
    assert!(!policy
        .authorize_topic(CLIENT_ID, "/devices/d1/state", AccessType::Publish)
        .is_allowed());
    assert!(!policy
        .authorize_connect(CLIENT_ID, Some("device"))
        .is_allowed());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_other_audience_denied(audience in "[a-z0-9-]{1,20}") {
        prop_assume!(audience != "p1");
        let credential = minter(Algorithm::Es256, &audience).mint_at(t0()).unwrap();
        let result = verifier(Algorithm::Es256, "p1").verify_at(credential.expose_token(), t0());
        let is_audience_mismatch = matches!(result, Err(DenyReason::AudienceMismatch { .. }));
        prop_assert!(is_audience_mismatch);
    }

    #[test]
    fn prop_denied_once_expired(extra in 1u64..86_400) {
        let credential = minter(Algorithm::Es256, "p1").mint_at(t0()).unwrap();
        let at = t0() + Duration::from_secs(20 * 60 + extra);
        let result = verifier(Algorithm::Es256, "p1").verify_at(credential.expose_token(), at);
        let is_expired = matches!(result, Err(DenyReason::Expired { .. }));
        prop_assert!(is_expired);
    }
}
