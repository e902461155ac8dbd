use super::{unix_seconds, ClaimSet, VerifyingKey};
use crate::policy::DenyReason;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::Validation;
use std::collections::HashSet;
use std::time::{Duration, SystemTime};

/// Verifies device credentials against a public key
///
/// Checks run in a fixed order and the first failure is reported:
/// algorithm, signature, audience, expiry, issue time. The verifier holds only
/// read-only state and can be shared across connection tasks.
#[derive(Debug)]
pub struct CredentialVerifier {
    key: VerifyingKey,
    audience: String,
    leeway: Duration,
}

impl CredentialVerifier {
    /// Verifier accepting tokens for `audience` signed by `key`
    ///
    /// Issue-time leeway defaults to zero: a token issued in the future is
    /// rejected.
    #[must_use]
    pub fn new(key: VerifyingKey, audience: impl Into<String>) -> Self {
        Self {
            key,
            audience: audience.into(),
            leeway: Duration::ZERO,
        }
    }

    /// Tolerated clock skew when checking `iat`
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Verifies `token` against the current wall-clock time
    ///
    /// # Errors
    ///
    /// Returns the first [`DenyReason`] the token fails on.
    pub fn verify(&self, token: &str) -> Result<ClaimSet, DenyReason> {
        self.verify_at(token, SystemTime::now())
    }

    /// Verifies `token` as if the current time were `now`
    ///
    /// # Errors
    ///
    /// Returns the first [`DenyReason`] the token fails on.
    pub fn verify_at(&self, token: &str, now: SystemTime) -> Result<ClaimSet, DenyReason> {
        if token.is_empty() {
            return Err(DenyReason::MissingCredential);
        }

        let expected = self.key.algorithm().jwt_algorithm();
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| DenyReason::MalformedCredential(e.to_string()))?;
        if header.alg != expected {
            return Err(DenyReason::AlgorithmMismatch {
                expected: format!("{expected:?}"),
                found: format!("{:?}", header.alg),
            });
        }

        // Time and audience checks are done below so their order is fixed
        let mut validation = Validation::new(expected);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let claims = jsonwebtoken::decode::<ClaimSet>(token, self.key.decoding_key(), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidRsaKey(_) => {
                    DenyReason::SignatureInvalid
                }
                _ => DenyReason::MalformedCredential(e.to_string()),
            })?
            .claims;

        if claims.aud != self.audience {
            return Err(DenyReason::AudienceMismatch {
                expected: self.audience.clone(),
                found: claims.aud,
            });
        }

        let now = unix_seconds(now);
        if now > claims.exp {
            return Err(DenyReason::Expired {
                expired_at: claims.exp,
                now,
            });
        }

        let leeway = i64::try_from(self.leeway.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_add(leeway) < claims.iat {
            return Err(DenyReason::NotYetValid {
                issued_at: claims.iat,
                now,
            });
        }

        if claims.exp <= claims.iat {
            return Err(DenyReason::MalformedCredential(
                "expiry is not after issue time".to_string(),
            ));
        }

        Ok(claims)
    }
}
