//! Device credentials: short-lived signed tokens carried in the MQTT password
//!
//! A credential is a compact JWT whose claims are limited to issue time,
//! expiry and audience (the project id). [`CredentialMinter`] produces one
//! from a private key; [`CredentialVerifier`] checks one against the matching
//! public key.

mod keys;
mod mint;
mod verify;

pub use keys::{SigningKey, VerifyingKey};
pub use mint::{CredentialMinter, DEFAULT_TOKEN_LIFETIME};
pub use verify::CredentialVerifier;

use crate::error::{IotCoreError, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Signing algorithms a device may use
///
/// The set is closed: each variant knows how to parse its own key material,
/// and any other algorithm name is rejected when configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    #[serde(rename = "RS256")]
    Rs256,
    /// ECDSA on P-256 with SHA-256
    #[serde(rename = "ES256")]
    Es256,
}

impl Algorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::Es256 => "ES256",
        }
    }

    pub(crate) fn jwt_algorithm(self) -> jsonwebtoken::Algorithm {
        match self {
            Self::Rs256 => jsonwebtoken::Algorithm::RS256,
            Self::Es256 => jsonwebtoken::Algorithm::ES256,
        }
    }
}

impl FromStr for Algorithm {
    type Err = IotCoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RS256" => Ok(Self::Rs256),
            "ES256" => Ok(Self::Es256),
            other => Err(IotCoreError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token claims in seconds since the Unix epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

impl ClaimSet {
    /// Claims for a token issued at `now` and valid for `lifetime`
    #[must_use]
    pub fn issued_at(now: SystemTime, lifetime: Duration, audience: impl Into<String>) -> Self {
        let iat = unix_seconds(now);
        let lifetime = i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
        Self {
            iat,
            exp: iat.saturating_add(lifetime),
            aud: audience.into(),
        }
    }

    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        from_unix_seconds(self.exp)
    }
}

/// A minted credential
///
/// The token is a bearer secret. `Debug` never shows it; the only way out is
/// [`Credential::expose_token`], used when writing the MQTT password field.
#[derive(Debug)]
pub struct Credential {
    token: SecretString,
    claims: ClaimSet,
    algorithm: Algorithm,
}

impl Credential {
    pub(crate) fn new(token: String, claims: ClaimSet, algorithm: Algorithm) -> Self {
        Self {
            token: SecretString::from(token),
            claims,
            algorithm,
        }
    }

    #[must_use]
    pub fn expose_token(&self) -> &str {
        self.token.expose_secret()
    }

    #[must_use]
    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.claims.expires_at()
    }

    /// Time left before expiry as seen at `now`, zero once expired
    #[must_use]
    pub fn remaining_at(&self, now: SystemTime) -> Duration {
        self.expires_at()
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
    }
}

pub(crate) fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn from_unix_seconds(seconds: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::try_from(seconds).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("RS256".parse::<Algorithm>().unwrap(), Algorithm::Rs256);
        assert_eq!("ES256".parse::<Algorithm>().unwrap(), Algorithm::Es256);

        for name in ["HS256", "rs256", "none", ""] {
            let err = name.parse::<Algorithm>().unwrap_err();
            assert!(err.is_configuration(), "{name} should be fatal");
        }
    }

    #[test]
    fn test_algorithm_serde_names() {
        assert_eq!(serde_json::to_string(&Algorithm::Es256).unwrap(), "\"ES256\"");
        let alg: Algorithm = serde_json::from_str("\"RS256\"").unwrap();
        assert_eq!(alg, Algorithm::Rs256);
        assert!(serde_json::from_str::<Algorithm>("\"PS256\"").is_err());
    }

    #[test]
    fn test_claims_window() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let claims = ClaimSet::issued_at(now, Duration::from_secs(20 * 60), "p1");
        assert_eq!(claims.iat, 1_700_000_000);
        assert_eq!(claims.exp, 1_700_001_200);
        assert_eq!(claims.aud, "p1");
        assert_eq!(claims.expires_at(), now + Duration::from_secs(1200));
    }

    #[test]
    fn test_credential_debug_hides_token() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let claims = ClaimSet::issued_at(now, Duration::from_secs(60), "p1");
        let credential = Credential::new("aaa.bbb.ccc".to_string(), claims, Algorithm::Rs256);

        assert!(!format!("{credential:?}").contains("aaa.bbb.ccc"));
        assert_eq!(credential.expose_token(), "aaa.bbb.ccc");
        assert_eq!(credential.remaining_at(now), Duration::from_secs(60));
        assert_eq!(
            credential.remaining_at(now + Duration::from_secs(120)),
            Duration::ZERO
        );
    }
}
