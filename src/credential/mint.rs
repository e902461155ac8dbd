use super::{ClaimSet, Credential, SigningKey};
use crate::error::Result;
use jsonwebtoken::Header;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Validity window of a freshly minted credential
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(20 * 60);

/// Mints device credentials from a private key
///
/// Every call produces a new token with `iat = now`, `exp = now + lifetime`
/// and `aud` set to the project id. Nothing is cached between calls.
#[derive(Debug)]
pub struct CredentialMinter {
    key: SigningKey,
    audience: String,
    lifetime: Duration,
}

impl CredentialMinter {
    #[must_use]
    pub fn new(key: SigningKey, audience: impl Into<String>) -> Self {
        Self {
            key,
            audience: audience.into(),
            lifetime: DEFAULT_TOKEN_LIFETIME,
        }
    }

    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Mints a credential valid from the current wall-clock time
    ///
    /// # Errors
    ///
    /// Returns `Jwt` if signing fails, which with a parsed key means the key
    /// material is unusable.
    pub fn mint(&self) -> Result<Credential> {
        self.mint_at(SystemTime::now())
    }

    /// Mints a credential as if the current time were `now`
    ///
    /// # Errors
    ///
    /// Returns `Jwt` if signing fails.
    pub fn mint_at(&self, now: SystemTime) -> Result<Credential> {
        let claims = ClaimSet::issued_at(now, self.lifetime, self.audience.clone());
        let algorithm = self.key.algorithm();

        let token = jsonwebtoken::encode(
            &Header::new(algorithm.jwt_algorithm()),
            &claims,
            self.key.encoding_key(),
        )?;

        debug!(
            algorithm = %algorithm,
            audience = %claims.aud,
            expires = claims.exp,
            "Minted device credential"
        );
        Ok(Credential::new(token, claims, algorithm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Algorithm;
    use std::time::UNIX_EPOCH;

    const EC_PRIVATE: &[u8] = include_bytes!("../../tests/fixtures/ec_private.pem");

    fn minter() -> CredentialMinter {
        CredentialMinter::new(
            SigningKey::from_pem(Algorithm::Es256, EC_PRIVATE).unwrap(),
            "p1",
        )
    }

    #[test]
    fn test_mint_sets_claims() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let credential = minter().mint_at(now).unwrap();

        assert_eq!(credential.claims().iat, 1_700_000_000);
        assert_eq!(credential.claims().exp, 1_700_000_000 + 1200);
        assert_eq!(credential.claims().aud, "p1");
        assert_eq!(credential.algorithm(), Algorithm::Es256);
        assert_eq!(credential.expose_token().split('.').count(), 3);
    }

    #[test]
    fn test_mint_header_names_algorithm() {
        let credential = minter().mint().unwrap();
        let header = jsonwebtoken::decode_header(credential.expose_token()).unwrap();
        assert_eq!(header.alg, jsonwebtoken::Algorithm::ES256);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
    }

    #[test]
    fn test_custom_lifetime() {
        let minter = minter().with_lifetime(Duration::from_secs(90));
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let credential = minter.mint_at(now).unwrap();
        assert_eq!(credential.claims().exp - credential.claims().iat, 90);
        assert_eq!(credential.remaining_at(now), Duration::from_secs(90));
    }

    #[test]
    fn test_each_mint_is_fresh() {
        let minter = minter();
        let first = minter.mint_at(UNIX_EPOCH + Duration::from_secs(1_000)).unwrap();
        let second = minter.mint_at(UNIX_EPOCH + Duration::from_secs(2_000)).unwrap();
        assert_ne!(first.expose_token(), second.expose_token());
        assert!(second.expires_at() > first.expires_at());
    }
}
