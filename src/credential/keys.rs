use super::Algorithm;
use crate::error::{IotCoreError, Result};
use jsonwebtoken::{DecodingKey, EncodingKey};
use p256::pkcs8::EncodePrivateKey;
use rustls_pemfile::Item;
use std::fmt;
use std::path::Path;

/// Private key used by the device to sign credentials
///
/// Accepted PEM encodings:
/// - RS256: PKCS#8 (`PRIVATE KEY`) or PKCS#1 (`RSA PRIVATE KEY`)
/// - ES256: SEC1 (`EC PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`), curve P-256
pub struct SigningKey {
    algorithm: Algorithm,
    key: EncodingKey,
}

impl SigningKey {
    /// Parses a PEM encoded private key for `algorithm`
    ///
    /// # Errors
    ///
    /// Returns `KeyFormat` if the PEM holds no private key, or holds one of a
    /// kind `algorithm` cannot use.
    pub fn from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<Self> {
        let mut reader = pem;
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| IotCoreError::KeyFormat(format!("invalid PEM: {e}")))?
            .ok_or_else(|| IotCoreError::KeyFormat("no PEM section found".to_string()))?;

        let key = match (algorithm, item) {
            (Algorithm::Rs256, Item::Pkcs8Key(_) | Item::Pkcs1Key(_)) => {
                EncodingKey::from_rsa_pem(pem).map_err(|e| key_error(algorithm, &e))?
            }
            (Algorithm::Es256, Item::Pkcs8Key(_)) => {
                EncodingKey::from_ec_pem(pem).map_err(|e| key_error(algorithm, &e))?
            }
            (Algorithm::Es256, Item::Sec1Key(sec1)) => {
                // The signer only takes PKCS#8, so re-wrap the SEC1 structure
                let secret = p256::SecretKey::from_sec1_der(sec1.secret_sec1_der())
                    .map_err(|e| key_error(algorithm, &e))?;
                let pkcs8 = secret
                    .to_pkcs8_der()
                    .map_err(|e| key_error(algorithm, &e))?;
                EncodingKey::from_ec_der(pkcs8.as_bytes())
            }
            (_, other) => {
                return Err(IotCoreError::KeyFormat(format!(
                    "{algorithm} cannot sign with {}",
                    pem_kind(&other)
                )))
            }
        };

        Ok(Self { algorithm, key })
    }

    /// Reads and parses a PEM private key file
    ///
    /// # Errors
    ///
    /// Returns `KeyFormat` if the file cannot be read or does not hold a
    /// usable key.
    pub fn from_pem_file(algorithm: Algorithm, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| {
            IotCoreError::KeyFormat(format!("failed to read private key {}: {e}", path.display()))
        })?;
        Self::from_pem(algorithm, &pem)
    }

    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Public key the verifier checks credential signatures against
pub struct VerifyingKey {
    algorithm: Algorithm,
    key: DecodingKey,
}

impl VerifyingKey {
    /// Parses a PEM encoded public key (`PUBLIC KEY`, or `RSA PUBLIC KEY` for RS256)
    ///
    /// # Errors
    ///
    /// Returns `KeyFormat` if the PEM does not hold a public key for `algorithm`.
    pub fn from_pem(algorithm: Algorithm, pem: &[u8]) -> Result<Self> {
        let key = match algorithm {
            Algorithm::Rs256 => DecodingKey::from_rsa_pem(pem),
            Algorithm::Es256 => DecodingKey::from_ec_pem(pem),
        }
        .map_err(|e| key_error(algorithm, &e))?;

        Ok(Self { algorithm, key })
    }

    /// Reads and parses a PEM public key file
    ///
    /// # Errors
    ///
    /// Returns `KeyFormat` if the file cannot be read or does not hold a
    /// usable key.
    pub fn from_pem_file(algorithm: Algorithm, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| {
            IotCoreError::KeyFormat(format!("failed to read public key {}: {e}", path.display()))
        })?;
        Self::from_pem(algorithm, &pem)
    }

    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyingKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

fn key_error(algorithm: Algorithm, err: &dyn fmt::Display) -> IotCoreError {
    IotCoreError::KeyFormat(format!("invalid {algorithm} key: {err}"))
}

fn pem_kind(item: &Item) -> &'static str {
    match item {
        Item::X509Certificate(_) => "a certificate",
        Item::SubjectPublicKeyInfo(_) => "a public key",
        Item::Pkcs1Key(_) => "an RSA private key",
        Item::Sec1Key(_) => "an EC private key",
        Item::Pkcs8Key(_) => "a PKCS#8 private key",
        _ => "an unsupported PEM section",
    }
}
