use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Make a P-256 private key (from which the public key can be derived).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Account signing key.
///
/// All signed requests are authenticated with this key: in JWK mode before
/// an account exists, and in key-ID mode afterwards. The key ID is the
/// account URL assigned by the server and lives in the signing context, not
/// here.
#[derive(Clone, Debug)]
pub struct AccountKey {
    signing_key: p256::ecdsa::SigningKey,
}

impl AccountKey {
    /// Generate a fresh P-256 account key.
    pub fn generate() -> AccountKey {
        AccountKey::from_key(create_p256_key())
    }

    /// Load an account key from a PKCS#8 PEM string.
    pub fn from_pem(pem: &str) -> Result<AccountKey> {
        let signing_key = ecdsa::SigningKey::<p256::NistP256>::from_pkcs8_pem(pem)
            .map_err(|err| Error::Crypto(format!("failed to read key PEM: {err}")))?;
        Ok(AccountKey::from_key(signing_key))
    }

    pub fn from_key(signing_key: p256::ecdsa::SigningKey) -> AccountKey {
        AccountKey { signing_key }
    }

    /// The key in PKCS#8 PEM format, for persisting between runs.
    pub fn to_pem(&self) -> Result<Zeroizing<String>> {
        Ok(self.signing_key.to_pkcs8_pem(pem::LineEnding::LF)?)
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }
}
