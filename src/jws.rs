//! Signed request envelopes per [RFC 8555 §6.2] and JWK handling.
//!
//! [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2

use hmac::{Hmac, Mac as _};
use p256::ecdsa::{signature::Signer as _, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{
    api::ChallengeKind,
    error::{Error, Result},
    key::AccountKey,
    util::base64url,
};

/// Protected header of a signed request.
///
/// Carries exactly one of `jwk` (pre-account requests: newAccount and the
/// inner key-change envelope) or `kid` (every request after the account URL
/// is known). The nonce is request-scoped and absent on embedded envelopes,
/// which are never sent on their own.
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct ProtectedHeader {
    alg: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,

    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    pub(crate) fn jwk_mode(jwk: Jwk, url: &str, nonce: String) -> Self {
        ProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce: Some(nonce),
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn kid_mode(kid: &str, url: &str, nonce: String) -> Self {
        ProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce: Some(nonce),
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }

    /// Header for the inner key-change envelope: jwk of the replacement key,
    /// no nonce.
    pub(crate) fn inner_jwk_mode(jwk: Jwk, url: &str) -> Self {
        ProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            jwk: Some(jwk),
            ..Default::default()
        }
    }
}

/// JSON representation of the account public key.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

impl TryFrom<&AccountKey> for Jwk {
    type Error = Error;

    fn try_from(key: &AccountKey) -> Result<Self> {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        let x = point
            .x()
            .ok_or_else(|| Error::Crypto("public key has no x coordinate".to_owned()))?;
        let y = point
            .y()
            .ok_or_else(|| Error::Crypto("public key has no y coordinate".to_owned()))?;

        Ok(Jwk {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: base64url(&x),
            y: base64url(&y),
        })
    }
}

/// Thumbprint view of a JWK per [RFC 7638].
///
/// [RFC 7638]: https://datatracker.ietf.org/doc/html/rfc7638
#[derive(Debug, Serialize, Deserialize, Clone)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) struct JwkThumb {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(jwk: &Jwk) -> Self {
        JwkThumb {
            crv: jwk.crv.clone(),
            kty: jwk.kty.clone(),
            x: jwk.x.clone(),
            y: jwk.y.clone(),
        }
    }
}

/// Flattened JSON JWS; see [RFC 7515 §7.2.2].
///
/// [RFC 7515 §7.2.2]: https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJws {
    pub(crate) protected: String,
    pub(crate) payload: String,
    pub(crate) signature: String,
}

impl FlattenedJws {
    pub(crate) fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Builds and ES256-signs a flattened JWS over `protected` and `payload`.
pub(crate) fn sign_jws<T: Serialize + ?Sized>(
    protected: ProtectedHeader,
    key: &AccountKey,
    payload: &T,
) -> Result<FlattenedJws> {
    let protected = {
        let header_json = serde_json::to_string(&protected)?;
        base64url(&header_json)
    };

    let payload = encode_payload(payload)?;

    let to_sign = format!("{protected}.{payload}");
    let signature: Signature = key.signing_key().sign(to_sign.as_bytes());
    let signature = base64url(&signature.to_bytes());

    Ok(FlattenedJws {
        protected,
        payload,
        signature,
    })
}

fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> Result<String> {
    let payload_json = serde_json::to_string(payload)?;

    // POST-as-GET bodies serialize to `""` and must stay genuinely empty
    // rather than base64url-encoded.
    if payload_json == "\"\"" {
        Ok(String::new())
    } else {
        Ok(base64url(&payload_json))
    }
}

/// The RFC 7638 thumbprint of the account key: base64url(SHA-256(JWK)).
pub(crate) fn thumbprint(key: &AccountKey) -> Result<String> {
    let jwk = Jwk::try_from(key)?;
    let thumb_json = serde_json::to_string(&JwkThumb::from(&jwk))?;
    Ok(base64url(&Sha256::digest(thumb_json)))
}

/// Derives the key authorization a challenge response must publish.
///
/// A pure function of (token, account key, challenge kind): `http-01` proofs
/// are `token + "." + thumbprint`; `dns-01` proofs are the base64url SHA-256
/// digest of that string.
pub(crate) fn key_authorization(
    token: &str,
    key: &AccountKey,
    kind: ChallengeKind,
) -> Result<String> {
    let key_auth = format!("{token}.{}", thumbprint(key)?);

    match kind {
        ChallengeKind::Http01 => Ok(key_auth),
        ChallengeKind::Dns01 => Ok(base64url(&Sha256::digest(key_auth))),
    }
}

/// External account binding material, provisioned out of band by the CA.
#[derive(Clone)]
pub struct ExternalAccountBinding {
    kid: String,
    hmac_key: Vec<u8>,
}

impl std::fmt::Debug for ExternalAccountBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log the symmetric key
        f.debug_struct("ExternalAccountBinding")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl ExternalAccountBinding {
    /// Creates a binding from the CA-issued key ID and base64url-encoded
    /// HMAC key.
    pub fn new(kid: impl Into<String>, hmac_key_b64: &str) -> Result<Self> {
        use base64::prelude::*;

        let hmac_key = BASE64_URL_SAFE_NO_PAD
            .decode(hmac_key_b64.trim_end_matches('='))
            .map_err(|err| Error::Crypto(format!("invalid EAB HMAC key: {err}")))?;

        Ok(ExternalAccountBinding {
            kid: kid.into(),
            hmac_key,
        })
    }

    /// Signs the inner envelope embedded in the newAccount payload: the
    /// account JWK as payload, HMAC-signed under the external key.
    pub(crate) fn sign(&self, account_key: &AccountKey, url: &str) -> Result<FlattenedJws> {
        #[derive(Serialize)]
        struct EabHeader<'a> {
            alg: &'a str,
            kid: &'a str,
            url: &'a str,
        }

        let protected = {
            let header = EabHeader {
                alg: "HS256",
                kid: &self.kid,
                url,
            };
            base64url(&serde_json::to_string(&header)?)
        };

        let payload = {
            let jwk = Jwk::try_from(account_key)?;
            base64url(&serde_json::to_string(&jwk)?)
        };

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.hmac_key)
            .map_err(|err| Error::Crypto(format!("invalid EAB HMAC key length: {err}")))?;
        mac.update(format!("{protected}.{payload}").as_bytes());
        let signature = base64url(&mac.finalize().into_bytes());

        Ok(FlattenedJws {
            protected,
            payload,
            signature,
        })
    }
}
