//! Protocol JSON objects.
//!
//! All objects are immutable snapshots returned by the server; the client
//! never mutates them, it requests a fresh snapshot and discards the old one.

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

use crate::error::{Error, Result};

/// Serializes to `""`, the POST-as-GET payload.
pub struct EmptyString;

impl Serialize for EmptyString {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`, the challenge-response payload.
pub struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// Problem document per RFC 7807, as used by ACME error responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    pub(crate) fn from_parts(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Problem {
            kind: kind.into(),
            detail: Some(detail.into()),
            ..Default::default()
        }
    }

    /// Returns true if the problem type denotes a rejected anti-replay nonce.
    pub fn is_bad_nonce(&self) -> bool {
        self.kind == "urn:ietf:params:acme:error:badNonce" || self.kind == "badNonce"
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

/// Directory document: resource name to URL, plus optional metadata.
///
/// Fetched once per client lifetime from the caller-supplied directory URL;
/// see [RFC 8555 §7.1.1].
///
/// [RFC 8555 §7.1.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.1
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// URL for new nonce requests.
    pub new_nonce: String,

    /// URL for new account requests.
    pub new_account: String,

    /// URL for new order requests.
    pub new_order: String,

    /// URL for pre-authorization requests. Servers that do not implement
    /// pre-authorization omit this field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_authz: Option<String>,

    /// URL for certificate revocation requests.
    pub revoke_cert: String,

    /// URL for key change requests.
    pub key_change: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

/// Optional `meta` sub-object of the directory document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    /// URL identifying the current terms of service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub caa_identities: Option<Vec<String>>,

    /// If true, the CA requires `externalAccountBinding` on newAccount
    /// requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_required: Option<bool>,
}

impl DirectoryMeta {
    pub fn external_account_required(&self) -> bool {
        self.external_account_required.unwrap_or(false)
    }
}

/// Account object, identified by its server-assigned URL (the key ID).
///
/// See [RFC 8555 §7.1.2](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.2).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,

    /// HMAC-signed envelope binding this account to a pre-provisioned
    /// external identity; only present on newAccount requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_binding: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

/// Order object: a request for a certificate covering a set of identifiers.
///
/// See [RFC 8555 §7.1.3](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub status: OrderStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    pub identifiers: Vec<Identifier>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,

    /// The error that occurred while processing the order, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,

    #[serde(default)]
    pub authorizations: Vec<String>,

    pub finalize: String,

    /// URL to download the certificate from, once the order is `valid`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    /// Order URL, captured from the `Location` header on creation. Not part
    /// of the wire representation.
    #[serde(skip)]
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl Order {
    /// Returns the identifier values of this order.
    pub fn domains(&self) -> Vec<&str> {
        self.identifiers
            .iter()
            .map(|identifier| identifier.value.as_str())
            .collect()
    }
}

/// Payload for newOrder requests.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Identifier {
            kind: "dns".to_owned(),
            value: value.to_owned(),
        }
    }

    pub fn is_dns(&self) -> bool {
        self.kind == "dns"
    }
}

/// Authorization object: the proof obligation for a single identifier.
///
/// Wildcard identifiers are authorized via exactly one authorization whose
/// identifier has the wildcard prefix stripped and `wildcard` set.
///
/// See [RFC 8555 §7.1.4](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,

    pub status: AuthorizationStatus,

    /// RFC 3339 timestamp after which the server considers this
    /// authorization invalid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    /// The challenges the client can fulfill to prove control of the
    /// identifier; any single one is sufficient.
    pub challenges: Vec<Challenge>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<bool>,

    /// Authorization URL as listed in the order. Not part of the wire
    /// representation.
    #[serde(skip)]
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl Authorization {
    pub fn is_wildcard(&self) -> bool {
        self.wildcard.unwrap_or(false)
    }

    /// Returns the challenge of the given kind, if the server offers one.
    pub fn challenge(&self, kind: ChallengeKind) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|challenge| challenge.kind().is_ok_and(|k| k == kind))
    }
}

/// Challenge object: one concrete mechanism for satisfying an authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub url: String,

    /// The challenge type as sent by the server. Use [`Challenge::kind`] for
    /// the validated, closed set.
    #[serde(rename = "type")]
    pub kind_str: String,

    pub status: ChallengeStatus,

    pub token: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl Challenge {
    /// Resolves the wire type into the supported challenge set.
    ///
    /// Unknown types are a typed error, never a panic.
    pub fn kind(&self) -> Result<ChallengeKind> {
        ChallengeKind::from_wire(&self.kind_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// Supported challenge validation mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Domain control proven over HTTP (`http-01`).
    Http01,
    /// Domain control proven over DNS (`dns-01`).
    Dns01,
}

impl ChallengeKind {
    pub fn from_wire(kind: &str) -> Result<Self> {
        match kind {
            "http-01" => Ok(ChallengeKind::Http01),
            "dns-01" => Ok(ChallengeKind::Dns01),
            other => Err(Error::UnknownChallengeType(other.to_owned())),
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Finalize payload; see [RFC 8555 §7.4](https://datatracker.ietf.org/doc/html/rfc8555#section-7.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Finalize {
    /// CSR in base64url-encoded DER (not PEM; headers are omitted).
    pub csr: String,
}

/// Revocation payload; see [RFC 8555 §7.6](https://datatracker.ietf.org/doc/html/rfc8555#section-7.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Revocation {
    /// The certificate to revoke, in base64url-encoded DER.
    pub certificate: String,

    /// A reason code from [RFC 5280 §5.3.1].
    ///
    /// [RFC 5280 §5.3.1]: https://datatracker.ietf.org/doc/html/rfc5280#section-5.3.1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<usize>,
}

/// Inner payload of a key-change request, signed by the replacement key;
/// see [RFC 8555 §7.3.5](https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.5).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeyChange {
    /// Account URL the rollover applies to.
    pub account: String,

    /// JWK of the key being replaced.
    pub old_key: crate::jws::Jwk,
}

/// Common view over order, authorization and challenge snapshots, used by
/// the status-polling loop.
pub trait PollTarget: serde::de::DeserializeOwned {
    fn is_valid(&self) -> bool;
    fn is_invalid(&self) -> bool;
    fn problem(&self) -> Option<&Problem>;

    /// Re-attaches the source URL after deserializing, for objects whose URL
    /// is not part of the wire representation.
    fn set_source_url(&mut self, _url: &str) {}
}

impl PollTarget for Order {
    fn is_valid(&self) -> bool {
        self.status == OrderStatus::Valid
    }

    fn is_invalid(&self) -> bool {
        self.status == OrderStatus::Invalid
    }

    fn problem(&self) -> Option<&Problem> {
        self.error.as_ref()
    }

    fn set_source_url(&mut self, url: &str) {
        self.url = url.to_owned();
    }
}

impl PollTarget for Authorization {
    fn is_valid(&self) -> bool {
        self.status == AuthorizationStatus::Valid
    }

    fn is_invalid(&self) -> bool {
        self.status == AuthorizationStatus::Invalid
    }

    fn problem(&self) -> Option<&Problem> {
        self.challenges
            .iter()
            .find_map(|challenge| challenge.error.as_ref())
    }

    fn set_source_url(&mut self, url: &str) {
        self.url = url.to_owned();
    }
}

impl PollTarget for Challenge {
    fn is_valid(&self) -> bool {
        self.status == ChallengeStatus::Valid
    }

    fn is_invalid(&self) -> bool {
        self.status == ChallengeStatus::Invalid
    }

    fn problem(&self) -> Option<&Problem> {
        self.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_payload() {
        let x = serde_json::to_string(&EmptyString).unwrap();
        assert_eq!("\"\"", x);
    }

    #[test]
    fn empty_object_payload() {
        let x = serde_json::to_string(&EmptyObject).unwrap();
        assert_eq!("{}", x);
    }

    #[test]
    fn challenge_kind_rejects_unknown_types() {
        assert_eq!(ChallengeKind::from_wire("http-01").unwrap(), ChallengeKind::Http01);
        assert_eq!(ChallengeKind::from_wire("dns-01").unwrap(), ChallengeKind::Dns01);

        match ChallengeKind::from_wire("tls-alpn-01") {
            Err(Error::UnknownChallengeType(kind)) => assert_eq!(kind, "tls-alpn-01"),
            other => panic!("expected UnknownChallengeType, got {other:?}"),
        }
    }

    #[test]
    fn bad_nonce_problem_detection() {
        let urn = Problem::from_parts("urn:ietf:params:acme:error:badNonce", "stale");
        assert!(urn.is_bad_nonce());

        let other = Problem::from_parts("urn:ietf:params:acme:error:malformed", "bad JWS");
        assert!(!other.is_bad_nonce());
    }

    #[test]
    fn order_snapshot_deserializes() {
        let json = r#"{
            "status": "pending",
            "expires": "2019-01-09T08:26:43.570360537Z",
            "identifiers": [{ "type": "dns", "value": "example.test" }],
            "authorizations": ["https://ca.example/acme/authz/1"],
            "finalize": "https://ca.example/acme/finalize/1"
        }"#;

        let order: Order = serde_json::from_str(json).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.domains(), vec!["example.test"]);
        assert!(order.certificate.is_none());
        assert!(order.url.is_empty());
    }

    #[test]
    fn authorization_challenge_lookup() {
        let json = r#"{
            "identifier": { "type": "dns", "value": "example.test" },
            "status": "pending",
            "challenges": [
                { "type": "http-01", "status": "pending", "url": "https://ca.example/chall/1", "token": "t1" },
                { "type": "tls-alpn-01", "status": "pending", "url": "https://ca.example/chall/2", "token": "t2" },
                { "type": "dns-01", "status": "pending", "url": "https://ca.example/chall/3", "token": "t3" }
            ]
        }"#;

        let authz: Authorization = serde_json::from_str(json).unwrap();
        assert!(!authz.is_wildcard());
        assert_eq!(authz.challenge(ChallengeKind::Http01).unwrap().token, "t1");
        assert_eq!(authz.challenge(ChallengeKind::Dns01).unwrap().token, "t3");

        // the unsupported challenge stays representable but its kind is rejected
        assert!(authz.challenges[1].kind().is_err());
    }
}
