//! ACME JSON payloads, trimmed to what a DNS-01 client exchanges.
//!
//! See [RFC 8555 §7.1](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1).

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

/// Serializes to `""`; the payload of a POST-as-GET request.
pub struct EmptyString;

impl Serialize for EmptyString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`; the payload that tells the server a challenge is ready.
pub struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// `application/problem+json` document returned on errors.
///
/// See [RFC 8555 §6.7](https://datatracker.ietf.org/doc/html/rfc8555#section-6.7).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    fn is(&self, name: &str) -> bool {
        self._type
            .strip_prefix("urn:ietf:params:acme:error:")
            .or_else(|| self._type.strip_prefix("urn:acme:error:"))
            .unwrap_or(&self._type)
            == name
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.is("badNonce")
    }

    /// Returns true if problem details indicate that JWS verification failed.
    pub fn is_jws_verification_error(&self) -> bool {
        self.is("malformed")
            && self
                .detail
                .as_deref()
                .is_some_and(|detail| detail == "JWS verification error")
    }

    pub fn is_rate_limited(&self) -> bool {
        self.is("rateLimited")
    }

    pub fn is_unauthorized(&self) -> bool {
        self.is("unauthorized") || self.is("accountDoesNotExist") || self.is("userActionRequired")
    }

    pub fn is_server_internal(&self) -> bool {
        self.is("serverInternal")
    }

    /// Finalize was sent to an order that is not `ready`.
    pub fn is_order_not_ready(&self) -> bool {
        self.is("orderNotReady")
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type),
            _ => write!(f, "{}", self._type),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

/// Directory object used for client self-configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub revoke_cert: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,

    /// If true, every newAccount request needs an external account binding, which this client
    /// does not provide.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_required: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Self {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }
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

/// An order tracks one certificate request through to issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,

    pub identifiers: Vec<Identifier>,

    #[serde(default, skip_serializing)]
    pub error: Option<Problem>,

    #[serde(default, skip_serializing)]
    pub authorizations: Vec<String>,

    #[serde(default, skip_serializing)]
    pub finalize: String,

    #[serde(default, skip_serializing)]
    pub certificate: Option<String>,
}

impl Order {
    pub fn for_domains<'a>(domains: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            identifiers: domains.into_iter().map(Identifier::dns).collect(),
            ..Default::default()
        }
    }
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

/// The server's authorization for an account to represent an identifier.
///
/// For a wildcard order the identifier value is the base domain and `wildcard` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: Option<bool>,
}

impl Authorization {
    pub fn dns_challenge(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c._type == "dns-01")
    }

    /// Domain as it was requested, with the `*.` label restored for wildcards.
    pub fn requested_domain(&self) -> String {
        if self.wildcard.unwrap_or(false) {
            format!("*.{}", self.identifier.value)
        } else {
            self.identifier.value.clone()
        }
    }

    /// First error reported by any challenge of a failed authorization.
    pub fn failure_detail(&self) -> String {
        self.challenges
            .iter()
            .find_map(|c| c.error.as_ref())
            .map(|err| err.to_string())
            .unwrap_or_else(|| format!("authorization is {:?}", self.status))
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub _type: String,
    pub url: String,
    pub status: ChallengeStatus,
    pub token: String,
    #[serde(default)]
    pub error: Option<Problem>,
}

/// CSR submission; base64url DER, not PEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalize {
    pub csr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    /// base64url DER of the certificate.
    pub certificate: String,

    /// RFC 5280 reason code; absent means "unspecified".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<u8>,
}
