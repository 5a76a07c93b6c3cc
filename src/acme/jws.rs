//! Request signing, see [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use p256::ecdsa::{signature::Signer as _, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use super::{key::AcmeKey, AcmeError};

/// Protected header. Carries `jwk` for newAccount and `kid` for everything after.
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtectedHeader {
    alg: String,
    nonce: String,
    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

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

impl TryFrom<&AcmeKey> for Jwk {
    type Error = AcmeError;

    fn try_from(key: &AcmeKey) -> Result<Self, AcmeError> {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        let (x, y) = point
            .x()
            .zip(point.y())
            .ok_or_else(|| AcmeError::Protocol("account key is the identity point".to_owned()))?;

        Ok(Jwk {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        })
    }
}

// field order is lexical, the thumbprint hashes this serialization
#[derive(Debug, Serialize)]
struct JwkThumb<'a> {
    crv: &'a str,
    kty: &'a str,
    x: &'a str,
    y: &'a str,
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Signs `payload` under `protected` and returns the flattened JSON serialization.
pub(crate) fn sign<T: Serialize + ?Sized>(
    protected: &JwsProtectedHeader,
    key: &AcmeKey,
    payload: &T,
) -> Result<String, AcmeError> {
    let protected = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(protected)?);

    let payload = match serde_json::to_string(payload)?.as_str() {
        // POST-as-GET carries an empty payload, not an encoded empty string
        "\"\"" => String::new(),
        json => BASE64_URL_SAFE_NO_PAD.encode(json),
    };

    let signature: Signature = key
        .signing_key()
        .sign(format!("{protected}.{payload}").as_bytes());

    let jws = FlattenedJsonJws {
        protected,
        payload,
        signature: BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    };

    Ok(serde_json::to_string(&jws)?)
}

/// TXT record value proving control of a domain for `token`.
///
/// `base64url(sha256(token "." base64url(sha256(jwk thumbprint))))`, see
/// [RFC 8555 §8.4](https://datatracker.ietf.org/doc/html/rfc8555#section-8.4).
pub(crate) fn dns_proof(token: &str, key: &AcmeKey) -> Result<String, AcmeError> {
    let jwk = Jwk::try_from(key)?;
    let thumb = JwkThumb {
        crv: &jwk.crv,
        kty: &jwk.kty,
        x: &jwk.x,
        y: &jwk.y,
    };
    let thumbprint = BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(serde_json::to_string(&thumb)?));

    let key_authorization = format!("{token}.{thumbprint}");
    Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization)))
}
