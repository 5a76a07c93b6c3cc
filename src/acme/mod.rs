//! ACME v2 ([RFC 8555]) client, restricted to the DNS-01 flow.
//!
//! The controller talks to certificate authorities through the [`AcmeClient`] trait. The
//! [`HttpAcmeClient`] implementation signs requests with a P-256 account key (ES256), keeps a
//! small nonce pool and maps `application/problem+json` answers onto [`AcmeError`], singling out
//! rate limits together with their `Retry-After` hint.
//!
//! # Order flow
//!
//! 1. [`AcmeClient::new_order`] creates the order and fetches every authorization. Each
//!    [`PendingAuthorization`] carries the TXT value to publish under
//!    `_acme-challenge.<domain>`.
//! 2. Once the record is visible, [`AcmeClient::validate`] tells the server to check it and polls
//!    the authorization until it leaves `pending`.
//! 3. [`AcmeClient::finalize`] submits a CSR for a fresh P-256 key, polls the order while it is
//!    `processing` and downloads the chain. Called again on the same order, it picks up from the
//!    order's current status and reuses the key of the CSR already sent.
//!
//! [RFC 8555]: https://datatracker.ietf.org/doc/html/rfc8555

use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use base64::prelude::*;
use der::Encode as _;
use parking_lot::Mutex;
use pkcs8::EncodePrivateKey as _;
use serde::{Deserialize, Deserializer};
use tokio::sync::OnceCell;

pub mod api;
mod cert;
mod jws;
mod key;
mod transport;

#[cfg(test)]
pub(crate) mod test_server;

pub use self::{cert::IssuedCertificate, key::create_p256_key};
pub(crate) use self::key::write_private_file;
use self::{
    key::AcmeKey,
    transport::{check_response, expect_header, http_client, Transport},
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Errors from the ACME exchange.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AcmeError {
    /// HTTP 429 or a `rateLimited` problem document.
    #[error("rate limited: {detail}")]
    RateLimited {
        detail: String,
        retry_after: Option<Duration>,
    },

    /// Any other problem document (or non-2xx answer).
    #[error("ACME problem (HTTP {status}): {problem}")]
    Problem { status: u16, problem: api::Problem },

    /// The server checked a challenge and refused it.
    #[error("validation of {domain} rejected: {detail}")]
    ValidationRejected { domain: String, detail: String },

    /// Account key or registration problems.
    #[error("account error: {0}")]
    Account(String),

    /// The request never produced an HTTP response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with something this client does not understand.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for AcmeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AcmeError::Protocol(err.to_string())
        } else {
            AcmeError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AcmeError {
    fn from(err: serde_json::Error) -> Self {
        AcmeError::Protocol(err.to_string())
    }
}

/// Well known ACME directories, or any other URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryUrl {
    /// The main Let's Encrypt directory.
    LetsEncrypt,

    /// The staging Let's Encrypt directory; relaxed rate limits, untrusted roots.
    LetsEncryptStaging,

    /// Any other directory URL.
    Other(String),
}

impl DirectoryUrl {
    pub fn as_str(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }

    pub fn is_staging(&self) -> bool {
        match self {
            DirectoryUrl::LetsEncryptStaging => true,
            DirectoryUrl::LetsEncrypt => false,
            DirectoryUrl::Other(url) => url.contains("staging"),
        }
    }
}

impl FromStr for DirectoryUrl {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "letsencrypt" | LETSENCRYPT_URL => DirectoryUrl::LetsEncrypt,
            "letsencrypt-staging" | LETSENCRYPT_STAGING_URL => DirectoryUrl::LetsEncryptStaging,
            other => DirectoryUrl::Other(other.to_owned()),
        })
    }
}

impl<'de> Deserialize<'de> for DirectoryUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_else(|never| match never {}))
    }
}

impl fmt::Display for DirectoryUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order created on the server, with one entry per authorization.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub url: String,
    pub finalize_url: String,
    pub domains: Vec<String>,
    pub authorizations: Vec<PendingAuthorization>,
}

/// One domain to prove control of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    /// Domain as requested, wildcards keep their `*.` label.
    pub domain: String,
    pub auth_url: String,
    pub challenge_url: String,
    /// TXT value to publish.
    pub dns_proof: String,
    /// False when the account already proved control recently.
    pub needs_validation: bool,
}

/// The ACME operations the certificate lifecycle depends on.
#[async_trait]
pub trait AcmeClient: Send + Sync + fmt::Debug {
    async fn new_order(&self, domains: &[String]) -> Result<NewOrder, AcmeError>;

    /// Notifies the server that the proof is in place and waits for the verdict.
    async fn validate(
        &self,
        authorization: &PendingAuthorization,
        poll_interval: Duration,
    ) -> Result<(), AcmeError>;

    /// Submits a CSR for a fresh key and downloads the issued chain.
    async fn finalize(
        &self,
        order: &NewOrder,
        poll_interval: Duration,
    ) -> Result<IssuedCertificate, AcmeError>;

    async fn revoke(&self, certificate: &IssuedCertificate) -> Result<(), AcmeError>;
}

/// [`AcmeClient`] speaking RFC 8555 over HTTPS.
///
/// The directory is fetched and the account registered (or looked up) on first use, so
/// constructing a client never touches the network.
pub struct HttpAcmeClient {
    directory_url: DirectoryUrl,
    account_key: Option<PathBuf>,
    contact: Vec<String>,
    session: OnceCell<Session>,
    /// Certificate keys of orders whose CSR went out, by order URL.
    certificate_keys: Mutex<HashMap<String, p256::ecdsa::SigningKey>>,
}

struct Session {
    transport: Transport,
    directory: api::Directory,
}

impl HttpAcmeClient {
    /// Creates a client for `directory_url`.
    ///
    /// `account_key` points to a PKCS#8 PEM file; it is generated on first use when missing. With
    /// `None` a throwaway key is generated in memory.
    pub fn new(
        directory_url: DirectoryUrl,
        account_key: Option<PathBuf>,
        contact: Vec<String>,
    ) -> Self {
        HttpAcmeClient {
            directory_url,
            account_key,
            contact,
            session: OnceCell::new(),
            certificate_keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory_url(&self) -> &DirectoryUrl {
        &self.directory_url
    }

    async fn session(&self) -> Result<&Session, AcmeError> {
        self.session.get_or_try_init(|| self.open_session()).await
    }

    async fn open_session(&self) -> Result<Session, AcmeError> {
        let client = http_client()?;

        log::debug!("fetching ACME directory {}", self.directory_url);
        let res = check_response(client.get(self.directory_url.as_str()).send().await?).await?;
        let directory = res.json::<api::Directory>().await?;

        if directory
            .meta
            .as_ref()
            .and_then(|meta| meta.external_account_required)
            .unwrap_or(false)
        {
            return Err(AcmeError::Account(
                "directory requires external account binding".to_owned(),
            ));
        }

        let acme_key = match &self.account_key {
            Some(path) => AcmeKey::load_or_create(path).await?,
            None => AcmeKey::generate(),
        };

        let mut transport = Transport::new(client, &directory.new_nonce, acme_key);

        // newAccount answers 200 with the existing account's URL for a known key
        let account = api::Account {
            contact: (!self.contact.is_empty()).then(|| self.contact.clone()),
            terms_of_service_agreed: Some(true),
            ..Default::default()
        };

        let res = transport.call_jwk(&directory.new_account, &account).await?;
        let kid = expect_header(&res, "location")?;
        let account = res.json::<api::Account>().await?;

        match account.status.as_deref() {
            Some("deactivated") | Some("revoked") => {
                return Err(AcmeError::Account(format!(
                    "account {kid} is {}",
                    account.status.unwrap_or_default()
                )))
            }
            _ => {}
        }

        log::debug!("key ID is: {kid}");
        transport.set_key_id(kid);

        Ok(Session {
            transport,
            directory,
        })
    }
}

impl fmt::Debug for HttpAcmeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAcmeClient")
            .field("directory_url", &self.directory_url)
            .field("account_key", &self.account_key)
            .field("connected", &self.session.initialized())
            .finish()
    }
}

#[async_trait]
impl AcmeClient for HttpAcmeClient {
    async fn new_order(&self, domains: &[String]) -> Result<NewOrder, AcmeError> {
        let session = self.session().await?;
        let transport = &session.transport;

        let request = api::Order::for_domains(domains.iter().map(String::as_str));
        let res = transport
            .call_kid(&session.directory.new_order, &request)
            .await?;
        let url = expect_header(&res, "location")?;
        let order = res.json::<api::Order>().await?;

        if order.status == Some(api::OrderStatus::Invalid) {
            return Err(AcmeError::Protocol(format!("new order {url} is invalid")));
        }

        let mut authorizations = Vec::with_capacity(order.authorizations.len());

        for auth_url in &order.authorizations {
            let auth = transport
                .call_kid(auth_url, &api::EmptyString)
                .await?
                .json::<api::Authorization>()
                .await?;

            let domain = auth.requested_domain();
            let challenge = auth.dns_challenge().ok_or_else(|| {
                AcmeError::Protocol(format!("no dns-01 challenge offered for {domain}"))
            })?;

            authorizations.push(PendingAuthorization {
                dns_proof: jws::dns_proof(&challenge.token, transport.acme_key())?,
                challenge_url: challenge.url.clone(),
                auth_url: auth_url.clone(),
                needs_validation: auth.status != api::AuthorizationStatus::Valid,
                domain,
            });
        }

        Ok(NewOrder {
            url,
            finalize_url: order.finalize,
            domains: domains.to_vec(),
            authorizations,
        })
    }

    async fn validate(
        &self,
        authorization: &PendingAuthorization,
        poll_interval: Duration,
    ) -> Result<(), AcmeError> {
        let transport = &self.session().await?.transport;

        transport
            .call_kid(&authorization.challenge_url, &api::EmptyObject)
            .await?;

        let auth = loop {
            let auth = transport
                .call_kid(&authorization.auth_url, &api::EmptyString)
                .await?
                .json::<api::Authorization>()
                .await?;

            if auth.status != api::AuthorizationStatus::Pending {
                break auth;
            }

            tokio::time::sleep(poll_interval).await;
        };

        if auth.status == api::AuthorizationStatus::Valid {
            Ok(())
        } else {
            Err(AcmeError::ValidationRejected {
                domain: authorization.domain.clone(),
                detail: auth.failure_detail(),
            })
        }
    }

    async fn finalize(
        &self,
        order: &NewOrder,
        poll_interval: Duration,
    ) -> Result<IssuedCertificate, AcmeError> {
        let transport = &self.session().await?.transport;

        // a retry picks up wherever the previous call stopped
        let mut state = order_state(transport, &order.url).await?;

        if state.status == Some(api::OrderStatus::Ready) {
            let signing_key = self
                .certificate_keys
                .lock()
                .entry(order.url.clone())
                .or_insert_with(create_p256_key)
                .clone();

            let domains = order.domains.iter().map(String::as_str).collect::<Vec<_>>();
            let csr = cert::create_csr(&signing_key, &domains)?
                .to_der()
                .map_err(|err| AcmeError::Protocol(format!("cannot encode CSR: {err}")))?;

            let finalize = api::Finalize {
                csr: BASE64_URL_SAFE_NO_PAD.encode(csr),
            };
            state = transport
                .call_kid(&order.finalize_url, &finalize)
                .await?
                .json::<api::Order>()
                .await?;
        }

        while state.status == Some(api::OrderStatus::Processing) {
            tokio::time::sleep(poll_interval).await;
            state = order_state(transport, &order.url).await?;
        }

        let signing_key = self.certificate_keys.lock().get(&order.url).cloned();

        let (certificate_url, signing_key) = match (state.status, state.certificate, signing_key) {
            (Some(api::OrderStatus::Valid), Some(url), Some(key)) => (url, key),

            (Some(api::OrderStatus::Valid), _, None) => {
                return Err(AcmeError::ValidationRejected {
                    domain: order.domains.join(","),
                    detail: format!("order {} was finalized with an unknown key", order.url),
                });
            }

            (status, _, _) => {
                self.certificate_keys.lock().remove(&order.url);

                let detail = state
                    .error
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| format!("order is {status:?}"));
                return Err(AcmeError::ValidationRejected {
                    domain: order.domains.join(","),
                    detail,
                });
            }
        };

        let certificate_pem = transport
            .call_kid(&certificate_url, &api::EmptyString)
            .await?
            .text()
            .await?;

        let private_key_pem = signing_key
            .to_pkcs8_pem(pem::LineEnding::LF)
            .map_err(|err| AcmeError::Protocol(format!("cannot encode certificate key: {err}")))?;

        let cert = IssuedCertificate::from_pem(certificate_pem, private_key_pem)?;
        self.certificate_keys.lock().remove(&order.url);

        Ok(cert)
    }

    async fn revoke(&self, certificate: &IssuedCertificate) -> Result<(), AcmeError> {
        let session = self.session().await?;

        let revocation = api::Revocation {
            certificate: BASE64_URL_SAFE_NO_PAD.encode(certificate.end_entity_der()?),
            // > the reason code CRL entry extension SHOULD be absent instead of
            // > using the unspecified (0) reasonCode value
            reason: None,
        };

        session
            .transport
            .call_kid(&session.directory.revoke_cert, &revocation)
            .await?;

        Ok(())
    }
}

async fn order_state(transport: &Transport, url: &str) -> Result<api::Order, AcmeError> {
    transport
        .call_kid(url, &api::EmptyString)
        .await?
        .json::<api::Order>()
        .await
        .map_err(AcmeError::from)
}
