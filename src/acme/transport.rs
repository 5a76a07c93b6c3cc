use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;
use reqwest::{header::HeaderMap, Response, StatusCode};
use serde::Serialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use super::{
    api,
    jws::{self, Jwk, JwsProtectedHeader},
    key::AcmeKey,
    AcmeError,
};

/// Bad nonces are expected now and then; anything beyond this is a broken server.
const MAX_NONCE_RETRIES: usize = 5;

const NONCE_POOL_SIZE: usize = 10;

pub(crate) fn http_client() -> Result<reqwest::Client, AcmeError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|err| AcmeError::Transport(err.to_string()))
}

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against the newAccount URL
/// 3. `set_key_id()` with the returned `Location` header
/// 4. `call_kid()` for every call after that
#[derive(Debug)]
pub(crate) struct Transport {
    client: reqwest::Client,
    acme_key: AcmeKey,
    nonce_url: String,
    nonces: Mutex<VecDeque<String>>,
}

impl Transport {
    pub(crate) fn new(client: reqwest::Client, nonce_url: &str, acme_key: AcmeKey) -> Self {
        Transport {
            client,
            acme_key,
            nonce_url: nonce_url.to_owned(),
            nonces: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.acme_key.set_key_id(kid);
    }

    pub(crate) fn acme_key(&self) -> &AcmeKey {
        &self.acme_key
    }

    /// Signed call carrying the full JWK; only needed for newAccount.
    pub(crate) async fn call_jwk<T>(&self, url: &str, body: &T) -> Result<Response, AcmeError>
    where
        T: Serialize + ?Sized,
    {
        let jwk = Jwk::try_from(&self.acme_key)?;
        self.call_with(url, body, |nonce| {
            JwsProtectedHeader::new_jwk(jwk.clone(), url, nonce)
        })
        .await
    }

    /// Signed call using the account URL as key ID.
    pub(crate) async fn call_kid<T>(&self, url: &str, body: &T) -> Result<Response, AcmeError>
    where
        T: Serialize + ?Sized,
    {
        let kid = self
            .acme_key
            .key_id()
            .ok_or_else(|| AcmeError::Account("account key has no key ID yet".to_owned()))?
            .to_owned();

        self.call_with(url, body, |nonce| {
            JwsProtectedHeader::new_kid(&kid, url, nonce)
        })
        .await
    }

    async fn call_with<T, F>(
        &self,
        url: &str,
        body: &T,
        make_header: F,
    ) -> Result<Response, AcmeError>
    where
        T: Serialize + ?Sized,
        F: Fn(String) -> JwsProtectedHeader,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let nonce = self.nonce().await?;
            let jws = jws::sign(&make_header(nonce), &self.acme_key, body)?;

            log::debug!("call endpoint: {url}");

            let res = self
                .client
                .post(url)
                .header("content-type", "application/jose+json")
                .body(jws)
                .send()
                .await?;

            // failed responses carry a fresh nonce too
            self.stash_nonce(res.headers());

            match check_response(res).await {
                Err(AcmeError::Problem { problem, .. })
                    if (problem.is_bad_nonce() || problem.is_jws_verification_error())
                        && attempt < MAX_NONCE_RETRIES =>
                {
                    log::debug!("retrying on: {problem}");
                }
                res => return res,
            }
        }
    }

    fn stash_nonce(&self, headers: &HeaderMap) {
        let Some(nonce) = headers
            .get("replay-nonce")
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };

        log::trace!("extracting new nonce");

        let mut pool = self.nonces.lock();
        pool.push_back(nonce.to_owned());
        if pool.len() > NONCE_POOL_SIZE {
            pool.pop_front();
        }
    }

    async fn nonce(&self) -> Result<String, AcmeError> {
        if let Some(nonce) = self.nonces.lock().pop_front() {
            log::trace!("use previous nonce");
            return Ok(nonce);
        }

        log::debug!("request new nonce");
        let res = check_response(self.client.head(&self.nonce_url).send().await?).await?;
        expect_header(&res, "replay-nonce")
    }
}

/// Turns non-2xx responses into [`AcmeError`]s, classifying rate limits.
pub(crate) async fn check_response(res: Response) -> Result<Response, AcmeError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let retry_after = res.headers().get("retry-after").and_then(|value| {
        value
            .to_str()
            .ok()
            .and_then(|value| parse_retry_after(value, OffsetDateTime::now_utc()))
    });

    let is_problem = res
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    let body = res.text().await.unwrap_or_default();

    let problem = if is_problem {
        serde_json::from_str(&body).unwrap_or_else(|err| api::Problem {
            _type: "problemJsonFail".to_owned(),
            detail: Some(format!(
                "failed to deserialize application/problem+json ({err}) body: {body}"
            )),
            subproblems: None,
        })
    } else {
        api::Problem {
            _type: "httpReqError".to_owned(),
            detail: Some(format!("{status} body: {body}")),
            subproblems: None,
        }
    };

    if status == StatusCode::TOO_MANY_REQUESTS || problem.is_rate_limited() {
        return Err(AcmeError::RateLimited {
            detail: problem.to_string(),
            retry_after,
        });
    }

    Err(AcmeError::Problem {
        status: status.as_u16(),
        problem,
    })
}

pub(crate) fn expect_header(res: &Response, name: &str) -> Result<String, AcmeError> {
    res.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
        .ok_or_else(|| AcmeError::Protocol(format!("missing header: {name}")))
}

/// `Retry-After` is either delay-seconds or an HTTP-date.
pub(crate) fn parse_retry_after(value: &str, now: OffsetDateTime) -> Option<Duration> {
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = OffsetDateTime::parse(value, &Rfc2822).ok()?;
    let delta = at - now;
    Some(Duration::try_from(delta).unwrap_or(Duration::ZERO))
}
