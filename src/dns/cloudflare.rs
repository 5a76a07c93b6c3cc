//! Cloudflare DNS provider, API v4.
//!
//! API documentation: <https://developers.cloudflare.com/api/resources/dns/>

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{DnsError, DnsProvider, DnsRecord, DnsResult, RecordType};

pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// "A record with the same settings already exists" and its identical-record sibling.
const DUPLICATE_RECORD_CODES: [i64; 2] = [81057, 81058];

/// Cloudflare zone-scoped API token provider.
#[derive(Debug)]
pub struct CloudflareProvider {
    client: reqwest::Client,
    api_base: String,
    token: String,
    zone_id: Option<String>,
    /// zone name -> zone id
    zone_cache: RwLock<HashMap<String, String>>,
}

impl CloudflareProvider {
    pub fn new(token: impl Into<String>, timeout: Duration) -> DnsResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DnsError::Transient(format!("cannot create HTTP client: {err}")))?;

        Ok(CloudflareProvider {
            client,
            api_base: CLOUDFLARE_API_BASE.to_owned(),
            token: token.into(),
            zone_id: None,
            zone_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Points the provider at another API endpoint.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_owned();
        self
    }

    /// Skips the zone lookup; every zone name resolves to this id.
    pub fn with_zone_id(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    async fn zone_id(&self, zone: &str) -> DnsResult<String> {
        if let Some(id) = &self.zone_id {
            return Ok(id.clone());
        }

        let cached = self.zone_cache.read().get(zone).cloned();
        if let Some(id) = cached {
            log::trace!("zone id for {zone} found in cache");
            return Ok(id);
        }

        let req = self
            .client
            .get(format!("{}/zones", self.api_base))
            .query(&[("name", zone)]);
        let zones = self.call::<Vec<CfZone>>(req).await?.1.into_result()?;

        let zone_id = zones
            .into_iter()
            .find(|z| z.name.eq_ignore_ascii_case(zone))
            .map(|z| z.id)
            .ok_or_else(|| DnsError::ZoneNotFound(zone.to_owned()))?;

        log::debug!("zone {zone} has id {zone_id}");
        self.zone_cache
            .write()
            .insert(zone.to_owned(), zone_id.clone());

        Ok(zone_id)
    }

    /// Sends the request and classifies HTTP-level failures.
    ///
    /// Answers other than 401/403/429/5xx come back as an envelope; the caller decides what its
    /// error codes mean.
    async fn call<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
    ) -> DnsResult<(StatusCode, Envelope<T>)> {
        let res = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| DnsError::Transient(err.to_string()))?;

        let status = res.status();
        let retry_after = res
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = res
            .text()
            .await
            .map_err(|err| DnsError::Transient(err.to_string()))?;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DnsError::Unauthorized(format!("{status}: {body}")))
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(DnsError::RateLimited { retry_after }),
            status if status.is_server_error() => {
                return Err(DnsError::Transient(format!("{status}: {body}")))
            }
            _ => {}
        }

        let envelope = serde_json::from_str::<Envelope<T>>(&body).map_err(|err| {
            DnsError::Transient(format!("unexpected Cloudflare response ({err}): {body}"))
        })?;

        Ok((status, envelope))
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    async fn create_record(
        &self,
        zone: &str,
        name: &str,
        record_type: RecordType,
        value: &str,
        ttl: u32,
    ) -> DnsResult<String> {
        let zone_id = self.zone_id(zone).await?;

        log::debug!("creating {record_type} record {name} in zone {zone}");

        let req = self
            .client
            .post(format!("{}/zones/{zone_id}/dns_records", self.api_base))
            .json(&NewRecord {
                record_type: record_type.as_str(),
                name,
                content: value,
                ttl,
            });
        let (_, envelope) = self.call::<CfRecord>(req).await?;

        if envelope.is_duplicate() {
            log::debug!("{record_type} record {name} already exists, reusing it");

            return self
                .find_records(zone, name, record_type)
                .await?
                .into_iter()
                .find(|record| record.content == value)
                .map(|record| record.id)
                .ok_or_else(|| {
                    DnsError::Rejected(format!("duplicate {record_type} record {name} not found"))
                });
        }

        Ok(envelope.into_result()?.id)
    }

    async fn delete_record(&self, zone: &str, record_id: &str) -> DnsResult<()> {
        let zone_id = self.zone_id(zone).await?;

        log::debug!("deleting record {record_id} in zone {zone}");

        let req = self.client.delete(format!(
            "{}/zones/{zone_id}/dns_records/{record_id}",
            self.api_base
        ));
        let (status, envelope) = self.call::<serde_json::Value>(req).await?;

        if status == StatusCode::NOT_FOUND {
            log::debug!("record {record_id} already gone");
            return Ok(());
        }

        envelope.into_result().map(drop)
    }

    async fn find_records(
        &self,
        zone: &str,
        name: &str,
        record_type: RecordType,
    ) -> DnsResult<Vec<DnsRecord>> {
        let zone_id = self.zone_id(zone).await?;

        let req = self
            .client
            .get(format!("{}/zones/{zone_id}/dns_records", self.api_base))
            .query(&[("type", record_type.as_str()), ("name", name)]);
        let records = self.call::<Vec<CfRecord>>(req).await?.1.into_result()?;

        Ok(records
            .into_iter()
            .map(|record| DnsRecord {
                // TXT content may come back quoted
                content: record.content.trim_matches('"').to_owned(),
                id: record.id,
                name: record.name,
            })
            .collect())
    }

    async fn verify_token(&self) -> DnsResult<bool> {
        let req = self
            .client
            .get(format!("{}/user/tokens/verify", self.api_base));

        match self.call::<TokenStatus>(req).await {
            Ok((_, envelope)) => Ok(envelope.into_result()?.status == "active"),
            Err(DnsError::Unauthorized(msg)) => {
                log::warn!("Cloudflare token rejected: {msg}");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

impl<T> Envelope<T> {
    fn is_duplicate(&self) -> bool {
        self.errors
            .iter()
            .any(|err| DUPLICATE_RECORD_CODES.contains(&err.code))
    }

    fn into_result(self) -> DnsResult<T> {
        match self.result {
            Some(result) if self.success => Ok(result),
            _ => {
                let messages = self
                    .errors
                    .iter()
                    .map(|err| format!("{} ({})", err.message, err.code))
                    .collect::<Vec<_>>();
                Err(DnsError::Rejected(if messages.is_empty() {
                    "request failed without error details".to_owned()
                } else {
                    messages.join("; ")
                }))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CfZone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CfRecord {
    id: String,
    name: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct NewRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct TokenStatus {
    status: String,
}
