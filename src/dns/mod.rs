//! DNS provider abstraction used to publish `_acme-challenge` TXT records.

use std::{fmt, time::Duration};

use async_trait::async_trait;

pub mod cloudflare;
pub mod propagation;

pub use self::{
    cloudflare::CloudflareProvider,
    propagation::{PropagationChecker, PropagationConfig, PublicResolvers, TxtLookup},
};

pub type DnsResult<T> = Result<T, DnsError>;

/// Label prepended to the domain for DNS-01 challenge records.
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// TTL for challenge records, in seconds.
pub const CHALLENGE_TTL: u32 = 60;

/// Errors from a DNS provider API or from a public resolver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    /// 401/403; retrying with the same token will not help.
    #[error("DNS provider refused credentials: {0}")]
    Unauthorized(String),

    #[error("DNS provider rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// 5xx, timeouts and connection errors.
    #[error("transient DNS provider error: {0}")]
    Transient(String),

    /// Any other 4xx.
    #[error("DNS provider rejected request: {0}")]
    Rejected(String),

    #[error("zone '{0}' not found")]
    ZoneNotFound(String),

    #[error("DNS lookup failed: {0}")]
    Lookup(String),
}

impl DnsError {
    /// True for failures worth retrying right away with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, DnsError::Transient(_) | DnsError::Lookup(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Txt,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Txt => "TXT",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    pub content: String,
}

/// A DNS hosting API able to manage records in a zone.
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait DnsProvider: Send + Sync + fmt::Debug {
    /// Provider name, for logs.
    fn name(&self) -> &'static str;

    /// Creates a record and returns its provider id.
    ///
    /// Creating a record identical to an existing one succeeds and returns the existing id.
    async fn create_record(
        &self,
        zone: &str,
        name: &str,
        record_type: RecordType,
        value: &str,
        ttl: u32,
    ) -> DnsResult<String>;

    /// Deletes a record. A record that is already gone is not an error.
    async fn delete_record(&self, zone: &str, record_id: &str) -> DnsResult<()>;

    /// Lists records of `record_type` named `name`.
    async fn find_records(
        &self,
        zone: &str,
        name: &str,
        record_type: RecordType,
    ) -> DnsResult<Vec<DnsRecord>>;

    /// Checks that the configured credentials are accepted.
    async fn verify_token(&self) -> DnsResult<bool>;
}

/// Strips the wildcard label; `*.example.com` is validated at `example.com`.
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// `_acme-challenge.<domain>`, for wildcards too.
pub fn challenge_record_name(domain: &str) -> String {
    format!("{ACME_CHALLENGE_LABEL}.{}", normalize_domain(domain))
}
