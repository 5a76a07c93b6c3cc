//! TOML configuration of the controller binary.
//!
//! ```toml
//! [controller]
//! reconcile_interval = "60s"
//! renew_before = "15days"
//!
//! [secrets]
//! root = "/var/lib/certctl/secrets"
//!
//! [[issuers]]
//! name = "staging"
//! directory = "letsencrypt-staging"
//! contact = ["mailto:ops@example.com"]
//!
//! [issuers.dns]
//! provider = "cloudflare"
//! zone = "example.com"
//! api_token_env = "CLOUDFLARE_API_TOKEN"
//!
//! [[certificates]]
//! domains = ["*.example.com", "example.com"]
//! issuer = "staging"
//! namespaces = ["team-a", "team-b"]
//! secret_name = "wildcard-tls"
//! ```

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::WrapErr as _;
use serde::Deserialize;

use crate::{
    acme::DirectoryUrl, dns::PropagationConfig, request::CertificateSpec, retry::Backoff,
};

/// Environment variable read when an issuer names no credential source.
pub const DEFAULT_TOKEN_ENV: &str = "CLOUDFLARE_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,

    pub secrets: SecretsConfig,

    #[serde(default)]
    pub issuers: Vec<IssuerConfig>,

    #[serde(default)]
    pub certificates: Vec<CertificateSpec>,
}

/// Timing and retry policy of the reconciliation loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,

    /// Renew once the certificate expires within this window.
    #[serde(with = "humantime_serde")]
    pub renew_before: Duration,

    /// Automatic retries of a failed request before it waits for an operator.
    pub max_retries: u32,

    /// Wall-clock bound of finalize, poll and download.
    #[serde(with = "humantime_serde")]
    pub issuing_timeout: Duration,

    /// Bound of a single authorization check by the ACME server.
    #[serde(with = "humantime_serde")]
    pub validation_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub acme_poll_interval: Duration,

    /// Wait after a rate limit answer without `Retry-After`.
    #[serde(with = "humantime_serde")]
    pub rate_limit_cooldown: Duration,

    pub backoff: Backoff,

    pub propagation: PropagationConfig,

    /// Attempts per DNS provider call on transient errors.
    pub dns_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            reconcile_interval: Duration::from_secs(60),
            renew_before: Duration::from_secs(15 * 24 * 60 * 60),
            max_retries: 5,
            issuing_timeout: Duration::from_secs(10 * 60),
            validation_timeout: Duration::from_secs(5 * 60),
            acme_poll_interval: Duration::from_secs(5),
            rate_limit_cooldown: Duration::from_secs(60 * 60),
            backoff: Backoff::default(),
            propagation: PropagationConfig::default(),
            dns_attempts: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretsConfig {
    /// Directory the file secret store writes to.
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssuerConfig {
    pub name: String,

    /// Directory URL, or `letsencrypt` / `letsencrypt-staging`.
    pub directory: DirectoryUrl,

    /// PEM file holding the account key; created on first use when missing.
    #[serde(default)]
    pub account_key: Option<PathBuf>,

    #[serde(default)]
    pub contact: Vec<String>,

    #[serde(default = "default_requests_per_week")]
    pub requests_per_week: u32,

    pub dns: DnsConfig,
}

fn default_requests_per_week() -> u32 {
    50
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    Cloudflare,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    pub provider: DnsProviderKind,

    /// Zone every domain of this issuer lives in.
    pub zone: String,

    /// Skips the zone lookup when set.
    #[serde(default)]
    pub zone_id: Option<String>,

    #[serde(default)]
    pub api_token_env: Option<String>,

    #[serde(default)]
    pub api_token_file: Option<PathBuf>,

    /// Overrides the provider API endpoint.
    #[serde(default)]
    pub api_base: Option<String>,
}

impl DnsConfig {
    /// Reads the API token from the configured file or environment variable.
    pub fn api_token(&self) -> eyre::Result<String> {
        let token = match (&self.api_token_file, &self.api_token_env) {
            (Some(_), Some(_)) => {
                eyre::bail!("set only one of api_token_file and api_token_env")
            }

            (Some(path), None) => std::fs::read_to_string(path)
                .wrap_err_with(|| format!("cannot read API token from {}", path.display()))?,

            (None, env) => {
                let var = env.as_deref().unwrap_or(DEFAULT_TOKEN_ENV);
                std::env::var(var)
                    .wrap_err_with(|| format!("API token variable {var} is not set"))?
            }
        };

        let token = token.trim();
        if token.is_empty() {
            eyre::bail!("API token is empty");
        }

        Ok(token.to_owned())
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read config file {}", path.display()))?;

        Self::from_toml_str(&text)
            .wrap_err_with(|| format!("invalid config file {}", path.display()))
    }

    /// Parses and validates a configuration.
    pub fn from_toml_str(text: &str) -> eyre::Result<Self> {
        let config = toml::from_str::<Config>(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        let mut names = BTreeSet::new();

        for issuer in &self.issuers {
            if issuer.name.trim().is_empty() {
                eyre::bail!("issuer with empty name");
            }
            if !names.insert(issuer.name.as_str()) {
                eyre::bail!("issuer {} defined twice", issuer.name);
            }
            if issuer.requests_per_week == 0 {
                eyre::bail!("issuer {}: requests_per_week must be positive", issuer.name);
            }
            if issuer.dns.zone.trim().is_empty() {
                eyre::bail!("issuer {}: DNS zone is empty", issuer.name);
            }
        }

        for (idx, cert) in self.certificates.iter().enumerate() {
            cert.validate()
                .wrap_err_with(|| format!("certificate #{} ({})", idx + 1, cert.secret_name))?;

            if !names.contains(cert.issuer.as_str()) {
                eyre::bail!(
                    "certificate #{} ({}) references unknown issuer {}",
                    idx + 1,
                    cert.secret_name,
                    cert.issuer
                );
            }
        }

        if self.controller.reconcile_interval.is_zero() {
            eyre::bail!("reconcile_interval must be positive");
        }

        Ok(())
    }

    pub fn issuer(&self, name: &str) -> Option<&IssuerConfig> {
        self.issuers.iter().find(|issuer| issuer.name == name)
    }
}
