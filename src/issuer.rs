//! Issuers: an ACME directory, a DNS solver and a rate limit, registered by name.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use eyre::WrapErr as _;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    acme::{AcmeClient, DirectoryUrl, HttpAcmeClient},
    config::{Config, DnsProviderKind, IssuerConfig},
    dns::{CloudflareProvider, DnsProvider, PropagationChecker},
    solver::ChallengeSolver,
};

const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Continuously refilling token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    period_secs: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket holding `capacity` tokens, refilled completely over `period`. Starts full.
    pub fn new(capacity: u32, period: Duration) -> Self {
        let capacity = f64::from(capacity);
        TokenBucket {
            capacity,
            period_secs: period.as_secs_f64(),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn per_week(requests: u32) -> Self {
        Self::new(requests, WEEK)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = if self.period_secs > 0.0 {
            (state.tokens + elapsed * self.capacity / self.period_secs).min(self.capacity)
        } else {
            self.capacity
        };
        state.last_refill = now;
    }

    /// Takes a token if one is available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens.floor() as u32
    }

    /// Time until the next token is available.
    pub fn time_until_available(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= 1.0 || self.capacity <= 0.0 {
            return Duration::ZERO;
        }

        Duration::from_secs_f64((1.0 - state.tokens) * self.period_secs / self.capacity)
    }
}

/// A named issuer. Immutable once registered.
#[derive(Debug)]
pub struct Issuer {
    name: String,
    directory_url: DirectoryUrl,
    acme: Arc<dyn AcmeClient>,
    solver: ChallengeSolver,
    rate_limit: TokenBucket,
}

impl Issuer {
    pub fn new(
        name: impl Into<String>,
        directory_url: DirectoryUrl,
        acme: Arc<dyn AcmeClient>,
        solver: ChallengeSolver,
        rate_limit: TokenBucket,
    ) -> Self {
        Issuer {
            name: name.into(),
            directory_url,
            acme,
            solver,
            rate_limit,
        }
    }

    /// Builds the ACME client and DNS solver described by `config`.
    pub fn from_config(config: &IssuerConfig, settings: &Config) -> eyre::Result<Self> {
        let acme = HttpAcmeClient::new(
            config.directory.clone(),
            config.account_key.clone(),
            config.contact.clone(),
        );

        let token = config
            .dns
            .api_token()
            .wrap_err_with(|| format!("DNS credentials of issuer {}", config.name))?;

        let provider: Arc<dyn DnsProvider> = match config.dns.provider {
            DnsProviderKind::Cloudflare => {
                let mut cf = CloudflareProvider::new(token, Duration::from_secs(30))?;
                if let Some(api_base) = &config.dns.api_base {
                    cf = cf.with_api_base(api_base);
                }
                if let Some(zone_id) = &config.dns.zone_id {
                    cf = cf.with_zone_id(zone_id);
                }
                Arc::new(cf)
            }
        };

        let controller = &settings.controller;
        let solver = ChallengeSolver::new(
            provider,
            PropagationChecker::public(controller.propagation.clone()),
            &config.dns.zone,
        )
        .with_retries(controller.backoff.clone(), controller.dns_attempts);

        Ok(Issuer::new(
            &config.name,
            config.directory.clone(),
            Arc::new(acme),
            solver,
            TokenBucket::per_week(config.requests_per_week),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory_url(&self) -> &DirectoryUrl {
        &self.directory_url
    }

    pub fn acme(&self) -> &dyn AcmeClient {
        self.acme.as_ref()
    }

    pub fn solver(&self) -> &ChallengeSolver {
        &self.solver
    }

    pub fn rate_limit(&self) -> &TokenBucket {
        &self.rate_limit
    }
}

/// Issuers by name.
#[derive(Debug, Default)]
pub struct IssuerRegistry {
    issuers: BTreeMap<String, Arc<Issuer>>,
}

impl IssuerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        let mut registry = IssuerRegistry::new();

        for issuer in &config.issuers {
            let issuer = Issuer::from_config(issuer, config)
                .wrap_err_with(|| format!("cannot set up issuer {}", issuer.name))?;
            registry.insert(issuer)?;
        }

        Ok(registry)
    }

    /// Registers `issuer`; names are unique.
    pub fn insert(&mut self, issuer: Issuer) -> eyre::Result<Arc<Issuer>> {
        if self.issuers.contains_key(issuer.name()) {
            eyre::bail!("issuer {} registered twice", issuer.name());
        }

        log::info!(
            "registered issuer {} ({})",
            issuer.name(),
            issuer.directory_url()
        );

        let issuer = Arc::new(issuer);
        self.issuers
            .insert(issuer.name().to_owned(), Arc::clone(&issuer));
        Ok(issuer)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Issuer>> {
        self.issuers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.issuers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Issuer>> {
        self.issuers.values()
    }

    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }
}
