//! Waits for challenge records to show up on public resolvers.
//!
//! The ACME server resolves the record itself; notifying it before the record is visible wastes
//! the authorization. Every configured nameserver is queried independently with caching
//! disabled, and a single resolver returning the exact expected value is enough.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::xfer::Protocol,
    ResolveError, Resolver, TokioResolver,
};
use serde::Deserialize;
use tokio::time::Instant;

use super::{DnsError, DnsResult};
use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Delay before the first check.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// Give up after this long.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    pub nameservers: Vec<IpAddr>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        PropagationConfig {
            initial_delay: Duration::ZERO,
            check_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
            ],
        }
    }
}

/// Source of TXT answers.
#[async_trait]
pub trait TxtLookup: Send + Sync + fmt::Debug {
    /// Every TXT value seen for `name`, across all queried resolvers.
    ///
    /// A name that does not exist yet yields an empty list, not an error.
    async fn txt_values(&self, name: &str) -> DnsResult<Vec<String>>;
}

/// [`TxtLookup`] over a set of independent public resolvers.
pub struct PublicResolvers {
    resolvers: Vec<(IpAddr, TokioResolver)>,
}

impl PublicResolvers {
    pub fn new(nameservers: &[IpAddr]) -> Self {
        let resolvers = nameservers
            .iter()
            .map(|ip| {
                let mut config = ResolverConfig::new();
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));

                let mut opts = ResolverOpts::default();
                opts.timeout = Duration::from_secs(5);
                opts.attempts = 2;
                opts.cache_size = 0;

                let resolver =
                    Resolver::builder_with_config(config, TokioConnectionProvider::default())
                        .with_options(opts)
                        .build();

                (*ip, resolver)
            })
            .collect();

        PublicResolvers { resolvers }
    }

    async fn query(ip: IpAddr, resolver: &TokioResolver, name: &str) -> DnsResult<Vec<String>> {
        match resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    // long values are split into several character-strings
                    txt.txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect::<String>()
                })
                .collect()),

            Err(err) if is_absent(&err) => Ok(Vec::new()),
            Err(err) => Err(DnsError::Lookup(format!("{name} via {ip}: {err}"))),
        }
    }
}

/// The name or its TXT records do not exist (yet).
fn is_absent(err: &ResolveError) -> bool {
    err.is_no_records_found() || err.is_nx_domain()
}

impl fmt::Debug for PublicResolvers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.resolvers.iter().map(|(ip, _)| ip))
            .finish()
    }
}

#[async_trait]
impl TxtLookup for PublicResolvers {
    async fn txt_values(&self, name: &str) -> DnsResult<Vec<String>> {
        let answers = futures::future::join_all(
            self.resolvers
                .iter()
                .map(|(ip, resolver)| Self::query(*ip, resolver, name)),
        )
        .await;

        let mut values = Vec::new();
        let mut answered = false;
        let mut last_err = None;

        for answer in answers {
            match answer {
                Ok(found) => {
                    answered = true;
                    values.extend(found);
                }
                Err(err) => {
                    log::debug!("{err}");
                    last_err = Some(err);
                }
            }
        }

        // an error only when no resolver answered at all
        match last_err {
            Some(err) if !answered => Err(err),
            _ => Ok(values),
        }
    }
}

/// Polls a [`TxtLookup`] until a record carries the expected value.
#[derive(Debug, Clone)]
pub struct PropagationChecker {
    lookup: Arc<dyn TxtLookup>,
    config: PropagationConfig,
}

impl PropagationChecker {
    pub fn new(lookup: Arc<dyn TxtLookup>, config: PropagationConfig) -> Self {
        PropagationChecker { lookup, config }
    }

    /// Checker backed by [`PublicResolvers`] for the configured nameservers.
    pub fn public(config: PropagationConfig) -> Self {
        let lookup = Arc::new(PublicResolvers::new(&config.nameservers));
        Self::new(lookup, config)
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Single check, no waiting.
    pub async fn is_visible(&self, record_name: &str, expected: &str) -> DnsResult<bool> {
        let values = self.lookup.txt_values(record_name).await?;
        log::trace!("{record_name} currently resolves to {values:?}");
        Ok(values.iter().any(|value| value == expected))
    }

    /// Waits until `record_name` resolves to `expected` on at least one resolver.
    pub async fn wait_for(&self, record_name: &str, expected: &str) -> Result<(), Error> {
        let start = Instant::now();
        let deadline = start + self.config.timeout;

        log::debug!(
            "waiting up to {:?} for {record_name} to propagate",
            self.config.timeout
        );

        tokio::time::sleep(self.config.initial_delay).await;

        loop {
            match self.is_visible(record_name, expected).await {
                Ok(true) => {
                    log::debug!("{record_name} visible after {:?}", start.elapsed());
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) => log::warn!("propagation check for {record_name} failed: {err}"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DnsPropagationTimeout {
                    record: record_name.to_owned(),
                    elapsed: now - start,
                });
            }

            tokio::time::sleep(self.config.check_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn only_missing_records_count_as_absent() {
        // classified by kind, whatever the message says
        assert!(!is_absent(&ResolveError::from("no records found for TXT")));
        assert!(!is_absent(&ResolveError::from("request timed out")));
    }

    /// Answers with the value once `visible_after` lookups have happened.
    #[derive(Debug)]
    struct SlowZone {
        value: String,
        visible_after: usize,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl TxtLookup for SlowZone {
        async fn txt_values(&self, _name: &str) -> DnsResult<Vec<String>> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst);
            if n >= self.visible_after {
                Ok(vec!["unrelated".to_owned(), self.value.clone()])
            } else {
                Ok(vec![])
            }
        }
    }

    fn checker(zone: Arc<SlowZone>) -> PropagationChecker {
        PropagationChecker::new(
            zone,
            PropagationConfig {
                check_interval: Duration::from_secs(5),
                timeout: Duration::from_secs(120),
                ..Default::default()
            },
        )
    }

    #[test]
    fn defaults() {
        let config = PropagationConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(config.nameservers.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_visible() {
        let zone = Arc::new(SlowZone {
            value: "proof".to_owned(),
            visible_after: 3,
            lookups: AtomicUsize::new(0),
        });

        checker(Arc::clone(&zone))
            .wait_for("_acme-challenge.example.com", "proof")
            .await
            .unwrap();

        assert_eq!(zone.lookups.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let zone = Arc::new(SlowZone {
            value: "proof".to_owned(),
            visible_after: usize::MAX,
            lookups: AtomicUsize::new(0),
        });

        let err = checker(zone)
            .wait_for("_acme-challenge.example.com", "proof")
            .await
            .unwrap_err();

        match err {
            Error::DnsPropagationTimeout { record, elapsed } => {
                assert_eq!(record, "_acme-challenge.example.com");
                assert!(elapsed >= Duration::from_secs(120));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_value_does_not_count() {
        let zone = Arc::new(SlowZone {
            value: "proo".to_owned(),
            visible_after: 0,
            lookups: AtomicUsize::new(0),
        });

        assert!(!checker(zone)
            .is_visible("_acme-challenge.example.com", "proof")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn resolvers_are_built_per_nameserver() {
        let resolvers = PublicResolvers::new(&PropagationConfig::default().nameservers);
        assert_eq!(format!("{resolvers:?}"), "[1.1.1.1, 8.8.8.8, 9.9.9.9]");
    }
}
