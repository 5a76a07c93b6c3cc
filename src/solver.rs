//! DNS-01 challenge solving: publish, wait for propagation, clean up.

use std::sync::Arc;

use crate::{
    dns::{self, DnsError, DnsProvider, PropagationChecker, RecordType, CHALLENGE_TTL},
    error::{Error, Result},
    retry::{retry, Backoff},
};

/// One TXT record proving control of one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Domain as requested, possibly a wildcard.
    pub domain: String,
    /// `_acme-challenge.<domain without "*.">`
    pub record_name: String,
    pub zone: String,
    pub expected_value: String,

    /// Provider id, once the create call answered.
    pub record_id: Option<String>,
    /// A create call was sent; the record may exist even without an id.
    pub publish_attempted: bool,
    pub propagated: bool,
    pub cleaned_up: bool,
}

impl Challenge {
    pub fn new(domain: &str, zone: &str, expected_value: &str) -> Self {
        Challenge {
            domain: domain.to_owned(),
            record_name: dns::challenge_record_name(domain),
            zone: zone.to_owned(),
            expected_value: expected_value.to_owned(),
            record_id: None,
            publish_attempted: false,
            propagated: false,
            cleaned_up: false,
        }
    }

    /// True while a record may still exist at the provider.
    pub fn needs_cleanup(&self) -> bool {
        self.publish_attempted && !self.cleaned_up
    }
}

/// Publishes challenge records in one zone and watches them propagate.
#[derive(Debug, Clone)]
pub struct ChallengeSolver {
    provider: Arc<dyn DnsProvider>,
    propagation: PropagationChecker,
    zone: String,
    backoff: Backoff,
    max_attempts: u32,
}

impl ChallengeSolver {
    pub fn new(
        provider: Arc<dyn DnsProvider>,
        propagation: PropagationChecker,
        zone: impl Into<String>,
    ) -> Self {
        ChallengeSolver {
            provider,
            propagation,
            zone: zone.into().trim_end_matches('.').to_ascii_lowercase(),
            backoff: Backoff::new(
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(30),
            ),
            max_attempts: 4,
        }
    }

    /// Backoff and attempt bound for transient provider errors.
    pub fn with_retries(mut self, backoff: Backoff, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn provider(&self) -> &Arc<dyn DnsProvider> {
        &self.provider
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Builds the challenge for `domain`, which must lie inside this solver's zone.
    pub fn challenge(&self, domain: &str, expected_value: &str) -> Result<Challenge> {
        let name = dns::normalize_domain(domain);
        if name != self.zone && !name.ends_with(&format!(".{}", self.zone)) {
            return Err(Error::InvalidRequest(format!(
                "{domain} is outside DNS zone {}",
                self.zone
            )));
        }

        Ok(Challenge::new(domain, &self.zone, expected_value))
    }

    /// Publishes the record and waits until a public resolver returns it.
    pub async fn solve(&self, challenge: &mut Challenge) -> Result<()> {
        self.publish(challenge).await?;
        self.await_propagation(challenge).await
    }

    pub async fn publish(&self, challenge: &mut Challenge) -> Result<()> {
        if challenge.record_id.is_some() {
            return Ok(());
        }

        log::info!(
            "publishing {} via {}",
            challenge.record_name,
            self.provider.name()
        );

        challenge.publish_attempted = true;

        let record_id = retry(
            &self.backoff,
            self.max_attempts,
            "create challenge record",
            DnsError::is_transient,
            || {
                self.provider.create_record(
                    &challenge.zone,
                    &challenge.record_name,
                    RecordType::Txt,
                    &challenge.expected_value,
                    CHALLENGE_TTL,
                )
            },
        )
        .await?;

        log::debug!("{} has record id {record_id}", challenge.record_name);
        challenge.record_id = Some(record_id);

        Ok(())
    }

    pub async fn await_propagation(&self, challenge: &mut Challenge) -> Result<()> {
        self.propagation
            .wait_for(&challenge.record_name, &challenge.expected_value)
            .await?;

        challenge.propagated = true;
        Ok(())
    }

    /// Removes the record. Calling it again after success is a no-op.
    pub async fn cleanup(&self, challenge: &mut Challenge) -> Result<()> {
        if !challenge.needs_cleanup() {
            return Ok(());
        }

        match &challenge.record_id {
            Some(record_id) => {
                retry(
                    &self.backoff,
                    self.max_attempts,
                    "delete challenge record",
                    DnsError::is_transient,
                    || self.provider.delete_record(&challenge.zone, record_id),
                )
                .await?;
            }

            // the create call failed ambiguously; find the record by name and value
            None => {
                let records = self
                    .provider
                    .find_records(&challenge.zone, &challenge.record_name, RecordType::Txt)
                    .await?;

                for record in records
                    .iter()
                    .filter(|record| record.content == challenge.expected_value)
                {
                    self.provider
                        .delete_record(&challenge.zone, &record.id)
                        .await?;
                }
            }
        }

        log::debug!("removed {}", challenge.record_name);
        challenge.cleaned_up = true;

        Ok(())
    }

    /// Cleans up every challenge, carrying on past failures. Returns the first error.
    pub async fn cleanup_all(&self, challenges: &mut [Challenge]) -> Result<()> {
        let mut first_err = None;

        for challenge in challenges.iter_mut() {
            if let Err(err) = self.cleanup(challenge).await {
                log::warn!("failed to remove {}: {err}", challenge.record_name);
                first_err.get_or_insert(err);
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}
