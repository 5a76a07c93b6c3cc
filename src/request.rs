//! Certificate requests and their state machine.

use std::{collections::BTreeSet, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    acme::IssuedCertificate,
    distribute::DistributedSecret,
    error::{Error, Result},
};

/// Identifies a request, displayed as `cr-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cr-{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.strip_prefix("cr-")
            .and_then(|n| n.parse().ok())
            .map(RequestId)
            .ok_or_else(|| Error::InvalidRequest(format!("malformed request id: {s}")))
    }
}

impl Serialize for RequestId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Normalized set of domains: lowercase, no trailing dot, deduplicated and sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainSet(BTreeSet<String>);

impl DomainSet {
    pub fn new<I, S>(domains: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = domains
            .into_iter()
            .map(|domain| normalize_domain(domain.as_ref()))
            .collect::<Result<BTreeSet<_>>>()?;

        if set.is_empty() {
            return Err(Error::InvalidRequest("no domains requested".to_owned()));
        }

        Ok(DomainSet(set))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl fmt::Display for DomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for domain in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(domain)?;
            first = false;
        }
        Ok(())
    }
}

fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid =
        |why: &str| Err(Error::InvalidRequest(format!("invalid domain '{domain}': {why}")));

    if domain.is_empty() {
        return invalid("empty");
    }
    if domain.len() > 253 {
        return invalid("longer than 253 characters");
    }

    let base = domain.strip_prefix("*.").unwrap_or(&domain);
    if !base.contains('.') {
        return invalid("needs at least two labels");
    }

    for label in base.split('.') {
        if label.is_empty() || label.len() > 63 {
            return invalid("label length must be 1 to 63");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("label starts or ends with '-'");
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return invalid("only letters, digits, '-' and a leading '*.' are allowed");
        }
    }

    Ok(domain)
}

/// At most one live request exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub issuer: String,
    pub domains: DomainSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestState {
    Pending,
    Validating,
    Issuing,
    Issued,
    Renewing,
    Failed,
    Revoked,
    Deleted,
}

impl RequestState {
    /// Work is in flight for the request.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RequestState::Validating | RequestState::Issuing | RequestState::Renewing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Revoked | RequestState::Deleted)
    }

    pub fn can_transition_to(self, to: RequestState) -> bool {
        use RequestState::*;

        match (self, to) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Revoked, _) => false,
            (_, Revoked) => true,

            (Pending, Validating) => true,
            (Validating | Renewing, Issuing | Failed) => true,
            (Issuing, Issued | Failed) => true,
            (Issued, Renewing) => true,
            (Failed, Validating | Renewing | Pending) => true,

            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What an operator asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateSpec {
    pub domains: Vec<String>,
    pub issuer: String,
    pub namespaces: Vec<String>,
    pub secret_name: String,
}

impl CertificateSpec {
    /// Checks names and returns the normalized domain set and namespace set.
    pub fn validate(&self) -> Result<(DomainSet, BTreeSet<String>)> {
        if self.issuer.trim().is_empty() {
            return Err(Error::InvalidRequest("issuer name is empty".to_owned()));
        }

        validate_name("secret name", &self.secret_name)?;

        let namespaces = validate_namespaces(&self.namespaces)?;
        let domains = DomainSet::new(&self.domains)?;

        Ok((domains, namespaces))
    }
}

pub(crate) fn validate_namespaces(namespaces: &[String]) -> Result<BTreeSet<String>> {
    if namespaces.is_empty() {
        return Err(Error::InvalidRequest("no target namespaces".to_owned()));
    }

    namespaces
        .iter()
        .map(|ns| validate_name("namespace", ns).map(|()| ns.clone()))
        .collect()
}

// names end up as path components in file stores
fn validate_name(what: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 253
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'));

    if ok {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("invalid {what} '{name}'")))
    }
}

/// A failed attempt, kept in the request history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub at: OffsetDateTime,
    /// State the request was in when the attempt failed.
    pub state: RequestState,
    pub error: Error,
}

#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub id: RequestId,
    pub domains: DomainSet,
    pub issuer: String,
    pub secret_name: String,
    pub namespaces: BTreeSet<String>,

    pub state: RequestState,
    pub created_at: OffsetDateTime,
    pub last_validated_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,

    /// Automatic retries since the last success or operator re-trigger.
    pub retry_count: u32,
    pub last_error: Option<Error>,
    /// When the scheduler may retry a failed request; `None` means never automatically.
    pub next_attempt_at: Option<OffsetDateTime>,
    pub history: Vec<Attempt>,

    pub certificate: Option<IssuedCertificate>,
    pub distributed: Vec<DistributedSecret>,
    pub failed_namespaces: BTreeSet<String>,
    pub renewal_requested: bool,
}

impl CertificateRequest {
    pub fn new(
        id: RequestId,
        spec: &CertificateSpec,
        domains: DomainSet,
        namespaces: BTreeSet<String>,
        now: OffsetDateTime,
    ) -> Self {
        CertificateRequest {
            id,
            domains,
            issuer: spec.issuer.clone(),
            secret_name: spec.secret_name.clone(),
            namespaces,
            state: RequestState::Pending,
            created_at: now,
            last_validated_at: None,
            expires_at: None,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            history: Vec::new(),
            certificate: None,
            distributed: Vec::new(),
            failed_namespaces: BTreeSet::new(),
            renewal_requested: false,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            issuer: self.issuer.clone(),
            domains: self.domains.clone(),
        }
    }

    pub fn spec(&self) -> CertificateSpec {
        CertificateSpec {
            domains: self.domains.to_vec(),
            issuer: self.issuer.clone(),
            namespaces: self.namespaces.iter().cloned().collect(),
            secret_name: self.secret_name.clone(),
        }
    }

    /// Moves to `to` if the state machine allows it and returns the previous state.
    pub fn transition(&mut self, to: RequestState) -> Result<RequestState> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidRequest(format!(
                "{} cannot move from {} to {to}",
                self.id, self.state
            )));
        }

        Ok(std::mem::replace(&mut self.state, to))
    }

    /// Records a failed attempt made in the current state.
    pub fn record_failure(&mut self, error: Error, at: OffsetDateTime) {
        self.history.push(Attempt {
            at,
            state: self.state,
            error: error.clone(),
        });
        self.last_error = Some(error);
    }

    /// Point in time from which the certificate is renewed.
    pub fn renew_at(&self, renew_before: Duration) -> Option<OffsetDateTime> {
        self.expires_at.map(|expiry| expiry - renew_before)
    }

    pub fn renewal_due(&self, now: OffsetDateTime, renew_before: Duration) -> bool {
        self.renewal_requested
            || self
                .renew_at(renew_before)
                .is_some_and(|renew_at| now >= renew_at)
    }
}
