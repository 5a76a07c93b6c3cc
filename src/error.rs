use std::time::Duration;

use crate::{acme::AcmeError, dns::DnsError};

/// Result type used by the controller.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the certificate lifecycle.
///
/// Each variant belongs to one [`ErrorClass`] which decides how (and whether) the scheduler
/// retries the failed request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A challenge TXT record was not visible on any public resolver in time.
    #[error("DNS propagation timeout for {record} after {elapsed:?}")]
    DnsPropagationTimeout { record: String, elapsed: Duration },

    /// The ACME server refused an authorization or an order.
    #[error("ACME validation rejected for {domain}: {detail}")]
    AcmeValidationRejected { domain: String, detail: String },

    /// The ACME server answered with a rate-limit problem.
    #[error("ACME rate limited: {detail}")]
    AcmeRateLimited {
        detail: String,
        retry_after: Option<Duration>,
    },

    /// The DNS provider answered with 429.
    #[error("DNS provider rate limited")]
    DnsRateLimited { retry_after: Option<Duration> },

    /// Credentials or configuration of the issuer were refused.
    #[error("issuer unavailable: {0}")]
    IssuerUnavailable(String),

    /// Network errors, 5xx answers, unparsable responses.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Finalizing the order did not complete inside the wall-clock window.
    #[error("certificate issuance did not complete within {0:?}")]
    IssuingTimeout(Duration),

    /// The request itself can never succeed as submitted.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The work was cancelled by an operator command or shutdown.
    #[error("cancelled")]
    Cancelled,
}

/// How the scheduler treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with exponential backoff and jitter.
    Transient,

    /// Retried after `Retry-After`, or the configured cooldown when absent.
    RateLimited(Option<Duration>),

    /// Never retried automatically.
    Permanent,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::DnsPropagationTimeout { .. }
            | Error::AcmeValidationRejected { .. }
            | Error::Transient(_)
            | Error::IssuingTimeout(_) => ErrorClass::Transient,

            Error::AcmeRateLimited { retry_after, .. } | Error::DnsRateLimited { retry_after } => {
                ErrorClass::RateLimited(*retry_after)
            }

            Error::IssuerUnavailable(_) | Error::InvalidRequest(_) | Error::Cancelled => {
                ErrorClass::Permanent
            }
        }
    }

    /// Short machine readable name, used in events and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DnsPropagationTimeout { .. } => "DNSPropagationTimeout",
            Error::AcmeValidationRejected { .. } => "ACMEValidationRejected",
            Error::AcmeRateLimited { .. } => "ACMERateLimited",
            Error::DnsRateLimited { .. } => "DNSRateLimited",
            Error::IssuerUnavailable(_) => "IssuerUnavailable",
            Error::Transient(_) => "Transient",
            Error::IssuingTimeout(_) => "IssuingTimeout",
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::Cancelled => "Cancelled",
        }
    }
}

impl From<DnsError> for Error {
    fn from(err: DnsError) -> Self {
        match err {
            DnsError::Unauthorized(msg) => Error::IssuerUnavailable(msg),
            DnsError::ZoneNotFound(zone) => {
                Error::IssuerUnavailable(format!("DNS zone '{zone}' not found"))
            }
            DnsError::RateLimited { retry_after } => Error::DnsRateLimited { retry_after },
            DnsError::Rejected(msg) => Error::InvalidRequest(msg),
            DnsError::Transient(msg) | DnsError::Lookup(msg) => Error::Transient(msg),
        }
    }
}

impl From<AcmeError> for Error {
    fn from(err: AcmeError) -> Self {
        match err {
            AcmeError::RateLimited {
                detail,
                retry_after,
            } => Error::AcmeRateLimited {
                detail,
                retry_after,
            },
            AcmeError::ValidationRejected { domain, detail } => {
                Error::AcmeValidationRejected { domain, detail }
            }
            AcmeError::Problem { status, problem } => {
                if status >= 500 || problem.is_server_internal() || problem.is_order_not_ready() {
                    Error::Transient(problem.to_string())
                } else if status == 401 || status == 403 || problem.is_unauthorized() {
                    Error::IssuerUnavailable(problem.to_string())
                } else {
                    Error::InvalidRequest(problem.to_string())
                }
            }
            AcmeError::Account(msg) => Error::IssuerUnavailable(msg),
            AcmeError::Transport(msg) | AcmeError::Protocol(msg) => Error::Transient(msg),
        }
    }
}
