//! Certificate lifecycle controller: obtains TLS certificates from ACME (Automatic Certificate
//! Management Environment) providers such as [Let's Encrypt](https://letsencrypt.org/) using
//! DNS-01 challenges, renews them before they expire and copies each one into every namespace
//! that needs it.
//!
//! # Overview
//!
//! A [`CertificateSpec`] names a set of domains (wildcards allowed), the [`Issuer`] to ask and
//! the namespaces to serve. The [`Controller`] turns it into a [`CertificateRequest`] and drives
//! it through its states:
//!
//! ```text
//! Pending -> Validating -> Issuing -> Issued -> Renewing -> Issuing -> Issued ...
//!                 \            \                   \
//!                  `------------`--> Failed <-------'
//! ```
//!
//! Validation creates an ACME order, publishes one `_acme-challenge` TXT record per
//! authorization through a [`DnsProvider`], waits until public resolvers return it and asks the
//! ACME server to check. The records are removed afterwards in every case. Issuance submits a
//! CSR for a fresh P-256 key and downloads the chain. Issued certificates are written to a
//! [`SecretStore`] once per namespace, skipping copies that are already up to date.
//!
//! # Failures
//!
//! Every error belongs to an [`ErrorClass`]. Transient errors are retried with exponential
//! backoff and jitter, rate limits are waited out using `Retry-After` when the server sends one,
//! and permanent errors (refused credentials, malformed requests) wait for an operator.
//!
//! # Rate Limits
//!
//! Let's Encrypt enforces [rate limits] on new orders. Each issuer carries its own token bucket
//! sized in requests per week; a request stays `Pending` while its issuer is out of tokens.
//!
//! ## Use Staging For Development!
//!
//! Take care to use the Let's Encrypt staging environment for development where the rate limits
//! are more relaxed. See [`DirectoryUrl::LetsEncryptStaging`].
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

pub mod acme;
pub mod config;
pub mod controller;
pub mod distribute;
pub mod dns;
mod error;
pub mod events;
pub mod issuer;
pub mod lifecycle;
pub mod request;
pub mod retry;
pub mod solver;


pub use crate::{
    acme::{AcmeClient, DirectoryUrl, HttpAcmeClient, IssuedCertificate},
    config::Config,
    controller::Controller,
    distribute::{FileSecretStore, MemorySecretStore, SecretStore},
    dns::DnsProvider,
    error::{Error, ErrorClass, Result},
    events::TransitionEvent,
    issuer::{Issuer, IssuerRegistry},
    request::{CertificateRequest, CertificateSpec, RequestId, RequestState},
};
