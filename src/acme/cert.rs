use std::{
    fmt,
    io::{BufReader, Cursor},
};

use der::{asn1::Ia5String, Decode as _};
use sha2::{Digest as _, Sha256};
use time::OffsetDateTime;
use x509_cert::{
    builder::{Builder as _, RequestBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    request::CertReq,
};
use zeroize::Zeroizing;

use super::AcmeError;

/// Creates a CSR for `domains`, signed by `signer`.
///
/// The first domain becomes the Common Name; every domain, the first included, goes into the
/// Subject Alternative Name extension.
pub(crate) fn create_csr(
    signer: &p256::ecdsa::SigningKey,
    domains: &[&str],
) -> Result<CertReq, AcmeError> {
    let csr_err = |err: &dyn fmt::Display| AcmeError::Protocol(format!("cannot build CSR: {err}"));

    let primary = domains
        .first()
        .ok_or_else(|| AcmeError::Protocol("cannot build CSR without domains".to_owned()))?;

    let subject = format!("CN={primary}")
        .parse::<Name>()
        .map_err(|err| csr_err(&err))?;

    let mut csr = RequestBuilder::new(subject, signer).map_err(|err| csr_err(&err))?;

    let names = domains
        .iter()
        .map(|domain| Ia5String::new(domain).map(GeneralName::DnsName))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| csr_err(&err))?;

    csr.add_extension(&SubjectAltName(names))
        .map_err(|err| csr_err(&err))?;

    csr.build::<p256::ecdsa::DerSignature>()
        .map_err(|err| csr_err(&err))
}

/// An issued certificate chain together with its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    certificate_pem: String,
    private_key_pem: Zeroizing<String>,
    not_after: OffsetDateTime,
}

impl IssuedCertificate {
    pub fn new(
        certificate_pem: impl Into<String>,
        private_key_pem: Zeroizing<String>,
        not_after: OffsetDateTime,
    ) -> Self {
        IssuedCertificate {
            certificate_pem: certificate_pem.into(),
            private_key_pem,
            not_after,
        }
    }

    /// Reads the expiry from the end-entity certificate, the first one in the chain.
    pub fn from_pem(
        certificate_pem: String,
        private_key_pem: Zeroizing<String>,
    ) -> Result<Self, AcmeError> {
        let chain = certificate_chain(&certificate_pem)?;
        let end_entity = chain
            .first()
            .ok_or_else(|| AcmeError::Protocol("no certificates in chain".to_owned()))?;

        let cert = x509_cert::Certificate::from_der(end_entity)
            .map_err(|err| AcmeError::Protocol(format!("invalid certificate: {err}")))?;

        let not_after = cert.tbs_certificate.validity.not_after.to_unix_duration();
        let not_after = i64::try_from(not_after.as_secs())
            .ok()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .ok_or_else(|| AcmeError::Protocol("certificate expiry out of range".to_owned()))?;

        Ok(IssuedCertificate {
            certificate_pem,
            private_key_pem,
            not_after,
        })
    }

    /// The certificate chain in PEM format.
    pub fn certificate(&self) -> &str {
        &self.certificate_pem
    }

    /// The private key in PKCS#8 PEM format.
    pub fn private_key(&self) -> &str {
        &self.private_key_pem
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// DER of the end-entity certificate, as needed for revocation.
    pub fn end_entity_der(&self) -> Result<Vec<u8>, AcmeError> {
        certificate_chain(&self.certificate_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| AcmeError::Protocol("no certificates in chain".to_owned()))
    }

    /// Hex SHA-256 over certificate and key; identifies the secret content.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.certificate_pem.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.private_key_pem.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("not_after", &self.not_after)
            .field("content_hash", &self.content_hash())
            .finish_non_exhaustive()
    }
}

fn certificate_chain(pem: &str) -> Result<Vec<Vec<u8>>, AcmeError> {
    let mut rdr = BufReader::new(Cursor::new(pem));

    rustls_pemfile::certs(&mut rdr)
        .map(|res| res.map(|cert| cert.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| AcmeError::Protocol(format!("invalid certificate PEM: {err}")))
}
