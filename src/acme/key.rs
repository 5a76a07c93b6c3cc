use std::{io, path::Path};

use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use tokio::io::AsyncWriteExt as _;
use zeroize::Zeroizing;

use super::AcmeError;

/// Make a P-256 private key, used both for ACME accounts and certificate keys.
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    p256::ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Writes `content` to `path`, readable by the owner only on Unix.
pub(crate) async fn write_private_file(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(content).await?;
    file.flush().await
}

/// Account key plus the key ID (account URL) once the server told us.
#[derive(Clone, Debug)]
pub(crate) struct AcmeKey {
    signing_key: p256::ecdsa::SigningKey,
    key_id: Option<String>,
}

impl AcmeKey {
    pub(crate) fn generate() -> AcmeKey {
        Self::from_key(create_p256_key())
    }

    pub(crate) fn from_pem(pem: &str) -> Result<AcmeKey, AcmeError> {
        let signing_key = p256::ecdsa::SigningKey::from_pkcs8_pem(pem)
            .map_err(|err| AcmeError::Account(format!("invalid account key PEM: {err}")))?;
        Ok(Self::from_key(signing_key))
    }

    /// Loads the account key at `path`, or generates one and persists it there.
    pub(crate) async fn load_or_create(path: &Path) -> Result<AcmeKey, AcmeError> {
        match tokio::fs::read_to_string(path).await {
            Ok(pem) => {
                log::debug!("loading ACME account key from {}", path.display());
                Self::from_pem(&pem)
            }

            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("generating ACME account key at {}", path.display());
                let key = Self::generate();
                let pem = key.to_pem()?;

                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|err| AcmeError::Account(err.to_string()))?;
                }
                write_private_file(path, pem.as_bytes())
                    .await
                    .map_err(|err| AcmeError::Account(err.to_string()))?;

                Ok(key)
            }

            Err(err) => Err(AcmeError::Account(format!(
                "cannot read account key {}: {err}",
                path.display()
            ))),
        }
    }

    fn from_key(signing_key: p256::ecdsa::SigningKey) -> AcmeKey {
        AcmeKey {
            signing_key,
            key_id: None,
        }
    }

    pub(crate) fn to_pem(&self) -> Result<Zeroizing<String>, AcmeError> {
        self.signing_key
            .to_pkcs8_pem(pem::LineEnding::LF)
            .map_err(|err| AcmeError::Account(format!("cannot encode account key: {err}")))
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }

    pub(crate) fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid)
    }
}
