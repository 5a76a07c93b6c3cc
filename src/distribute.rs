//! Fan-out of issued certificates into per-namespace secrets.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt, io,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::{
    acme::{write_private_file, IssuedCertificate},
    request::RequestId,
};

/// Certificate chain and key as stored in a secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBundle {
    pub certificate_pem: String,
    pub private_key_pem: Zeroizing<String>,
    pub content_hash: String,
}

impl From<&IssuedCertificate> for SecretBundle {
    fn from(cert: &IssuedCertificate) -> Self {
        SecretBundle {
            certificate_pem: cert.certificate().to_owned(),
            private_key_pem: Zeroizing::new(cert.private_key().to_owned()),
            content_hash: cert.content_hash(),
        }
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("access to namespace '{0}' denied")]
    Denied(String),

    #[error("secret store I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Namespaced key/value store for TLS secrets.
#[async_trait]
pub trait SecretStore: Send + Sync + fmt::Debug {
    /// Hash of the stored content, `None` when the secret does not exist.
    async fn content_hash(&self, namespace: &str, name: &str) -> Result<Option<String>, StoreError>;

    /// Creates or replaces the secret.
    async fn write(
        &self,
        namespace: &str,
        name: &str,
        bundle: &SecretBundle,
    ) -> Result<(), StoreError>;

    /// Removes the secret; a missing secret is not an error.
    async fn remove(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// In-memory [`SecretStore`].
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<(String, String), SecretBundle>>,
    denied: Mutex<HashSet<String>>,
    writes: AtomicUsize,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every following operation on `namespace` fails with [`StoreError::Denied`].
    pub fn deny_namespace(&self, namespace: &str) {
        self.denied.lock().insert(namespace.to_owned());
    }

    pub fn allow_namespace(&self, namespace: &str) {
        self.denied.lock().remove(namespace);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<SecretBundle> {
        self.secrets
            .lock()
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Namespaces holding a secret called `name`.
    pub fn namespaces_with(&self, name: &str) -> BTreeSet<String> {
        self.secrets
            .lock()
            .keys()
            .filter(|(_, n)| n == name)
            .map(|(ns, _)| ns.clone())
            .collect()
    }

    fn check(&self, namespace: &str) -> Result<(), StoreError> {
        if self.denied.lock().contains(namespace) {
            Err(StoreError::Denied(namespace.to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn content_hash(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        self.check(namespace)?;
        Ok(self.get(namespace, name).map(|bundle| bundle.content_hash))
    }

    async fn write(
        &self,
        namespace: &str,
        name: &str,
        bundle: &SecretBundle,
    ) -> Result<(), StoreError> {
        self.check(namespace)?;
        self.secrets
            .lock()
            .insert((namespace.to_owned(), name.to_owned()), bundle.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.check(namespace)?;
        self.secrets
            .lock()
            .remove(&(namespace.to_owned(), name.to_owned()));
        Ok(())
    }
}

/// [`SecretStore`] writing `<root>/<namespace>/<name>/{tls.crt,tls.key,content-hash}`.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    root: PathBuf,
}

const CERT_FILE: &str = "tls.crt";
const KEY_FILE: &str = "tls.key";
const HASH_FILE: &str = "content-hash";

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileSecretStore { root: root.into() }
    }

    fn dir(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(name)
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn content_hash(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.dir(namespace, name).join(HASH_FILE)).await {
            Ok(hash) => Ok(Some(hash.trim().to_owned())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(
        &self,
        namespace: &str,
        name: &str,
        bundle: &SecretBundle,
    ) -> Result<(), StoreError> {
        let dir = self.dir(namespace, name);
        tokio::fs::create_dir_all(&dir).await?;

        // hash goes last so a torn write is never mistaken for an up-to-date copy
        for (file, content) in [
            (CERT_FILE, bundle.certificate_pem.as_bytes()),
            (KEY_FILE, bundle.private_key_pem.as_bytes()),
            (HASH_FILE, bundle.content_hash.as_bytes()),
        ] {
            let tmp = dir.join(format!(".{file}.tmp"));
            if file == KEY_FILE {
                write_private_file(&tmp, content).await?;
            } else {
                tokio::fs::write(&tmp, content).await?;
            }
            tokio::fs::rename(&tmp, dir.join(file)).await?;
        }

        Ok(())
    }

    async fn remove(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(self.dir(namespace, name)).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

/// One copy of a request's certificate in one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistributedSecret {
    pub request_id: RequestId,
    pub namespace: String,
    pub secret_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub synced_at: OffsetDateTime,
    pub content_hash: String,
}

/// Everything distribution needs, copied out of the request.
#[derive(Debug, Clone)]
pub struct DistributionSnapshot {
    pub request_id: RequestId,
    pub secret_name: String,
    pub bundle: SecretBundle,
    pub namespaces: BTreeSet<String>,
    pub previous: Vec<DistributedSecret>,
}

#[derive(Debug, Default)]
pub struct DistributionReport {
    /// Up-to-date copies after this run.
    pub secrets: Vec<DistributedSecret>,
    /// Namespaces whose write or removal failed.
    pub failed: BTreeMap<String, StoreError>,
    /// Writes actually performed; unchanged copies are skipped.
    pub writes: usize,
    /// Namespaces the secret was retracted from.
    pub removed: Vec<String>,
}

impl DistributionReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

enum Outcome {
    Unchanged,
    Written,
    Removed,
}

/// Copies certificates into every target namespace.
#[derive(Debug, Clone)]
pub struct Distributor {
    store: Arc<dyn SecretStore>,
}

impl Distributor {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Distributor { store }
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    /// Upserts the bundle into every namespace concurrently and retracts it from namespaces that
    /// left the target set. Failures are isolated per namespace.
    pub async fn distribute(&self, snapshot: &DistributionSnapshot) -> DistributionReport {
        let name = snapshot.secret_name.as_str();
        let bundle = &snapshot.bundle;

        let upserts = snapshot.namespaces.iter().map(|ns| async move {
            let res = async {
                if self.store.content_hash(ns, name).await?.as_deref()
                    == Some(bundle.content_hash.as_str())
                {
                    return Ok(Outcome::Unchanged);
                }

                self.store.write(ns, name, bundle).await?;
                Ok::<_, StoreError>(Outcome::Written)
            }
            .await;

            (ns.as_str(), res)
        });

        let dropped = snapshot
            .previous
            .iter()
            .filter(|prev| !snapshot.namespaces.contains(&prev.namespace))
            .map(|prev| async move {
                let res = self
                    .store
                    .remove(&prev.namespace, &prev.secret_name)
                    .await
                    .map(|()| Outcome::Removed);
                (prev.namespace.as_str(), res)
            });

        let (upserts, removals) = futures::future::join(
            futures::future::join_all(upserts),
            futures::future::join_all(dropped),
        )
        .await;

        let now = OffsetDateTime::now_utc();
        let mut report = DistributionReport::default();

        for (ns, res) in upserts.into_iter().chain(removals) {
            match res {
                Ok(Outcome::Removed) => {
                    log::info!("retracted {name} from {ns}");
                    report.removed.push(ns.to_owned());
                }

                Ok(outcome) => {
                    if let Outcome::Written = outcome {
                        log::info!("wrote {name} to {ns}");
                        report.writes += 1;
                    }

                    report.secrets.push(DistributedSecret {
                        request_id: snapshot.request_id,
                        namespace: ns.to_owned(),
                        secret_name: name.to_owned(),
                        synced_at: now,
                        content_hash: bundle.content_hash.clone(),
                    });
                }

                Err(err) => {
                    log::warn!("distributing {name} to {ns} failed: {err}");
                    report.failed.insert(ns.to_owned(), err);
                }
            }
        }

        // a dropped namespace we could not clean up stays on record
        for prev in &snapshot.previous {
            if !snapshot.namespaces.contains(&prev.namespace)
                && report.failed.contains_key(&prev.namespace)
            {
                report.secrets.push(prev.clone());
            }
        }

        report
    }

    /// Removes the secret from every listed namespace. Returns the namespaces that failed.
    pub async fn retract<'a>(
        &self,
        secret_name: &str,
        namespaces: impl IntoIterator<Item = &'a str>,
    ) -> BTreeMap<String, StoreError> {
        let removals = namespaces.into_iter().map(|ns| async move {
            (ns, self.store.remove(ns, secret_name).await)
        });

        futures::future::join_all(removals)
            .await
            .into_iter()
            .filter_map(|(ns, res)| {
                res.err().map(|err| {
                    log::warn!("retracting {secret_name} from {ns} failed: {err}");
                    (ns.to_owned(), err)
                })
            })
            .collect()
    }
}
