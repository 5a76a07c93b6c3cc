//! The reconciliation loop and the operator commands.
//!
//! The [`Controller`] keeps one live record per (issuer, domain set) pair. Operators create and
//! flag requests; only the scheduler moves a request out of `Pending`, `Issued` or `Failed`.
//! Validation and issuance of one request run in their own task, which can be cancelled by
//! [`Controller::delete`], [`Controller::revoke`] or shutdown. A cancelled task still removes its
//! challenge records before it ends.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::{sync::broadcast, time::MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    acme::IssuedCertificate,
    config::ControllerConfig,
    distribute::{DistributionSnapshot, Distributor, SecretBundle, SecretStore},
    error::{Error, ErrorClass, Result},
    events::{EventBus, TransitionEvent},
    issuer::{Issuer, IssuerRegistry},
    lifecycle,
    request::{
        validate_namespaces, CertificateRequest, CertificateSpec, DedupKey, DomainSet, RequestId,
        RequestState,
    },
};

/// Owns every certificate request. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    settings: ControllerConfig,
    issuers: IssuerRegistry,
    distributor: Distributor,
    events: EventBus,
    book: Mutex<Book>,
    workers: Mutex<HashMap<RequestId, Worker>>,
    /// Serializes writes and retractions of one issuer's secrets.
    distribution: HashMap<String, tokio::sync::Mutex<()>>,
    next_id: AtomicU64,
}

/// Revoked and deleted requests kept for [`Controller::get`]; older ones are forgotten.
const ARCHIVE_LIMIT: usize = 1024;

#[derive(Debug)]
struct Book {
    live: BTreeMap<RequestId, CertificateRequest>,
    by_key: HashMap<DedupKey, RequestId>,
    /// Revoked and deleted requests, oldest first.
    archive: VecDeque<CertificateRequest>,
    archive_limit: usize,
    /// Being deleted or revoked; the scheduler leaves these alone.
    stopping: HashSet<RequestId>,
}

impl Default for Book {
    fn default() -> Self {
        Book {
            live: BTreeMap::new(),
            by_key: HashMap::new(),
            archive: VecDeque::new(),
            archive_limit: ARCHIVE_LIMIT,
            stopping: HashSet::new(),
        }
    }
}

impl Book {
    fn archive(&mut self, req: CertificateRequest) {
        self.archive.push_back(req);

        while self.archive.len() > self.archive_limit {
            if let Some(old) = self.archive.pop_front() {
                log::debug!("{}: dropped from the archive", old.id);
            }
        }
    }

    fn live_mut(&mut self, id: RequestId) -> Result<&mut CertificateRequest> {
        self.live.get_mut(&id).ok_or_else(|| unknown_request(id))
    }

    fn retire(&mut self, id: RequestId) -> Option<CertificateRequest> {
        self.stopping.remove(&id);
        let req = self.live.remove(&id)?;

        let key = req.dedup_key();
        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
        }

        Some(req)
    }
}

#[derive(Debug)]
struct Worker {
    cancel: CancellationToken,
    /// Cancelled once the task has finished.
    done: CancellationToken,
}

impl Worker {
    fn is_running(&self) -> bool {
        !self.done.is_cancelled()
    }
}

fn unknown_request(id: RequestId) -> Error {
    Error::InvalidRequest(format!("unknown request {id}"))
}

fn snapshot(req: &CertificateRequest) -> Option<DistributionSnapshot> {
    req.certificate.as_ref().map(|cert| DistributionSnapshot {
        request_id: req.id,
        secret_name: req.secret_name.clone(),
        bundle: SecretBundle::from(cert),
        namespaces: req.namespaces.clone(),
        previous: req.distributed.clone(),
    })
}

impl Controller {
    pub fn new(
        settings: ControllerConfig,
        issuers: IssuerRegistry,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        let distribution = issuers
            .names()
            .map(|name| (name.to_owned(), tokio::sync::Mutex::new(())))
            .collect();

        Controller {
            shared: Arc::new(Shared {
                settings,
                issuers,
                distributor: Distributor::new(store),
                events: EventBus::default(),
                book: Mutex::new(Book::default()),
                workers: Mutex::new(HashMap::new()),
                distribution,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &ControllerConfig {
        &self.shared.settings
    }

    pub fn issuers(&self) -> &IssuerRegistry {
        &self.shared.issuers
    }

    /// Registers a request, or coalesces it onto the live request for the same issuer and
    /// domain set.
    ///
    /// Coalescing adds the new namespaces to the existing request. A failed request is reset to
    /// `Pending` as if [`retry`](Self::retry) had been called.
    pub fn submit(&self, spec: CertificateSpec) -> Result<RequestId> {
        let (domains, namespaces) = spec.validate()?;

        if self.shared.issuers.get(&spec.issuer).is_none() {
            return Err(Error::InvalidRequest(format!(
                "unknown issuer {}",
                spec.issuer
            )));
        }

        let key = DedupKey {
            issuer: spec.issuer.clone(),
            domains: domains.clone(),
        };

        let mut book = self.shared.book.lock();

        let existing = book.by_key.get(&key).copied();
        if let Some(req) = existing.and_then(|id| book.live.get_mut(&id)) {
            let id = req.id;

            if req.secret_name != spec.secret_name {
                log::warn!(
                    "{id}: keeping secret name {}, ignoring {}",
                    req.secret_name,
                    spec.secret_name
                );
            }

            for ns in namespaces {
                if req.namespaces.insert(ns.clone()) {
                    log::info!("{id}: added namespace {ns}");
                }
            }

            if req.state == RequestState::Failed {
                self.shared.reset(req)?;
            }

            log::debug!("{id}: coalesced submission for {}", req.domains);
            return Ok(id);
        }

        let id = RequestId(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let req =
            CertificateRequest::new(id, &spec, domains, namespaces, OffsetDateTime::now_utc());
        log::info!("{id}: new request for {} from {}", req.domains, req.issuer);

        book.by_key.insert(key, id);
        book.live.insert(id, req);

        Ok(id)
    }

    /// Flags an issued request for renewal on the next pass.
    pub fn trigger_renewal(&self, id: RequestId) -> Result<()> {
        let mut book = self.shared.book.lock();
        let req = book.live_mut(id)?;

        match req.state {
            RequestState::Issued | RequestState::Renewing => {
                req.renewal_requested = true;
                log::info!("{id}: renewal requested");
                Ok(())
            }
            state => Err(Error::InvalidRequest(format!(
                "{id} is {state}, only issued certificates can be renewed"
            ))),
        }
    }

    /// Puts a failed request back to `Pending` with a fresh retry budget.
    pub fn retry(&self, id: RequestId) -> Result<()> {
        let mut book = self.shared.book.lock();
        let req = book.live_mut(id)?;

        if req.state != RequestState::Failed {
            return Err(Error::InvalidRequest(format!(
                "{id} is {}, only failed requests can be retried",
                req.state
            )));
        }

        self.shared.reset(req)
    }

    /// Replaces the target namespaces. Copies in dropped namespaces are retracted on the next
    /// pass.
    pub fn set_namespaces(&self, id: RequestId, namespaces: &[String]) -> Result<()> {
        let namespaces = validate_namespaces(namespaces)?;

        let mut book = self.shared.book.lock();
        let req = book.live_mut(id)?;
        log::info!("{id}: target namespaces now {namespaces:?}");
        req.namespaces = namespaces;

        Ok(())
    }

    /// Stops any work in flight, removes every copy and archives the request as `Deleted`.
    pub async fn delete(&self, id: RequestId) -> Result<()> {
        let shared = &self.shared;

        let issuer = {
            let mut book = shared.book.lock();

            if !book.live.contains_key(&id) {
                return shared.delete_archived(&mut book, id);
            }

            book.stopping.insert(id);
            book.live_mut(id)?.issuer.clone()
        };

        shared.stop_worker(id).await;

        let _guard = shared.lock_distribution(&issuer).await;
        shared.retract_copies(id).await;

        let mut book = shared.book.lock();
        let mut req = book.retire(id).ok_or_else(|| unknown_request(id))?;
        let from = req.transition(RequestState::Deleted)?;
        shared.emit(&req, from);
        book.archive(req);

        Ok(())
    }

    /// Revokes the current certificate at the ACME server, removes every copy and archives the
    /// request as `Revoked`.
    ///
    /// The request ends up `Revoked` even when the ACME server refuses; that error is recorded
    /// and returned.
    pub async fn revoke(&self, id: RequestId) -> Result<()> {
        let shared = &self.shared;

        let issuer = {
            let mut book = shared.book.lock();
            let issuer = book.live_mut(id)?.issuer.clone();
            book.stopping.insert(id);
            issuer
        };

        shared.stop_worker(id).await;

        let _guard = shared.lock_distribution(&issuer).await;

        let certificate = shared
            .book
            .lock()
            .live
            .get(&id)
            .and_then(|req| req.certificate.clone());

        let revoked = match (&certificate, shared.issuers.get(&issuer)) {
            (Some(cert), Some(issuer)) => {
                log::info!("{id}: revoking certificate expiring {}", cert.not_after());
                issuer.acme().revoke(cert).await.map_err(Error::from)
            }
            _ => Ok(()),
        };

        shared.retract_copies(id).await;

        let mut book = shared.book.lock();
        let mut req = book.retire(id).ok_or_else(|| unknown_request(id))?;
        if let Err(err) = &revoked {
            log::warn!("{id}: revocation failed: {err}");
            req.record_failure(err.clone(), OffsetDateTime::now_utc());
        }
        let from = req.transition(RequestState::Revoked)?;
        shared.emit(&req, from);
        book.archive(req);

        revoked
    }

    /// Live or archived request.
    pub fn get(&self, id: RequestId) -> Option<CertificateRequest> {
        let book = self.shared.book.lock();

        book.live
            .get(&id)
            .or_else(|| book.archive.iter().rev().find(|req| req.id == id))
            .cloned()
    }

    /// Every request, archived ones included, ordered by id.
    pub fn list(&self) -> Vec<CertificateRequest> {
        let book = self.shared.book.lock();

        let mut all = book
            .live
            .values()
            .chain(&book.archive)
            .cloned()
            .collect::<Vec<_>>();
        all.sort_by_key(|req| req.id);
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.shared.events.subscribe()
    }

    /// One scheduler pass over the requests of issuer `name`.
    pub async fn reconcile_issuer(&self, name: &str) -> Result<()> {
        let issuer = self
            .shared
            .issuers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidRequest(format!("unknown issuer {name}")))?;

        self.schedule(&issuer);
        self.shared.redistribute(name).await;

        Ok(())
    }

    /// One pass over every issuer, concurrently.
    pub async fn reconcile_all(&self) -> Result<()> {
        let passes = self
            .shared
            .issuers
            .names()
            .map(|name| self.reconcile_issuer(name));

        futures::future::try_join_all(passes).await?;
        Ok(())
    }

    /// Runs one reconciliation loop per issuer until `shutdown` is cancelled, then cancels the
    /// work in flight and waits for it to clean up.
    pub async fn run(&self, shutdown: CancellationToken) {
        let loops = self
            .shared
            .issuers
            .names()
            .map(|name| {
                let this = self.clone();
                let name = name.to_owned();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.reconcile_loop(&name, &shutdown).await })
            })
            .collect::<Vec<_>>();

        for res in futures::future::join_all(loops).await {
            if let Err(err) = res {
                log::error!("reconciliation loop crashed: {err}");
            }
        }

        log::info!("shutting down, cancelling work in flight");
        self.shared.stop_all().await;
    }

    async fn reconcile_loop(&self, name: &str, shutdown: &CancellationToken) {
        let mut interval = tokio::time::interval(self.shared.settings.reconcile_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "reconciling issuer {name} every {:?}",
            self.shared.settings.reconcile_interval
        );

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(err) = self.reconcile_issuer(name).await {
                log::error!("reconciling issuer {name} failed: {err}");
            }
        }
    }

    /// Waits until no work is in flight for `id` and returns the request.
    pub async fn wait_idle(&self, id: RequestId) -> Option<CertificateRequest> {
        let done = self
            .shared
            .workers
            .lock()
            .get(&id)
            .map(|worker| worker.done.clone());

        if let Some(done) = done {
            done.cancelled().await;
        }

        self.get(id)
    }

    /// Starts pending requests, due retries and due renewals, as far as the rate limit allows.
    fn schedule(&self, issuer: &Arc<Issuer>) {
        let shared = &self.shared;
        let settings = &shared.settings;
        let now = OffsetDateTime::now_utc();

        let mut book = shared.book.lock();
        let mut workers = shared.workers.lock();
        workers.retain(|_, worker| worker.is_running());

        let Book { live, stopping, .. } = &mut *book;

        for phase in [
            RequestState::Pending,
            RequestState::Failed,
            RequestState::Issued,
        ] {
            for req in live.values_mut() {
                if req.issuer != issuer.name()
                    || req.state != phase
                    || stopping.contains(&req.id)
                    || workers.contains_key(&req.id)
                {
                    continue;
                }

                let to = match phase {
                    RequestState::Pending => RequestState::Validating,

                    RequestState::Failed => {
                        if !req.next_attempt_at.is_some_and(|at| at <= now) {
                            continue;
                        }
                        if req.certificate.is_some() {
                            RequestState::Renewing
                        } else {
                            RequestState::Validating
                        }
                    }

                    _ => {
                        if !req.renewal_due(now, settings.renew_before) {
                            continue;
                        }
                        RequestState::Renewing
                    }
                };

                if !issuer.rate_limit().try_acquire() {
                    log::debug!(
                        "{}: issuer {} out of tokens for {:?}",
                        req.id,
                        issuer.name(),
                        issuer.rate_limit().time_until_available()
                    );
                    continue;
                }

                if phase == RequestState::Failed {
                    // waiting out a rate limit does not use up the retry budget
                    let rate_limited = matches!(
                        req.last_error.as_ref().map(Error::class),
                        Some(ErrorClass::RateLimited(_))
                    );
                    if !rate_limited {
                        req.retry_count += 1;
                    }
                    req.next_attempt_at = None;
                }

                let from = match req.transition(to) {
                    Ok(from) => from,
                    Err(err) => {
                        log::error!("{err}");
                        continue;
                    }
                };
                shared.emit(req, from);

                let cancel = CancellationToken::new();
                let done = CancellationToken::new();

                tokio::spawn(Arc::clone(shared).work(
                    Arc::clone(issuer),
                    req.id,
                    req.domains.clone(),
                    cancel.clone(),
                    done.clone().drop_guard(),
                ));

                workers.insert(req.id, Worker { cancel, done });
            }
        }
    }
}

impl Shared {
    fn emit(&self, req: &CertificateRequest, from: RequestState) {
        log::info!("{} ({}): {from} -> {}", req.id, req.domains, req.state);
        self.events
            .emit(TransitionEvent::new(req, from, OffsetDateTime::now_utc()));
    }

    fn reset(&self, req: &mut CertificateRequest) -> Result<()> {
        req.retry_count = 0;
        req.next_attempt_at = None;
        let from = req.transition(RequestState::Pending)?;
        self.emit(req, from);
        Ok(())
    }

    /// Applies `update` and moves the request to `to`, provided it is still in one of the
    /// `expected` states. Fails with [`Error::Cancelled`] when the request changed meanwhile.
    fn transition<T>(
        &self,
        id: RequestId,
        expected: &[RequestState],
        to: RequestState,
        update: impl FnOnce(&mut CertificateRequest) -> T,
    ) -> Result<T> {
        let mut book = self.book.lock();

        let req = book
            .live
            .get_mut(&id)
            .filter(|req| expected.contains(&req.state) && req.state.can_transition_to(to))
            .ok_or(Error::Cancelled)?;

        let out = update(req);
        let from = req.transition(to)?;
        self.emit(req, from);

        Ok(out)
    }

    async fn work(
        self: Arc<Self>,
        issuer: Arc<Issuer>,
        id: RequestId,
        domains: DomainSet,
        cancel: CancellationToken,
        _done: DropGuard,
    ) {
        match self.attempt(&issuer, id, &domains, &cancel).await {
            Ok(()) => {}
            Err(Error::Cancelled) => log::info!("{id}: work stopped"),
            Err(err) => self.fail(id, err),
        }
    }

    async fn attempt(
        &self,
        issuer: &Issuer,
        id: RequestId,
        domains: &DomainSet,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let order = lifecycle::validate(issuer, domains, &self.settings, cancel).await?;

        let now = OffsetDateTime::now_utc();
        self.transition(
            id,
            &[RequestState::Validating, RequestState::Renewing],
            RequestState::Issuing,
            |req| req.last_validated_at = Some(now),
        )?;

        let cert = lifecycle::issue(issuer, &order, &self.settings, cancel).await?;
        self.complete(issuer.name(), id, cert).await
    }

    async fn complete(&self, issuer: &str, id: RequestId, cert: IssuedCertificate) -> Result<()> {
        let _guard = self.lock_distribution(issuer).await;

        let snapshot = self.transition(id, &[RequestState::Issuing], RequestState::Issued, |req| {
            log::info!("{id}: certificate valid until {}", cert.not_after());

            req.expires_at = Some(cert.not_after());
            req.certificate = Some(cert);
            req.retry_count = 0;
            req.renewal_requested = false;
            req.next_attempt_at = None;
            req.last_error = None;

            snapshot(req)
        })?;

        if let Some(snapshot) = snapshot {
            self.distribute(snapshot).await;
        }

        Ok(())
    }

    fn fail(&self, id: RequestId, err: Error) {
        let settings = &self.settings;
        let now = OffsetDateTime::now_utc();

        let res = self.transition(
            id,
            &[
                RequestState::Validating,
                RequestState::Renewing,
                RequestState::Issuing,
            ],
            RequestState::Failed,
            |req| {
                req.next_attempt_at = match err.class() {
                    ErrorClass::Transient if req.retry_count < settings.max_retries => {
                        Some(now + settings.backoff.delay(req.retry_count))
                    }
                    ErrorClass::Transient => {
                        log::warn!("{id}: giving up after {} retries", req.retry_count);
                        None
                    }
                    ErrorClass::RateLimited(retry_after) => {
                        Some(now + retry_after.unwrap_or(settings.rate_limit_cooldown))
                    }
                    ErrorClass::Permanent => None,
                };

                match req.next_attempt_at {
                    Some(at) => log::warn!("{id}: {err}; next attempt at {at}"),
                    None => log::error!("{id}: {err}"),
                }

                req.record_failure(err, now);
            },
        );

        if res.is_err() {
            log::debug!("{id}: changed while failing, dropping the error");
        }
    }

    async fn distribute(&self, snapshot: DistributionSnapshot) {
        let report = self.distributor.distribute(&snapshot).await;
        let id = snapshot.request_id;

        if report.is_partial() {
            log::warn!(
                "{id}: {} distribution failed in {:?}",
                snapshot.secret_name,
                report.failed.keys().collect::<Vec<_>>()
            );
        }

        let mut book = self.book.lock();

        if let Some(req) = book.live.get_mut(&id).filter(|req| {
            req.certificate
                .as_ref()
                .is_some_and(|cert| cert.content_hash() == snapshot.bundle.content_hash)
        }) {
            req.distributed = report.secrets;
            req.failed_namespaces = report.failed.into_keys().collect();
        }
    }

    /// Re-distributes every request holding a certificate and without work in flight. A failed
    /// renewal keeps serving the previous certificate, so `Failed` requests are included.
    async fn redistribute(&self, issuer: &str) {
        let _guard = self.lock_distribution(issuer).await;

        let snapshots = {
            let book = self.book.lock();
            let workers = self.workers.lock();

            book.live
                .values()
                .filter(|req| {
                    req.issuer == issuer
                        && !book.stopping.contains(&req.id)
                        && !workers.get(&req.id).is_some_and(Worker::is_running)
                })
                .filter_map(snapshot)
                .collect::<Vec<_>>()
        };

        futures::future::join_all(snapshots.into_iter().map(|snapshot| self.distribute(snapshot)))
            .await;
    }

    async fn lock_distribution(&self, issuer: &str) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match self.distribution.get(issuer) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    /// Removes every recorded copy of the request's secret.
    async fn retract_copies(&self, id: RequestId) {
        let (secret_name, namespaces) = {
            let book = self.book.lock();
            let Some(req) = book.live.get(&id) else {
                return;
            };

            let namespaces = req
                .distributed
                .iter()
                .map(|copy| copy.namespace.clone())
                .chain(req.failed_namespaces.iter().cloned())
                .collect::<HashSet<_>>();

            (req.secret_name.clone(), namespaces)
        };

        let failed = self
            .distributor
            .retract(&secret_name, namespaces.iter().map(String::as_str))
            .await;

        if !failed.is_empty() {
            log::warn!(
                "{id}: {secret_name} may remain in {:?}",
                failed.keys().collect::<Vec<_>>()
            );
        }

        if let Some(req) = self.book.lock().live.get_mut(&id) {
            req.distributed.clear();
            req.failed_namespaces = failed.into_keys().collect();
        }
    }

    fn delete_archived(&self, book: &mut Book, id: RequestId) -> Result<()> {
        let req = book
            .archive
            .iter_mut()
            .rev()
            .find(|req| req.id == id)
            .ok_or_else(|| unknown_request(id))?;

        let from = req.transition(RequestState::Deleted)?;
        self.emit(req, from);

        Ok(())
    }

    async fn stop_worker(&self, id: RequestId) {
        let worker = self.workers.lock().remove(&id);

        if let Some(worker) = worker {
            worker.cancel.cancel();
            worker.done.cancelled().await;
        }
    }

    async fn stop_all(&self) {
        let workers = self.workers.lock().drain().collect::<Vec<_>>();

        for (_, worker) in &workers {
            worker.cancel.cancel();
        }

        futures::future::join_all(workers.iter().map(|(_, worker)| worker.done.cancelled())).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, time::Duration};

    use super::*;
    use crate::{
        acme::AcmeError,
        distribute::MemorySecretStore,
        test::{fast_settings, issuer, FakeAcme, MockDns},
    };

    use crate::request::RequestState::*;

    struct Harness {
        controller: Controller,
        acme: Arc<FakeAcme>,
        dns: Arc<MockDns>,
        store: Arc<MemorySecretStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(50, fast_settings())
        }

        fn with(requests_per_week: u32, settings: ControllerConfig) -> Self {
            let acme = FakeAcme::new();
            let dns = MockDns::new();
            acme.require_records_in(&dns);

            let mut issuers = IssuerRegistry::new();
            issuers
                .insert(issuer("staging", &acme, &dns, requests_per_week))
                .unwrap();

            let store = Arc::new(MemorySecretStore::new());
            let controller =
                Controller::new(settings, issuers, Arc::clone(&store) as Arc<dyn SecretStore>);

            Harness {
                controller,
                acme,
                dns,
                store,
            }
        }

        /// One scheduler pass, then waits for the work it started.
        async fn pass(&self, id: RequestId) -> CertificateRequest {
            self.controller.reconcile_issuer("staging").await.unwrap();
            self.controller.wait_idle(id).await.unwrap()
        }
    }

    fn spec(domains: &[&str], namespaces: &[&str]) -> CertificateSpec {
        CertificateSpec {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            issuer: "staging".to_owned(),
            namespaces: namespaces.iter().map(|ns| ns.to_string()).collect(),
            secret_name: "web-tls".to_owned(),
        }
    }

    fn transitions(
        rx: &mut broadcast::Receiver<TransitionEvent>,
    ) -> Vec<(RequestState, RequestState)> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| (event.from, event.to))
            .collect()
    }

    fn hash_in(store: &MemorySecretStore, ns: &str) -> Option<String> {
        store.get(ns, "web-tls").map(|bundle| bundle.content_hash)
    }

    #[tokio::test]
    async fn wildcard_certificate_reaches_both_namespaces() {
        let h = Harness::new();
        let mut events = h.controller.subscribe();

        let id = h
            .controller
            .submit(spec(&["*.example.com", "example.com"], &["team-a", "team-b"]))
            .unwrap();
        let req = h.pass(id).await;

        assert_eq!(req.state, Issued);
        assert!(req.last_validated_at.is_some());
        assert!(req.expires_at.is_some());
        assert!(req.failed_namespaces.is_empty());
        assert_eq!(req.distributed.len(), 2);

        let hash = req.certificate.as_ref().unwrap().content_hash();
        assert_eq!(hash_in(&h.store, "team-a"), Some(hash.clone()));
        assert_eq!(hash_in(&h.store, "team-b"), Some(hash));

        // one record per authorization, both removed
        assert_eq!(h.dns.creates(), 2);
        assert_eq!(h.dns.deletes(), 2);
        assert!(h.dns.records().is_empty());

        assert_eq!(
            transitions(&mut events),
            [(Pending, Validating), (Validating, Issuing), (Issuing, Issued)]
        );
    }

    #[tokio::test]
    async fn single_wildcard_uses_one_challenge() {
        let h = Harness::new();

        let id = h
            .controller
            .submit(spec(&["*.example.com"], &["production", "staging"]))
            .unwrap();
        let req = h.pass(id).await;

        assert_eq!(req.state, Issued);
        assert_eq!(h.acme.validations(), 1);
        assert_eq!(h.dns.creates(), 1);
        assert_eq!(h.dns.deletes(), 1);
        assert!(h.dns.records().is_empty());

        let hash = req.certificate.as_ref().unwrap().content_hash();
        assert_eq!(hash_in(&h.store, "production"), Some(hash.clone()));
        assert_eq!(hash_in(&h.store, "staging"), Some(hash));
    }

    #[tokio::test]
    async fn forbidden_dns_token_fails_without_retry() {
        let h = Harness::new();
        h.dns.forbid();
        let mut events = h.controller.subscribe();

        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        let req = h.pass(id).await;

        assert_eq!(req.state, Failed);
        assert_eq!(req.last_error.as_ref().unwrap().code(), "IssuerUnavailable");
        assert_eq!(req.retry_count, 0);
        assert_eq!(req.next_attempt_at, None);
        assert_eq!(req.history.len(), 1);
        assert_eq!(req.history[0].state, Validating);

        let failed = std::iter::from_fn(|| events.try_recv().ok())
            .find(|event| event.to == Failed)
            .unwrap();
        assert!(failed.error.unwrap().starts_with("IssuerUnavailable: "));

        let req = h.pass(id).await;
        assert_eq!(req.state, Failed);
        assert_eq!(h.dns.creates(), 1);
        assert_eq!(h.acme.orders(), 1);
    }

    #[tokio::test]
    async fn rate_limited_finalize_stays_issuing() {
        let h = Harness::new();
        for _ in 0..2 {
            h.acme.fail_finalize(AcmeError::RateLimited {
                detail: "too many new orders".to_owned(),
                retry_after: Some(Duration::from_millis(30)),
            });
        }
        let mut events = h.controller.subscribe();

        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        let req = h.pass(id).await;

        assert_eq!(req.state, Issued);
        assert!(req.history.is_empty());
        assert_eq!(h.acme.finalize_calls(), 3);
        assert!(!transitions(&mut events).iter().any(|(_, to)| *to == Failed));
    }

    #[tokio::test]
    async fn propagation_timeout_fails_and_removes_record() {
        let h = Harness::new();
        h.dns.hide_from_resolvers(true);

        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        let req = h.pass(id).await;

        assert_eq!(req.state, Failed);
        assert_eq!(req.last_error.as_ref().unwrap().code(), "DNSPropagationTimeout");
        assert!(req.next_attempt_at.is_some());
        assert!(h.dns.records().is_empty());
        assert_eq!(h.dns.deletes(), 1);
        assert_eq!(h.acme.validations(), 0);
        assert!(h.store.namespaces_with("web-tls").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_are_coalesced() {
        let h = Harness::new();

        let submissions = (0..16).map(|i| {
            let controller = h.controller.clone();
            let domains = if i % 2 == 0 {
                ["www.example.com", "example.com"]
            } else {
                ["Example.com.", "WWW.example.com"]
            };
            let ns = format!("team-{}", i % 4);

            tokio::spawn(async move { controller.submit(spec(&domains, &[ns.as_str()])) })
        });

        let ids = futures::future::join_all(submissions)
            .await
            .into_iter()
            .map(|res| res.unwrap().unwrap())
            .collect::<HashSet<_>>();

        assert_eq!(ids.len(), 1);
        assert_eq!(h.controller.list().len(), 1);

        let id = ids.into_iter().next().unwrap();
        let req = h.pass(id).await;
        assert_eq!(req.state, Issued);
        assert_eq!(req.namespaces.len(), 4);
        assert_eq!(h.acme.orders(), 1);
    }

    #[tokio::test]
    async fn renewal_replaces_distributed_content() {
        let h = Harness::new();
        let id = h
            .controller
            .submit(spec(&["*.example.com"], &["team-a", "team-b"]))
            .unwrap();
        let first = h.pass(id).await;
        let old_hash = hash_in(&h.store, "team-a").unwrap();

        let mut events = h.controller.subscribe();
        h.controller.trigger_renewal(id).unwrap();
        let second = h.pass(id).await;

        assert_eq!(second.id, id);
        assert_eq!(second.state, Issued);
        assert_eq!(second.domains, first.domains);
        assert!(!second.renewal_requested);

        let new_hash = second.certificate.as_ref().unwrap().content_hash();
        assert_ne!(new_hash, old_hash);
        assert_eq!(hash_in(&h.store, "team-a"), Some(new_hash.clone()));
        assert_eq!(hash_in(&h.store, "team-b"), Some(new_hash));
        assert_eq!(
            transitions(&mut events),
            [(Issued, Renewing), (Renewing, Issuing), (Issuing, Issued)]
        );
        assert_eq!(h.acme.orders(), 2);
    }

    #[tokio::test]
    async fn failed_renewal_keeps_serving_old_certificate() {
        let h = Harness::new();
        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        h.pass(id).await;
        let old_hash = hash_in(&h.store, "team-a").unwrap();

        h.dns.hide_from_resolvers(true);
        h.controller.trigger_renewal(id).unwrap();
        let req = h.pass(id).await;

        assert_eq!(req.state, Failed);
        assert_eq!(req.certificate.as_ref().unwrap().content_hash(), old_hash);
        assert_eq!(hash_in(&h.store, "team-a"), Some(old_hash));

        // the retry renews rather than starting over
        h.dns.hide_from_resolvers(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut events = h.controller.subscribe();
        let req = h.pass(id).await;

        assert_eq!(req.state, Issued);
        assert_eq!(req.retry_count, 0);
        assert_eq!(transitions(&mut events)[0], (Failed, Renewing));
    }

    #[tokio::test]
    async fn failed_renewal_still_heals_distribution() {
        let h = Harness::new();
        h.store.deny_namespace("team-b");

        let id = h
            .controller
            .submit(spec(&["example.com"], &["team-a", "team-b"]))
            .unwrap();
        let req = h.pass(id).await;
        assert_eq!(req.failed_namespaces, BTreeSet::from(["team-b".to_owned()]));

        // renewal fails for good
        h.dns.forbid();
        h.controller.trigger_renewal(id).unwrap();
        let req = h.pass(id).await;
        assert_eq!(req.state, Failed);
        assert_eq!(req.next_attempt_at, None);

        h.store.allow_namespace("team-b");
        h.controller
            .set_namespaces(id, &["team-b".to_owned(), "team-c".to_owned()])
            .unwrap();
        let req = h.pass(id).await;

        assert_eq!(req.state, Failed);
        assert!(req.failed_namespaces.is_empty());
        assert_eq!(req.distributed.len(), 2);
        assert_eq!(
            h.store.namespaces_with("web-tls"),
            BTreeSet::from(["team-b".to_owned(), "team-c".to_owned()])
        );
    }

    #[tokio::test]
    async fn expiring_certificates_are_renewed() {
        let h = Harness::new();
        h.acme.set_validity(Duration::from_secs(24 * 60 * 60));

        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        let first = h.pass(id).await;
        assert!(first
            .renewal_due(OffsetDateTime::now_utc(), h.controller.settings().renew_before));

        let second = h.pass(id).await;
        assert_eq!(second.state, Issued);
        assert_eq!(h.acme.orders(), 2);
        assert_ne!(second.certificate, first.certificate);
    }

    #[tokio::test]
    async fn delete_during_validation_cleans_up() {
        let h = Harness::new();
        h.dns.hide_from_resolvers(true);
        let mut events = h.controller.subscribe();

        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        h.controller.reconcile_issuer("staging").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.dns.records().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        h.controller.delete(id).await.unwrap();

        let req = h.controller.get(id).unwrap();
        assert_eq!(req.state, Deleted);
        assert!(h.dns.records().is_empty());
        assert_eq!(h.acme.finalize_calls(), 0);
        assert_eq!(
            transitions(&mut events),
            [(Pending, Validating), (Validating, Deleted)]
        );

        // a later submission starts from scratch
        let again = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        assert_ne!(again, id);
    }

    #[tokio::test]
    async fn delete_retracts_every_copy() {
        let h = Harness::new();
        let id = h
            .controller
            .submit(spec(&["example.com"], &["team-a", "team-b"]))
            .unwrap();
        h.pass(id).await;
        assert_eq!(h.store.namespaces_with("web-tls").len(), 2);

        h.controller.delete(id).await.unwrap();

        assert!(h.store.namespaces_with("web-tls").is_empty());
        assert_eq!(h.controller.get(id).unwrap().state, Deleted);
        assert!(h.controller.delete(id).await.is_err());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_automatically() {
        let h = Harness::new();
        h.acme.reject_next_validations(1);

        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        let req = h.pass(id).await;
        assert_eq!(req.state, Failed);
        assert_eq!(req.last_error.as_ref().unwrap().code(), "ACMEValidationRejected");
        assert!(req.next_attempt_at.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let req = h.pass(id).await;

        assert_eq!(req.state, Issued);
        assert_eq!(req.retry_count, 0);
        assert_eq!(req.last_error, None);
        assert_eq!(req.history.len(), 1);
        assert!(h.dns.records().is_empty());
    }

    #[tokio::test]
    async fn retries_stop_at_the_limit() {
        let settings = ControllerConfig {
            max_retries: 1,
            ..fast_settings()
        };
        let h = Harness::with(50, settings);
        h.acme.reject_next_validations(10);

        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        let req = h.pass(id).await;
        assert_eq!(req.retry_count, 0);
        assert!(req.next_attempt_at.is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let req = h.pass(id).await;
        assert_eq!(req.state, Failed);
        assert_eq!(req.retry_count, 1);
        assert_eq!(req.next_attempt_at, None);

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.pass(id).await;
        assert_eq!(h.acme.orders(), 2);
    }

    #[tokio::test]
    async fn operator_retry_resets_failed_request() {
        let h = Harness::new();
        h.dns.forbid();

        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        assert_eq!(h.pass(id).await.state, Failed);
        assert!(h.controller.trigger_renewal(id).is_err());

        h.dns.permit();
        h.controller.retry(id).unwrap();
        let req = h.controller.get(id).unwrap();
        assert_eq!(req.state, Pending);
        assert!(h.controller.retry(id).is_err());

        assert_eq!(h.pass(id).await.state, Issued);
    }

    #[tokio::test]
    async fn token_bucket_limits_new_orders() {
        let h = Harness::with(1, fast_settings());

        let first = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        let second = h
            .controller
            .submit(spec(&["www.example.com"], &["team-a"]))
            .unwrap();

        assert_eq!(h.pass(first).await.state, Issued);
        assert_eq!(h.controller.get(second).unwrap().state, Pending);

        h.controller.reconcile_all().await.unwrap();
        assert_eq!(h.controller.get(second).unwrap().state, Pending);
        assert_eq!(h.acme.orders(), 1);
    }

    #[tokio::test]
    async fn partial_distribution_heals_on_next_pass() {
        let h = Harness::new();
        h.store.deny_namespace("team-b");

        let id = h
            .controller
            .submit(spec(&["example.com"], &["team-a", "team-b"]))
            .unwrap();
        let req = h.pass(id).await;

        assert_eq!(req.state, Issued);
        assert_eq!(req.failed_namespaces, BTreeSet::from(["team-b".to_owned()]));
        assert_eq!(req.distributed.len(), 1);

        h.store.allow_namespace("team-b");
        let req = h.pass(id).await;

        assert!(req.failed_namespaces.is_empty());
        assert_eq!(req.distributed.len(), 2);
        // team-a was already up to date
        assert_eq!(h.store.write_count(), 2);
    }

    #[tokio::test]
    async fn namespace_changes_are_applied() {
        let h = Harness::new();
        let id = h
            .controller
            .submit(spec(&["example.com"], &["team-a", "team-b"]))
            .unwrap();
        h.pass(id).await;

        h.controller
            .set_namespaces(id, &["team-b".to_owned(), "team-c".to_owned()])
            .unwrap();
        let req = h.pass(id).await;

        assert_eq!(
            h.store.namespaces_with("web-tls"),
            BTreeSet::from(["team-b".to_owned(), "team-c".to_owned()])
        );
        assert_eq!(req.distributed.len(), 2);
        assert!(h.controller.set_namespaces(id, &[]).is_err());
    }

    #[tokio::test]
    async fn revoke_removes_copies_and_archives() {
        let h = Harness::new();
        let id = h
            .controller
            .submit(spec(&["example.com"], &["team-a", "team-b"]))
            .unwrap();
        h.pass(id).await;

        h.controller.revoke(id).await.unwrap();

        let req = h.controller.get(id).unwrap();
        assert_eq!(req.state, Revoked);
        assert!(req.distributed.is_empty());
        assert_eq!(h.acme.revocations(), 1);
        assert!(h.store.namespaces_with("web-tls").is_empty());
        assert!(h.controller.revoke(id).await.is_err());

        // revoked requests can still be deleted, and no longer block new submissions
        h.controller.delete(id).await.unwrap();
        assert_eq!(h.controller.get(id).unwrap().state, Deleted);
        let again = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        assert_ne!(again, id);
        assert_eq!(h.controller.list().len(), 2);
    }

    #[test]
    fn archive_keeps_the_newest_records() {
        let mut book = Book {
            archive_limit: 2,
            ..Book::default()
        };

        for n in 1..=3 {
            let (domains, namespaces) = spec(&["example.com"], &["team-a"]).validate().unwrap();
            let req = CertificateRequest::new(
                RequestId(n),
                &spec(&["example.com"], &["team-a"]),
                domains,
                namespaces,
                OffsetDateTime::now_utc(),
            );
            book.archive(req);
        }

        let ids = book.archive.iter().map(|req| req.id).collect::<Vec<_>>();
        assert_eq!(ids, [RequestId(2), RequestId(3)]);
    }

    #[tokio::test]
    async fn unknown_issuers_are_refused() {
        let h = Harness::new();
        let mut bad = spec(&["example.com"], &["team-a"]);
        bad.issuer = "production".to_owned();

        assert!(matches!(h.controller.submit(bad), Err(Error::InvalidRequest(_))));
        assert!(h.controller.reconcile_issuer("production").await.is_err());
        assert!(h.controller.list().is_empty());
    }

    #[tokio::test]
    async fn run_issues_until_shutdown() {
        let h = Harness::new();
        let mut events = h.controller.subscribe();
        let shutdown = CancellationToken::new();

        let id = h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        let task = tokio::spawn({
            let controller = h.controller.clone();
            let shutdown = shutdown.clone();
            async move { controller.run(shutdown).await }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.request_id == id && event.to == Issued {
                    break;
                }
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        task.await.unwrap();

        let req = h.controller.wait_idle(id).await.unwrap();
        assert_eq!(req.state, Issued);
        assert!(hash_in(&h.store, "team-a").is_some());
    }

    #[tokio::test]
    async fn shutdown_cancels_work_and_cleans_up() {
        let h = Harness::new();
        h.dns.hide_from_resolvers(true);
        let shutdown = CancellationToken::new();

        h.controller.submit(spec(&["example.com"], &["team-a"])).unwrap();
        let task = tokio::spawn({
            let controller = h.controller.clone();
            let shutdown = shutdown.clone();
            async move { controller.run(shutdown).await }
        });

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.dns.records().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        task.await.unwrap();

        assert!(h.dns.records().is_empty());
        assert_eq!(h.acme.validations(), 0);
    }
}
