//! Worker lifecycle: install, wait, activate.
//!
//! ```text
//! WorkerRegistration (scope)
//!     ├── installing ── install() ──→ waiting
//!     ├── waiting ───── activate() ─→ active
//!     └── active ────── superseded ─→ Redundant
//! ```
//!
//! Each phase registers its sub-operations on an [`ExtendableEvent`] and is
//! only finished once [`ExtendableEvent::settle`] has joined all of them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{join_all, BoxFuture};
use hashbrown::HashMap;
use indaia_net::{Fetcher, Request, RequestMode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::WorkerConfig;
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Script evaluated, install not started.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed and waiting to take over.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced or failed to install.
    Redundant,
}

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub script_url: Url,
    pub state: ServiceWorkerState,
    /// Set by `skipWaiting()`; the worker activates as soon as it is installed.
    pub skip_waiting: bool,
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(script_url: Url) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(worker = self.id.raw(), from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

// ==================== Registration ====================

/// The installing, waiting and active workers of one scope.
#[derive(Debug)]
pub struct WorkerRegistration {
    pub scope: Url,
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    pub active: Option<ServiceWorker>,
    /// Active worker being replaced, kept until the activation settles.
    superseded: Option<ServiceWorker>,
}

impl WorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            superseded: None,
        }
    }

    /// Start installing a new worker generation.
    pub fn begin_install(&mut self, script_url: Url) -> ServiceWorkerId {
        let mut worker = ServiceWorker::new(script_url);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        if let Some(mut abandoned) = self.installing.replace(worker) {
            abandoned.set_state(ServiceWorkerState::Redundant);
        }
        id
    }

    /// Move the installing worker to waiting. A previous waiting worker is
    /// superseded.
    pub fn install_complete(&mut self) -> Result<&ServiceWorker, ServiceWorkerError> {
        let mut worker = self
            .installing
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no installing worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut old) = self.waiting.take() {
            old.set_state(ServiceWorkerState::Redundant);
        }
        Ok(&*self.waiting.insert(worker))
    }

    /// Discard the installing worker.
    pub fn install_failed(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.set_state(ServiceWorkerState::Redundant);
        }
    }

    /// Flag the newest not-yet-active worker to skip waiting.
    ///
    /// Returns `true` if a worker is already waiting and can activate now.
    pub fn skip_waiting(&mut self) -> bool {
        if let Some(worker) = self.installing.as_mut() {
            worker.skip_waiting = true;
        }
        match self.waiting.as_mut() {
            Some(worker) => {
                worker.skip_waiting = true;
                true
            }
            None => false,
        }
    }

    /// Whether the waiting worker may activate without waiting for pages to close.
    pub fn should_activate(&self) -> bool {
        match &self.waiting {
            Some(worker) => worker.skip_waiting || self.active.is_none(),
            None => false,
        }
    }

    /// Promote the waiting worker to the active slot, in `Activating` state.
    pub fn begin_activation(&mut self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        if self.superseded.is_some() {
            return Err(ServiceWorkerError::StateError(
                "activation already in progress".to_string(),
            ));
        }
        let mut worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Activating);
        let id = worker.id;

        self.superseded = self.active.replace(worker);
        Ok(id)
    }

    /// Finish activation; the replaced worker becomes redundant.
    pub fn activation_complete(&mut self) {
        if let Some(worker) = self.active.as_mut() {
            worker.set_state(ServiceWorkerState::Activated);
        }
        if let Some(mut old) = self.superseded.take() {
            old.set_state(ServiceWorkerState::Redundant);
        }
    }

    /// Undo [`begin_activation`](Self::begin_activation): the worker goes back
    /// to waiting and the replaced worker is active again.
    pub fn activation_failed(&mut self) {
        let Some(mut worker) = self.active.take() else {
            return;
        };
        if worker.state != ServiceWorkerState::Activating {
            self.active = Some(worker);
            return;
        }

        self.active = self.superseded.take();
        if self.waiting.is_some() {
            // A newer install finished meanwhile and supersedes this one.
            worker.set_state(ServiceWorkerState::Redundant);
        } else {
            worker.set_state(ServiceWorkerState::Installed);
            self.waiting = Some(worker);
        }
    }

    /// Unregister: every worker becomes redundant.
    pub fn unregister(&mut self) {
        for mut worker in [
            self.installing.take(),
            self.waiting.take(),
            self.active.take(),
            self.superseded.take(),
        ]
            .into_iter()
            .flatten()
        {
            worker.set_state(ServiceWorkerState::Redundant);
        }
    }
}

// ==================== Clients ====================

/// A controlled (or controllable) page.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub controller: Option<ServiceWorkerId>,
}

/// Pages known to the worker.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
    next_id: u64,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an open page. Returns its client id.
    pub fn add(&mut self, url: Url) -> String {
        self.next_id += 1;
        let id = format!("client-{}", self.next_id);
        self.clients.insert(
            id.clone(),
            Client {
                id: id.clone(),
                url,
                controller: None,
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Take control of every page within `scope`. Returns how many changed controller.
    pub fn claim(&mut self, scope: &Url, worker: ServiceWorkerId) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.url.as_str().starts_with(scope.as_str()) && client.controller != Some(worker) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        claimed
    }

    /// Number of pages controlled by `worker`.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }
}

// ==================== Extendable Event ====================

/// Join barrier for a lifecycle phase.
///
/// Sub-operations registered with [`wait_until`](Self::wait_until) all run to
/// completion in [`settle`](Self::settle); one failing does not cancel the
/// others.
pub struct ExtendableEvent<'a> {
    name: &'static str,
    pending: Vec<BoxFuture<'a, Result<(), ServiceWorkerError>>>,
}

impl<'a> ExtendableEvent<'a> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Vec::new(),
        }
    }

    /// Keep the event alive until `operation` completes.
    pub fn wait_until<F>(&mut self, operation: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'a,
    {
        self.pending.push(Box::pin(operation));
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Await every registered operation. Returns the first error, if any.
    pub async fn settle(self) -> Result<(), ServiceWorkerError> {
        let count = self.pending.len();
        let results = join_all(self.pending).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        debug!(event = self.name, count, failures, "Extendable event settled");
        results.into_iter().collect()
    }
}

// ==================== Lifecycle Manager ====================

/// Outcome of the install phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Whether the all-or-nothing bulk pre-cache succeeded.
    pub bulk: bool,
    /// Manifest entries stored in the static generation.
    pub cached: usize,
    /// Manifest entries that could not be fetched.
    pub failed: Vec<String>,
    /// Whether the installed worker asked to skip waiting.
    pub skip_waiting: bool,
}

/// Outcome of the activate phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    /// Generations deleted as superseded.
    pub deleted: Vec<String>,
    /// Pages claimed by the new worker.
    pub claimed: usize,
}

/// Runs install and activate for one registration.
pub struct LifecycleManager {
    config: Arc<WorkerConfig>,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    registration: RwLock<WorkerRegistration>,
    clients: RwLock<Clients>,
}

impl LifecycleManager {
    pub fn new(config: Arc<WorkerConfig>, caches: CacheStorage, fetcher: Arc<dyn Fetcher>) -> Self {
        let registration = WorkerRegistration::new(config.origin.clone());
        Self {
            config,
            caches,
            fetcher,
            registration: RwLock::new(registration),
            clients: RwLock::new(Clients::new()),
        }
    }

    pub fn registration(&self) -> &RwLock<WorkerRegistration> {
        &self.registration
    }

    pub fn clients(&self) -> &RwLock<Clients> {
        &self.clients
    }

    /// Install a new worker generation.
    ///
    /// Pre-caches the essential manifest in bulk; if the bulk operation
    /// fails, every entry is retried on its own and individual failures are
    /// only logged. Skip-waiting is signalled concurrently.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        info!(version = %self.config.version, "Installing worker");

        let script_url = self.config.script_url()?;
        let essential = self.config.essential_urls()?;
        self.registration.write().await.begin_install(script_url);
        self.caches.open(&self.config.dynamic_cache_name()).await;

        let mut report = InstallReport::default();
        let mut event = ExtendableEvent::new("install");

        let report_ref = &mut report;
        event.wait_until(async move {
            self.precache(essential, report_ref).await;
            Ok(())
        });
        event.wait_until(async {
            self.skip_waiting().await;
            Ok(())
        });

        if let Err(e) = event.settle().await {
            self.registration.write().await.install_failed();
            return Err(e);
        }

        let mut registration = self.registration.write().await;
        report.skip_waiting = registration.install_complete()?.skip_waiting;
        info!(
            cached = report.cached,
            failed = report.failed.len(),
            bulk = report.bulk,
            "Worker installed"
        );
        Ok(report)
    }

    async fn precache(&self, essential: Vec<Url>, report: &mut InstallReport) {
        let cache = self.caches.open(&self.config.static_cache_name()).await;
        let requests: Vec<Request> = essential
            .iter()
            .map(|url| Request::get(url.clone()).mode(RequestMode::Cors))
            .collect();

        debug!(count = requests.len(), cache = cache.name(), "Pre-caching essential resources");
        match cache.add_all(self.fetcher.as_ref(), requests.clone()).await {
            Ok(()) => {
                report.bulk = true;
                report.cached = requests.len();
            }
            Err(e) => {
                warn!(error = %e, "Bulk pre-cache failed, caching resources individually");

                let fetcher = self.fetcher.as_ref();
                let attempts = requests.into_iter().map(|request| {
                    let cache = cache.clone();
                    async move {
                        let url = request.url.to_string();
                        cache.add(fetcher, request).await.map_err(|e| (url, e))
                    }
                });

                for result in join_all(attempts).await {
                    match result {
                        Ok(()) => report.cached += 1,
                        Err((url, e)) => {
                            warn!(url = %url, error = %e, "Resource could not be cached");
                            report.failed.push(url);
                        }
                    }
                }
            }
        }
    }

    /// `skipWaiting()`: let the newest worker activate without waiting for
    /// controlled pages to close. Returns `true` if a worker is waiting now.
    pub async fn skip_waiting(&self) -> bool {
        self.registration.write().await.skip_waiting()
    }

    /// Whether the waiting worker should be activated right away.
    pub async fn should_activate(&self) -> bool {
        self.registration.read().await.should_activate()
    }

    /// Activate the waiting worker.
    ///
    /// Deletes every generation except the two current ones and claims all
    /// open pages. Cleanup failures propagate.
    pub async fn activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        info!(version = %self.config.version, "Activating worker");

        let worker = self.registration.write().await.begin_activation()?;
        let scope = self.registration.read().await.scope.clone();

        let mut deleted = Vec::new();
        let mut claimed = 0;
        let mut event = ExtendableEvent::new("activate");

        let deleted_ref = &mut deleted;
        event.wait_until(async move {
            *deleted_ref = self.delete_stale_generations().await?;
            Ok(())
        });

        let claimed_ref = &mut claimed;
        event.wait_until(async move {
            *claimed_ref = self.clients.write().await.claim(&scope, worker);
            Ok(())
        });

        if let Err(e) = event.settle().await {
            warn!(error = %e, "Activation failed, worker returns to waiting");
            self.registration.write().await.activation_failed();
            return Err(e);
        }

        self.registration.write().await.activation_complete();
        info!(deleted = deleted.len(), claimed, "Worker activated");
        Ok(ActivateReport { deleted, claimed })
    }

    async fn delete_stale_generations(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let current = self.config.current_cache_names();
        let stale: Vec<String> = self
            .caches
            .keys()
            .await
            .into_iter()
            .filter(|name| !current.contains(name))
            .collect();

        let deletions = stale.iter().map(|name| async move {
            info!(cache = %name, "Deleting stale cache generation");
            if self.caches.delete(name).await {
                Ok(name.clone())
            } else {
                Err(ServiceWorkerError::NotFound(name.clone()))
            }
        });

        join_all(deletions).await.into_iter().collect()
    }
}
