//! Worker global scope: event dispatch.

use std::sync::Arc;

use indaia_common::worker_span;
use indaia_net::{Fetcher, Request};
use tracing::{debug, info, warn, Instrument, Span};

use crate::cache::CacheStorage;
use crate::config::WorkerConfig;
use crate::control::{
    BackgroundSync, CacheStatus, ClientMessage, LoggingSync, MessageEvent, MessageOutcome,
    SyncEvent, BACKGROUND_SYNC_TAG,
};
use crate::lifecycle::{ActivateReport, InstallReport, LifecycleManager};
use crate::router::{FetchOutcome, Router};
use crate::ServiceWorkerError;

/// Platform events delivered to the worker.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(MessageEvent),
    Sync(SyncEvent),
}

/// Event kind, used for logging and handler lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
    Sync,
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Message(_) => EventKind::Message,
            WorkerEvent::Sync(_) => EventKind::Sync,
        }
    }
}

/// Result of dispatching one event.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(Result<InstallReport, ServiceWorkerError>),
    Activated(Result<ActivateReport, ServiceWorkerError>),
    Fetch(FetchOutcome),
    Message(MessageOutcome),
    /// `false` when the sync tag is not one this worker handles.
    Synced(Result<bool, ServiceWorkerError>),
}

/// The offline worker for one page.
pub struct OfflineWorker {
    config: Arc<WorkerConfig>,
    caches: CacheStorage,
    lifecycle: LifecycleManager,
    router: Router,
    sync: Arc<dyn BackgroundSync>,
    span: Span,
}

impl OfflineWorker {
    /// Create a worker with a fresh, unbounded cache storage.
    pub fn new(config: WorkerConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self, ServiceWorkerError> {
        Self::with_storage(config, fetcher, CacheStorage::new())
    }

    /// Create a worker over an existing cache storage (e.g. one left by a
    /// previous worker version).
    pub fn with_storage(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        caches: CacheStorage,
    ) -> Result<Self, ServiceWorkerError> {
        if let Err(e) = config.validate() {
            warn!(category = e.category(), error = %e, "Rejected worker config");
            return Err(e.into());
        }
        let config = Arc::new(config);
        let span = worker_span(&config.app_name, &config.version);

        let router = Router::new(Arc::clone(&config), caches.clone(), Arc::clone(&fetcher))?;
        let lifecycle = LifecycleManager::new(Arc::clone(&config), caches.clone(), fetcher);

        span.in_scope(|| {
            info!(
                static_cache = %config.static_cache_name(),
                dynamic_cache = %config.dynamic_cache_name(),
                "Worker loaded"
            )
        });

        Ok(Self {
            config,
            caches,
            lifecycle,
            router,
            sync: Arc::new(LoggingSync),
            span,
        })
    }

    /// Replace the background-sync hook.
    pub fn with_background_sync(mut self, hook: Arc<dyn BackgroundSync>) -> Self {
        self.sync = hook;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Deliver one event and wait until its handling is complete.
    pub async fn dispatch(&self, event: WorkerEvent) -> EventOutcome {
        self.handle(event).instrument(self.span.clone()).await
    }

    async fn handle(&self, event: WorkerEvent) -> EventOutcome {
        debug!(kind = ?event.kind(), "Dispatching event");
        match event {
            WorkerEvent::Install => EventOutcome::Installed(self.lifecycle.install().await),
            WorkerEvent::Activate => EventOutcome::Activated(self.lifecycle.activate().await),
            WorkerEvent::Fetch(request) => EventOutcome::Fetch(self.router.handle_fetch(&request).await),
            WorkerEvent::Message(message) => EventOutcome::Message(self.on_message(message).await),
            WorkerEvent::Sync(sync) => EventOutcome::Synced(self.on_sync(sync).await),
        }
    }

    /// Run install and, when the new worker may take over right away,
    /// activate. This is what the host does on registration or update.
    pub async fn start(&self) -> Result<(InstallReport, Option<ActivateReport>), ServiceWorkerError> {
        self.install_and_activate()
            .instrument(self.span.clone())
            .await
    }

    async fn install_and_activate(
        &self,
    ) -> Result<(InstallReport, Option<ActivateReport>), ServiceWorkerError> {
        let installed = self.lifecycle.install().await?;
        let activated = if self.lifecycle.should_activate().await {
            Some(self.lifecycle.activate().await?)
        } else {
            None
        };
        Ok((installed, activated))
    }

    /// Convenience for `dispatch(WorkerEvent::Fetch(..))`.
    pub async fn fetch(&self, request: Request) -> FetchOutcome {
        self.router
            .handle_fetch(&request)
            .instrument(self.span.clone())
            .await
    }

    async fn on_message(&self, event: MessageEvent) -> MessageOutcome {
        match ClientMessage::parse(&event.data) {
            Some(ClientMessage::SkipWaiting) => {
                let activated = if self.lifecycle.skip_waiting().await {
                    match self.lifecycle.activate().await {
                        Ok(_) => true,
                        Err(e) => {
                            warn!(error = %e, "Skip-waiting activation failed");
                            false
                        }
                    }
                } else {
                    false
                };
                MessageOutcome::SkipWaiting { activated }
            }
            Some(ClientMessage::GetCacheStatus) => {
                let status = CacheStatus::collect(&self.caches, &self.config).await;
                match event.ports.first() {
                    Some(port) => match serde_json::to_value(&status) {
                        Ok(reply) => {
                            if let Err(e) = port.post_message(reply) {
                                debug!(error = %e, "Cache status reply not delivered");
                            }
                        }
                        Err(e) => warn!(error = %e, "Cache status not serializable"),
                    },
                    None => debug!("GET_CACHE_STATUS without reply port"),
                }
                MessageOutcome::CacheStatus(status)
            }
            None => MessageOutcome::Ignored,
        }
    }

    async fn on_sync(&self, event: SyncEvent) -> Result<bool, ServiceWorkerError> {
        if event.tag != BACKGROUND_SYNC_TAG {
            debug!(tag = %event.tag, "Ignoring sync tag");
            return Ok(false);
        }
        self.sync.sync(&event).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indaia_net::MockFetcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn online_worker() -> (OfflineWorker, Arc<MockFetcher>) {
        let config = WorkerConfig::default();
        let fetcher = Arc::new(MockFetcher::new());
        for url in config.essential_urls().unwrap() {
            fetcher.respond_ok(&url, url.to_string());
        }
        let worker = OfflineWorker::new(config, fetcher.clone()).unwrap();
        (worker, fetcher)
    }

    #[derive(Default)]
    struct CountingSync(AtomicUsize);

    #[async_trait::async_trait]
    impl BackgroundSync for CountingSync {
        async fn sync(&self, _event: &SyncEvent) -> Result<(), ServiceWorkerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(WorkerEvent::Install.kind(), EventKind::Install);
        assert_eq!(
            WorkerEvent::Sync(SyncEvent::new("x")).kind(),
            EventKind::Sync
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = WorkerConfig {
            app_name: String::new(),
            ..Default::default()
        };
        let result = OfflineWorker::new(config, Arc::new(MockFetcher::new()));
        assert!(matches!(result, Err(ServiceWorkerError::Config(_))));
    }

    #[test]
    fn test_repeated_essential_entry_is_rejected() {
        let config = WorkerConfig {
            essential: vec!["/index.html".to_string(), "/index.html".to_string()],
            ..Default::default()
        };
        let result = OfflineWorker::new(config, Arc::new(MockFetcher::new()));
        assert!(matches!(
            result,
            Err(ServiceWorkerError::Config(indaia_common::IndaiaError::Manifest { .. }))
        ));
    }

    #[tokio::test]
    async fn test_start_activates_first_worker() {
        let (worker, _) = online_worker();
        let (installed, activated) = worker.start().await.unwrap();
        assert!(installed.bulk);
        assert!(activated.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_install_and_activate() {
        let (worker, _) = online_worker();
        assert!(matches!(
            worker.dispatch(WorkerEvent::Install).await,
            EventOutcome::Installed(Ok(_))
        ));
        assert!(matches!(
            worker.dispatch(WorkerEvent::Activate).await,
            EventOutcome::Activated(Ok(_))
        ));
        // Nothing left waiting.
        assert!(matches!(
            worker.dispatch(WorkerEvent::Activate).await,
            EventOutcome::Activated(Err(ServiceWorkerError::StateError(_)))
        ));
    }

    #[tokio::test]
    async fn test_skip_waiting_message_activates_waiting_worker() {
        let (worker, _) = online_worker();
        worker.start().await.unwrap();

        // An update installs but stays waiting until asked to skip.
        worker.dispatch(WorkerEvent::Install).await;
        {
            let mut registration = worker.lifecycle().registration().write().await;
            if let Some(waiting) = registration.waiting.as_mut() {
                waiting.skip_waiting = false;
            }
        }
        assert!(!worker.lifecycle().should_activate().await);

        let outcome = worker
            .dispatch(WorkerEvent::Message(MessageEvent::new(
                serde_json::json!({"type": "SKIP_WAITING"}),
            )))
            .await;
        assert!(matches!(
            outcome,
            EventOutcome::Message(MessageOutcome::SkipWaiting { activated: true })
        ));
        assert!(worker.lifecycle().registration().read().await.waiting.is_none());
    }

    #[tokio::test]
    async fn test_skip_waiting_with_nothing_waiting() {
        let (worker, _) = online_worker();
        let outcome = worker
            .dispatch(WorkerEvent::Message(MessageEvent::new(
                serde_json::json!({"type": "SKIP_WAITING"}),
            )))
            .await;
        assert!(matches!(
            outcome,
            EventOutcome::Message(MessageOutcome::SkipWaiting { activated: false })
        ));
    }

    #[tokio::test]
    async fn test_unknown_message_ignored() {
        let (worker, _) = online_worker();
        let outcome = worker
            .dispatch(WorkerEvent::Message(MessageEvent::new(
                serde_json::json!({"type": "PING"}),
            )))
            .await;
        assert!(matches!(outcome, EventOutcome::Message(MessageOutcome::Ignored)));
    }

    #[tokio::test]
    async fn test_sync_routes_only_background_tag() {
        let (worker, _) = online_worker();
        let hook = Arc::new(CountingSync::default());
        let worker = worker.with_background_sync(hook.clone());

        let outcome = worker
            .dispatch(WorkerEvent::Sync(SyncEvent::new(BACKGROUND_SYNC_TAG)))
            .await;
        assert!(matches!(outcome, EventOutcome::Synced(Ok(true))));

        let outcome = worker
            .dispatch(WorkerEvent::Sync(SyncEvent::new("periodic")))
            .await;
        assert!(matches!(outcome, EventOutcome::Synced(Ok(false))));
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }
}
