//! Container discovery and worker lifecycle management.
//!
//! The loop keeps the registry in sync with the runtime's container set:
//! a full reconciliation on start and after every event-feed gap, then
//! incremental updates from lifecycle events. The subscription is opened
//! before reconciling so no event can fall between enumeration and the
//! first read. Transient runtime errors are retried with backoff; only
//! the shutdown signal ends the loop.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;

use crate::config::Settings;
use crate::container::ContainerID;
use crate::docker::{self, ContainerEvent, ContainerRuntime, EventAction};
use crate::filter::ExclusionFilter;
use crate::forward::ForwarderHandle;
use crate::policy::BackoffPolicy;
use crate::registry::StreamRegistry;
use crate::worker::{StreamWorker, WorkerConfig};

pub struct DiscoveryLoop {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<StreamRegistry>,
    forwarder: ForwarderHandle,
    filter: ExclusionFilter,
    include_stopped: bool,
    worker_config: WorkerConfig,
    backoff: BackoffPolicy,
}

impl DiscoveryLoop {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<StreamRegistry>,
        forwarder: ForwarderHandle,
        settings: &Settings,
    ) -> Self {
        Self {
            runtime,
            registry,
            forwarder,
            filter: ExclusionFilter::from_settings(settings),
            include_stopped: settings.include_stopped,
            worker_config: WorkerConfig::from(settings),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Runs until the shutdown signal fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;

        'supervise: loop {
            let events = tokio::select! {
                _ = shutdown_signal(&mut shutdown) => break,
                subscribed = self.runtime.events() => subscribed,
            };
            let mut events = match events {
                Ok(events) => events,
                Err(err) => {
                    failures += 1;
                    log::error!("failed to subscribe to runtime events: {err}");
                    if !self.retry_pause(&mut shutdown, failures).await {
                        break;
                    }
                    continue;
                }
            };

            // Subscription is live; bring the registry in sync. An event
            // feed resumed after a gap cannot be trusted on its own.
            if let Err(err) = self.reconcile().await {
                failures += 1;
                log::error!("container reconciliation failed: {err}");
                if !self.retry_pause(&mut shutdown, failures).await {
                    break;
                }
                continue;
            }
            failures = 0;

            loop {
                tokio::select! {
                    _ = shutdown_signal(&mut shutdown) => break 'supervise,
                    event = events.next() => match event {
                        None => {
                            log::warn!("runtime event feed ended, resubscribing");
                            break;
                        }
                        Some(Err(err)) => {
                            log::warn!("runtime event feed failed, resubscribing: {err}");
                            break;
                        }
                        Some(Ok(event)) => self.handle_event(event).await,
                    },
                }
            }
        }

        log::debug!("discovery loop stopped");
    }

    /// Full re-sync of the registry against the runtime's container set.
    async fn reconcile(&self) -> docker::Result<()> {
        let containers = self.runtime.list_containers(self.include_stopped).await?;
        log::info!("reconciling against {} containers", containers.len());

        let mut desired: HashSet<ContainerID> = HashSet::with_capacity(containers.len());
        for container in containers {
            if !self.filter.admit(&container) {
                continue;
            }
            desired.insert(container.id().clone());
            self.start_worker(container.id().clone()).await;
        }

        // Workers whose container vanished during an event gap.
        for id in self.registry.ids() {
            if !desired.contains(&id) {
                log::info!("container `{}` gone, stopping its worker", id.short());
                self.registry.signal_stop(id.as_ref());
            }
        }

        Ok(())
    }

    async fn handle_event(&self, event: ContainerEvent) {
        log::info!(
            "container event: {} ({}) - {:?}",
            event.name,
            event.id.short(),
            event.action
        );
        match event.action {
            EventAction::Start => self.start_worker(event.id).await,
            EventAction::Stop | EventAction::Die => {
                self.registry.signal_stop(event.id.as_ref());
            }
            EventAction::Destroy => self.registry.evict(event.id.as_ref()),
        }
    }

    /// Starts a worker for the container unless one is already registered.
    ///
    /// The worker gets a fresh inspect snapshot (canonical name, labels,
    /// TTY mode); admission is decided on that snapshot. Inspect failures
    /// are logged and left to the next reconciliation.
    async fn start_worker(&self, id: ContainerID) {
        if self.registry.contains(id.as_ref()) {
            return;
        }
        let record = match self.runtime.inspect(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                log::debug!("container `{}` vanished before its worker started", id.short());
                return;
            }
            Err(err) => {
                log::warn!("failed to inspect container `{}`: {}", id.short(), err);
                return;
            }
        };
        if !self.filter.admit(&record) {
            return;
        }
        StreamWorker::spawn(
            record,
            Arc::clone(&self.runtime),
            self.forwarder.clone(),
            Arc::clone(&self.registry),
            self.worker_config,
        );
    }

    /// Backoff pause between retries; `false` when shutdown fired.
    async fn retry_pause(&self, shutdown: &mut watch::Receiver<bool>, failures: u32) -> bool {
        let delay = self.backoff.delay(failures.saturating_sub(1));
        tokio::select! {
            _ = shutdown_signal(shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Resolves once the engine-wide shutdown flag is raised (or its sender
/// is gone, which only happens when the engine is tearing down anyway).
pub(crate) async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerRecord, ContainerStatus};
    use crate::docker::{ByteStream, EventStream, LogStart, LogStream};
    use crate::enrich::LogRecord;
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct MockRuntime {
        containers: Mutex<Vec<ContainerRecord>>,
        events: Mutex<Vec<ContainerEvent>>,
    }

    impl MockRuntime {
        fn new(containers: Vec<ContainerRecord>, events: Vec<ContainerEvent>) -> Arc<Self> {
            Arc::new(Self {
                containers: Mutex::new(containers),
                events: Mutex::new(events),
            })
        }
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list_containers(&self, _all: bool) -> docker::Result<Vec<ContainerRecord>> {
            Ok(self.containers.lock().unwrap().clone())
        }

        async fn inspect(
            &self,
            id: &ContainerID,
        ) -> docker::Result<Option<ContainerRecord>> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.id() == id)
                .cloned())
        }

        async fn events(&self) -> docker::Result<EventStream> {
            let scripted: Vec<docker::Result<ContainerEvent>> = self
                .events
                .lock()
                .unwrap()
                .drain(..)
                .map(Ok)
                .collect();
            // The feed stays open after the scripted events.
            Ok(Box::pin(stream::iter(scripted).chain(stream::pending())))
        }

        async fn open_log_stream(
            &self,
            _id: &ContainerID,
            _start: LogStart,
            _tty: bool,
        ) -> docker::Result<LogStream> {
            let bytes: ByteStream = Box::pin(stream::pending());
            Ok(LogStream {
                multiplexed: true,
                bytes,
            })
        }
    }

    fn running(id: &str, name: &str) -> ContainerRecord {
        ContainerRecord::new(
            ContainerID::new(id).unwrap(),
            name,
            "busybox",
            HashMap::new(),
            ContainerStatus::Running,
            false,
        )
    }

    fn start_event(id: &str, name: &str) -> ContainerEvent {
        ContainerEvent {
            id: ContainerID::new(id).unwrap(),
            name: name.to_owned(),
            action: EventAction::Start,
        }
    }

    struct Harness {
        registry: Arc<StreamRegistry>,
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
        // Keeps the records channel alive so workers do not see a closed
        // forwarder.
        _records: tokio::sync::mpsc::Receiver<LogRecord>,
    }

    fn spawn_discovery(runtime: Arc<MockRuntime>, exclude: &[&str]) -> Harness {
        let mut settings = Settings::for_tests();
        settings.exclude_containers = exclude.iter().map(|s| (*s).to_owned()).collect();
        let registry = Arc::new(StreamRegistry::new());
        let (handle, rx) = ForwarderHandle::test_pair(64);
        let discovery = DiscoveryLoop::new(runtime, registry.clone(), handle, &settings);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(discovery.run(shutdown_rx));
        Harness {
            registry,
            shutdown_tx,
            task,
            _records: rx,
        }
    }

    async fn settle() {
        // Lets the discovery loop and freshly spawned workers run.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn initial_reconcile_starts_workers_for_running_containers() {
        let runtime = MockRuntime::new(
            vec![running("aaa111", "api"), running("bbb222", "db")],
            vec![],
        );
        let harness = spawn_discovery(runtime, &[]);
        settle().await;

        assert_eq!(harness.registry.len(), 2);
        assert!(harness.registry.contains("aaa111"));
        assert!(harness.registry.contains("bbb222"));

        harness.shutdown_tx.send(true).unwrap();
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn excluded_container_is_never_started() {
        let runtime = MockRuntime::new(
            vec![running("aaa111", "web")],
            vec![start_event("aaa111", "web")],
        );
        let harness = spawn_discovery(runtime, &["web"]);
        settle().await;

        assert!(harness.registry.is_empty());

        harness.shutdown_tx.send(true).unwrap();
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_events_yield_one_worker() {
        let runtime = MockRuntime::new(
            vec![running("aaa111", "api")],
            vec![
                start_event("aaa111", "api"),
                start_event("aaa111", "api"),
            ],
        );
        let harness = spawn_discovery(runtime, &[]);
        settle().await;

        assert_eq!(harness.registry.len(), 1);

        harness.shutdown_tx.send(true).unwrap();
        harness.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_container_worker_is_stopped_on_reconcile() {
        let runtime = MockRuntime::new(vec![running("aaa111", "api")], vec![]);
        let harness = spawn_discovery(runtime.clone(), &[]);
        settle().await;
        assert!(harness.registry.contains("aaa111"));

        // The container disappears while the engine is disconnected from
        // the event feed; a later event triggers nothing, but shutdown of
        // the old worker is reconcile's job. Simulate by clearing the
        // runtime and forcing the loop through resubscription.
        runtime.containers.lock().unwrap().clear();
        harness.shutdown_tx.send(true).unwrap();
        harness.task.await.unwrap();

        // Direct check of the reconcile diff instead: a fresh discovery
        // loop over the now-empty runtime signals the stale worker.
        let settings = Settings::for_tests();
        let (handle, _rx) = ForwarderHandle::test_pair(64);
        let discovery = DiscoveryLoop::new(
            runtime,
            harness.registry.clone(),
            handle,
            &settings,
        );
        discovery.reconcile().await.unwrap();
        settle().await;
        // The worker saw the stop signal and deregistered itself.
        assert!(harness.registry.is_empty());
    }
}
