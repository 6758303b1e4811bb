//! Wires the sync pipeline together.
//!
//! [`SyncOrchestrator`] owns one of each component, built explicitly from an
//! injected link and a [`Config`]:
//!
//! - an event loop that forwards connection events from the link to the
//!   [`ConnectionManager`] and decodes live telemetry into the timeline;
//! - a watcher that starts an escalation run each time a connection session
//!   becomes [`ConnectionState::Ready`] and cancels it when the session ends;
//! - the [`SyncTimeline`] merge task.
//!
//! History replies travel on the same event stream as live telemetry but only
//! reach the timeline through the fetcher's results. Both paths attribute
//! records without a `deviceId` to the session's device, so a live sample and
//! its history copy share one identity.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionSession, ConnectionSnapshot, ConnectionState};
use crate::error::Result;
use crate::escalation::EscalationController;
use crate::history::{FetcherSettings, HistoryFetcher};
use crate::link::{
    DiscoveredDevice, HistoryKind, LinkEvent, LinkStatus, SharedLink, TelemetryOrigin,
};
use crate::progress::{ProgressReporter, SyncProgress};
use crate::timeline::{SyncTimeline, TimelineSnapshot};

/// Escalation work tied to one connection session.
#[derive(Debug, Default)]
struct SessionSync {
    generation: u64,
    token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    link: SharedLink,
    config: Config,
    connection: Arc<ConnectionManager>,
    fetcher: Arc<HistoryFetcher>,
    escalation: Arc<EscalationController>,
    timeline: SyncTimeline,
    progress: ProgressReporter,
    shutdown: CancellationToken,
    sync: Mutex<SessionSync>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Entry point for collaborators: connection control, sync control and the
/// merged timeline.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("state", &self.connection_state())
            .field("records", &self.inner.timeline.snapshot().len())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Build every component over `link` and start the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(link: SharedLink, config: Config) -> Self {
        let shutdown = CancellationToken::new();
        let progress = ProgressReporter::new();
        let connection = Arc::new(ConnectionManager::new(Arc::clone(&link), &config));
        let fetcher = Arc::new(
            HistoryFetcher::new(Arc::clone(&link), FetcherSettings::from(&config.history))
                .with_progress(progress.clone()),
        );
        let escalation = Arc::new(EscalationController::new(
            Arc::clone(&fetcher),
            &config.escalation,
            progress.clone(),
        ));
        let (timeline, merge_task) =
            SyncTimeline::spawn_with_retention(shutdown.clone(), config.timeline.retention());

        // Subscribe before anything can emit so no early event is missed.
        let events = link.subscribe();
        let updates = connection.subscribe();

        let inner = Arc::new(Inner {
            link,
            config,
            connection,
            fetcher,
            escalation,
            timeline,
            progress,
            shutdown,
            sync: Mutex::new(SessionSync::default()),
            tasks: Mutex::new(Vec::new()),
        });

        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&inner), events));
        let watcher = tokio::spawn(watch_sessions(Arc::clone(&inner), updates));
        inner.tasks().extend([merge_task, event_loop, watcher]);

        info!("sync orchestrator started");
        Self { inner }
    }

    /// Start scanning; the scan stops by itself after the configured window.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection is in progress or the link cannot
    /// scan.
    pub async fn start_scan(&self) -> Result<()> {
        self.inner.connection.start_scan().await?;

        let inner = Arc::clone(&self.inner);
        let window = Duration::from_secs(inner.config.connection.scan_timeout_secs);
        let timer = tokio::spawn(async move {
            tokio::select! {
                () = inner.shutdown.cancelled() => {}
                () = tokio::time::sleep(window) => {
                    if let Err(err) = inner.connection.finish_scan().await {
                        warn!(error = %err, "failed to end scan");
                    }
                }
            }
        });
        self.inner.tasks().push(timer);
        Ok(())
    }

    /// Stop scanning.
    ///
    /// # Errors
    ///
    /// Returns an error if the link refuses to stop.
    pub async fn stop_scan(&self) -> Result<()> {
        self.inner.connection.stop_scan().await
    }

    /// Devices found by scans.
    #[must_use]
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.connection.discovered_devices()
    }

    /// Connect and authenticate to `address`. History sync starts on its own
    /// once the connection is ready.
    ///
    /// # Errors
    ///
    /// Returns why the connection did not become ready.
    pub async fn start_connection(&self, address: &str) -> Result<ConnectionState> {
        self.inner.connection.connect(address).await
    }

    /// Cancel sync and drop the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the link refuses to disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.cancel_sync();
        self.inner.connection.disconnect().await
    }

    /// Cancel the running history sync, keeping whatever was merged already.
    /// Returns whether anything was running.
    pub fn cancel_sync(&self) -> bool {
        let escalating = self.inner.cancel_session_sync();
        let fetches = self.inner.fetcher.cancel_all_fetches();
        if escalating || fetches > 0 {
            info!(fetches, "history sync cancelled");
        }
        escalating || fetches > 0
    }

    /// Whether history sync is running.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.escalation.is_running() || self.inner.fetcher.active_fetches() > 0
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Current connection session.
    #[must_use]
    pub fn session(&self) -> ConnectionSession {
        self.inner.connection.session()
    }

    /// Connection state and session together.
    #[must_use]
    pub fn connection_snapshot(&self) -> ConnectionSnapshot {
        self.inner.connection.subscribe().borrow().clone()
    }

    /// Watch connection changes.
    #[must_use]
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.connection.subscribe()
    }

    /// Fresh connectivity report from the link.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot report its status.
    pub async fn link_status(&self) -> Result<LinkStatus> {
        Ok(self.inner.link.connection_status().await?)
    }

    /// The merged timeline.
    #[must_use]
    pub fn timeline(&self) -> TimelineSnapshot {
        self.inner.timeline.snapshot()
    }

    /// Watch timeline rebuilds.
    #[must_use]
    pub fn subscribe_timeline(&self) -> watch::Receiver<TimelineSnapshot> {
        self.inner.timeline.subscribe()
    }

    /// Receive sync progress updates.
    #[must_use]
    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncProgress> {
        self.inner.progress.subscribe()
    }

    /// Stop every background task and wait for them.
    pub async fn shutdown(&self) {
        self.cancel_sync();
        self.inner.shutdown.cancel();

        let session_task = self.inner.sync().task.take();
        let tasks: Vec<_> = self.inner.tasks().drain(..).collect();
        for task in session_task.into_iter().chain(tasks) {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        info!("sync orchestrator stopped");
    }
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync(&self) -> MutexGuard<'_, SessionSync> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_session_sync(&self) -> bool {
        let mut sync = self.sync();
        let Some(token) = sync.token.take() else {
            return false;
        };
        token.cancel();
        debug!(generation = sync.generation, "session sync cancelled");
        true
    }

    /// Start escalation for session `generation`, after any previous run has
    /// wound down.
    fn begin_session_sync(self: &Arc<Self>, generation: u64) {
        let token = self.shutdown.child_token();
        let mut sync = self.sync();
        if let Some(previous) = sync.token.replace(token.clone()) {
            previous.cancel();
        }
        let previous_task = sync.task.take();
        sync.generation = generation;

        let inner = Arc::clone(self);
        sync.task = Some(tokio::spawn(async move {
            if let Some(previous) = previous_task {
                if let Err(err) = previous.await {
                    warn!(error = %err, "previous history sync ended abnormally");
                }
            }
            if token.is_cancelled() {
                return;
            }
            info!(generation, "connection ready, starting history sync");
            let outcome = inner
                .escalation
                .smart_fetch(HistoryKind::EldEvents, &token)
                .await;

            let stages: Vec<&str> = outcome.stages.iter().map(|s| s.name.as_str()).collect();
            info!(
                generation,
                records = outcome.records.len(),
                duplicates_removed = outcome.duplicates_removed,
                ?stages,
                cancelled = outcome.cancelled,
                "history sync finished"
            );
            let device_id = inner.connection.session().last_known_device_id;
            let mut records = outcome.records;
            for record in &mut records {
                record.fill_device_id(device_id.as_deref());
            }
            if !inner.timeline.submit(records).await {
                debug!("timeline closed before history could be merged");
            }
        }));
    }
}

async fn run_event_loop(inner: Arc<Inner>, mut events: broadcast::Receiver<LinkEvent>) {
    loop {
        let event = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(LinkEvent::Telemetry(telemetry)) if telemetry.origin == TelemetryOrigin::Live => {
                let device_id = inner.connection.session().last_known_device_id;
                match telemetry.decode(device_id, Utc::now()) {
                    Ok(record) => {
                        if !inner.timeline.submit(vec![record]).await {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "dropping undecodable telemetry"),
                }
            }
            // History replies are collected by the fetcher that asked for them.
            Ok(LinkEvent::Telemetry(_)) => {}
            Ok(event) => {
                debug!(event = event.name(), "link event");
                inner.connection.handle_link_event(&event).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event loop fell behind the link");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("link event loop stopped");
}

async fn watch_sessions(inner: Arc<Inner>, mut updates: watch::Receiver<ConnectionSnapshot>) {
    // Handle whatever state the connection is already in.
    updates.mark_changed();
    let mut synced_generation = 0;
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            changed = updates.changed() => if changed.is_err() { break },
        }
        let snapshot = updates.borrow_and_update().clone();
        if snapshot.state == ConnectionState::Ready {
            if snapshot.session.generation != synced_generation {
                synced_generation = snapshot.session.generation;
                inner.begin_session_sync(synced_generation);
            }
        } else if inner.cancel_session_sync() {
            debug!(state = %snapshot.state, "session ended, history sync cancelled");
        }
    }
}
