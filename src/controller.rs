//! Reconciles pod capture annotations into running captures.
//!
//! Notifications are filtered down to pod keys whose capture state may have
//! changed and pushed onto a deduplicating queue. Workers then act on the
//! pod's *current* cached state, so a burst of updates to one pod collapses
//! into a single reconcile of its latest version.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::capture::SessionManager;
use crate::errors::{AppError, AppResult, CaptureError};
use crate::podwatch::{DeletedPod, PodEventHandler, PodStore};
use crate::types::{PodKey, PodSnapshot};
use crate::workqueue::WorkQueue;

/// Delay before a worker that panicked is started again.
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

pub struct Controller {
    store: PodStore,
    queue: Arc<WorkQueue<PodKey>>,
    captures: Arc<SessionManager>,
    workers: usize,
}

/// Whether an update may change the pod's capture state: the annotation was
/// added, removed, or changed value. Updates that keep the resource version
/// (resyncs) never qualify.
pub fn update_needs_sync(old: &PodSnapshot, new: &PodSnapshot) -> bool {
    if old.resource_version == new.resource_version {
        return false;
    }
    old.capture_annotation() != new.capture_annotation()
}

impl Controller {
    pub fn new(store: PodStore, captures: Arc<SessionManager>, workers: usize) -> Self {
        Self {
            store,
            queue: Arc::new(WorkQueue::with_default_rate_limiter()),
            captures,
            workers: workers.max(1),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<PodKey>> {
        &self.queue
    }

    /// Waits for the informer's initial list, then runs workers until
    /// `shutdown` fires.
    ///
    /// Not reaching the initial sync is fatal: there is no point reconciling
    /// against a partial cache.
    pub async fn run(
        self: Arc<Self>,
        mut synced: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) -> AppResult<()> {
        tracing::info!("starting packet capture controller");

        let reached = tokio::select! {
            res = synced.wait_for(|s| *s) => res.is_ok(),
            _ = shutdown.cancelled() => false,
        };
        if !reached {
            self.queue.shut_down();
            return Err(AppError::CacheSync(
                "pod informer stopped before the initial list completed".to_string(),
            ));
        }

        tracing::info!("cache synced, starting workers");

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(Arc::clone(&self).supervise_worker(id, shutdown.clone()));
        }
        tracing::info!(workers = self.workers, "started workers");

        shutdown.cancelled().await;
        tracing::info!("shutting down packet capture controller");

        self.queue.shut_down();
        while workers.join_next().await.is_some() {}

        Ok(())
    }

    /// Keeps one worker alive, restarting it after a panic.
    async fn supervise_worker(self: Arc<Self>, id: usize, shutdown: CancellationToken) {
        loop {
            let ctl = Arc::clone(&self);
            match tokio::spawn(async move { ctl.run_worker().await }).await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    tracing::error!(worker = id, "worker panicked; restarting");
                    tokio::select! {
                        _ = tokio::time::sleep(WORKER_RESTART_DELAY) => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
                Err(_) => return,
            }
        }
    }

    async fn run_worker(&self) {
        while self.process_next_work_item().await {}
    }

    /// Handles one queued key. Returns `false` once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let _done = Done {
            queue: &self.queue,
            key: &key,
        };

        match self.sync_handler(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(e) => {
                tracing::error!(
                    namespace = %key.namespace,
                    pod = %key.name,
                    error = %e,
                    "error syncing pod; requeueing"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
        true
    }

    /// Converges one pod's capture state against the cache.
    pub async fn sync_handler(&self, key: &PodKey) -> Result<(), CaptureError> {
        let Some(pod) = self.store.get(key) else {
            tracing::debug!(namespace = %key.namespace, pod = %key.name, "pod no longer exists, cleaning up");
            self.captures.stop_capture(key);
            return Ok(());
        };

        if pod.deletion_requested {
            tracing::debug!(namespace = %key.namespace, pod = %key.name, "pod is being deleted, stopping capture");
            self.captures.stop_capture(key);
            return Ok(());
        }

        if pod.capture_annotation().is_some() {
            tracing::debug!(namespace = %key.namespace, pod = %key.name, "ensuring capture");
            self.captures.start_capture(&pod).await?;
        } else {
            tracing::debug!(namespace = %key.namespace, pod = %key.name, "annotation absent, stopping capture");
            self.captures.stop_capture(key);
        }

        tracing::trace!(namespace = %key.namespace, pod = %key.name, "synced pod");
        Ok(())
    }
}

/// Hands a key back to the queue however processing ends, panics included.
struct Done<'a> {
    queue: &'a WorkQueue<PodKey>,
    key: &'a PodKey,
}

impl Drop for Done<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

impl PodEventHandler for Controller {
    fn on_add(&self, pod: &PodSnapshot) {
        if pod.capture_annotation().is_some() {
            tracing::debug!(namespace = %pod.key.namespace, pod = %pod.key.name, "pod added with capture annotation");
            self.queue.add(pod.key.clone());
        }
    }

    fn on_update(&self, old: &PodSnapshot, new: &PodSnapshot) {
        if update_needs_sync(old, new) {
            tracing::debug!(
                namespace = %new.key.namespace,
                pod = %new.key.name,
                old = ?old.capture_annotation(),
                new = ?new.capture_annotation(),
                "capture annotation changed"
            );
            self.queue.add(new.key.clone());
        }
    }

    fn on_delete(&self, pod: &DeletedPod) {
        if let DeletedPod::Tombstone(snap) = pod {
            tracing::trace!(namespace = %snap.key.namespace, pod = %snap.key.name, "recovered deleted pod from tombstone");
        }
        if pod.snapshot().capture_annotation().is_some() {
            let key = pod.key();
            tracing::debug!(namespace = %key.namespace, pod = %key.name, "pod with capture annotation deleted");
            self.queue.add(key.clone());
        }
    }
}
