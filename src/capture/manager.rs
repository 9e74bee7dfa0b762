use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::capture::artifacts;
use crate::capture::launcher::{CaptureLauncher, CapturePlan};
use crate::capture::resolver::PidResolver;
use crate::errors::CaptureError;
use crate::types::{PodKey, PodSnapshot};

/// Rotation limit used when the annotation value is not a positive integer.
pub const DEFAULT_ROTATION_LIMIT: u32 = 10;

/// One running capture. Only the cancellation token is kept; the task that
/// owns the child process is never joined.
struct CaptureSession {
    generation: u64,
    token: CancellationToken,
    /// Set by `stop_capture` before cancelling: the run must not leave files.
    purge: Arc<AtomicBool>,
}

type SessionTable = Arc<Mutex<HashMap<PodKey, CaptureSession>>>;

fn lock(sessions: &Mutex<HashMap<PodKey, CaptureSession>>) -> MutexGuard<'_, HashMap<PodKey, CaptureSession>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the set of active captures, at most one per pod.
///
/// The session table lock is only ever held for a single lookup, insert, or
/// removal; PID resolution and process handling happen outside it.
pub struct SessionManager {
    sessions: SessionTable,
    generations: AtomicU64,
    capture_dir: PathBuf,
    resolver: Arc<dyn PidResolver>,
    launcher: Arc<dyn CaptureLauncher>,
    root: CancellationToken,
}

impl SessionManager {
    /// Creates the manager and its capture directory. A directory that cannot
    /// be created is logged; captures will then fail when tcpdump starts.
    pub fn new(
        capture_dir: impl Into<PathBuf>,
        resolver: Arc<dyn PidResolver>,
        launcher: Arc<dyn CaptureLauncher>,
        root: CancellationToken,
    ) -> Self {
        let capture_dir = capture_dir.into();
        if let Err(e) = fs::create_dir_all(&capture_dir) {
            tracing::error!(
                dir = %capture_dir.display(),
                error = %e,
                "failed to create capture directory"
            );
        }

        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            capture_dir,
            resolver,
            launcher,
            root,
        }
    }

    pub fn is_active(&self, pod: &PodKey) -> bool {
        lock(&self.sessions).contains_key(pod)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn active_pods(&self) -> Vec<PodKey> {
        let mut pods: Vec<_> = lock(&self.sessions).keys().cloned().collect();
        pods.sort();
        pods
    }

    /// Starts a capture for `pod` unless one is already running.
    ///
    /// Returns once the capture task is scheduled, not once tcpdump is up.
    /// On error no session exists and nothing was launched.
    pub async fn start_capture(&self, pod: &PodSnapshot) -> Result<(), CaptureError> {
        let key = &pod.key;

        let Some(raw_limit) = pod.capture_annotation() else {
            return Err(CaptureError::annotation_missing(key));
        };

        // A running session wins over whatever the pod's container statuses
        // say now; they are only read to launch a new one.
        if self.is_active(key) {
            tracing::debug!(namespace = %key.namespace, pod = %key.name, "capture already running");
            return Ok(());
        }

        let container_id = first_container_id(pod)?.to_string();

        let resolver = Arc::clone(&self.resolver);
        let lookup_id = container_id.clone();
        let pid = tokio::task::spawn_blocking(move || resolver.resolve(&lookup_id))
            .await
            .map_err(|e| CaptureError::process_not_found(&container_id).with_source(e))??;

        let plan = CapturePlan {
            pod: key.clone(),
            pid,
            rotation_limit: parse_rotation_limit(key, raw_limit),
            output: artifacts::live_file(&self.capture_dir, key),
        };

        let (generation, token, purge) = {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(key) {
                tracing::debug!(namespace = %key.namespace, pod = %key.name, "capture already running");
                return Ok(());
            }
            let generation = self.generations.fetch_add(1, Ordering::Relaxed);
            let token = self.root.child_token();
            let purge = Arc::new(AtomicBool::new(false));
            sessions.insert(
                key.clone(),
                CaptureSession {
                    generation,
                    token: token.clone(),
                    purge: Arc::clone(&purge),
                },
            );
            (generation, token, purge)
        };

        tracing::info!(
            namespace = %key.namespace,
            pod = %key.name,
            pid = plan.pid,
            limit = plan.rotation_limit,
            "starting capture"
        );

        let command = self.launcher.command(&plan);
        tokio::spawn(run_capture(
            CaptureRun {
                sessions: Arc::clone(&self.sessions),
                capture_dir: self.capture_dir.clone(),
                generation,
                token,
                purge,
            },
            plan,
            command,
        ));

        Ok(())
    }

    /// Stops the capture for `pod` and deletes its artifacts. A pod without a
    /// session is left alone.
    pub fn stop_capture(&self, pod: &PodKey) {
        let Some(session) = lock(&self.sessions).remove(pod) else {
            tracing::debug!(namespace = %pod.namespace, pod = %pod.name, "no capture to stop");
            return;
        };

        tracing::info!(namespace = %pod.namespace, pod = %pod.name, "stopping capture");
        session.purge.store(true, Ordering::Release);
        session.token.cancel();
        let removed = artifacts::remove_artifacts(&self.capture_dir, pod);
        tracing::debug!(namespace = %pod.namespace, pod = %pod.name, removed, "capture files cleaned up");
    }

    /// Cancels every running capture, keeping their artifacts on disk.
    pub fn shutdown_all(&self) {
        let drained: Vec<_> = lock(&self.sessions).drain().collect();
        for (pod, session) in drained {
            tracing::debug!(namespace = %pod.namespace, pod = %pod.name, "cancelling capture");
            session.token.cancel();
        }
    }
}

fn first_container_id(pod: &PodSnapshot) -> Result<&str, CaptureError> {
    let Some(raw) = pod.container_ids.first() else {
        return Err(CaptureError::container_not_found(&pod.key));
    };
    match raw.split_once("://") {
        Some((runtime, id)) if !runtime.is_empty() && !id.is_empty() => Ok(id),
        _ => Err(CaptureError::malformed_container_id(&pod.key, raw)),
    }
}

fn parse_rotation_limit(pod: &PodKey, raw: &str) -> u32 {
    let err = match raw.parse::<u32>() {
        Ok(limit) if limit > 0 => return limit,
        Ok(_) => CaptureError::annotation_parse(raw),
        Err(e) => CaptureError::annotation_parse(raw).with_source(e),
    };
    tracing::warn!(
        namespace = %pod.namespace,
        pod = %pod.name,
        default = DEFAULT_ROTATION_LIMIT,
        error = %err,
        "invalid capture limit, using default"
    );
    DEFAULT_ROTATION_LIMIT
}

/// What a capture task needs to find its way back to the session table.
struct CaptureRun {
    sessions: SessionTable,
    capture_dir: PathBuf,
    generation: u64,
    token: CancellationToken,
    purge: Arc<AtomicBool>,
}

/// Runs one capture until the process exits or the session is cancelled, then
/// drops the session entry if it still belongs to this run.
///
/// A process that stops after reaching its rotation limit looks the same here
/// as one that failed; both just end the session.
async fn run_capture(run: CaptureRun, plan: CapturePlan, mut command: Command) {
    let pod = &plan.pod;
    command.kill_on_drop(true);

    // Stopped before this task got scheduled: launching now would write a
    // file after cleanup already ran.
    let mut killed = false;
    if run.token.is_cancelled() {
        tracing::debug!(namespace = %pod.namespace, pod = %pod.name, "capture cancelled before launch");
    } else {
        match command.spawn() {
            Err(e) => {
                let err = CaptureError::tcpdump_execution(pod).with_source(e);
                tracing::error!(namespace = %pod.namespace, pod = %pod.name, error = %err, "capture failed to start");
            }
            Ok(mut child) => {
                let exited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = run.token.cancelled() => None,
                };

                match exited {
                    Some(Ok(status)) if status.success() => {
                        tracing::info!(namespace = %pod.namespace, pod = %pod.name, "capture process exited");
                    }
                    Some(Ok(status)) => {
                        tracing::error!(namespace = %pod.namespace, pod = %pod.name, %status, "tcpdump exited with error");
                    }
                    Some(Err(e)) => {
                        tracing::error!(namespace = %pod.namespace, pod = %pod.name, error = %e, "failed to wait for capture process");
                    }
                    None => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(namespace = %pod.namespace, pod = %pod.name, error = %e, "failed to kill capture process");
                        }
                        killed = true;
                        tracing::debug!(namespace = %pod.namespace, pod = %pod.name, "capture stopped gracefully");
                    }
                }
            }
        }
    }

    let mut table = lock(&run.sessions);
    if table.get(pod).is_some_and(|s| s.generation == run.generation) {
        table.remove(pod);
    } else if killed && run.purge.load(Ordering::Acquire) && !table.contains_key(pod) {
        // The process may have written after stop_capture cleaned up. The
        // table stays locked so no new session for the pod starts mid-purge.
        let removed = artifacts::remove_artifacts(&run.capture_dir, pod);
        if removed > 0 {
            tracing::debug!(namespace = %pod.namespace, pod = %pod.name, removed, "removed files written during stop");
        }
    }
}
