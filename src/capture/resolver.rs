use std::fs;
use std::path::PathBuf;

use crate::errors::CaptureError;

/// Maps a runtime container id to a host PID living in that container.
pub trait PidResolver: Send + Sync {
    fn resolve(&self, container_id: &str) -> Result<u32, CaptureError>;
}

/// Finds a container's process by scanning `<root>/<pid>/cgroup` for the
/// container id.
///
/// The first process whose cgroup text contains the id wins, in whatever order
/// the directory listing yields. Nothing guarantees only one process matches
/// (every process in the container does, and so would any other whose cgroup
/// path happens to embed the same string), so the result is an approximation:
/// some process inside the target's namespaces in practice, not a specific one.
#[derive(Clone, Debug)]
pub struct ProcfsResolver {
    root: PathBuf,
}

impl ProcfsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcfsResolver {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl PidResolver for ProcfsResolver {
    fn resolve(&self, container_id: &str) -> Result<u32, CaptureError> {
        if container_id.is_empty() {
            return Err(CaptureError::process_not_found(container_id));
        }

        let entries = fs::read_dir(&self.root)
            .map_err(|e| CaptureError::process_not_found(container_id).with_source(e))?;

        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };

            // Processes come and go during the scan.
            let Ok(cgroup) = fs::read_to_string(entry.path().join("cgroup")) else {
                continue;
            };

            if cgroup.lines().any(|line| line.contains(container_id)) {
                tracing::debug!(container_id, pid, "resolved container process");
                return Ok(pid);
            }
        }

        Err(CaptureError::process_not_found(container_id))
    }
}
