//! Test doubles for the capture seams.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::process::Command;

use crate::capture::launcher::{CaptureLauncher, CapturePlan};
use crate::capture::resolver::PidResolver;
use crate::errors::CaptureError;
use crate::types::{PodKey, PodSnapshot, CAPTURE_ANNOTATION};

/// Resolves every container to the same PID, or to nothing.
pub(crate) struct FixedPid(pub Option<u32>);

impl PidResolver for FixedPid {
    fn resolve(&self, container_id: &str) -> Result<u32, CaptureError> {
        self.0
            .ok_or_else(|| CaptureError::process_not_found(container_id))
    }
}

/// Runs a shell snippet in place of nsenter/tcpdump and records every plan.
/// The snippet sees the planned output file as `$CAPTURE_OUTPUT`.
pub(crate) struct ScriptLauncher {
    script: &'static str,
    plans: Mutex<Vec<CapturePlan>>,
}

impl ScriptLauncher {
    pub(crate) fn new(script: &'static str) -> Self {
        Self {
            script,
            plans: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn plans(&self) -> Vec<CapturePlan> {
        self.plans.lock().unwrap().clone()
    }
}

impl CaptureLauncher for ScriptLauncher {
    fn command(&self, plan: &CapturePlan) -> Command {
        self.plans.lock().unwrap().push(plan.clone());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(self.script).env("CAPTURE_OUTPUT", &plan.output);
        cmd
    }
}

pub(crate) fn pod_with(
    namespace: &str,
    name: &str,
    annotation: Option<&str>,
    container_ids: &[&str],
) -> PodSnapshot {
    let mut annotations = BTreeMap::new();
    if let Some(value) = annotation {
        annotations.insert(CAPTURE_ANNOTATION.to_string(), value.to_string());
    }

    PodSnapshot {
        key: PodKey::new(namespace, name),
        annotations,
        container_ids: container_ids.iter().map(|s| s.to_string()).collect(),
        deletion_requested: false,
        resource_version: Some("1".to_string()),
        node_name: Some("node-1".to_string()),
    }
}
