use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::types::PodKey;

/// Everything needed to start one capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturePlan {
    pub pod: PodKey,
    pub pid: u32,
    pub rotation_limit: u32,
    pub output: PathBuf,
}

/// Builds the external command that performs a capture.
pub trait CaptureLauncher: Send + Sync {
    fn command(&self, plan: &CapturePlan) -> Command;
}

/// Enters the target's network namespace with `nsenter` and runs `tcpdump`
/// on every interface, rotating output every `file_size_mb` megabytes.
#[derive(Clone, Debug)]
pub struct NsenterTcpdump {
    pub nsenter: PathBuf,
    pub tcpdump: String,
    pub file_size_mb: u32,
}

impl Default for NsenterTcpdump {
    fn default() -> Self {
        Self {
            nsenter: PathBuf::from("nsenter"),
            tcpdump: "tcpdump".to_string(),
            file_size_mb: 1,
        }
    }
}

impl NsenterTcpdump {
    pub fn args(&self, plan: &CapturePlan) -> Vec<OsString> {
        vec![
            "-t".into(),
            plan.pid.to_string().into(),
            "-n".into(),
            "--".into(),
            self.tcpdump.clone().into(),
            "-Z".into(),
            "root".into(),
            "-i".into(),
            "any".into(),
            "-C".into(),
            self.file_size_mb.to_string().into(),
            "-W".into(),
            plan.rotation_limit.to_string().into(),
            "-w".into(),
            plan.output.clone().into_os_string(),
        ]
    }
}

impl CaptureLauncher for NsenterTcpdump {
    fn command(&self, plan: &CapturePlan) -> Command {
        let args = self.args(plan);
        tracing::debug!(
            nsenter = %self.nsenter.display(),
            args = ?args,
            "building capture command"
        );

        let mut cmd = Command::new(&self.nsenter);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        cmd
    }
}
