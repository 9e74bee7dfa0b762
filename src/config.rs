use std::path::PathBuf;
use std::time::Duration;

use crate::capture::NsenterTcpdump;
use crate::cli::Cli;
use crate::errors::{AppError, AppResult};

#[derive(Clone, Debug)]
pub struct Config {
    pub node_name: String,
    pub kubeconfig: Option<PathBuf>,
    pub workers: usize,
    pub capture_dir: PathBuf,

    /// `None` disables periodic resync.
    pub resync: Option<Duration>,
    pub shutdown_grace: Duration,

    pub launcher: NsenterTcpdump,
}

impl TryFrom<Cli> for Config {
    type Error = AppError;

    fn try_from(cli: Cli) -> AppResult<Self> {
        let node_name = cli.node_name.trim().to_string();
        if node_name.is_empty() {
            return Err(AppError::Cli(
                "--node-name (or NODE_NAME) must not be empty".to_string(),
            ));
        }
        if cli.workers == 0 {
            return Err(AppError::Cli("--workers must be at least 1".to_string()));
        }
        if cli.file_size_mb == 0 {
            return Err(AppError::Cli("--file-size-mb must be at least 1".to_string()));
        }

        let resync = (cli.resync_secs > 0).then(|| Duration::from_secs(cli.resync_secs));

        Ok(Self {
            node_name,
            kubeconfig: cli.kubeconfig,
            workers: cli.workers,
            capture_dir: cli.capture_dir,

            resync,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),

            launcher: NsenterTcpdump {
                nsenter: cli.nsenter,
                tcpdump: cli.tcpdump,
                file_size_mb: cli.file_size_mb,
            },
        })
    }
}
