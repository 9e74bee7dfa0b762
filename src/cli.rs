use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "kube-podcap",
    version,
    about = "Node agent that runs tcpdump for pods annotated with tcpdump.antrea.io"
)]
pub struct Cli {
    /// Node this agent runs on; only pods scheduled here are watched
    #[arg(long = "node-name", env = "NODE_NAME")]
    pub node_name: String,

    /// Kubeconfig used when not running in-cluster
    #[arg(long = "kubeconfig", env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Number of reconcile workers
    #[arg(long = "workers", default_value_t = 1)]
    pub workers: usize,

    /// Directory capture files are written to
    #[arg(long = "capture-dir", default_value = "/var/log/antrea-captures")]
    pub capture_dir: PathBuf,

    /// Seconds between informer resyncs (0 disables)
    #[arg(long = "resync-secs", default_value_t = 30)]
    pub resync_secs: u64,

    /// Seconds to wait after shutdown for captures to stop
    #[arg(long = "shutdown-grace-secs", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Size in MB at which tcpdump rotates to a new file
    #[arg(long = "file-size-mb", default_value_t = 1)]
    pub file_size_mb: u32,

    /// nsenter binary
    #[arg(long = "nsenter", default_value = "nsenter")]
    pub nsenter: PathBuf,

    /// tcpdump binary, resolved inside the pod's network namespace
    #[arg(long = "tcpdump", default_value = "tcpdump")]
    pub tcpdump: String,
}
