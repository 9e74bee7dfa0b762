use std::path::{Path, PathBuf};

use kube::config::{Config as KubeConfig, KubeConfigOptions, Kubeconfig};
use kube::Client;

use crate::errors::{AppError, AppResult};

/// Builds an API client: in-cluster credentials first, then `kubeconfig`
/// (or `$KUBECONFIG`), then `$HOME/.kube/config`.
pub async fn make_client(kubeconfig: Option<&Path>) -> AppResult<Client> {
    let config = match KubeConfig::incluster() {
        Ok(config) => {
            tracing::info!("using in-cluster configuration");
            config
        }
        Err(e) => {
            tracing::debug!(error = %e, "not running in-cluster");
            let path = kubeconfig_path(kubeconfig).ok_or_else(|| {
                AppError::Cli(
                    "no in-cluster config and no kubeconfig found; set --kubeconfig".to_string(),
                )
            })?;
            tracing::info!(path = %path.display(), "using kubeconfig");
            let file = Kubeconfig::read_from(&path)?;
            KubeConfig::from_custom_kubeconfig(file, &KubeConfigOptions::default()).await?
        }
    };

    Ok(Client::try_from(config)?)
}

fn kubeconfig_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let home = std::env::var_os("HOME")?;
    let path = PathBuf::from(home).join(".kube").join("config");
    path.exists().then_some(path)
}
