pub mod capture;
pub mod cli;
pub mod config;
pub mod controller;
pub mod errors;
pub mod kube;
pub mod logging;
pub mod podwatch;
pub mod shutdown;
pub mod types;
pub mod workqueue;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use crate::capture::{ProcfsResolver, SessionManager};
use crate::config::Config;
use crate::controller::Controller;
use crate::errors::{AppError, AppResult};
use crate::podwatch::{PodEventHandler, PodInformer, PodStore};
use crate::shutdown::{wait_for_signal, Shutdown, ShutdownReason};

pub async fn run(config: Config) -> AppResult<()> {
    let shutdown = Shutdown::new();
    let client = crate::kube::client::make_client(config.kubeconfig.as_deref()).await?;

    let captures = Arc::new(SessionManager::new(
        &config.capture_dir,
        Arc::new(ProcfsResolver::default()),
        Arc::new(config.launcher.clone()),
        shutdown.child_token(),
    ));
    let store = PodStore::default();
    let controller = Arc::new(Controller::new(
        store.clone(),
        Arc::clone(&captures),
        config.workers,
    ));
    let (informer, synced) = PodInformer::new(
        config.node_name.clone(),
        store,
        Arc::clone(&controller) as Arc<dyn PodEventHandler>,
        config.resync,
    );

    tracing::info!(
        node = %config.node_name,
        capture_dir = %config.capture_dir.display(),
        workers = config.workers,
        "starting capture agent"
    );

    // Whatever ends the informer ends the agent.
    let informer = {
        let token = shutdown.token();
        let api = ::kube::Api::<Pod>::all(client);
        tokio::spawn(async move {
            let res = informer.run(api, token.clone()).await;
            if !token.is_cancelled() {
                tracing::warn!(reason = ?ShutdownReason::InformerEnded, "shutting down");
                token.cancel();
            }
            res
        })
    };

    let (controlled, _) = tokio::join!(
        async {
            let res = Arc::clone(&controller).run(synced, shutdown.token()).await;
            shutdown.cancel();
            res
        },
        wait_for_signal(&shutdown),
    );

    let active = captures.active_pods();
    if !active.is_empty() {
        tracing::info!(count = active.len(), pods = ?active, "stopping active captures");
    }
    captures.shutdown_all();

    let informed = match informer.await {
        Ok(res) => res,
        Err(e) => Err(AppError::Other(format!("pod informer task failed: {e}"))),
    };

    tracing::info!(grace = ?config.shutdown_grace, "waiting for captures to stop");
    tokio::time::sleep(config.shutdown_grace).await;
    tracing::info!("capture agent stopped");

    informed.and(controlled)
}
