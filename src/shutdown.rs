use tokio_util::sync::CancellationToken;

/// Why the agent is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    CtrlC,
    Sigterm,
    InformerEnded,
}

/// Root cancellation for the agent. Capture sessions hang off a child token,
/// so cancelling here stops every running tcpdump.
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for SIGINT or SIGTERM and cancels. Returns `None` if shutdown was
/// triggered some other way first.
pub async fn wait_for_signal(shutdown: &Shutdown) -> Option<ShutdownReason> {
    let token = shutdown.token();
    let reason = tokio::select! {
        r = wait_ctrl_c() => r,
        r = wait_sigterm() => r,
        _ = token.cancelled() => return None,
    };
    tracing::info!(reason = ?reason, "received signal, shutting down");
    shutdown.cancel();
    Some(reason)
}

async fn wait_ctrl_c() -> ShutdownReason {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    ShutdownReason::CtrlC
}

#[cfg(unix)]
async fn wait_sigterm() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
    ShutdownReason::Sigterm
}

#[cfg(not(unix))]
async fn wait_sigterm() -> ShutdownReason {
    std::future::pending::<()>().await;
    ShutdownReason::Sigterm
}
