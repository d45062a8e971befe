//! # Shutdown
//!
//! Signal handling and supervised teardown of the gateway's background
//! tasks (health prober, pending model pulls). Each task runs under a
//! shared cancellation token; shutdown cancels them and waits a bounded
//! time for each to drain.

use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long shutdown waits for each background task.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TaskSupervisor {
    cancel: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token handed to background tasks; cancelled once at shutdown.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn register(&self, name: &str, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push((name.to_string(), handle));
    }

    /// Cancel every registered task and wait up to `DRAIN_TIMEOUT` for
    /// each to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let tasks: Vec<(String, JoinHandle<()>)> =
            std::mem::take(&mut *self.tasks.lock().unwrap());
        for (name, handle) in tasks {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => info!("background task {} stopped", name),
                Ok(Err(err)) => warn!("background task {} ended with error: {}", name, err),
                Err(_) => warn!("background task {} did not stop within {:?}", name, DRAIN_TIMEOUT),
            }
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve when the process receives SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                warn!("could not install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
    }
}
