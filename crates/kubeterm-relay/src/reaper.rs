//! Background sweep closing sessions nobody has viewed for a while.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::SessionRegistry;
use crate::session::SessionId;

/// Closes sessions that have had no viewer for at least `idle_timeout`.
#[derive(Clone)]
pub struct IdleReaper {
    registry: SessionRegistry,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl IdleReaper {
    pub const fn new(
        registry: SessionRegistry,
        idle_timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            registry,
            idle_timeout,
            sweep_interval,
        }
    }

    /// Close every idle session once and return the ids closed.
    pub async fn sweep(&self) -> Vec<SessionId> {
        let mut reaped = Vec::new();
        for connection in self.registry.snapshot().await {
            let Some(idle) = connection.close_if_idle(self.idle_timeout).await else {
                continue;
            };
            if self.registry.close(connection.id()).await {
                info!(session_id = %connection.id(), idle_secs = idle.as_secs(), "Reaped idle session");
                reaped.push(connection.id());
            }
        }
        reaped
    }

    /// Sweep on an interval until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval);
            interval.tick().await; // skip first immediate tick
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let reaped = self.sweep().await;
                        if !reaped.is_empty() {
                            debug!(count = reaped.len(), "Idle sweep finished");
                        }
                    }
                }
            }
            debug!("Idle reaper stopped");
        })
    }
}
