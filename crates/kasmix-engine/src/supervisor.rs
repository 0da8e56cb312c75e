//! Periodic monitor tasks with cooperative shutdown.
//!
//! Three interval-driven loops run against the engine: the mix monitor
//! and the CoinJoin monitor every 10 seconds, the lobby cleanup every
//! 5 minutes. Each loop checks a shared watch channel between iterations
//! and exits promptly on shutdown; in-flight RPC work is simply
//! abandoned (session state is written before side effects wherever
//! possible, and loudly after submission otherwise).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use kasmix_core::constants::{LOBBY_CLEANUP_PERIOD_MS, MONITOR_PERIOD_MS};

use crate::context::Engine;

/// Handle over the running monitor tasks.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn all monitor tasks against the engine.
    pub fn start(engine: Arc<Engine>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut handles = Vec::new();

        {
            let engine = Arc::clone(&engine);
            let rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(run_periodic(
                "mix-monitor",
                Duration::from_millis(MONITOR_PERIOD_MS),
                rx,
                move || {
                    let engine = Arc::clone(&engine);
                    async move { engine.mix_monitor_tick().await }
                },
            )));
        }
        {
            let engine = Arc::clone(&engine);
            let rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(run_periodic(
                "coinjoin-monitor",
                Duration::from_millis(MONITOR_PERIOD_MS),
                rx,
                move || {
                    let engine = Arc::clone(&engine);
                    async move { engine.coinjoin_monitor_tick().await }
                },
            )));
        }
        {
            let engine = Arc::clone(&engine);
            let rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(run_periodic(
                "lobby-cleanup",
                Duration::from_millis(LOBBY_CLEANUP_PERIOD_MS),
                rx,
                move || {
                    let engine = Arc::clone(&engine);
                    async move { engine.lobby_cleanup_tick() }
                },
            )));
        }

        info!(tasks = handles.len(), "monitors started");
        Self { shutdown_tx, handles }
    }

    /// Signal shutdown and wait for every monitor to finish its current
    /// iteration.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("monitors stopped");
    }
}

/// Drive one named tick function at a fixed period until shutdown.
async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                debug!(task = name, "tick");
                tick().await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(task = name, "shutting down");
                    break;
                }
            }
        }
    }
}
