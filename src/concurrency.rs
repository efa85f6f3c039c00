//! Concurrency primitives for supervised loops
//!
//! Every long-lived loop in the engine (lifter processor, staging scheduler,
//! path-cache cleaner, row sweeper, deadlock detector, pollers) is a spawned
//! task holding a [`CancelToken`]. Shutdown cancels the root token and every
//! loop drains out at its next suspension point.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::WcsResult;

/// A token for cooperative task cancellation.
///
/// Clones share one flag; cancelling any clone releases every waiter.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Cancel this token and wake all waiters
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether the token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a supervised periodic loop.
///
/// The tick closure runs every `period` until the token is cancelled. Tick
/// errors are logged and the loop continues; loops never terminate the
/// process.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancelToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = WcsResult<()>> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(loop_name = name, "supervised loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = tick().await {
                        warn!(loop_name = name, error = %err, "tick failed");
                    }
                }
            }
        }
    })
}
