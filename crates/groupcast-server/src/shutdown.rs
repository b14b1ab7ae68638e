//! Shutdown signal and session drain.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// One-shot, process-wide shutdown flag.
///
/// Sessions and the listener hold child views through [`ShutdownSignal::token`].
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// An untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the signal triggers.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger the signal. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Whether [`trigger`](Self::trigger) has been called.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Stop accepting new tasks on `tracker` and wait up to `deadline` for the
/// running ones.
///
/// Returns `false` when tasks were still running at the deadline.
pub async fn drain(tracker: &TaskTracker, deadline: Duration) -> bool {
    let _ = tracker.close();
    info!(running = tracker.len(), ?deadline, "draining sessions");
    match tokio::time::timeout(deadline, tracker.wait()).await {
        Ok(()) => true,
        Err(_) => {
            warn!(running = tracker.len(), "sessions outlived the shutdown deadline");
            false
        }
    }
}
