//! Last-acknowledgment timestamp shared between the queue and the watchdog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Written by the request queue on every resolution, read by the watchdog.
/// Stored as milliseconds since `epoch` so no lock is needed.
#[derive(Debug)]
pub struct LivenessState {
    epoch: Instant,
    last_ack_ms: AtomicU64,
}

impl LivenessState {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ack_ms: AtomicU64::new(0),
        }
    }

    pub fn record_ack(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_ack_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn since_last_ack(&self) -> Duration {
        let last = Duration::from_millis(self.last_ack_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tracks_time_since_last_ack() {
        let liveness = LivenessState::new();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(liveness.since_last_ack(), Duration::from_millis(1500));

        liveness.record_ack();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(liveness.since_last_ack(), Duration::from_millis(200));
    }
}
