//! Submission freeze after the venue's edge layer blocks us.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{error, info};

/// Shared gate checked before every live submission.
///
/// Monitoring continues while the gate is closed; only order placement is
/// suppressed.
#[derive(Debug)]
pub struct BlockCooldown {
    duration: Duration,
    blocked_until: RwLock<Option<Instant>>,
    trips: AtomicU64,
}

impl BlockCooldown {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            blocked_until: RwLock::new(None),
            trips: AtomicU64::new(0),
        }
    }

    /// Close the gate for the configured duration.
    pub async fn trigger(&self, reason: &str) {
        let until = Instant::now() + self.duration;
        *self.blocked_until.write().await = Some(until);
        self.trips.fetch_add(1, Ordering::Relaxed);
        error!(
            reason = %reason,
            cooldown_secs = self.duration.as_secs(),
            "Blocked by venue edge, pausing order submission"
        );
    }

    /// Time left before submissions resume, if the gate is closed.
    pub async fn remaining(&self) -> Option<Duration> {
        let until = (*self.blocked_until.read().await)?;
        let now = Instant::now();
        if now >= until {
            return None;
        }
        Some(until - now)
    }

    pub async fn is_active(&self) -> bool {
        self.remaining().await.is_some()
    }

    /// Reopen the gate early.
    pub async fn clear(&self) {
        if self.blocked_until.write().await.take().is_some() {
            info!("Block cooldown cleared");
        }
    }

    /// Times the gate has been closed.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}
