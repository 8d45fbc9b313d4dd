use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep_until, Instant};

use crate::config::MAX_GEOCODE_QPS;

/// Keeps successive calls to an external API at least `1 / qps` apart.
/// Callers queue on the lock, so the spacing holds across tasks.
pub struct RateLimiter {
    interval: Duration,
    next_slot: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(qps: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / qps.clamp(1, MAX_GEOCODE_QPS),
            next_slot: AsyncMutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn wait(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(slot) = *next_slot {
            sleep_until(slot).await;
        }
        *next_slot = Some(Instant::now() + self.interval);
    }
}
