//! Process-wide warning rate limiter

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Lets at most one warning through per interval
#[derive(Debug)]
pub struct RateLimitedLog {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimitedLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Returns true if the caller may log now, and records the emission
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_one_warning_per_interval() {
        let log = RateLimitedLog::new(Duration::from_secs(60));

        assert!(log.allow());
        assert!(!log.allow());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!log.allow());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(log.allow());
        assert!(!log.allow());
    }
}
