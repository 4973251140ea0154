use crate::config::RateLimitConfig;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Window {
    start: Instant,
    started: u32,
}

/// Fixed-window limiter: at most `max` starts per `window`
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            state: Mutex::new(Window {
                start: Instant::now(),
                started: 0,
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max, config.window())
    }

    /// Take a slot in the current window, or report how long until the next one
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // Reset window if needed
        if now >= state.start + self.window {
            state.start = now;
            state.started = 0;
        }

        if state.started < self.max {
            state.started += 1;
            Ok(())
        } else {
            Err(state.start + self.window - now)
        }
    }

    /// Give back a slot taken in the current window that went unused
    pub fn release(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if now < state.start + self.window {
            state.started = state.started.saturating_sub(1);
        }
    }

    /// Wait for a slot
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tracing::debug!("Rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}
