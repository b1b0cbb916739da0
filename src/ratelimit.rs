use crate::{CaptureError, UserId};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window submission limiter, one window per user.
pub struct RateLimiter {
    max_requests: usize,
    window_size: Duration,
    request_times: DashMap<UserId, VecDeque<Instant>>,
}

impl RateLimiter {
    /// `max_requests == 0` disables limiting.
    pub fn new(max_requests: usize, window_size: Duration) -> Self {
        Self {
            max_requests,
            window_size,
            request_times: DashMap::new(),
        }
    }

    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn check(&self, user_id: &str) -> Result<(), CaptureError> {
        if self.max_requests == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let mut times = self
            .request_times
            .entry(user_id.to_string())
            .or_insert_with(VecDeque::new);

        while let Some(&oldest) = times.front() {
            if now.duration_since(oldest) >= self.window_size {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() < self.max_requests {
            times.push_back(now);
            return Ok(());
        }

        let retry_after = times
            .front()
            .map(|&oldest| self.window_size.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(self.window_size);

        Err(CaptureError::RateLimited { retry_after })
    }

    pub fn current_rate(&self, user_id: &str) -> usize {
        let now = Instant::now();
        self.request_times
            .get(user_id)
            .map(|times| {
                times
                    .iter()
                    .filter(|&&time| now.duration_since(time) < self.window_size)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_limits_per_user() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));

        for _ in 0..3 {
            assert!(limiter.check("alice").is_ok());
        }
        assert!(matches!(
            limiter.check("alice"),
            Err(CaptureError::RateLimited { .. })
        ));

        // other users have their own window
        assert!(limiter.check("bob").is_ok());
        assert_eq!(limiter.current_rate("alice"), 3);
        assert_eq!(limiter.current_rate("bob"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));
        limiter.check("alice").unwrap();

        tokio::time::advance(Duration::from_millis(400)).await;
        match limiter.check("alice") {
            Err(CaptureError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_millis(600));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.check("alice").is_ok());
    }

    #[test]
    fn test_zero_disables() {
        let limiter = RateLimiter::per_minute(0);
        for _ in 0..1000 {
            assert!(limiter.check("alice").is_ok());
        }
    }
}
