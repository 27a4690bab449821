use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding Window Rate Limiter
/// Bounds how many commands one sender identity may submit per window.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    requests: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records the request and returns true if it fits in the window.
    pub fn is_allowed(&self, identifier: &str) -> bool {
        let now = Instant::now();
        let mut requests = self.requests.lock();
        let times = requests.entry(identifier.to_string()).or_default();
        Self::evict(times, now, self.window);

        if times.len() >= self.max_requests {
            return false;
        }
        times.push_back(now);
        true
    }

    pub fn remaining(&self, identifier: &str) -> usize {
        let now = Instant::now();
        let mut requests = self.requests.lock();
        match requests.get_mut(identifier) {
            Some(times) => {
                Self::evict(times, now, self.window);
                self.max_requests.saturating_sub(times.len())
            }
            None => self.max_requests,
        }
    }

    fn evict(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = times.front() {
            if now.duration_since(*oldest) >= window {
                times.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_per_identifier() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.is_allowed("brain"));
        assert!(limiter.is_allowed("brain"));
        assert!(!limiter.is_allowed("brain"));
        assert_eq!(limiter.remaining("brain"), 0);

        // Other senders have their own window
        assert!(limiter.is_allowed("operator"));
        assert_eq!(limiter.remaining("operator"), 1);
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(50));
        assert!(limiter.is_allowed("brain"));
        assert!(!limiter.is_allowed("brain"));

        std::thread::sleep(Duration::from_millis(70));
        assert!(limiter.is_allowed("brain"));
    }
}
