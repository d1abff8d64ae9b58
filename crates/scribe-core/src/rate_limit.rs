use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Sliding-window limiter for outbound calls to a rate-limited API.
///
/// Local to one process: several instances sharing one upstream quota each get
/// the full `(max_requests, window)` budget.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: (max_requests as usize).max(1),
            window,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Suspend until a call is admitted, then record it.
    ///
    /// The queue lock is held while sleeping so waiters are admitted in arrival order.
    pub async fn wait(&self) {
        let mut requests = self.requests.lock().await;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = requests.front() {
                if now.duration_since(oldest) >= self.window {
                    requests.pop_front();
                } else {
                    break;
                }
            }

            if requests.len() < self.max_requests {
                requests.push_back(now);
                return;
            }

            if let Some(&oldest) = requests.front() {
                sleep_until(oldest + self.window).await;
            }
        }
    }

    /// Calls admitted within the current window.
    pub async fn in_window(&self) -> usize {
        let now = Instant::now();
        let requests = self.requests.lock().await;
        requests
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_two_per_second() {
        let limiter = RateLimiter::new(2, Duration::from_millis(1000));
        let start = Instant::now();

        let mut admitted = Vec::new();
        for _ in 0..5 {
            limiter.wait().await;
            admitted.push(Instant::now().duration_since(start));
        }

        assert_eq!(admitted[0], Duration::ZERO);
        assert_eq!(admitted[1], Duration::ZERO);
        assert!(admitted[2] >= admitted[0] + Duration::from_millis(1000));
        assert!(admitted[3] >= admitted[1] + Duration::from_millis(1000));
        assert!(admitted[4] >= admitted[2] + Duration::from_millis(1000));
        assert!(admitted[4] < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_the_window() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_millis(1000)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.wait().await;
                Instant::now().duration_since(start)
            }));
        }

        let mut times = Vec::new();
        for h in handles {
            times.push(h.await.unwrap());
        }
        times.sort();

        for pair in times.windows(3) {
            assert!(pair[2] - pair[0] >= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_after_idle_period() {
        let limiter = RateLimiter::new(1, Duration::from_millis(500));
        limiter.wait().await;
        tokio::time::advance(Duration::from_millis(600)).await;

        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(Instant::now(), before);
        assert_eq!(limiter.in_window().await, 1);
    }
}
