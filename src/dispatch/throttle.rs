//! Engine-wide request rate limit.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding window of at most `max_requests` starts per `window`.
///
/// The slot queue sits behind a fair mutex that is held while a caller
/// sleeps, so waiters are admitted in arrival order.
#[derive(Debug)]
pub struct RequestThrottle {
    max_requests: usize,
    window: Duration,
    started: Mutex<VecDeque<Instant>>,
}

impl RequestThrottle {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            started: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait for a free slot and claim it. Returns how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        let mut started = self.started.lock().await;
        let mut waited = Duration::ZERO;
        loop {
            let now = Instant::now();
            while let Some(&oldest) = started.front() {
                if now.duration_since(oldest) < self.window {
                    break;
                }
                started.pop_front();
            }
            if started.len() < self.max_requests {
                started.push_back(now);
                return waited;
            }
            let ready = started.front().map_or(now, |&oldest| oldest + self.window);
            log::debug!(
                "request rate limit reached ({} per {}ms), waiting {}ms",
                self.max_requests,
                self.window.as_millis(),
                ready.saturating_duration_since(now).as_millis()
            );
            waited += ready.saturating_duration_since(now);
            tokio::time::sleep_until(ready).await;
        }
    }

    /// Requests started within the current window.
    pub async fn in_flight(&self) -> usize {
        let now = Instant::now();
        let started = self.started.lock().await;
        started
            .iter()
            .filter(|&&at| now.duration_since(at) < self.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn admits_up_to_the_cap_then_waits() {
        let throttle = RequestThrottle::new(2, Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert_eq!(throttle.acquire().await, Duration::ZERO);
        assert_eq!(throttle.acquire().await, Duration::ZERO);
        assert_eq!(throttle.in_flight().await, 2);

        let waited = throttle.acquire().await;
        assert!(waited > Duration::ZERO);
        assert!(started.elapsed() >= Duration::from_millis(190));
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let throttle = Arc::new(RequestThrottle::new(1, Duration::from_millis(50)));
        throttle.acquire().await;

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let throttle = throttle.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                throttle.acquire().await;
                order.lock().unwrap().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        futures_util::future::join_all(tasks).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn zero_cap_is_raised_to_one() {
        assert_eq!(RequestThrottle::new(0, Duration::from_secs(1)).max_requests(), 1);
    }
}
