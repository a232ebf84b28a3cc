use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Process-local token bucket shared by every client this instance serves.
///
/// The bucket starts full, refills at `rate` tokens per second up to
/// `burst` tokens, and every admitted request consumes exactly one token.
/// It does not touch the shared store, so it keeps working when the store
/// is down.
pub struct LocalTokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    burst: f64,
}

impl LocalTokenBucket {
    /// * `rps`   - sustained requests per second (refill rate)
    /// * `burst` - maximum burst size (bucket capacity)
    pub fn new(rps: u64, burst: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            rate: rps as f64,
            burst: burst as f64,
        }
    }

    /// Take one token.
    ///
    /// On failure returns how long until the next token becomes available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else if self.rate > 0.0 {
            Err(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
        } else {
            Err(Duration::MAX)
        }
    }

    /// Tokens currently available, after applying pending refill.
    pub fn available(&self) -> f64 {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * self.rate).min(self.burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allows_up_to_burst() {
        let bucket = LocalTokenBucket::new(10, 5);

        for _ in 0..5 {
            assert!(bucket.try_acquire().is_ok(), "should allow within burst");
        }

        let wait = bucket.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_millis(100), "one token takes 100ms at 10 rps");
    }

    #[tokio::test(start_paused = true)]
    async fn refills_over_time() {
        let bucket = LocalTokenBucket::new(10, 5);

        for _ in 0..5 {
            bucket.try_acquire().unwrap();
        }
        assert!(bucket.try_acquire().is_err());

        // 150ms at 10 rps refills one token and a half.
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(bucket.try_acquire().is_ok(), "should allow after refill");
        assert!(bucket.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_burst() {
        let bucket = LocalTokenBucket::new(100, 3);
        bucket.try_acquire().unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.available(), 3.0);
    }

    #[test]
    fn shared_across_threads() {
        let bucket = Arc::new(LocalTokenBucket::new(1, 40));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                std::thread::spawn(move || (0..10).filter(|_| bucket.try_acquire().is_ok()).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 40 burst plus at most a token or two of refill during the test.
        assert!((40..=42).contains(&admitted), "admitted {}", admitted);
    }
}
