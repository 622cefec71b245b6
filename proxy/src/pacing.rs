//! Per-mapping backpressure
//!
//! The backend RCON listener degrades when it receives near-simultaneous
//! commands, especially during authentication bursts. Each mapping therefore
//! owns two [`Pacer`]s: one spacing out admitted connections, one spacing out
//! packets forwarded from clients to the backend. A pacer is a token bucket of
//! capacity one whose token is refilled a fixed delay after it is handed back.
//!
//! There is no queue beyond the bucket itself. A task waiting for the token is
//! simply suspended, which stalls the client it serves.

use crate::config::PacingConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Default minimum spacing for both gates
pub const DEFAULT_PACING_DELAY: Duration = Duration::from_millis(10);

/// Token bucket with capacity one.
///
/// Waiters are served in the order they started waiting.
#[derive(Debug, Clone)]
pub struct Pacer {
    bucket: Arc<Mutex<()>>,
}

/// The single token of a [`Pacer`].
///
/// Dropping it puts the token back immediately; [`PacingToken::release_after`]
/// puts it back once the delay has passed.
#[must_use = "dropping a pacing token refills the bucket immediately"]
#[derive(Debug)]
pub struct PacingToken {
    guard: OwnedMutexGuard<()>,
}

impl Pacer {
    pub fn new() -> Self {
        Self {
            bucket: Arc::new(Mutex::new(())),
        }
    }

    /// Waits for the token.
    pub async fn acquire(&self) -> PacingToken {
        PacingToken {
            guard: Arc::clone(&self.bucket).lock_owned().await,
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacingToken {
    /// Refills the bucket `delay` from now without blocking the caller.
    pub fn release_after(self, delay: Duration) {
        if delay.is_zero() {
            return;
        }

        let guard = self.guard;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            drop(guard);
        });
    }
}

/// Pacing state shared by one mapping's acceptor and all of its sessions.
#[derive(Debug)]
pub struct Pacing {
    admission: Pacer,
    forwarding: Pacer,
    admission_delay: Duration,
    forward_delay: Duration,
}

impl Pacing {
    pub fn new(admission_delay: Duration, forward_delay: Duration) -> Self {
        Self {
            admission: Pacer::new(),
            forwarding: Pacer::new(),
            admission_delay,
            forward_delay,
        }
    }

    pub fn from_config(config: &PacingConfig) -> Self {
        Self::new(config.admission_delay(), config.forward_delay())
    }

    /// Waits until this mapping may admit another connection.
    pub async fn acquire_admission(&self) -> PacingToken {
        self.admission.acquire().await
    }

    /// Schedules the admission token's return after the admission delay.
    pub fn release_admission(&self, token: PacingToken) {
        token.release_after(self.admission_delay);
    }

    /// Waits until this mapping may forward another client packet.
    pub async fn acquire_forward(&self) -> PacingToken {
        self.forwarding.acquire().await
    }

    /// Schedules the forwarding token's return after the forward delay.
    pub fn release_forward(&self, token: PacingToken) {
        token.release_after(self.forward_delay);
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::new(DEFAULT_PACING_DELAY, DEFAULT_PACING_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn is_available(pacer: &Pacer) -> bool {
        pacer.bucket.try_lock().is_ok()
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_returns_after_delay() {
        let pacer = Pacer::new();
        let start = Instant::now();

        let token = pacer.acquire().await;
        assert!(!is_available(&pacer));
        token.release_after(Duration::from_millis(10));

        let _token = pacer.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_token_returns_immediately() {
        let pacer = Pacer::new();
        let start = Instant::now();

        drop(pacer.acquire().await);
        assert!(is_available(&pacer));

        let _token = pacer.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_does_not_block() {
        let pacer = Pacer::new();
        pacer.acquire().await.release_after(Duration::ZERO);
        assert!(is_available(&pacer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_does_not_block_holder() {
        let pacer = Pacer::new();
        let start = Instant::now();

        pacer.acquire().await.release_after(Duration::from_secs(5));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!is_available(&pacer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_are_spaced() {
        let pacing = Arc::new(Pacing::default());
        let start = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let pacing = Arc::clone(&pacing);
                tokio::spawn(async move {
                    let token = pacing.acquire_forward().await;
                    let at = start.elapsed();
                    pacing.release_forward(token);
                    at
                })
            })
            .collect();

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }
        times.sort();

        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= DEFAULT_PACING_DELAY);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_served_in_order() {
        let pacer = Pacer::new();
        let held = pacer.acquire().await;
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..4 {
            let pacer = pacer.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let token = pacer.acquire().await;
                order.lock().unwrap().push(id);
                token.release_after(Duration::from_millis(5));
            }));
            // Let each waiter queue up before the next one starts
            tokio::task::yield_now().await;
        }

        held.release_after(Duration::from_millis(5));
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gates_are_independent() {
        let pacing = Pacing::default();
        let start = Instant::now();

        let admission = pacing.acquire_admission().await;
        pacing.release_admission(admission);

        let forward = pacing.acquire_forward().await;
        pacing.release_forward(forward);

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_from_config() {
        let pacing = Pacing::from_config(&PacingConfig {
            admission_delay_ms: 3,
            forward_delay_ms: 7,
        });
        assert_eq!(pacing.admission_delay, Duration::from_millis(3));
        assert_eq!(pacing.forward_delay, Duration::from_millis(7));
    }
}
