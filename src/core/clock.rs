use async_trait::async_trait;
use std::time::Duration;

/// Source of the scripted delays in progress simulation.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real timer backed by the tokio runtime. Under `tokio::time::pause` it
/// follows virtual time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that never waits. Useful where only step ordering matters.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantClock;

#[async_trait]
impl Clock for InstantClock {
    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_virtual_time() {
        let start = Instant::now();
        TokioClock.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_clock_does_not_advance() {
        let start = Instant::now();
        InstantClock.sleep(Duration::from_secs(30)).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
