use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Keepalive timer owned by one session
#[derive(Debug)]
pub(crate) struct Heartbeat {
    period: Duration,
    ticker: Option<Interval>,
}

impl Heartbeat {
    /// Creates a stopped heartbeat
    pub(crate) fn new(period: Duration) -> Self {
        Heartbeat {
            period,
            ticker: None,
        }
    }

    /// Starts ticking one period from now; no-op when already running
    pub(crate) fn start(&mut self) {
        if self.ticker.is_some() {
            return;
        }
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
    }

    /// Stops the heartbeat
    pub(crate) fn stop(&mut self) {
        self.ticker = None;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Resolves at the next beat; never resolves while stopped
    pub(crate) async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_one_period() {
        let mut heartbeat = Heartbeat::new(Duration::from_secs(20));
        heartbeat.start();

        let started = Instant::now();
        heartbeat.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(20));

        heartbeat.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_keeps_schedule() {
        let mut heartbeat = Heartbeat::new(Duration::from_secs(20));
        heartbeat.start();
        let started = Instant::now();

        tokio::time::advance(Duration::from_secs(15)).await;
        heartbeat.start();
        heartbeat.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_heartbeat_never_ticks() {
        let mut heartbeat = Heartbeat::new(Duration::from_secs(1));
        heartbeat.start();
        heartbeat.stop();
        assert!(!heartbeat.is_running());
        assert!(timeout(Duration::from_secs(60), heartbeat.tick()).await.is_err());
    }
}
