//! SSH keepalive loop

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something that can prove the session is still alive
#[async_trait]
pub trait KeepaliveProbe: Send + Sync {
    async fn ping(&self) -> Result<(), String>;
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    Cancelled,
    /// The retry budget ran out
    Dead { failures: u32 },
}

/// Ping right away and then every `interval` until cancelled or until
/// `retries` consecutive pings have failed.
pub async fn run(
    probe: &dyn KeepaliveProbe,
    interval: Duration,
    retries: u32,
    cancel: &CancellationToken,
) -> KeepaliveOutcome {
    let retries = retries.max(1);
    let mut failures = 0u32;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("SSH keepalive started: interval={:?}, retries={}", interval, retries);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return KeepaliveOutcome::Cancelled,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return KeepaliveOutcome::Cancelled,
            result = probe.ping() => result,
        };

        match result {
            Ok(()) => {
                if failures > 0 {
                    info!("SSH keepalive recovered after {} failures", failures);
                }
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                warn!("SSH keepalive failed ({}/{}): {}", failures, retries, e);
                if failures >= retries {
                    return KeepaliveOutcome::Dead { failures };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    struct ScriptedProbe {
        replies: Mutex<VecDeque<bool>>,
        pings: Mutex<Vec<Instant>>,
    }

    impl ScriptedProbe {
        fn new(replies: &[bool]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().copied().collect()),
                pings: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl KeepaliveProbe for ScriptedProbe {
        async fn ping(&self) -> Result<(), String> {
            self.pings.lock().push(Instant::now());
            match self.replies.lock().pop_front() {
                Some(false) => Err("no reply".to_string()),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_after_consecutive_failures() {
        let probe = ScriptedProbe::new(&[true, false, true, false, false, false]);
        let started = Instant::now();

        let outcome = run(&probe, Duration::from_secs(10), 3, &CancellationToken::new()).await;
        assert_eq!(outcome, KeepaliveOutcome::Dead { failures: 3 });

        let pings = probe.pings.lock();
        assert_eq!(pings.len(), 6);
        assert_eq!(pings[0], started);
        assert_eq!(pings[5] - started, Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_loop() {
        let probe = ScriptedProbe::new(&[]);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            canceller.cancel();
        });

        let outcome = run(&probe, Duration::from_secs(10), 3, &cancel).await;
        assert_eq!(outcome, KeepaliveOutcome::Cancelled);
        assert_eq!(probe.pings.lock().len(), 3);
    }
}
