use std::time::{Duration, Instant};

/// Presentation cadence limiter.
///
/// Blocks keep being analysed at the source rate; the clock only decides
/// which of the resulting frames reach the sink.
#[derive(Debug, Clone)]
pub struct FrameClock {
    interval: Option<Duration>,
    next_due: Option<Instant>,
}

impl FrameClock {
    /// `None` or zero presents every frame.
    pub fn new(max_fps: Option<u32>) -> Self {
        let interval = max_fps
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_secs_f64(1.0 / f64::from(fps)));
        Self {
            interval,
            next_due: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Whether a frame finished at `now` should be presented.
    pub fn should_present(&mut self, now: Instant) -> bool {
        let Some(interval) = self.interval else {
            return true;
        };

        match self.next_due {
            Some(due) if now < due => false,
            Some(due) => {
                let next = due + interval;
                // Resynchronise after a long gap instead of bursting.
                self.next_due = Some(if next <= now { now + interval } else { next });
                true
            }
            None => {
                self.next_due = Some(now + interval);
                true
            }
        }
    }
}

/// Tracks periods in which the source delivers nothing.
#[derive(Debug, Clone)]
pub struct StallMonitor {
    timeout: Duration,
    stalled_since: Option<Instant>,
    stalls: u64,
}

impl StallMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            stalled_since: None,
            stalls: 0,
        }
    }

    /// How long the consumer waits before declaring a stall.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of distinct stall episodes seen so far.
    pub fn stalls(&self) -> u64 {
        self.stalls
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_since.is_some()
    }

    /// Records a wait that ran into the timeout. Returns `true` when this
    /// starts a new stall episode.
    pub fn on_timeout(&mut self, now: Instant) -> bool {
        if self.stalled_since.is_some() {
            return false;
        }
        self.stalled_since = Some(now.checked_sub(self.timeout).unwrap_or(now));
        self.stalls += 1;
        tracing::warn!(
            timeout_ms = self.timeout.as_millis() as u64,
            stalls = self.stalls,
            "frame source stalled"
        );
        true
    }

    /// Records a delivered block, ending any stall in progress.
    pub fn on_block(&mut self, now: Instant) {
        if let Some(since) = self.stalled_since.take() {
            tracing::info!(
                stalled_ms = now.saturating_duration_since(since).as_millis() as u64,
                "frame source resumed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unthrottled_clock_presents_everything() {
        let mut clock = FrameClock::new(None);
        let start = Instant::now();
        assert!((0..10).all(|i| clock.should_present(start + Duration::from_micros(i))));
        assert!(FrameClock::new(Some(0)).interval().is_none());
    }

    #[test]
    fn throttle_limits_rate_without_drift() {
        // 100 blocks per second offered to a 30 fps clock for two seconds.
        let mut clock = FrameClock::new(Some(30));
        let start = Instant::now();
        let presented = (0..200)
            .filter(|i| clock.should_present(start + Duration::from_millis(i * 10)))
            .count();
        assert!((58..=61).contains(&presented), "presented {presented}");
    }

    #[test]
    fn throttle_resynchronises_after_gap() {
        let mut clock = FrameClock::new(Some(10));
        let start = Instant::now();
        assert!(clock.should_present(start));
        assert!(clock.should_present(start + Duration::from_secs(5)));
        assert!(!clock.should_present(start + Duration::from_millis(5050)));
        assert!(clock.should_present(start + Duration::from_millis(5100)));
    }

    #[test]
    fn stall_episodes_are_counted_once() {
        let mut monitor = StallMonitor::new(Duration::from_millis(100));
        let start = Instant::now();

        assert!(monitor.on_timeout(start));
        assert!(!monitor.on_timeout(start + Duration::from_millis(100)));
        assert!(monitor.is_stalled());

        monitor.on_block(start + Duration::from_millis(150));
        assert!(!monitor.is_stalled());
        assert!(monitor.on_timeout(start + Duration::from_millis(400)));
        assert_eq!(monitor.stalls(), 2);
    }
}
