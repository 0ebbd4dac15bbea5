use std::time::{Duration, Instant};

/// Wall-clock cadence for forced keyframes. Polled once per frame by the
/// encode worker; never blocks.
#[derive(Debug, Clone)]
pub struct ForceKeyframeTimer {
    interval: Duration,
    last: Instant,
}

impl ForceKeyframeTimer {
    pub fn start(interval: Duration) -> Self {
        Self::start_at(interval, Instant::now())
    }

    pub fn start_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn has_elapsed(&mut self) -> bool {
        self.has_elapsed_at(Instant::now())
    }

    /// True once per elapsed interval. The next period starts at `now`, so a
    /// stalled producer gets one keyframe, not a burst.
    pub fn has_elapsed_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) < self.interval {
            return false;
        }
        self.last = now;
        true
    }
}
