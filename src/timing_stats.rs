use std::{collections::HashMap, time::Instant};

use tracing::{debug, warn};

const TIMING_ACCUMULATOR_SIZE: usize = 120;

/// Rolling per-frame timings for one encode worker, reported at debug level
/// every [`TIMING_ACCUMULATOR_SIZE`] frames.
pub struct TimingStats {
    last_frame: Option<Instant>,
    label: String,
    accumulator: Vec<u32>,

    trackers: HashMap<&'static str, Instant>,
    spans: HashMap<&'static str, Vec<u32>>,
    values: HashMap<&'static str, (Vec<u32>, &'static str)>,
}

fn micros_since(instant: Instant) -> u32 {
    instant.elapsed().as_micros().min(u32::MAX as u128) as u32
}

fn mean(values: &[u32]) -> f32 {
    if values.is_empty() {
        return 0.;
    }
    values.iter().map(|&v| v as u64).sum::<u64>() as f32 / values.len() as f32
}

impl TimingStats {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_frame: None,
            accumulator: Vec::with_capacity(TIMING_ACCUMULATOR_SIZE),
            trackers: HashMap::new(),
            spans: HashMap::new(),
            values: HashMap::new(),
        }
    }

    /// Mark a frame boundary. Returns true when this tick emitted a report.
    pub fn tick(&mut self) -> bool {
        if let Some(last_frame) = self.last_frame {
            self.accumulator.push(micros_since(last_frame));
        }
        self.last_frame = Some(Instant::now());

        if self.accumulator.len() < TIMING_ACCUMULATOR_SIZE {
            return false;
        }

        let average = mean(&self.accumulator);
        debug!(
            stats = %self.label,
            frame_us = average,
            fps = format_args!("{:.2}", 1_000_000f32 / average.max(1.)),
            "encode timing"
        );
        for (label, spans) in &self.spans {
            debug!(stats = %self.label, span = label, us = mean(spans), "encode timing");
        }
        for (label, (values, unit)) in &self.values {
            debug!(stats = %self.label, value = label, mean = mean(values), unit, "encode timing");
        }

        self.spans.clear();
        self.trackers.clear();
        self.accumulator.clear();
        self.values.clear();
        true
    }

    pub fn start(&mut self, label: &'static str) {
        if self.trackers.contains_key(label) {
            warn!(stats = %self.label, label, "ignoring start, timer already running");
            return;
        }
        self.trackers.insert(label, Instant::now());
    }

    pub fn end(&mut self, label: &'static str) {
        let Some(started) = self.trackers.remove(label) else {
            warn!(stats = %self.label, label, "ignoring end, no such timer");
            return;
        };
        self.spans.entry(label).or_default().push(micros_since(started));
    }

    pub fn track(&mut self, label: &'static str, value: u32, unit: &'static str) {
        let entry = self.values.entry(label).or_insert_with(|| (Vec::new(), unit));
        entry.0.push(value);
        entry.1 = unit;
    }

    /// Frames recorded since the last report.
    pub fn pending(&self) -> usize {
        self.accumulator.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_every_accumulator_window() {
        let mut stats = TimingStats::new("test");
        // The first tick only starts the clock.
        assert!(!stats.tick());
        for _ in 0..TIMING_ACCUMULATOR_SIZE - 1 {
            assert!(!stats.tick());
        }
        assert!(stats.tick());
        assert_eq!(stats.pending(), 0);
    }

    #[test]
    fn unmatched_end_is_ignored() {
        let mut stats = TimingStats::new("test");
        stats.end("encode");
        assert!(stats.spans.is_empty());

        stats.start("encode");
        stats.start("encode");
        stats.end("encode");
        assert_eq!(stats.spans["encode"].len(), 1);
    }

    #[test]
    fn tracked_values_keep_the_latest_unit() {
        let mut stats = TimingStats::new("test");
        stats.track("size", 10, "bytes");
        stats.track("size", 20, "bits");
        assert_eq!(stats.values["size"], (vec![10, 20], "bits"));
        assert_eq!(mean(&stats.values["size"].0), 15.);
    }
}
