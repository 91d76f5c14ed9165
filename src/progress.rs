//! Cosmetic progress estimation for a job in flight.
//!
//! The estimate blends two models: a weighted stage table walked at a constant
//! rate across the minimum processing duration, and a straight time fraction
//! that caps it. Neither reflects backend progress.

use crate::model::ProgressEstimate;
use std::time::Duration;

pub struct Stage {
    pub name: &'static str,
    pub weight: u32,
}

/// Weights sum to 100.
pub const STAGES: &[Stage] = &[
    Stage { name: "Initializing scan data", weight: 10 },
    Stage { name: "Preprocessing image", weight: 15 },
    Stage { name: "Analyzing brain regions", weight: 20 },
    Stage { name: "Running AI model", weight: 25 },
    Stage { name: "Generating predictions", weight: 20 },
    Stage { name: "Compiling results", weight: 10 },
];

pub const COMPLETED_LABEL: &str = "Analysis complete";

/// Compute the estimate for `elapsed` time since job creation.
pub fn estimate(elapsed: Duration, min_duration: Duration) -> ProgressEstimate {
    let total = min_duration.as_secs_f64();
    let fraction = if total <= 0.0 {
        1.0
    } else {
        (elapsed.as_secs_f64() / total).clamp(0.0, 1.0)
    };

    let n = STAGES.len();
    let scaled = fraction * n as f64;
    let index = (scaled.floor() as usize).min(n - 1);
    let within = (scaled - index as f64).clamp(0.0, 1.0);

    let completed: u32 = STAGES[..index].iter().map(|s| s.weight).sum();
    let stage_model = completed as f64 + STAGES[index].weight as f64 * within;
    let time_cap = fraction * 100.0;

    // floor, so 100 is only reported once the full duration has elapsed
    let percent = stage_model.min(time_cap).clamp(0.0, 100.0).floor() as u8;
    ProgressEstimate::new(percent, STAGES[index].name)
}

/// Monotonic wrapper around [`estimate`] for one job.
#[derive(Debug, Clone)]
pub struct ProgressClock {
    min_duration: Duration,
    current: ProgressEstimate,
}

impl ProgressClock {
    pub fn new(min_duration: Duration) -> Self {
        Self {
            min_duration,
            current: estimate(Duration::ZERO, min_duration),
        }
    }

    /// Recompute from elapsed time. Never moves backward.
    pub fn advance(&mut self, elapsed: Duration) -> &ProgressEstimate {
        let next = estimate(elapsed, self.min_duration);
        if next.percent >= self.current.percent {
            self.current = next;
        }
        &self.current
    }

    pub fn complete(&mut self) -> &ProgressEstimate {
        self.current = ProgressEstimate::new(100, COMPLETED_LABEL);
        &self.current
    }

    pub fn current(&self) -> &ProgressEstimate {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(16);

    #[test]
    fn stage_weights_sum_to_one_hundred() {
        assert_eq!(STAGES.iter().map(|s| s.weight).sum::<u32>(), 100);
    }

    #[test]
    fn starts_at_zero_in_first_stage() {
        let e = estimate(Duration::ZERO, MIN);
        assert_eq!(e.percent, 0);
        assert_eq!(e.stage_label, "Initializing scan data");
    }

    #[test]
    fn stays_below_one_hundred_until_minimum_elapses() {
        let e = estimate(MIN - Duration::from_millis(1), MIN);
        assert!(e.percent < 100);
        assert_eq!(e.stage_label, "Compiling results");
        assert_eq!(estimate(MIN, MIN).percent, 100);
        assert_eq!(estimate(MIN * 3, MIN).percent, 100);
    }

    #[test]
    fn time_fraction_caps_stage_model() {
        // Just under two thirds in: stage model is ~70 (10+15+20+25), time says 66.
        let e = estimate(MIN * 2 / 3, MIN);
        assert_eq!(e.percent, 66);
        assert_eq!(e.stage_label, "Running AI model");
    }

    #[test]
    fn stage_model_lags_time_early_on() {
        // Halfway: stages 0..3 complete = 45, time cap = 50.
        let e = estimate(MIN / 2, MIN);
        assert_eq!(e.percent, 45);
        assert_eq!(e.stage_label, "Running AI model");
    }

    #[test]
    fn clock_is_monotonic_across_ticks() {
        let mut clock = ProgressClock::new(MIN);
        let mut last = 0;
        for ms in (0..20_000).step_by(300) {
            let p = clock.advance(Duration::from_millis(ms)).percent;
            assert!(p >= last, "progress went backward at {ms}ms");
            assert!(p <= 100);
            last = p;
        }
        assert_eq!(last, 100);
        // An earlier elapsed value never lowers the estimate.
        assert_eq!(clock.advance(Duration::from_secs(1)).percent, 100);
    }

    #[test]
    fn zero_minimum_duration_is_immediately_full() {
        assert_eq!(estimate(Duration::ZERO, Duration::ZERO).percent, 100);
    }

    #[test]
    fn complete_forces_one_hundred() {
        let mut clock = ProgressClock::new(MIN);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.complete().percent, 100);
        assert_eq!(clock.current().stage_label, COMPLETED_LABEL);
    }
}
