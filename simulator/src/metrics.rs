//! What a scenario run observed.
//!
//! Every contended operation is recorded with how long it waited and how it
//! ended; guarantee breaches are kept with their description. A scenario
//! passes when it recorded no violations.

use std::time::Duration;

use serde::Serialize;

/// How a contended operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The lock or permits were granted within the wait budget.
    Granted,
    /// The wait budget ran out first.
    TimedOut,
}

/// Wait times of operations with the same outcome.
#[derive(Debug, Clone, Default)]
struct WaitSamples {
    waits: Vec<Duration>,
}

impl WaitSamples {
    fn summary(&self) -> WaitSummary {
        if self.waits.is_empty() {
            return WaitSummary::default();
        }

        let mut sorted = self.waits.clone();
        sorted.sort_unstable();
        let total: Duration = sorted.iter().sum();

        WaitSummary {
            count: sorted.len(),
            min_ms: millis(sorted[0]),
            mean_ms: millis(total / sorted.len() as u32),
            p50_ms: millis(nearest_rank(&sorted, 50)),
            p99_ms: millis(nearest_rank(&sorted, 99)),
            max_ms: millis(sorted[sorted.len() - 1]),
        }
    }
}

/// `pct`-th percentile of a sorted, non-empty slice.
fn nearest_rank(sorted: &[Duration], pct: usize) -> Duration {
    let rank = (sorted.len() * pct + 99) / 100;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Wait distribution of one outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WaitSummary {
    pub count: usize,
    pub min_ms: u64,
    pub mean_ms: u64,
    pub p50_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Collects observations while one scenario runs.
#[derive(Debug, Default)]
pub struct ScenarioRecorder {
    granted: WaitSamples,
    timed_out: WaitSamples,
    violations: Vec<String>,
}

impl ScenarioRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one contended operation.
    pub fn record(&mut self, outcome: Outcome, waited: Duration) {
        match outcome {
            Outcome::Granted => self.granted.waits.push(waited),
            Outcome::TimedOut => self.timed_out.waits.push(waited),
        }
    }

    /// Record a broken guarantee.
    pub fn violation(&mut self, what: impl Into<String>) {
        self.violations.push(what.into());
    }

    /// Summarize what was recorded so far.
    pub fn report(&self, scenario: &str, elapsed: Duration) -> ScenarioReport {
        ScenarioReport {
            scenario: scenario.to_string(),
            elapsed_ms: millis(elapsed),
            granted: self.granted.summary(),
            timed_out: self.timed_out.summary(),
            violations: self.violations.clone(),
        }
    }
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub elapsed_ms: u64,
    /// Waits that ended in a grant.
    pub granted: WaitSummary,
    /// Waits that ran out of budget.
    pub timed_out: WaitSummary,
    pub violations: Vec<String>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Share of operations that were granted.
    pub fn grant_rate(&self) -> f64 {
        let total = self.granted.count + self.timed_out.count;
        if total == 0 {
            return 0.0;
        }
        self.granted.count as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_waits_split_by_outcome() {
        let mut recorder = ScenarioRecorder::new();
        recorder.record(Outcome::Granted, ms(200));
        recorder.record(Outcome::Granted, ms(100));
        recorder.record(Outcome::Granted, ms(150));
        recorder.record(Outcome::TimedOut, ms(10_000));

        let report = recorder.report("mutex-contention", ms(12_000));
        assert_eq!(
            report.granted,
            WaitSummary {
                count: 3,
                min_ms: 100,
                mean_ms: 150,
                p50_ms: 150,
                p99_ms: 200,
                max_ms: 200,
            }
        );
        assert_eq!(report.timed_out.count, 1);
        assert_eq!(report.timed_out.max_ms, 10_000);
        assert_eq!(report.grant_rate(), 0.75);
        assert!(report.passed());
    }

    #[test]
    fn test_violation_fails_the_report() {
        let mut recorder = ScenarioRecorder::new();
        recorder.record(Outcome::Granted, ms(5));
        recorder.violation("two workers inside the mutex");

        let report = recorder.report("mutex-contention", ms(20));
        assert!(!report.passed());
        assert_eq!(report.violations, vec!["two workers inside the mutex"]);
    }

    #[test]
    fn test_empty_run_reports_zeroes() {
        let report = ScenarioRecorder::new().report("lease-expiry", Duration::ZERO);
        assert_eq!(report.granted, WaitSummary::default());
        assert_eq!(report.grant_rate(), 0.0);
        assert!(report.passed());
    }

    #[test]
    fn test_tail_percentile_picks_slowest_of_many() {
        let mut recorder = ScenarioRecorder::new();
        for n in 1..=100 {
            recorder.record(Outcome::Granted, ms(n));
        }

        let summary = recorder.report("fair-order", ms(1)).granted;
        assert_eq!(summary.p50_ms, 50);
        assert_eq!(summary.p99_ms, 99);
        assert_eq!(summary.max_ms, 100);
    }
}
