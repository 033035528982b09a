use serde::{Deserialize, Serialize};

use crate::history::Outcome;

/// Outcome tallies, per run and cumulative across continuous-mode runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Metrics {
    pub runs: u64,
    pub posts_processed: u64,
    pub posted: u64,
    pub skipped_duplicate: u64,
    pub skipped_filtered: u64,
    pub failed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one processed post
    pub fn record(&mut self, outcome: Outcome) {
        self.posts_processed += 1;
        match outcome {
            Outcome::Posted => self.posted += 1,
            Outcome::SkippedDuplicate => self.skipped_duplicate += 1,
            Outcome::SkippedFiltered => self.skipped_filtered += 1,
            Outcome::Failed => self.failed += 1,
        }
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Posted => self.posted,
            Outcome::SkippedDuplicate => self.skipped_duplicate,
            Outcome::SkippedFiltered => self.skipped_filtered,
            Outcome::Failed => self.failed,
        }
    }

    /// Fold a finished run into the cumulative totals
    pub fn absorb(&mut self, run: &Metrics) {
        self.runs += 1;
        self.posts_processed += run.posts_processed;
        self.posted += run.posted;
        self.skipped_duplicate += run.skipped_duplicate;
        self.skipped_filtered += run.skipped_filtered;
        self.failed += run.failed;
    }

    /// Share of attempted replies that were posted, as a percentage.
    /// Skips do not count as attempts.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.posted + self.failed;
        if attempts == 0 {
            return 100.0;
        }
        (self.posted as f64 / attempts as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.posts_processed, 0);
        assert_eq!(metrics.success_rate(), 100.0);
    }

    #[test]
    fn test_record_outcomes() {
        let mut metrics = Metrics::new();
        metrics.record(Outcome::Posted);
        metrics.record(Outcome::Posted);
        metrics.record(Outcome::Failed);
        metrics.record(Outcome::SkippedFiltered);

        assert_eq!(metrics.posts_processed, 4);
        assert_eq!(metrics.count(Outcome::Posted), 2);
        assert_eq!(metrics.count(Outcome::SkippedDuplicate), 0);
        assert!((metrics.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_absorb_runs() {
        let mut run = Metrics::new();
        run.record(Outcome::Posted);
        run.record(Outcome::SkippedDuplicate);

        let mut total = Metrics::new();
        total.absorb(&run);
        total.absorb(&run);
        assert_eq!(total.runs, 2);
        assert_eq!(total.posts_processed, 4);
        assert_eq!(total.posted, 2);
        assert_eq!(total.skipped_duplicate, 2);
    }
}
