use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;
use tracing::info;

use super::RunSummary;

/// Surfaces harvest progress: an optional terminal bar plus periodic
/// structured log lines.
pub struct ProgressReporter {
    bar: Option<ProgressBar>,
    log_every: usize,
    total_set: bool,
}

impl ProgressReporter {
    pub fn new(show_bar: bool, log_every: usize) -> Self {
        Self {
            bar: show_bar.then(make_progress_bar),
            log_every,
            total_set: false,
        }
    }

    pub fn hidden(log_every: usize) -> Self {
        Self::new(false, log_every)
    }

    /// First reported total wins; later pages may disagree.
    pub fn set_total(&mut self, total: u64) {
        if self.total_set {
            return;
        }
        self.total_set = true;
        if let Some(pb) = self.bar.as_ref() {
            pb.set_length(total.max(1));
        }
        info!(total_elements = total, "Catalog size reported by upstream");
    }

    /// Returns true when a periodic progress line was logged.
    pub fn item_done(&self, summary: &RunSummary, id: i64, registration: Option<&str>) -> bool {
        if let Some(pb) = self.bar.as_ref() {
            pb.inc(1);
            pb.set_message(format!("id {} | insc {}", id, registration.unwrap_or("-")));
        }

        if self.log_every == 0 || summary.total_processed == 0 || summary.total_processed % self.log_every != 0 {
            return false;
        }
        self.log(|| {
            info!(
                total_processed = summary.total_processed,
                inserted = summary.inserted,
                updated = summary.updated,
                "Progress"
            )
        });
        true
    }

    pub fn finish(&self, summary: &RunSummary) {
        if let Some(pb) = self.bar.as_ref() {
            pb.finish_with_message(format!(
                "Done: {} processed ({} new, {} updated, {} partial)",
                summary.total_processed, summary.inserted, summary.updated, summary.detail_failures
            ));
        }
    }

    fn log(&self, f: impl FnOnce()) {
        match self.bar.as_ref() {
            Some(pb) => pb.suspend(f),
            None => f(),
        }
    }
}

fn make_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "SENASA [{bar:40}] {percent}% | {pos}/{len} ({eta}) | {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(12));
    pb.enable_steady_tick(Duration::from_millis(250));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(processed: usize) -> RunSummary {
        RunSummary {
            total_processed: processed,
            ..Default::default()
        }
    }

    #[test]
    fn test_logs_every_nth_item() {
        let reporter = ProgressReporter::hidden(20);
        assert!(!reporter.item_done(&summary(1), 1, None));
        assert!(!reporter.item_done(&summary(19), 19, Some("100")));
        assert!(reporter.item_done(&summary(20), 20, None));
        assert!(reporter.item_done(&summary(40), 40, None));
    }

    #[test]
    fn test_zero_interval_never_logs() {
        let reporter = ProgressReporter::hidden(0);
        assert!(!reporter.item_done(&summary(20), 20, None));
    }

    #[test]
    fn test_total_only_set_once() {
        let mut reporter = ProgressReporter::hidden(20);
        reporter.set_total(250);
        assert!(reporter.total_set);
        reporter.set_total(10);
        reporter.finish(&summary(2));
    }
}
