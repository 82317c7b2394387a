//! Terminal progress bar as a [`ProgressObserver`].

use crate::models::ProgressObserver;
use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}";

/// Drives an `indicatif` bar from dispatch and evaluation progress.
#[derive(Debug, Clone)]
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar().template(TEMPLATE) {
            bar.set_style(style.progress_chars("##-"));
        }
        Self { bar }
    }

    /// Progress bar that draws nothing, for quiet runs.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.bar.finish_with_message(message.into());
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for IndicatifProgress {
    fn set_total(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
    }

    fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    fn increment(&self) {
        self.bar.inc(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_reset_position() {
        let progress = IndicatifProgress::hidden();
        progress.set_total(4);
        progress.increment();
        progress.increment();
        assert_eq!(progress.position(), 2);

        progress.set_total(1);
        assert_eq!(progress.position(), 0);
    }
}
