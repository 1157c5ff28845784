use indicatif::{ProgressBar, ProgressStyle};

pub trait ProgressReporter: Send {
    /// Permanently silences this reporter.
    fn disable(&mut self);
    fn is_enabled(&self) -> bool;
    fn start_epoch(&mut self, epoch: usize, steps: usize);
    fn advance(&mut self, message: &str);
    fn finish(&mut self);
}

/// Terminal progress bar, one bar per epoch.
pub struct ProgressBarCallback {
    enabled: bool,
    bar: Option<ProgressBar>,
}

impl Default for ProgressBarCallback {
    fn default() -> Self {
        Self {
            enabled: true,
            bar: None,
        }
    }
}

impl ProgressBarCallback {
    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}

impl ProgressReporter for ProgressBarCallback {
    fn disable(&mut self) {
        self.enabled = false;
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn start_epoch(&mut self, epoch: usize, steps: usize) {
        if !self.enabled {
            return;
        }
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
        let bar = ProgressBar::new(steps as u64);
        bar.set_style(Self::style());
        bar.set_message(format!("epoch {epoch}"));
        self.bar = Some(bar);
    }

    fn advance(&mut self, message: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(message.to_string());
            bar.inc(1);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message("done");
        }
    }
}

/// Reporter that never draws anything.
#[derive(Debug, Default)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn disable(&mut self) {}

    fn is_enabled(&self) -> bool {
        false
    }

    fn start_epoch(&mut self, _epoch: usize, _steps: usize) {}

    fn advance(&mut self, _message: &str) {}

    fn finish(&mut self) {}
}
