use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

/// Observer for reporting incremental progress of long sampling runs.
///
/// Implementations are shared across the worker threads that run chains, so
/// every hook takes `&self`.
pub trait SamplingProgress: Sync {
    fn on_start(&self, label: &str, total: u64) {
        let _ = (label, total);
    }
    fn on_advance(&self, delta: u64) {
        let _ = delta;
    }
    fn on_finish(&self) {}
}

#[derive(Default)]
pub struct NoopProgress;

impl SamplingProgress for NoopProgress {}

/// Terminal progress bar. Hidden when stderr is not a terminal.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplingProgress for BarProgress {
    fn on_start(&self, label: &str, total: u64) {
        self.bar.reset();
        self.bar.set_length(total);
        self.bar.set_message(label.to_string());
    }

    fn on_advance(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn on_finish(&self) {
        self.bar.finish_and_clear();
    }
}
