//! Terminal progress for the DAG run.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Overall task progress bar, updated by the scheduler between waves.
pub struct DagProgress {
    bar: ProgressBar,
}

impl DagProgress {
    pub fn new(total: usize, visible: bool) -> Self {
        let bar = ProgressBar::new(total as u64);
        if !visible {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("█▓▒░"),
        );
        bar.set_prefix("Tasks");
        Self { bar }
    }

    pub fn update(&self, approved: usize, total: usize, in_flight: &[String]) {
        self.bar.set_length(total as u64);
        self.bar.set_position(approved as u64);
        if in_flight.is_empty() {
            self.bar.set_message(String::new());
        } else {
            self.bar.set_message(format!("running: {}", in_flight.join(", ")));
        }
    }

    pub fn finish(&self, msg: &str) {
        self.bar.finish_with_message(msg.to_string());
    }
}
