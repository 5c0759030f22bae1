// 进度显示
use crate::transfer::task::{format_speed, TransferEvent, TransferStatus};
use crossbeam_channel::Receiver;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

/// Terminal progress bar fed by transfer events.
pub struct ProgressTracker {
    progress_bar: ProgressBar,
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
}

impl ProgressTracker {
    pub fn new(total_size: u64, description: &str) -> Self {
        let progress_bar = ProgressBar::new(total_size);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        progress_bar.set_style(style);
        progress_bar.set_message(description.to_string());

        let now = Instant::now();
        Self {
            progress_bar,
            start_time: now,
            last_update_time: now,
            last_bytes: 0,
        }
    }

    pub fn hidden() -> Self {
        let tracker = Self::new(0, "");
        tracker.progress_bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        tracker
    }

    pub fn apply(&mut self, event: &TransferEvent) {
        if self.progress_bar.length() != Some(event.total) {
            self.progress_bar.set_length(event.total);
        }
        self.update(event.transferred);
    }

    pub fn update(&mut self, bytes_transferred: u64) {
        self.progress_bar.set_position(bytes_transferred);
        self.update_speed(bytes_transferred);
    }

    pub fn position(&self) -> u64 {
        self.progress_bar.position()
    }

    pub fn finish(&self) {
        let total = self.progress_bar.position();
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let avg_speed = if elapsed > 0.0 { total as f64 / elapsed } else { total as f64 };

        self.progress_bar.finish_with_message(format!(
            "Transfer completed (avg speed: {})",
            format_speed(avg_speed)
        ));
    }

    pub fn finish_with_error(&self, error: &str) {
        self.progress_bar
            .abandon_with_message(format!("Transfer failed: {}", error));
    }

    pub fn finish_cancelled(&self) {
        self.progress_bar.abandon_with_message("Transfer cancelled");
    }

    // 每200ms更新一次速度，避免太频繁刷新
    fn update_speed(&mut self, current_bytes: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time);
        if elapsed < Duration::from_millis(200) {
            return;
        }

        let bytes_diff = current_bytes.saturating_sub(self.last_bytes);
        let speed = bytes_diff as f64 / elapsed.as_secs_f64();
        self.progress_bar.set_message(format_speed(speed));

        self.last_update_time = now;
        self.last_bytes = current_bytes;
    }
}

/// Feeds `events` into `tracker` until the task ends; returns the final status.
pub fn follow(events: &Receiver<TransferEvent>, tracker: &mut ProgressTracker) -> Option<TransferStatus> {
    for event in events.iter() {
        tracker.apply(&event);
        if event.status.is_terminal() {
            return Some(event.status);
        }
    }
    None
}
