// 传输任务：状态机与进度指标
use crate::utils::error::TransferError;
use std::fmt;
use std::time::{Duration, Instant};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => f.write_str("upload"),
            TransferDirection::Download => f.write_str("download"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    /// Allowed edges of the lifecycle. Terminal states have none.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::InProgress => "in progress",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Progress notification, one per chunk plus one per status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub task_id: TaskId,
    pub transferred: u64,
    pub total: u64,
    pub status: TransferStatus,
}

/// Snapshot of a single file transfer.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: TaskId,
    pub direction: TransferDirection,
    pub source: String,
    pub destination: String,
    total_size: u64,
    status: TransferStatus,
    transferred_bytes: u64,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    error: Option<TransferError>,
}

impl TransferTask {
    pub(crate) fn new(
        id: TaskId,
        direction: TransferDirection,
        source: String,
        destination: String,
        total_size: u64,
    ) -> Self {
        Self {
            id,
            direction,
            source,
            destination,
            total_size,
            status: TransferStatus::Pending,
            transferred_bytes: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub fn error(&self) -> Option<&TransferError> {
        self.error.as_ref()
    }

    pub fn event(&self) -> TransferEvent {
        TransferEvent {
            task_id: self.id,
            transferred: self.transferred_bytes,
            total: self.total_size,
            status: self.status,
        }
    }

    /// Fraction in `0.0..=1.0`; an empty total reports 0.
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            self.transferred_bytes as f64 / self.total_size as f64
        }
    }

    /// Bytes per second since the first chunk, only while in progress.
    pub fn rate(&self) -> Option<f64> {
        if self.status != TransferStatus::InProgress {
            return None;
        }
        let elapsed = self.started_at?.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(self.transferred_bytes as f64 / elapsed)
    }

    pub fn eta(&self) -> Option<Duration> {
        let rate = self.rate().filter(|r| *r > 0.0)?;
        let remaining = self.total_size.saturating_sub(self.transferred_bytes);
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// 受保护的状态迁移；非法迁移被忽略并返回 false
    pub(crate) fn transition(&mut self, next: TransferStatus, error: Option<TransferError>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        let now = Instant::now();
        match next {
            TransferStatus::InProgress => self.started_at = Some(now),
            TransferStatus::Completed => {
                self.transferred_bytes = self.total_size;
                self.finished_at = Some(now);
            }
            TransferStatus::Failed => {
                self.error = error;
                self.finished_at = Some(now);
            }
            TransferStatus::Cancelled => {
                self.error = Some(TransferError::Cancelled);
                self.finished_at = Some(now);
            }
            TransferStatus::Pending => {}
        }
        self.status = next;
        true
    }

    /// Records the running byte count. Never moves backwards; a count past
    /// the announced total raises the total with it.
    pub(crate) fn record_progress(&mut self, transferred: u64) -> bool {
        if self.status != TransferStatus::InProgress || transferred < self.transferred_bytes {
            return false;
        }
        self.transferred_bytes = transferred;
        if transferred > self.total_size {
            self.total_size = transferred;
        }
        true
    }

    pub(crate) fn set_total_size(&mut self, total: u64) {
        if self.status == TransferStatus::Pending {
            self.total_size = total;
        }
    }
}

/// 格式化速度显示
pub fn format_speed(bytes_per_sec: f64) -> String {
    let bytes_per_sec = bytes_per_sec.max(0.0);
    if bytes_per_sec < 1024.0 {
        format!("{:.0} B/s", bytes_per_sec)
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.2} KB/s", bytes_per_sec / 1024.0)
    } else if bytes_per_sec < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB/s", bytes_per_sec / (1024.0 * 1024.0 * 1024.0))
    }
}

pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(total: u64) -> TransferTask {
        TransferTask::new(
            1,
            TransferDirection::Upload,
            "/tmp/a".into(),
            "/srv/a".into(),
            total,
        )
    }

    #[test]
    fn terminal_states_are_final() {
        let mut t = task(10);
        assert!(t.transition(TransferStatus::InProgress, None));
        assert!(t.transition(TransferStatus::Cancelled, None));
        assert!(!t.transition(TransferStatus::Completed, None));
        assert!(!t.transition(TransferStatus::InProgress, None));
        assert_eq!(t.status(), TransferStatus::Cancelled);
        assert_eq!(t.error(), Some(&TransferError::Cancelled));
    }

    #[test]
    fn pending_can_fail_or_cancel_but_not_complete() {
        assert!(!TransferStatus::Pending.can_transition_to(TransferStatus::Completed));
        assert!(TransferStatus::Pending.can_transition_to(TransferStatus::Failed));
        assert!(!TransferStatus::InProgress.can_transition_to(TransferStatus::Pending));

        let mut t = task(10);
        assert!(t.transition(
            TransferStatus::Failed,
            Some(TransferError::LocalIoError("gone".into()))
        ));
        assert!(t.started_at().is_none());
        assert!(t.finished_at().is_some());
    }

    #[test]
    fn progress_is_monotonic_and_completion_fills_total() {
        let mut t = task(100);
        assert!(!t.record_progress(10), "pending tasks take no progress");

        t.transition(TransferStatus::InProgress, None);
        assert!(t.record_progress(40));
        assert!(!t.record_progress(30));
        assert_eq!(t.transferred_bytes(), 40);
        assert!((t.progress() - 0.4).abs() < f64::EPSILON);

        t.transition(TransferStatus::Completed, None);
        assert_eq!(t.transferred_bytes(), 100);
        assert!(t.rate().is_none());
        assert!(t.eta().is_none());
    }

    #[test]
    fn growing_source_raises_total() {
        let mut t = task(10);
        t.transition(TransferStatus::InProgress, None);
        t.record_progress(15);
        assert_eq!(t.total_size(), 15);
        assert!(t.transferred_bytes() <= t.total_size());
    }

    #[test]
    fn empty_total_reports_zero_progress() {
        let t = task(0);
        assert_eq!(t.progress(), 0.0);
        assert!(t.eta().is_none());
    }

    #[test]
    fn formatting() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2048.0), "2.00 KB/s");
        assert_eq!(format_eta(Duration::from_secs(42)), "42s");
        assert_eq!(format_eta(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_eta(Duration::from_secs(3720)), "1h 02m");
    }
}
