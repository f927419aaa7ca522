use serde::Serialize;
use thiserror::Error;

use crate::relay::RelayDriver;

/// Failure classes reported by the remote-update transport. Recorded and
/// logged, never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UpdateErrorKind {
    #[error("authentication rejected")]
    Auth,
    #[error("update session could not begin")]
    Begin,
    #[error("connection to the update peer failed")]
    Connect,
    #[error("image receive failed")]
    Receive,
    #[error("image finalize failed")]
    End,
}

/// Tracks the lifecycle of a remote firmware update as reported by the
/// transport. Normal operation continues after any failure.
#[derive(Debug, Default)]
pub struct UpdateMonitor {
    in_progress: bool,
    bytes_written: u64,
    total_bytes: Option<u64>,
    progress_pct: Option<u8>,
    last_error: Option<UpdateErrorKind>,
    last_completed_epoch: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateStatusView {
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    pub progress_pct: Option<u8>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    pub last_completed_epoch: Option<i64>,
}

impl UpdateMonitor {
    /// The heating element must never ride through a firmware flash, so the
    /// relay is forced off before anything else happens.
    pub fn on_start(&mut self, relay: &mut dyn RelayDriver) {
        relay.set_energized(false);
        self.in_progress = true;
        self.bytes_written = 0;
        self.total_bytes = None;
        self.progress_pct = None;
        self.last_error = None;
    }

    pub fn on_progress(&mut self, written: u64, total: Option<u64>) {
        self.bytes_written = written;
        self.total_bytes = total;
        if let Some(total) = total.filter(|value| *value > 0) {
            let pct = (written.saturating_mul(100) / total).min(100);
            self.progress_pct = Some(pct as u8);
        }
    }

    pub fn on_error(&mut self, kind: UpdateErrorKind, now_epoch: i64) {
        self.in_progress = false;
        self.last_error = Some(kind);
        self.last_completed_epoch = Some(now_epoch);
    }

    pub fn on_end(&mut self, now_epoch: i64) {
        self.in_progress = false;
        self.progress_pct = Some(100);
        self.last_error = None;
        self.last_completed_epoch = Some(now_epoch);
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn last_error(&self) -> Option<UpdateErrorKind> {
        self.last_error
    }

    pub fn status_view(&self) -> UpdateStatusView {
        UpdateStatusView {
            in_progress: self.in_progress,
            bytes_written: self.bytes_written,
            total_bytes: self.total_bytes,
            progress_pct: self.progress_pct,
            last_error: self.last_error.map(|kind| kind.to_string()),
            last_completed_epoch: self.last_completed_epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::test_support::RecordingRelay;

    #[test]
    fn start_forces_the_relay_off() {
        let mut monitor = UpdateMonitor::default();
        let mut relay = RecordingRelay::default();

        monitor.on_start(&mut relay);

        assert_eq!(relay.states, vec![false]);
        assert!(monitor.in_progress());
    }

    #[test]
    fn progress_tracks_bytes_and_percent() {
        let mut monitor = UpdateMonitor::default();
        let mut relay = RecordingRelay::default();
        monitor.on_start(&mut relay);

        monitor.on_progress(512, Some(2_048));
        let view = monitor.status_view();

        assert_eq!(view.bytes_written, 512);
        assert_eq!(view.progress_pct, Some(25));
    }

    #[test]
    fn errors_are_classified_and_terminal_for_the_attempt() {
        let mut monitor = UpdateMonitor::default();
        let mut relay = RecordingRelay::default();
        monitor.on_start(&mut relay);

        monitor.on_error(UpdateErrorKind::Receive, 1_700_000_000);

        assert!(!monitor.in_progress());
        assert_eq!(monitor.last_error(), Some(UpdateErrorKind::Receive));
        assert_eq!(
            monitor.status_view().last_error.as_deref(),
            Some("image receive failed")
        );
    }

    #[test]
    fn clean_end_clears_the_error_and_stamps_completion() {
        let mut monitor = UpdateMonitor::default();
        let mut relay = RecordingRelay::default();
        monitor.on_start(&mut relay);
        monitor.on_error(UpdateErrorKind::Connect, 100);

        monitor.on_start(&mut relay);
        monitor.on_progress(2_048, Some(2_048));
        monitor.on_end(1_700_000_000);

        let view = monitor.status_view();
        assert!(!view.in_progress);
        assert_eq!(view.progress_pct, Some(100));
        assert_eq!(view.last_error, None);
        assert_eq!(view.last_completed_epoch, Some(1_700_000_000));
    }
}
