//! Transfer progress state.
//!
//! A [`TransferTracker`] is owned by the pipeline moving the file. It is the
//! only writer of the [`TransferState`]; everyone else observes whole-state
//! snapshots through a `watch::Receiver`.
//!
//! Throughput is the average over the whole transfer
//! (`bytes_moved / elapsed`), and ETA is `(total - moved) / throughput`.

use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::utils::sos::SignalOfStop;

// ── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// We are sending the file to a peer.
    Outbound,
    /// We are receiving the file from a peer.
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Completed,
    /// Stopped by a user on either side. Not an error.
    Cancelled,
    /// The receiver declined the transfer request.
    Rejected,
    Failed(String),
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

#[derive(Debug, Clone)]
pub struct TransferState {
    pub direction: TransferDirection,
    pub file_name: String,
    pub bytes_moved: u64,
    pub total_size: u64,
    pub started_at: Instant,
    pub status: TransferStatus,
    /// Bytes per second, averaged since `started_at`.
    pub throughput: f64,
    pub eta: Option<Duration>,
    /// Outbound only: the receiver confirmed it finalized the file.
    pub acknowledged: bool,
}

impl TransferState {
    fn new(direction: TransferDirection, file_name: String, total_size: u64) -> Self {
        Self {
            direction,
            file_name,
            bytes_moved: 0,
            total_size,
            started_at: Instant::now(),
            status: TransferStatus::InProgress,
            throughput: 0.0,
            eta: None,
            acknowledged: false,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        self.bytes_moved as f64 * 100.0 / self.total_size as f64
    }

    fn recompute_rate(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.started_at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.throughput = self.bytes_moved as f64 / elapsed;
        let remaining = self.total_size - self.bytes_moved;
        self.eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if self.throughput > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / self.throughput))
        } else {
            None
        };
    }
}

// ── Tracker ──────────────────────────────────────────────────────────────────

pub struct TransferTracker {
    tx: watch::Sender<TransferState>,
    cancel: SignalOfStop,
}

impl TransferTracker {
    pub fn new(direction: TransferDirection, file_name: impl Into<String>, total_size: u64) -> Self {
        let (tx, _) = watch::channel(TransferState::new(direction, file_name.into(), total_size));
        Self {
            tx,
            cancel: SignalOfStop::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TransferState {
        self.tx.borrow().clone()
    }

    /// Cancel handle checked by the pipeline before every chunk.
    pub fn cancel_handle(&self) -> SignalOfStop {
        self.cancel.clone()
    }

    /// Count `n` more bytes as moved. Clamped at `total_size`; ignored once
    /// the transfer reached a terminal status.
    pub fn advance(&self, n: u64) {
        let now = Instant::now();
        self.tx.send_modify(|s| {
            if s.status.is_terminal() {
                return;
            }
            s.bytes_moved = s.bytes_moved.saturating_add(n).min(s.total_size);
            s.recompute_rate(now);
        });
    }

    /// Move to a terminal status. The first terminal status wins.
    pub fn finish(&self, status: TransferStatus) {
        self.tx.send_modify(|s| {
            if s.status.is_terminal() {
                return;
            }
            s.status = status;
            if s.status == TransferStatus::Completed {
                s.eta = Some(Duration::ZERO);
            }
        });
    }

    pub fn acknowledge(&self) {
        self.tx.send_modify(|s| s.acknowledged = true);
    }
}
