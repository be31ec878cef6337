//! Receiver pipeline.
//!
//! Consumes decoded frames from any of the peer's channels:
//!
//! - `file-metadata` with no active transfer opens the sink and starts a
//!   new [`TransferTracker`]. A sink that cannot be opened fails the
//!   transfer before anything is written.
//! - Each chunk is written at its own offset, so arrival order across
//!   channels does not matter. Only bytes not covered by an earlier chunk
//!   count toward `bytes_moved`; a repeated chunk is dropped.
//! - Once `bytes_moved` reaches the declared size the sink is finalized and
//!   the transfer completes. The owner then acknowledges with a
//!   `file-received` frame.
//! - `cancel` aborts the sink. Write failures abort it too.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::error::TransferError;
use crate::core::pipeline::sink::{ChunkSink, SinkFactory};
use crate::core::protocol::frame::{ControlFrame, Frame};
use crate::core::transfer::{TransferDirection, TransferState, TransferStatus, TransferTracker};

/// What a frame did to the receiver.
#[derive(Debug)]
pub enum ReceiveEvent {
    /// Nothing changed that the owner must act on.
    Ignored,
    Started(watch::Receiver<TransferState>),
    Progress,
    /// The active transfer ended. `path` is set on completion.
    Finished {
        status: TransferStatus,
        progress: watch::Receiver<TransferState>,
        path: Option<PathBuf>,
    },
}

struct ActiveReceive {
    sink: Box<dyn ChunkSink>,
    tracker: TransferTracker,
    total: u64,
    moved: u64,
    written: Coverage,
}

/// Disjoint byte ranges already written, keyed by start. Touching ranges
/// are merged.
#[derive(Default)]
struct Coverage {
    ranges: BTreeMap<u64, u64>,
}

impl Coverage {
    /// Mark `start..end` written. Returns how many of those bytes were new.
    fn insert(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        let touching: Vec<(u64, u64)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(_, e)| **e >= start)
            .map(|(s, e)| (*s, *e))
            .collect();
        let (mut lo, mut hi, mut seen) = (start, end, 0);
        for (s, e) in touching {
            seen += e.min(end).saturating_sub(s.max(start));
            lo = lo.min(s);
            hi = hi.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(lo, hi);
        (end - start) - seen
    }
}

pub struct ReceiverPipeline {
    sinks: Arc<dyn SinkFactory>,
    active: Option<ActiveReceive>,
}

impl ReceiverPipeline {
    pub fn new(sinks: Arc<dyn SinkFactory>) -> Self {
        Self { sinks, active: None }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn progress(&self) -> Option<watch::Receiver<TransferState>> {
        self.active.as_ref().map(|a| a.tracker.subscribe())
    }

    pub async fn handle(&mut self, frame: Frame) -> ReceiveEvent {
        match frame {
            Frame::Control(ControlFrame::FileMetadata { name, size }) => {
                self.start(name, size).await
            }
            Frame::Control(ControlFrame::Cancel) => {
                if self.active.is_none() {
                    return ReceiveEvent::Ignored;
                }
                info!(event = "transfer_cancelled_by_peer");
                self.end(TransferStatus::Cancelled).await
            }
            Frame::Control(ControlFrame::FileReceived) => {
                debug!(event = "unexpected_ack_on_receiver");
                ReceiveEvent::Ignored
            }
            Frame::Chunk { offset, data } => self.chunk(offset, &data).await,
        }
    }

    /// End the active transfer, if any, with `status` (peer lost, shutdown).
    pub async fn abort(&mut self, status: TransferStatus) -> Option<ReceiveEvent> {
        if self.active.is_none() {
            return None;
        }
        Some(self.end(status).await)
    }

    async fn start(&mut self, name: String, size: u64) -> ReceiveEvent {
        if self.active.is_some() {
            warn!(event = "metadata_during_transfer", file = %name);
            return ReceiveEvent::Ignored;
        }
        let tracker = TransferTracker::new(TransferDirection::Inbound, name.clone(), size);
        let sink = match self.sinks.open(&name, size).await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(event = "sink_open_failure", file = %name, error = %e);
                tracker.finish(TransferStatus::Failed(e.to_string()));
                return ReceiveEvent::Finished {
                    status: tracker.snapshot().status,
                    progress: tracker.subscribe(),
                    path: None,
                };
            }
        };
        info!(event = "receive_started", file = %name, size);
        let progress = tracker.subscribe();
        self.active = Some(ActiveReceive {
            sink,
            tracker,
            total: size,
            moved: 0,
            written: Coverage::default(),
        });
        if size == 0 {
            return self.complete().await;
        }
        ReceiveEvent::Started(progress)
    }

    async fn chunk(&mut self, offset: u64, data: &[u8]) -> ReceiveEvent {
        let Some(active) = self.active.as_mut() else {
            warn!(event = "chunk_without_metadata", offset, len = data.len());
            return ReceiveEvent::Ignored;
        };
        let end = offset.saturating_add(data.len() as u64);
        if end > active.total {
            let e = TransferError::Protocol(format!(
                "chunk at {offset}+{} exceeds declared size {}",
                data.len(),
                active.total
            ));
            warn!(event = "chunk_out_of_range", error = %e);
            return self.end(TransferStatus::Failed(e.to_string())).await;
        }
        let fresh = active.written.insert(offset, end);
        if fresh == 0 {
            debug!(event = "duplicate_chunk", offset, len = data.len());
            return ReceiveEvent::Ignored;
        }
        if let Err(e) = active.sink.write_at(offset, data).await {
            warn!(event = "sink_write_failure", offset, error = %e);
            return self.end(TransferStatus::Failed(e.to_string())).await;
        }
        active.moved += fresh;
        active.tracker.advance(fresh);
        if active.moved >= active.total {
            return self.complete().await;
        }
        ReceiveEvent::Progress
    }

    async fn complete(&mut self) -> ReceiveEvent {
        let Some(mut active) = self.active.take() else {
            return ReceiveEvent::Ignored;
        };
        let progress = active.tracker.subscribe();
        match active.sink.finalize().await {
            Ok(path) => {
                active.tracker.finish(TransferStatus::Completed);
                info!(event = "receive_completed", path = %path.display(), size = active.total);
                ReceiveEvent::Finished {
                    status: TransferStatus::Completed,
                    progress,
                    path: Some(path),
                }
            }
            Err(e) => {
                warn!(event = "sink_finalize_failure", error = %e);
                active.sink.abort().await;
                let status = TransferStatus::Failed(e.to_string());
                active.tracker.finish(status.clone());
                ReceiveEvent::Finished {
                    status,
                    progress,
                    path: None,
                }
            }
        }
    }

    async fn end(&mut self, status: TransferStatus) -> ReceiveEvent {
        let Some(mut active) = self.active.take() else {
            return ReceiveEvent::Ignored;
        };
        active.sink.abort().await;
        active.tracker.finish(status.clone());
        ReceiveEvent::Finished {
            status,
            progress: active.tracker.subscribe(),
            path: None,
        }
    }
}
