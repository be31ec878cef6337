//! Sender pipeline.
//!
//! ```text
//! ┌─────────────┐  read-ahead  ┌───────────┐  chunk i → slot i mod N
//! │ spawn_reader│ ────────────►│ send loop │ ───────────────────────► pool
//! └─────────────┘              └───────────┘
//! ```
//!
//! 1. Refuse to start unless every pooled channel is open.
//! 2. Send the metadata frame on channel 0.
//! 3. Send each chunk, offset-tagged, on its channel, waiting out
//!    backpressure when the channel is above the high watermark.
//! 4. Publish progress after every chunk.
//!
//! Cancellation is checked before every chunk and raced against the
//! backpressure wait. Frames already handed to the transport stay queued.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::config::CONTROL_FRAME_TIMEOUT;
use crate::core::error::TransferResult;
use crate::core::pipeline::pool::TransferChannelPool;
use crate::core::pipeline::source::{spawn_reader, ChunkSource};
use crate::core::protocol::frame::{encode_chunk_frame, encode_control_frame, ControlFrame};
use crate::core::transfer::{TransferStatus, TransferTracker};

pub struct SenderPipeline {
    pool: Arc<TransferChannelPool>,
    chunk_size: usize,
}

impl SenderPipeline {
    pub fn new(pool: Arc<TransferChannelPool>, chunk_size: usize) -> Self {
        Self {
            pool,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Move the whole source to the peer.
    ///
    /// Returns [`TransferError::NotReady`] without touching `tracker` or the
    /// channels if the pool is not fully open. Every other outcome is a
    /// terminal [`TransferStatus`], also published through `tracker`.
    pub async fn send(
        &self,
        source: Arc<dyn ChunkSource>,
        tracker: &TransferTracker,
    ) -> TransferResult<TransferStatus> {
        self.pool.ensure_ready().await?;

        let status = match self.stream(source, tracker).await {
            Ok(status) => status,
            Err(e) => {
                warn!(event = "transfer_send_failure", error = %e);
                TransferStatus::Failed(e.to_string())
            }
        };
        tracker.finish(status.clone());
        Ok(tracker.snapshot().status)
    }

    async fn stream(
        &self,
        source: Arc<dyn ChunkSource>,
        tracker: &TransferTracker,
    ) -> TransferResult<TransferStatus> {
        let cancel = tracker.cancel_handle();
        let state = tracker.snapshot();
        let total = source.size();

        let metadata = encode_control_frame(&ControlFrame::FileMetadata {
            name: state.file_name.clone(),
            size: total,
        })?;
        self.pool.send_control(metadata).await?;
        info!(
            event = "transfer_started",
            file = %state.file_name,
            size = total,
            channels = self.pool.len(),
            chunk_size = self.chunk_size
        );

        let (mut chunks, reader) = spawn_reader(source, self.chunk_size);
        let result = loop {
            if cancel.cancelled() {
                break Ok(TransferStatus::Cancelled);
            }
            let next = tokio::select! {
                biased;
                _ = cancel.wait() => break Ok(TransferStatus::Cancelled),
                next = chunks.recv() => next,
            };
            let chunk = match next {
                None => break Ok(TransferStatus::Completed),
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => break Err(e),
            };

            let len = chunk.data.len() as u64;
            let frame = encode_chunk_frame(chunk.offset, &chunk.data);
            let sent = tokio::select! {
                biased;
                _ = cancel.wait() => break Ok(TransferStatus::Cancelled),
                sent = self.pool.send(chunk.index, frame) => sent,
            };
            if let Err(e) = sent {
                break Err(e);
            }
            tracker.advance(len);
            debug!(event = "chunk_sent", index = chunk.index, offset = chunk.offset, len);
        };
        reader.abort();

        match &result {
            Ok(TransferStatus::Cancelled) => {
                info!(event = "transfer_cancelled", file = %state.file_name, sent = tracker.snapshot().bytes_moved)
            }
            Ok(_) => info!(event = "transfer_sent", file = %state.file_name, size = total),
            Err(_) => {}
        }
        result
    }
}

/// Best-effort notice to the receiver that the sender gave up. Bounded by
/// [`CONTROL_FRAME_TIMEOUT`] so a stuck transport cannot stall teardown.
pub async fn send_cancel(pool: &TransferChannelPool) {
    let Ok(frame) = encode_control_frame(&ControlFrame::Cancel) else {
        return;
    };
    match tokio::time::timeout(CONTROL_FRAME_TIMEOUT, pool.send_control(frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(event = "cancel_frame_failure", error = %e),
        Err(_) => debug!(event = "cancel_frame_timeout"),
    }
}
