//! Transfer channel pool.
//!
//! A fixed set of `N` ordered, reliable channels to one peer. The initiator
//! creates them after the session connects; the responder fills the same
//! slots from incoming channels, matched by the index in their label
//! (`file-transfer-{i}`).
//!
//! Chunk `i` always travels on slot `i mod N`. Before each send the slot's
//! buffered amount is checked against the high watermark; above it the send
//! waits until the channel drains to the low watermark. That wait is the
//! only suspension point of the sender. Control frames skip it: they are a
//! few bytes, and a cancel must not queue behind the data it cancels.

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::core::config::{
    BACKPRESSURE_POLL_INTERVAL, CHANNEL_LABEL_PREFIX, DC_BUFFERED_AMOUNT_HIGH,
    DC_BUFFERED_AMOUNT_LOW,
};
use crate::core::error::{TransferError, TransferResult};
use crate::core::transport::DataChannel;

pub struct TransferChannelPool {
    slots: RwLock<Vec<Option<Arc<dyn DataChannel>>>>,
    size: usize,
    high: AtomicUsize,
    low: AtomicUsize,
}

impl TransferChannelPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: RwLock::new(vec![None; size]),
            size,
            high: AtomicUsize::new(DC_BUFFERED_AMOUNT_HIGH),
            low: AtomicUsize::new(DC_BUFFERED_AMOUNT_LOW),
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn label(index: usize) -> String {
        format!("{CHANNEL_LABEL_PREFIX}{index}")
    }

    /// Slot index encoded in a channel label, if it is one of ours.
    pub fn index_of(label: &str) -> Option<usize> {
        label.strip_prefix(CHANNEL_LABEL_PREFIX)?.parse().ok()
    }

    /// Put `channel` in the slot named by its label. Returns the slot, or
    /// `None` for foreign labels and out-of-range indices.
    pub async fn register(&self, channel: Arc<dyn DataChannel>) -> Option<usize> {
        let Some(index) = Self::index_of(channel.label()).filter(|i| *i < self.size) else {
            warn!(event = "channel_label_rejected", label = channel.label(), pool = self.size);
            return None;
        };
        channel
            .set_buffered_amount_low_threshold(self.low.load(Ordering::Relaxed))
            .await;
        let mut slots = self.slots.write().await;
        if slots[index].is_some() {
            debug!(event = "channel_slot_replaced", index);
        }
        slots[index] = Some(channel);
        Some(index)
    }

    pub async fn channel(&self, index: usize) -> Option<Arc<dyn DataChannel>> {
        self.slots.read().await.get(index).cloned().flatten()
    }

    pub async fn ready_count(&self) -> usize {
        self.slots
            .read()
            .await
            .iter()
            .filter(|s| s.as_ref().is_some_and(|c| c.is_open()))
            .count()
    }

    /// Every slot is filled with an open channel.
    pub async fn all_ready(&self) -> bool {
        self.ready_count().await == self.size
    }

    /// Fail with [`TransferError::NotReady`] unless every channel is open.
    pub async fn ensure_ready(&self) -> TransferResult<()> {
        let ready = self.ready_count().await;
        if ready == self.size {
            Ok(())
        } else {
            Err(TransferError::NotReady {
                ready,
                total: self.size,
            })
        }
    }

    pub async fn set_watermarks(&self, high: usize, low: usize) {
        let low = low.min(high);
        self.high.store(high, Ordering::Relaxed);
        self.low.store(low, Ordering::Relaxed);
        for ch in self.slots.read().await.iter().flatten() {
            ch.set_buffered_amount_low_threshold(low).await;
        }
    }

    /// Send a chunk frame on slot `chunk_index mod N`, waiting for the slot
    /// to drain first if it is above the high watermark.
    pub async fn send(&self, chunk_index: u64, frame: Bytes) -> TransferResult<()> {
        let slot = (chunk_index % self.size as u64) as usize;
        self.send_on(slot, frame).await
    }

    /// Control frames travel on slot 0, without waiting for backpressure.
    pub async fn send_control(&self, frame: Bytes) -> TransferResult<()> {
        let channel = self.slot(0).await?;
        if !channel.is_open() {
            return Err(TransferError::ChannelClosed(channel.label().to_string()));
        }
        Self::deliver(&channel, frame).await
    }

    async fn send_on(&self, slot: usize, frame: Bytes) -> TransferResult<()> {
        let channel = self.slot(slot).await?;
        self.wait_for_drain(&channel).await?;
        Self::deliver(&channel, frame).await
    }

    async fn slot(&self, slot: usize) -> TransferResult<Arc<dyn DataChannel>> {
        self.channel(slot)
            .await
            .ok_or_else(|| TransferError::ChannelClosed(Self::label(slot)))
    }

    async fn deliver(channel: &Arc<dyn DataChannel>, frame: Bytes) -> TransferResult<()> {
        channel.send(frame).await.map_err(|e| TransferError::Send {
            label: channel.label().to_string(),
            reason: e.to_string(),
        })
    }

    async fn wait_for_drain(&self, channel: &Arc<dyn DataChannel>) -> TransferResult<()> {
        let high = self.high.load(Ordering::Relaxed);
        let buffered = channel.buffered_amount().await;
        if buffered <= high {
            return Ok(());
        }
        let low = self.low.load(Ordering::Relaxed);
        trace!(event = "backpressure_wait", channel = channel.label(), buffered, high, low);
        loop {
            if !channel.is_open() {
                return Err(TransferError::ChannelClosed(channel.label().to_string()));
            }
            tokio::select! {
                _ = channel.buffered_amount_low() => {}
                _ = tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL) => {}
            }
            if channel.buffered_amount().await <= low {
                trace!(event = "backpressure_released", channel = channel.label());
                return Ok(());
            }
        }
    }

    pub async fn close_all(&self) {
        let channels: Vec<_> = self.slots.write().await.iter_mut().filter_map(Option::take).collect();
        for ch in channels {
            if let Err(e) = ch.close().await {
                debug!(event = "channel_close_failure", channel = ch.label(), error = %e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::mock::MockChannel;
    use std::time::Duration;

    async fn pool_of(n: usize) -> (TransferChannelPool, Vec<Arc<MockChannel>>) {
        let pool = TransferChannelPool::new(n);
        let mut mocks = Vec::new();
        for i in 0..n {
            let ch = MockChannel::open(&TransferChannelPool::label(i));
            pool.register(ch.clone()).await;
            mocks.push(ch);
        }
        (pool, mocks)
    }

    #[test]
    fn labels_round_trip_to_indices() {
        assert_eq!(TransferChannelPool::label(3), "file-transfer-3");
        assert_eq!(TransferChannelPool::index_of("file-transfer-3"), Some(3));
        assert_eq!(TransferChannelPool::index_of("chat"), None);
        assert_eq!(TransferChannelPool::index_of("file-transfer-x"), None);
    }

    #[tokio::test]
    async fn mirrors_incoming_channels_by_label_index() {
        let pool = TransferChannelPool::new(2);
        assert!(!pool.all_ready().await);
        let b = MockChannel::open("file-transfer-1");
        let a = MockChannel::new("file-transfer-0");
        assert_eq!(pool.register(b).await, Some(1));
        assert_eq!(pool.register(a.clone()).await, Some(0));
        assert_eq!(pool.register(MockChannel::open("file-transfer-5")).await, None);

        // Registered but not open yet.
        assert!(matches!(
            pool.ensure_ready().await,
            Err(TransferError::NotReady { ready: 1, total: 2 })
        ));
        a.set_open(true);
        assert!(pool.all_ready().await);
    }

    #[tokio::test]
    async fn chunks_round_robin_over_slots() {
        let (pool, mocks) = pool_of(3).await;
        for i in 0..7u64 {
            pool.send(i, Bytes::from(vec![i as u8])).await.unwrap();
        }
        let firsts: Vec<Vec<u8>> = mocks
            .iter()
            .map(|m| m.sent().iter().map(|b| b[0]).collect())
            .collect();
        assert_eq!(firsts, vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]);
    }

    #[tokio::test]
    async fn waits_above_high_watermark_until_low() {
        let (pool, mocks) = pool_of(1).await;
        pool.set_watermarks(1000, 100).await;
        assert_eq!(mocks[0].low_threshold(), 100);
        mocks[0].set_buffered(1001);

        let pool = Arc::new(pool);
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.send(0, Bytes::from_static(b"x")).await })
        };

        // The send has seen 1001 > high and is parked.
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL * 2).await;
        assert_eq!(mocks[0].sent_count(), 0);
        assert!(!task.is_finished());

        // Below high but still above low: keep waiting.
        mocks[0].drain_to(500);
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL * 3).await;
        assert_eq!(mocks[0].sent_count(), 0);
        assert!(!task.is_finished());

        mocks[0].drain_to(100);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(mocks[0].sent_count(), 1);
    }

    #[tokio::test]
    async fn exactly_at_high_watermark_still_sends() {
        let (pool, mocks) = pool_of(1).await;
        pool.set_watermarks(1000, 100).await;
        mocks[0].set_buffered(1000);
        pool.send(0, Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(mocks[0].sent_count(), 1);
    }

    #[tokio::test]
    async fn control_frames_skip_backpressure() {
        let (pool, mocks) = pool_of(2).await;
        pool.set_watermarks(1000, 100).await;
        mocks[0].set_buffered(5000);

        tokio::time::timeout(
            BACKPRESSURE_POLL_INTERVAL,
            pool.send_control(Bytes::from_static(b"c")),
        )
        .await
        .expect("control frame waited on a full channel")
        .unwrap();
        assert_eq!(mocks[0].sent_count(), 1);

        mocks[0].set_open(false);
        let err = pool.send_control(Bytes::from_static(b"c")).await.unwrap_err();
        assert!(matches!(err, TransferError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn closed_channel_aborts_wait() {
        let (pool, mocks) = pool_of(1).await;
        pool.set_watermarks(10, 1).await;
        mocks[0].set_buffered(11);
        mocks[0].set_open(false);
        let err = pool.send(0, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, TransferError::ChannelClosed(_)));
    }

    #[tokio::test]
    async fn send_failure_names_the_channel() {
        let (pool, mocks) = pool_of(2).await;
        mocks[1].set_fail_sends(true);
        let err = pool.send(1, Bytes::from_static(b"x")).await.unwrap_err();
        match err {
            TransferError::Send { label, .. } => assert_eq!(label, "file-transfer-1"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
