//! Centralized configuration constants for peerdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame type bytes, message
//! type names) stay in their respective protocol modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (60 KiB).
///
/// Independent of the channel count. Each chunk travels as one data channel
/// message, so a chunk frame (payload plus header) must fit in
/// [`SCTP_MAX_MESSAGE_SIZE`].
pub const CHUNK_SIZE: usize = 60 * 1024;

/// Number of ordered, reliable data channels opened per peer.
pub const DEFAULT_CHANNEL_COUNT: usize = 4;

/// Sender read-ahead buffer: max chunks prefetched from disk while the
/// send loop is blocked on backpressure.
pub const SENDER_READ_AHEAD_CHUNKS: usize = 8;

/// Label prefix for transfer channels. Channel `i` is `"file-transfer-{i}"`.
pub const CHANNEL_LABEL_PREFIX: &str = "file-transfer-";

// ── Flow Control ─────────────────────────────────────────────────────────────

/// High watermark for a channel's SCTP send buffer (bytes).
/// When `buffered_amount` exceeds this value the sender stops using the
/// channel until it drains to the low watermark.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024;

/// Low watermark (bytes). Also installed as the provider's
/// buffered-amount-low threshold so the drain is signalled, not only polled.
pub const DC_BUFFERED_AMOUNT_LOW: usize = 1024 * 1024;

/// Re-check interval while waiting on the buffered-amount-low signal.
/// Guards against a low event that fired between the check and the wait.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on delivering a control frame (cancel, ack) during teardown.
pub const CONTROL_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Largest message webrtc-rs will put on an SCTP stream (its fixed default).
pub const SCTP_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Public STUN servers used when no ICE servers are configured.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Default listen address of the relay service.
pub const DEFAULT_RELAY_BIND: &str = "0.0.0.0:3000";

/// Default relay URL used by clients.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000";

/// Delay before the receive daemon reconnects after losing the relay.
pub const RELAY_RECONNECT_DELAY: Duration = Duration::from_secs(3);

// ── Naming ───────────────────────────────────────────────────────────────────

/// Generated display names are between these lengths (inclusive).
pub const DISPLAY_NAME_MIN_LEN: usize = 10;
pub const DISPLAY_NAME_MAX_LEN: usize = 12;

/// Random draws before falling back to a numbered display name.
pub const DISPLAY_NAME_MAX_ATTEMPTS: usize = 64;

// ── UI / Misc ────────────────────────────────────────────────────────────────

/// Minimum interval between two progress lines printed by the CLI.
pub const PROGRESS_PRINT_INTERVAL: Duration = Duration::from_millis(500);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::frame::CHUNK_HEADER_LEN;

    #[test]
    fn chunk_frame_fits_one_sctp_message() {
        assert!(CHUNK_SIZE + CHUNK_HEADER_LEN <= SCTP_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn watermarks_are_ordered() {
        assert!(DC_BUFFERED_AMOUNT_LOW < DC_BUFFERED_AMOUNT_HIGH);
        assert!(CHUNK_SIZE < DC_BUFFERED_AMOUNT_LOW);
    }
}
