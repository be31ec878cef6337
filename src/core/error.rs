//! Transfer failure taxonomy.
//!
//! Everything that can end a transfer abnormally is one of these kinds.
//! The pipelines convert them into a terminal [`TransferStatus`] at their
//! own boundary; they never cross into the negotiation layer.
//!
//! [`TransferStatus`]: crate::core::transfer::TransferStatus

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The sender was asked to start before every pooled channel was open.
    #[error("connection not ready: {ready} of {total} channels open")]
    NotReady { ready: usize, total: usize },

    /// A channel closed while the transfer still needed it.
    #[error("channel '{0}' closed")]
    ChannelClosed(String),

    /// The provider rejected a send.
    #[error("send on channel '{label}' failed: {reason}")]
    Send { label: String, reason: String },

    /// The destination sink could not be opened.
    #[error("cannot open destination: {0}")]
    SinkOpen(String),

    /// The destination sink rejected a write or failed to finalize.
    #[error("destination write failed: {0}")]
    SinkWrite(String),

    /// The chunk source failed to produce a slice.
    #[error("reading source failed: {0}")]
    Source(String),

    /// The peer sent something that violates the transfer protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type TransferResult<T> = std::result::Result<T, TransferError>;
