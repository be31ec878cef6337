//! Data channel framing.
//!
//! All messages on a transfer channel use this compact binary envelope:
//!
//!   [1 byte: frame_type] [N bytes: payload]
//!
//! Frame types:
//!   0x01 = Control (JSON-encoded [`ControlFrame`])
//!   0x02 = Chunk   (8 bytes absolute file offset, big endian, + raw data)
//!
//! Chunks carry their absolute offset so the receiver can write them
//! positionally; arrival order across channels is irrelevant.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::core::error::{TransferError, TransferResult};

/// Frame type marker for control messages.
pub const FRAME_CONTROL: u8 = 0x01;

/// Frame type marker for binary chunk data.
pub const FRAME_CHUNK: u8 = 0x02;

/// Bytes of framing in front of every chunk payload.
pub const CHUNK_HEADER_LEN: usize = 1 + 8;

/// Control messages exchanged on channel 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Sent once by the sender before any chunk.
    FileMetadata { name: String, size: u64 },
    /// Receiver → sender, after the sink was finalized.
    FileReceived,
    /// Sender → receiver, best effort, when the user cancels.
    Cancel,
}

/// A decoded data channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Chunk { offset: u64, data: Bytes },
}

/// Encode a chunk frame: [0x02][u64 offset BE][payload]
pub fn encode_chunk_frame(offset: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
    buf.put_u8(FRAME_CHUNK);
    buf.put_u64(offset);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Encode a control frame: [0x01][json bytes]
pub fn encode_control_frame(msg: &ControlFrame) -> TransferResult<Bytes> {
    let json = serde_json::to_vec(msg).map_err(|e| TransferError::Protocol(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(1 + json.len());
    buf.put_u8(FRAME_CONTROL);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// Decode one data channel message.
pub fn decode_frame(mut data: Bytes) -> TransferResult<Frame> {
    if data.is_empty() {
        return Err(TransferError::Protocol("empty frame".into()));
    }
    match data.get_u8() {
        FRAME_CONTROL => serde_json::from_slice(&data)
            .map(Frame::Control)
            .map_err(|e| TransferError::Protocol(format!("bad control frame: {e}"))),
        FRAME_CHUNK => {
            if data.len() < 8 {
                return Err(TransferError::Protocol("truncated chunk header".into()));
            }
            let offset = data.get_u64();
            Ok(Frame::Chunk { offset, data })
        }
        other => Err(TransferError::Protocol(format!(
            "unknown frame type 0x{other:02x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_frame_keeps_offset_and_payload() {
        let frame = encode_chunk_frame(262_144, b"abc");
        assert_eq!(frame.len(), CHUNK_HEADER_LEN + 3);
        match decode_frame(frame).unwrap() {
            Frame::Chunk { offset, data } => {
                assert_eq!(offset, 262_144);
                assert_eq!(&data[..], b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn metadata_frame_is_tagged_json() {
        let frame = encode_control_frame(&ControlFrame::FileMetadata {
            name: "report.pdf".into(),
            size: 1_000_000,
        })
        .unwrap();
        assert_eq!(frame[0], FRAME_CONTROL);
        let json: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(json["type"], "file-metadata");
        assert_eq!(json["size"], 1_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_frame(Bytes::new()).is_err());
        assert!(decode_frame(Bytes::from_static(&[0x02, 0, 0])).is_err());
        assert!(decode_frame(Bytes::from_static(&[0x7f, 1, 2])).is_err());
        assert!(decode_frame(Bytes::from_static(b"\x01{not json")).is_err());
    }

    #[test]
    fn empty_chunk_payload_is_allowed() {
        let frame = encode_chunk_frame(0, &[]);
        assert_eq!(
            decode_frame(frame).unwrap(),
            Frame::Chunk {
                offset: 0,
                data: Bytes::new()
            }
        );
    }
}
