//! Wire formats: relay envelopes and data channel frames.

pub mod frame;
pub mod signaling;
