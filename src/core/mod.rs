pub mod config;
pub mod engine;
pub mod error;
pub mod negotiation;
pub mod pipeline;
pub mod protocol;
pub mod relay;
pub mod transfer;
pub mod transport;
