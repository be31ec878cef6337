//! File transfer pipeline: the channel pool, chunk source and sink, and the
//! sender/receiver loops that move one file per peer over the pool.

pub mod pool;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod source;
