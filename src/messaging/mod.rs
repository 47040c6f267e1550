//! # Messaging Module
//!
//! Addresses of cluster components and the typed result messages tasks send
//! from their completion phase. Wire encoding belongs to the [`ResultSink`]
//! implementation; this crate only decides what is sent and to whom.

pub mod message;
pub mod sink;

pub use message::*;
pub use sink::{ChannelResultSink, ResultSink, SendError};
