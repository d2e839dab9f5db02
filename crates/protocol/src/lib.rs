//! Wire protocol types for the clobfeed node's WebSocket feed.
//!
//! The feed speaks a tagged JSON protocol: every frame carries a `type`
//! field that discriminates its shape. Clients send `subscribe` /
//! `unsubscribe` requests; the node answers with acknowledgment frames and
//! pushes channel-bound data frames.

pub mod constants;
pub mod frames;

pub use frames::{Channel, ClientFrame, ServerFrame};
