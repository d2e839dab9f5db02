//! Client connection manager for the clobfeed WebSocket feed.
//!
//! Maintains one socket to the feed endpoint, runs the node's tagged
//! message protocol over it, tracks one logical subscription per channel,
//! and recovers from transport drops with exponential backoff and
//! automatic resubscription.

pub mod backoff;
pub mod connection;
pub mod error;
pub(crate) mod pumps;
pub(crate) mod reconnection;
pub(crate) mod registry;
pub(crate) mod socket;
pub mod types;

pub use backoff::{ReconnectPolicy, ReconnectionManager, ResolvedBackoffPolicy, calculate_delay};
pub use connection::FeedConnection;
pub use error::FeedError;
pub use types::{ConnectionEvent, ConnectionState, FeedConfig, ListenerId};
