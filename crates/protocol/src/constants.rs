//! Protocol and client tuning constants.

use std::time::Duration;

/// Maximum accepted WebSocket message size in bytes.
pub const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Interval between keepalive pings sent by the client.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(30);

/// How long the read side tolerates silence before declaring the
/// connection dead. Must exceed [`WS_PING_PERIOD`] so at least one pong
/// has a chance to arrive.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(75);

/// How long a `subscribe` request waits for its acknowledgment frame.
pub const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the graceful close handshake before local state is
/// forced to disconnected.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Close code sent on explicit disconnect (normal closure).
pub const WS_CLOSE_NORMAL: u16 = 1000;

/// Default cap on concurrently active subscriptions.
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 10;
