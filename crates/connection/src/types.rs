//! Public types for the feed connection.

use clobfeed_protocol::constants::DEFAULT_MAX_SUBSCRIPTIONS;

use crate::backoff::ReconnectPolicy;

/// Connection state of the feed socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket open.
    Disconnected,
    /// WebSocket handshake in progress.
    Connecting,
    /// Socket open and ready for subscriptions.
    Connected,
    /// Connection lost, waiting out the backoff before retrying.
    Reconnecting { attempt: u32 },
}

/// Events emitted to registered listeners.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The socket opened.
    Connected,
    /// The socket closed, with the peer's close reason if it sent one.
    Disconnected { reason: Option<String> },
    /// An automatic reconnection attempt is in progress.
    Reconnecting { attempt: u32 },
    /// A connection-level error occurred.
    Error { message: String },
}

/// Callback registered via `add_event_listener`.
pub type EventListener = Box<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Handle returned by `add_event_listener`, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Configuration for a [`FeedConnection`](crate::FeedConnection).
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket URL of the feed endpoint.
    pub url: String,
    /// Cap on concurrently active subscriptions.
    pub max_subscriptions: usize,
    /// Reconnection behavior after an unexpected disconnect.
    pub reconnect_policy: ReconnectPolicy,
}

impl FeedConfig {
    /// Creates a config with the default subscription cap and reconnect
    /// policy.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            reconnect_policy: ReconnectPolicy::default(),
        }
    }
}
