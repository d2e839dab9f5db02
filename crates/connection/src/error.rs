//! Errors surfaced by the feed connection.

use clobfeed_protocol::Channel;
use tokio_tungstenite::tungstenite;

/// Errors from the feed connection.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The transport could not be opened.
    #[error("connection to {url} failed: {source}")]
    ConnectionFailed {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("send failed: {0}")]
    Send(String),

    #[error("connection closed")]
    Closed,

    #[error("subscription limit reached ({count}/{max})")]
    SubscriptionLimit { count: usize, max: usize },

    #[error("already subscribed to channel: {0}")]
    AlreadySubscribed(Channel),

    #[error("subscribe timed out waiting for acknowledgment")]
    SubscribeTimeout,

    /// A channel-less error frame from the node.
    #[error("server error: {0}")]
    Server(String),

    #[error("reconnection attempts exhausted")]
    ReconnectExhausted,

    #[error("reconnection aborted")]
    ReconnectAborted,

    /// `wait` was called on a reconnection manager with a `never` policy.
    #[error("cannot wait with a 'never' reconnect policy")]
    NeverPolicyWait,

    /// A message handler panicked; delivered to the channel's error handler.
    #[error("message handler failed for channel {channel}")]
    Handler { channel: Channel },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = FeedError::Closed;
        assert_eq!(err.to_string(), "connection closed");

        let err = FeedError::SubscriptionLimit { count: 10, max: 10 };
        assert_eq!(err.to_string(), "subscription limit reached (10/10)");

        let err = FeedError::AlreadySubscribed(Channel::Orderbook);
        assert_eq!(err.to_string(), "already subscribed to channel: orderbook");

        let err = FeedError::Server("bad params".into());
        assert!(err.to_string().contains("bad params"));
    }
}
