//! The feed connection: public state machine over one WebSocket.
//!
//! Tracks connection state, enforces the subscription limit, routes
//! inbound frames to per-channel handlers, and reconnects automatically
//! with exponential backoff on unexpected disconnects.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clobfeed_protocol::constants::CLOSE_TIMEOUT;
use clobfeed_protocol::{Channel, ClientFrame};

use crate::backoff::ReconnectionManager;
use crate::error::FeedError;
use crate::reconnection::{
    FeedContext, ListenerMap, cancel_reconnect, emit_event, ensure_connected, send_subscribe,
};
use crate::registry::{ActiveSubscription, SubscriptionMeta, SubscriptionRegistry};
use crate::socket::FeedSocket;
use crate::types::{ConnectionEvent, ConnectionState, FeedConfig, ListenerId};

/// Connection manager for the clobfeed WebSocket feed.
///
/// One instance manages exactly one socket and one logical subscription
/// per channel. On an unexpected disconnect with live subscriptions, the
/// connection retries per its [`ReconnectPolicy`](crate::ReconnectPolicy)
/// and replays every subscription with its original handlers.
///
/// # Example
///
/// ```no_run
/// use clobfeed_connection::{FeedConfig, FeedConnection};
/// use clobfeed_protocol::Channel;
///
/// # async fn run() -> Result<(), clobfeed_connection::FeedError> {
/// let connection = FeedConnection::new(FeedConfig::new("wss://feed.example"));
/// connection.connect().await?;
///
/// connection
///     .subscribe(
///         Channel::Orderbook,
///         Some(serde_json::json!({"depth": 10})),
///         |update| println!("{update}"),
///         |err| eprintln!("{err}"),
///         || println!("done"),
///     )
///     .await?;
///
/// connection.unsubscribe(Channel::Orderbook).await;
/// connection.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct FeedConnection {
    config: Arc<FeedConfig>,
    socket: Arc<Mutex<Option<FeedSocket>>>,
    state: Arc<RwLock<ConnectionState>>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    reconnect: Arc<Mutex<ReconnectionManager>>,
    /// Re-entry guard: true while a reconnect loop is running.
    reconnecting: Arc<AtomicBool>,
    /// Cancel token for the active reconnect wait.
    reconnect_cancel: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    /// Set on explicit disconnect so the close handler won't reconnect.
    manual_disconnect: Arc<AtomicBool>,
    listeners: ListenerMap,
    next_listener_id: AtomicU64,
}

impl FeedConnection {
    /// Creates a new, disconnected feed connection.
    pub fn new(config: FeedConfig) -> Self {
        let reconnect = ReconnectionManager::new(config.reconnect_policy.clone());
        debug!(
            url = %config.url,
            max_subscriptions = config.max_subscriptions,
            "feed connection created"
        );
        Self {
            config: Arc::new(config),
            socket: Arc::new(Mutex::new(None)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            registry: Arc::new(Mutex::new(SubscriptionRegistry::default())),
            reconnect: Arc::new(Mutex::new(reconnect)),
            reconnecting: Arc::new(AtomicBool::new(false)),
            reconnect_cancel: Arc::new(std::sync::Mutex::new(None)),
            manual_disconnect: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Number of active subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.registry.lock().await.active_count()
    }

    /// The configured subscription cap.
    pub fn max_subscriptions(&self) -> usize {
        self.config.max_subscriptions
    }

    /// Whether another subscription would be accepted.
    pub async fn can_subscribe(&self) -> bool {
        self.subscription_count().await < self.config.max_subscriptions
    }

    /// Registers a connection event listener and returns its handle.
    pub fn add_event_listener(
        &self,
        listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.listeners.lock() {
            guard.insert(id, Box::new(listener));
        }
        ListenerId(id)
    }

    /// Removes a previously registered event listener.
    pub fn remove_event_listener(&self, id: ListenerId) {
        if let Ok(mut guard) = self.listeners.lock() {
            guard.remove(&id.0);
        }
    }

    /// Connects to the feed endpoint.
    ///
    /// A no-op when already connected or connecting; both callers resolve
    /// and no second socket is opened.
    pub async fn connect(&self) -> Result<(), FeedError> {
        self.manual_disconnect.store(false, Ordering::Relaxed);
        ensure_connected(&self.context()).await
    }

    /// Disconnects from the feed endpoint.
    ///
    /// Cancels any in-flight reconnection wait, rejects pending subscribe
    /// acks, and requests a graceful close. Resolves once the socket is
    /// down or after a hard timeout; it never hangs on an unresponsive
    /// peer.
    pub async fn disconnect(&self) {
        self.manual_disconnect.store(true, Ordering::Relaxed);
        cancel_reconnect(&self.reconnect_cancel);

        // In-flight subscribes fail immediately.
        self.registry
            .lock()
            .await
            .reject_all_pending(|| FeedError::Closed);

        let socket = self.socket.lock().await.take();
        let Some(socket) = socket else {
            self.settle_disconnected(None).await;
            return;
        };

        info!(url = %self.config.url, "disconnecting");
        socket.close().await;
        if tokio::time::timeout(CLOSE_TIMEOUT, socket.wait_closed())
            .await
            .is_err()
        {
            warn!("close handshake timed out, forcing disconnect");
        }
        self.settle_disconnected(Some("client disconnect".into()))
            .await;
    }

    /// Cancels any in-progress automatic reconnection. The connection
    /// settles in `Disconnected`; subscriptions stay registered.
    pub fn cancel_reconnection(&self) {
        cancel_reconnect(&self.reconnect_cancel);
    }

    /// Creates a subscription on `channel`.
    ///
    /// Fails fast, without any network round trip, when the subscription
    /// limit is reached or the channel already has an active or in-flight
    /// subscription. Connects first if not connected. The returned channel
    /// is the handle for [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(
        &self,
        channel: Channel,
        params: Option<serde_json::Value>,
        on_message: impl Fn(serde_json::Value) + Send + Sync + 'static,
        on_error: impl Fn(FeedError) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
    ) -> Result<Channel, FeedError> {
        {
            let registry = self.registry.lock().await;
            let count = registry.active_count();
            if count >= self.config.max_subscriptions {
                return Err(FeedError::SubscriptionLimit {
                    count,
                    max: self.config.max_subscriptions,
                });
            }
            if registry.is_tracked(channel) {
                return Err(FeedError::AlreadySubscribed(channel));
            }
        }

        if self.state().await != ConnectionState::Connected {
            self.connect().await?;
        }

        debug!(%channel, "creating subscription");

        let ctx = self.context();
        send_subscribe(&ctx, channel, params.clone()).await?;

        let sub = ActiveSubscription {
            channel,
            on_message: Box::new(on_message),
            on_error: Box::new(on_error),
            on_complete: Box::new(on_complete),
        };
        self.registry
            .lock()
            .await
            .insert_active(sub, SubscriptionMeta { channel, params });

        info!(%channel, "subscription created");
        Ok(channel)
    }

    /// Tears down the subscription on `channel`. A no-op for channels
    /// without one.
    ///
    /// The outbound `unsubscribe` frame is best-effort: a send failure is
    /// logged and local teardown proceeds regardless. The subscription's
    /// completion handler fires exactly once.
    pub async fn unsubscribe(&self, channel: Channel) {
        if self
            .registry
            .lock()
            .await
            .get_active(channel)
            .is_none()
        {
            return;
        }

        debug!(%channel, "unsubscribing");

        if self.state().await == ConnectionState::Connected {
            let socket = self.socket.lock().await;
            if let Some(socket) = socket.as_ref() {
                let frame = ClientFrame::Unsubscribe { channel };
                if let Err(e) = socket.send_frame(&frame).await {
                    warn!(%channel, error = %e, "failed to send unsubscribe");
                }
            }
        }

        if let Some(sub) = self.registry.lock().await.remove(channel) {
            if std::panic::catch_unwind(AssertUnwindSafe(|| (sub.on_complete)())).is_err() {
                warn!(%channel, "complete handler panicked");
            }
        }

        info!(%channel, "unsubscribed");
    }

    /// Forces local state to `Disconnected`, emitting the event only if
    /// the close handler has not already done so.
    async fn settle_disconnected(&self, reason: Option<String>) {
        let changed = {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Disconnected {
                false
            } else {
                *state = ConnectionState::Disconnected;
                true
            }
        };
        if changed {
            emit_event(&self.listeners, &ConnectionEvent::Disconnected { reason });
        }
    }

    /// Builds a [`FeedContext`] from the connection's shared state.
    fn context(&self) -> FeedContext {
        FeedContext {
            config: self.config.clone(),
            socket: self.socket.clone(),
            state: self.state.clone(),
            registry: self.registry.clone(),
            reconnect: self.reconnect.clone(),
            reconnecting: self.reconnecting.clone(),
            reconnect_cancel: self.reconnect_cancel.clone(),
            manual_disconnect: self.manual_disconnect.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectPolicy;

    fn test_config() -> FeedConfig {
        // An unroutable URL: tests that reach the network fail fast.
        FeedConfig::new("ws://127.0.0.1:1")
    }

    #[tokio::test]
    async fn new_connection_is_disconnected() {
        let connection = FeedConnection::new(test_config());
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
        assert_eq!(connection.subscription_count().await, 0);
        assert_eq!(connection.max_subscriptions(), 10);
        assert!(connection.can_subscribe().await);
    }

    #[tokio::test]
    async fn connect_to_unreachable_endpoint_fails() {
        let connection = FeedConnection::new(test_config());
        let result = connection.connect().await;
        assert!(matches!(result, Err(FeedError::ConnectionFailed { .. })));
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn subscribe_at_limit_fails_without_connecting() {
        let mut config = test_config();
        config.max_subscriptions = 0;
        let connection = FeedConnection::new(config);

        let result = connection
            .subscribe(Channel::Orderbook, None, |_| {}, |_| {}, || {})
            .await;

        // The limit error proves no dial was attempted: the URL is
        // unreachable and would have produced ConnectionFailed.
        assert!(matches!(
            result,
            Err(FeedError::SubscriptionLimit { count: 0, max: 0 })
        ));
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_when_not_connected_is_noop() {
        let connection = FeedConnection::new(test_config());
        connection.disconnect().await;
        connection.disconnect().await;
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_channel_is_noop() {
        let connection = FeedConnection::new(test_config());
        connection.unsubscribe(Channel::Bids).await;
        assert_eq!(connection.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn listeners_can_be_added_and_removed() {
        let connection = FeedConnection::new(test_config());
        let id = connection.add_event_listener(|_| {});
        let other = connection.add_event_listener(|_| {});
        assert_ne!(id, other);
        connection.remove_event_listener(id);
        connection.remove_event_listener(id);
    }

    #[tokio::test]
    async fn never_policy_connection_reports_no_retry() {
        let mut config = test_config();
        config.reconnect_policy = ReconnectPolicy::Never;
        let connection = FeedConnection::new(config);
        assert!(!connection.reconnect.lock().await.should_retry());
    }
}
