//! Connection establishment, frame routing, and the reconnect loop.
//!
//! Contains the shared [`FeedContext`], cancellation helpers, and the free
//! functions that drive the connection state machine from socket events.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use clobfeed_protocol::constants::SUBSCRIBE_ACK_TIMEOUT;
use clobfeed_protocol::{Channel, ClientFrame, ServerFrame};

use crate::backoff::ReconnectionManager;
use crate::error::FeedError;
use crate::registry::{ActiveSubscription, SubscriptionRegistry};
use crate::socket::FeedSocket;
use crate::types::{ConnectionEvent, ConnectionState, EventListener, FeedConfig};

/// Registered event listeners, keyed by listener id.
pub(crate) type ListenerMap = Arc<std::sync::Mutex<HashMap<u64, EventListener>>>;

/// Shared state passed to free functions for socket callback setup and
/// reconnection. Avoids threading eight separate Arc parameters.
#[derive(Clone)]
pub(crate) struct FeedContext {
    pub(crate) config: Arc<FeedConfig>,
    pub(crate) socket: Arc<Mutex<Option<FeedSocket>>>,
    pub(crate) state: Arc<RwLock<ConnectionState>>,
    pub(crate) registry: Arc<Mutex<SubscriptionRegistry>>,
    pub(crate) reconnect: Arc<Mutex<ReconnectionManager>>,
    pub(crate) reconnecting: Arc<AtomicBool>,
    pub(crate) reconnect_cancel: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    pub(crate) manual_disconnect: Arc<AtomicBool>,
    pub(crate) listeners: ListenerMap,
}

/// Cancels the active reconnect wait, if any.
pub(crate) fn cancel_reconnect(slot: &std::sync::Mutex<Option<CancellationToken>>) {
    if let Ok(mut guard) = slot.lock()
        && let Some(token) = guard.take()
    {
        token.cancel();
    }
}

/// Emits an event to every registered listener. A panicking listener is
/// logged and does not affect the others.
pub(crate) fn emit_event(listeners: &ListenerMap, event: &ConnectionEvent) {
    if let Ok(guard) = listeners.lock() {
        for listener in guard.values() {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(?event, "event listener panicked");
            }
        }
    }
}

/// Connects unless a socket is already open or being opened. The
/// `Connecting` state is claimed under the write lock, so concurrent
/// callers cannot both dial.
pub(crate) async fn ensure_connected(ctx: &FeedContext) -> Result<(), FeedError> {
    {
        let mut state = ctx.state.write().await;
        match *state {
            ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
            _ => *state = ConnectionState::Connecting,
        }
    }
    establish(ctx).await
}

/// Opens the transport, wires up routing and close handling, and moves the
/// connection to `Connected`. Expects the `Connecting` state to already be
/// claimed.
pub(crate) async fn establish(ctx: &FeedContext) -> Result<(), FeedError> {
    info!(url = %ctx.config.url, "connecting");

    let (socket, mut frames_rx) = match FeedSocket::connect(&ctx.config.url).await {
        Ok(pair) => pair,
        Err(e) => {
            *ctx.state.write().await = ConnectionState::Disconnected;
            warn!(url = %ctx.config.url, error = %e, "connection failed");
            emit_event(
                &ctx.listeners,
                &ConnectionEvent::Error {
                    message: e.to_string(),
                },
            );
            return Err(e);
        }
    };

    // Router task: frames are delivered strictly in transport order.
    let ctx_route = ctx.clone();
    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            route_frame(&ctx_route, frame).await;
        }
    });

    let socket_id = socket.id();
    let mut closed_rx = socket.closed_receiver();
    *ctx.socket.lock().await = Some(socket);
    *ctx.state.write().await = ConnectionState::Connected;

    // A fresh connection starts the attempt counter over. The manager is
    // only ever contended by a reconnect loop sitting in its backoff wait,
    // and that loop resets after resubscribing, so skipping here is safe.
    if let Ok(mut reconnect) = ctx.reconnect.try_lock() {
        reconnect.reset();
    }

    // Close watcher: spawned only after the socket is registered, so close
    // handling can never observe a half-installed connection.
    let ctx_close = ctx.clone();
    tokio::spawn(async move {
        let reason = match closed_rx.wait_for(Option::is_some).await {
            Ok(info) => info.as_ref().and_then(|close| close.reason.clone()),
            Err(_) => None,
        };
        handle_close(ctx_close, socket_id, reason).await;
    });

    info!(url = %ctx.config.url, "connected");
    emit_event(&ctx.listeners, &ConnectionEvent::Connected);
    Ok(())
}

/// Sends a `subscribe` frame and waits for its acknowledgment.
///
/// The pending slot is claimed before the frame goes out and cleaned up on
/// every failure path; no registry entries survive a failed subscribe.
pub(crate) async fn send_subscribe(
    ctx: &FeedContext,
    channel: Channel,
    params: Option<serde_json::Value>,
) -> Result<(), FeedError> {
    let (ack_tx, ack_rx) = oneshot::channel();
    ctx.registry.lock().await.claim_pending(channel, ack_tx)?;

    let frame = ClientFrame::Subscribe { channel, params };
    let sent = {
        let socket = ctx.socket.lock().await;
        match socket.as_ref() {
            Some(socket) => socket.send_frame(&frame).await,
            None => Err(FeedError::Closed),
        }
    };
    if let Err(e) = sent {
        ctx.registry.lock().await.take_pending(channel);
        return Err(e);
    }
    debug!(%channel, "sent subscribe");

    match tokio::time::timeout(SUBSCRIBE_ACK_TIMEOUT, ack_rx).await {
        Ok(Ok(result)) => result,
        // The ack sender was dropped, e.g. the registry was cleared.
        Ok(Err(_)) => Err(FeedError::Closed),
        Err(_) => {
            ctx.registry.lock().await.take_pending(channel);
            Err(FeedError::SubscribeTimeout)
        }
    }
}

/// Routes one inbound frame: acks resolve their pending subscribe,
/// channel-less errors reject every pending subscribe, data frames go to
/// their channel's message handler.
pub(crate) async fn route_frame(ctx: &FeedContext, frame: ServerFrame) {
    if let Some(channel) = frame.data_channel() {
        deliver_data(ctx, channel, &frame).await;
        return;
    }

    match frame {
        ServerFrame::Subscribed { channel } => {
            let ack = ctx.registry.lock().await.take_pending(channel);
            match ack {
                Some(ack) => {
                    debug!(%channel, "subscribe acknowledged");
                    let _ = ack.send(Ok(()));
                }
                None => debug!(%channel, "unmatched subscribed ack"),
            }
        }
        ServerFrame::Unsubscribed { channel } => {
            debug!(%channel, "unsubscribe acknowledged");
        }
        ServerFrame::Error { message } => {
            // The protocol does not correlate generic errors to a request,
            // so every in-flight subscribe is rejected.
            warn!(%message, "error frame from server");
            ctx.registry
                .lock()
                .await
                .reject_all_pending(|| FeedError::Server(message.clone()));
        }
        // Data frames were handled above.
        _ => {}
    }
}

/// Delivers a data frame to its channel's message handler. A handler that
/// panics is redirected to that channel's error handler; routing of other
/// channels is unaffected.
async fn deliver_data(ctx: &FeedContext, channel: Channel, frame: &ServerFrame) {
    let value = match serde_json::to_value(frame) {
        Ok(value) => value,
        Err(e) => {
            warn!(%channel, error = %e, "failed to convert data frame");
            return;
        }
    };

    let registry = ctx.registry.lock().await;
    let Some(sub) = registry.get_active(channel) else {
        debug!(%channel, "no active subscription, dropping frame");
        return;
    };

    if std::panic::catch_unwind(AssertUnwindSafe(|| (sub.on_message)(value))).is_err() {
        warn!(%channel, "message handler panicked");
        let err = FeedError::Handler { channel };
        if std::panic::catch_unwind(AssertUnwindSafe(|| (sub.on_error)(err))).is_err() {
            warn!(%channel, "error handler panicked");
        }
    }
}

/// Runs when a socket's read pump has exited: settles state, rejects
/// in-flight subscribes, and decides whether to start the reconnect loop.
pub(crate) async fn handle_close(ctx: FeedContext, socket_id: u64, reason: Option<String>) {
    let was_connected = *ctx.state.read().await == ConnectionState::Connected;

    {
        let mut guard = ctx.socket.lock().await;
        match guard.as_ref() {
            Some(socket) if socket.id() == socket_id => {
                guard.take();
            }
            // A newer socket is installed; this close event is stale.
            Some(_) => return,
            // Explicit disconnect already removed the socket.
            None => {}
        }
    }

    warn!(?reason, was_connected, "WebSocket closed");

    let changed = {
        let mut state = ctx.state.write().await;
        if *state == ConnectionState::Disconnected {
            false
        } else {
            *state = ConnectionState::Disconnected;
            true
        }
    };
    if changed {
        emit_event(
            &ctx.listeners,
            &ConnectionEvent::Disconnected {
                reason: reason.clone(),
            },
        );
    }

    // In-flight subscribes cannot survive a drop.
    let has_subscriptions = {
        let mut registry = ctx.registry.lock().await;
        registry.reject_all_pending(|| FeedError::Closed);
        registry.active_count() > 0
    };

    let manual = ctx.manual_disconnect.load(Ordering::Relaxed);
    if was_connected
        && has_subscriptions
        && !manual
        && !ctx.reconnecting.swap(true, Ordering::SeqCst)
    {
        let cancel = CancellationToken::new();
        cancel_reconnect(&ctx.reconnect_cancel);
        if let Ok(mut guard) = ctx.reconnect_cancel.lock() {
            *guard = Some(cancel.clone());
        }
        tokio::spawn(reconnect_loop(ctx.clone(), cancel));
    }
}

/// Reconnection loop with exponential backoff and resubscription.
///
/// Returns a boxed future to break the recursive type cycle with
/// [`handle_close`], which spawns this function from the close watcher of
/// every socket it tears down.
pub(crate) fn reconnect_loop(
    ctx: FeedContext,
    cancel: CancellationToken,
) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            let (should_retry, attempt) = {
                let reconnect = ctx.reconnect.lock().await;
                (reconnect.should_retry(), reconnect.current_attempt())
            };

            if !should_retry {
                abandon_subscriptions(&ctx).await;
                break;
            }

            *ctx.state.write().await = ConnectionState::Reconnecting { attempt };
            emit_event(&ctx.listeners, &ConnectionEvent::Reconnecting { attempt });
            info!(attempt, "reconnecting");

            // Wait out the backoff delay (or cancellation).
            let wait = ctx.reconnect.lock().await.wait(&cancel).await;
            if wait.is_err() {
                // Explicit disconnect is in progress; stop silently.
                debug!("reconnect cancelled");
                let mut state = ctx.state.write().await;
                if matches!(*state, ConnectionState::Reconnecting { .. }) {
                    *state = ConnectionState::Disconnected;
                }
                break;
            }

            match ensure_connected(&ctx).await {
                Ok(()) => {
                    resubscribe_all(&ctx).await;
                    ctx.reconnect.lock().await.reset();
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    ctx.reconnect.lock().await.record_failure();
                }
            }

            if cancel.is_cancelled() {
                break;
            }
        }

        // Release the cancel token before clearing the in-progress flag so
        // a new loop never sees a stale token.
        if let Ok(mut guard) = ctx.reconnect_cancel.lock() {
            *guard = None;
        }
        ctx.reconnecting.store(false, Ordering::SeqCst);
    })
}

/// Terminal cleanup once retries are exhausted: every active subscription
/// hears the error and completes, then the registry is emptied. The caller
/// must connect and subscribe again manually.
async fn abandon_subscriptions(ctx: &FeedContext) {
    error!("reconnection attempts exhausted");

    let subscriptions = ctx.registry.lock().await.drain_active();
    for sub in subscriptions {
        notify_dropped(&sub, FeedError::ReconnectExhausted);
    }
    *ctx.state.write().await = ConnectionState::Disconnected;
}

/// Replays `subscribe` for every channel that was active before the drop,
/// reusing the original handler triples. A channel that fails to
/// resubscribe is dropped with its own error/complete callbacks; the rest
/// continue.
async fn resubscribe_all(ctx: &FeedContext) {
    let entries = ctx.registry.lock().await.take_for_resubscribe();

    for (meta, sub) in entries {
        let channel = meta.channel;
        match send_subscribe(ctx, channel, meta.params.clone()).await {
            Ok(()) => {
                ctx.registry.lock().await.insert_active(sub, meta);
                info!(%channel, "resubscribed");
            }
            Err(e) => {
                warn!(%channel, error = %e, "failed to resubscribe");
                notify_dropped(&sub, e);
            }
        }
    }
}

/// Fires a subscription's error and completion handlers, guarding against
/// handler panics.
fn notify_dropped(sub: &ActiveSubscription, err: FeedError) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| (sub.on_error)(err))).is_err() {
        warn!(channel = %sub.channel, "error handler panicked");
    }
    if std::panic::catch_unwind(AssertUnwindSafe(|| (sub.on_complete)())).is_err() {
        warn!(channel = %sub.channel, "complete handler panicked");
    }
}
