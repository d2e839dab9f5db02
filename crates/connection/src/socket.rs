//! WebSocket transport wrapper: dialing, pump wiring, and close signalling.

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;

use clobfeed_protocol::constants::{WS_CLOSE_NORMAL, WS_MAX_MESSAGE_SIZE};
use clobfeed_protocol::{ClientFrame, ServerFrame};

use crate::error::FeedError;

/// Why the read pump exited, with the peer's close reason if it sent one.
#[derive(Debug, Clone, Default)]
pub(crate) struct CloseInfo {
    pub(crate) reason: Option<String>,
}

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(0);

/// A single open WebSocket to the feed endpoint.
///
/// Owns the read/write/ping pumps; dropping the socket cancels them.
/// Parsed inbound frames arrive on the receiver returned by
/// [`FeedSocket::connect`], in transport order.
pub(crate) struct FeedSocket {
    id: u64,
    write_tx: mpsc::Sender<tungstenite::Message>,
    closed_rx: watch::Receiver<Option<CloseInfo>>,
    cancel: tokio_util::sync::CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    _ping_handle: tokio::task::JoinHandle<()>,
}

impl FeedSocket {
    /// Dials the endpoint and spawns the pumps.
    pub(crate) async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::Receiver<ServerFrame>), FeedError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false)
                .await
                .map_err(|source| FeedError::ConnectionFailed {
                    url: url.to_string(),
                    source,
                })?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let (frames_tx, frames_rx) = mpsc::channel::<ServerFrame>(256);
        let (closed_tx, closed_rx) = watch::channel(None);
        let cancel = tokio_util::sync::CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::read::read_pump(
                read, frames_tx, closed_tx, write_tx, cancel,
            ))
        };

        let ping_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::ping::ping_pump(write_tx, cancel))
        };

        let socket = Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            write_tx,
            closed_rx,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _ping_handle: ping_handle,
        };
        Ok((socket, frames_rx))
    }

    /// Identity of this socket; close events carry it so a stale event
    /// cannot tear down a newer socket.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Serializes and enqueues an outbound frame.
    pub(crate) async fn send_frame(&self, frame: &ClientFrame) -> Result<(), FeedError> {
        let json = serde_json::to_string(frame)?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| FeedError::Send("write queue closed".into()))
    }

    /// Requests a graceful close (normal close code) and stops the pumps.
    pub(crate) async fn close(&self) {
        let frame = tungstenite::protocol::CloseFrame {
            code: tungstenite::protocol::frame::coding::CloseCode::from(WS_CLOSE_NORMAL),
            reason: "client disconnect".into(),
        };
        let _ = self
            .write_tx
            .send(tungstenite::Message::Close(Some(frame)))
            .await;
        self.cancel.cancel();
    }

    /// A receiver that observes the read pump exiting.
    pub(crate) fn closed_receiver(&self) -> watch::Receiver<Option<CloseInfo>> {
        self.closed_rx.clone()
    }

    /// Resolves once the read pump has exited, yielding the close reason.
    pub(crate) async fn wait_closed(&self) -> Option<String> {
        let mut rx = self.closed_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(info) => info.as_ref().and_then(|close| close.reason.clone()),
            Err(_) => None,
        }
    }
}

impl Drop for FeedSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
        self._ping_handle.abort();
    }
}
