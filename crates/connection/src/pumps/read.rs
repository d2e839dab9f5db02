//! WebSocket read pump — parses and forwards inbound frames.

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use clobfeed_protocol::ServerFrame;
use clobfeed_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};

use crate::socket::CloseInfo;

/// Reads messages from the WebSocket, parses them as tagged frames, and
/// forwards them in transport order.
///
/// Any incoming message resets the pong deadline; a connection that stays
/// silent past [`WS_PONG_WAIT`] is considered dead and the pump exits,
/// which surfaces as a close to the connection layer.
pub(crate) async fn read_pump<S>(
    mut read: S,
    frames_tx: mpsc::Sender<ServerFrame>,
    closed_tx: watch::Sender<Option<CloseInfo>>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let mut close_reason: Option<String> = None;

    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, connection dead, closing");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        // Any traffic proves the connection is alive.
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                forward_text_frame(&text, &frames_tx).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                if let Some(f) = &frame
                                    && !f.reason.is_empty()
                                {
                                    close_reason = Some(f.reason.to_string());
                                }
                                debug!("received close frame");
                                break;
                            }
                            _ => {} // Binary frames are not part of the feed protocol.
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let _ = closed_tx.send(Some(CloseInfo {
        reason: close_reason,
    }));
}

/// Parses one text message and forwards the frame.
async fn forward_text_frame(text: &str, frames_tx: &mpsc::Sender<ServerFrame>) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("failed to parse frame: {e}");
            return;
        }
    };

    if frames_tx.send(frame).await.is_err() {
        debug!("frame receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn channels() -> (
        mpsc::Sender<ServerFrame>,
        mpsc::Receiver<ServerFrame>,
        watch::Sender<Option<CloseInfo>>,
        watch::Receiver<Option<CloseInfo>>,
        mpsc::Sender<tungstenite::Message>,
        mpsc::Receiver<tungstenite::Message>,
    ) {
        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (closed_tx, closed_rx) = watch::channel(None);
        let (write_tx, write_rx) = mpsc::channel(16);
        (frames_tx, frames_rx, closed_tx, closed_rx, write_tx, write_rx)
    }

    #[tokio::test]
    async fn forwards_parsed_frames_in_order() {
        let (frames_tx, mut frames_rx, closed_tx, _closed_rx, write_tx, _write_rx) = channels();

        let messages = [
            r#"{"type":"subscribed","channel":"orderbook"}"#,
            r#"{"type":"orderbook_snapshot","clob_id":"0x1"}"#,
        ]
        .map(|json| Ok(tungstenite::Message::Text(json.into())));
        let stream = stream::iter(messages);

        read_pump(
            stream,
            frames_tx,
            closed_tx,
            write_tx,
            CancellationToken::new(),
        )
        .await;

        let first = frames_rx.recv().await.unwrap();
        assert!(matches!(first, ServerFrame::Subscribed { .. }));
        let second = frames_rx.recv().await.unwrap();
        assert!(matches!(second, ServerFrame::OrderbookSnapshot { .. }));
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_dropped() {
        let (frames_tx, mut frames_rx, closed_tx, _closed_rx, write_tx, _write_rx) = channels();

        let messages = [
            "not json {{{",
            r#"{"type":"heartbeat"}"#,
            r#"{"type":"unsubscribed","channel":"bids"}"#,
        ]
        .map(|json| Ok(tungstenite::Message::Text(json.into())));

        read_pump(
            stream::iter(messages),
            frames_tx,
            closed_tx,
            write_tx,
            CancellationToken::new(),
        )
        .await;

        // Only the valid frame survives.
        let frame = frames_rx.recv().await.unwrap();
        assert!(matches!(frame, ServerFrame::Unsubscribed { .. }));
        assert!(frames_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (frames_tx, _frames_rx, closed_tx, _closed_rx, write_tx, mut write_rx) = channels();

        let messages = [Ok(tungstenite::Message::Ping(vec![1, 2].into()))];
        read_pump(
            stream::iter(messages),
            frames_tx,
            closed_tx,
            write_tx,
            CancellationToken::new(),
        )
        .await;

        let reply = write_rx.recv().await.unwrap();
        assert!(matches!(reply, tungstenite::Message::Pong(_)));
    }

    #[tokio::test]
    async fn stream_end_signals_close() {
        let (frames_tx, _frames_rx, closed_tx, mut closed_rx, write_tx, _write_rx) = channels();

        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();
        read_pump(empty, frames_tx, closed_tx, write_tx, CancellationToken::new()).await;

        let info = closed_rx.wait_for(Option::is_some).await.unwrap();
        assert!(info.as_ref().unwrap().reason.is_none());
    }

    #[tokio::test]
    async fn close_frame_reason_is_captured() {
        let (frames_tx, _frames_rx, closed_tx, mut closed_rx, write_tx, _write_rx) = channels();

        let frame = tungstenite::protocol::CloseFrame {
            code: tungstenite::protocol::frame::coding::CloseCode::Away,
            reason: "going away".into(),
        };
        let messages = [Ok(tungstenite::Message::Close(Some(frame)))];
        read_pump(
            stream::iter(messages),
            frames_tx,
            closed_tx,
            write_tx,
            CancellationToken::new(),
        )
        .await;

        let info = closed_rx.wait_for(Option::is_some).await.unwrap();
        assert_eq!(
            info.as_ref().unwrap().reason.as_deref(),
            Some("going away")
        );
    }

    #[tokio::test]
    async fn silence_past_pong_deadline_ends_pump() {
        tokio::time::pause();

        let (frames_tx, _frames_rx, closed_tx, closed_rx, write_tx, _write_rx) = channels();

        // A stream that never yields, simulating a dead connection.
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();
        let handle = tokio::spawn(read_pump(
            silent,
            frames_tx,
            closed_tx,
            write_tx,
            CancellationToken::new(),
        ));

        handle.await.unwrap();
        assert!(closed_rx.borrow().is_some());
    }

    #[tokio::test]
    async fn cancel_stops_pump() {
        let (frames_tx, _frames_rx, closed_tx, mut closed_rx, write_tx, _write_rx) = channels();

        let cancel = CancellationToken::new();
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();
        let pump = tokio::spawn(read_pump(silent, frames_tx, closed_tx, write_tx, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), pump)
            .await
            .expect("should stop")
            .expect("no panic");
        assert!(closed_rx.borrow_and_update().is_some());
    }
}
