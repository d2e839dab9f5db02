//! WebSocket write pump — serialises outbound messages.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Writes messages to the WebSocket.
///
/// Exits on cancellation or when the queue closes, and makes sure a close
/// frame goes out exactly once on the way down.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut sent_close = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        let is_close = matches!(m, tungstenite::Message::Close(_));
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            break;
                        }
                        if is_close {
                            sent_close = true;
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    if !sent_close {
        let _ = write.send(tungstenite::Message::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    fn capture_sink() -> (
        std::pin::Pin<Box<impl SinkExt<tungstenite::Message, Error = tungstenite::Error>>>,
        mpsc::Receiver<tungstenite::Message>,
    ) {
        let (sink_tx, sink_rx) = mpsc::channel::<tungstenite::Message>(16);
        let sink = sink::unfold(sink_tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        });
        (Box::pin(sink), sink_rx)
    }

    #[tokio::test]
    async fn writes_queued_messages() {
        let (sink, mut sink_rx) = capture_sink();
        let (write_tx, write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(write_pump(sink, write_rx, cancel));

        write_tx
            .send(tungstenite::Message::Text("{\"type\":\"subscribe\"}".into()))
            .await
            .unwrap();
        let written = sink_rx.recv().await.unwrap();
        assert!(matches!(written, tungstenite::Message::Text(_)));

        drop(write_tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn sends_close_frame_on_cancel() {
        let (sink, mut sink_rx) = capture_sink();
        let (_write_tx, write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(write_pump(sink, write_rx, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), pump)
            .await
            .expect("should stop")
            .expect("no panic");

        let close = sink_rx.recv().await;
        assert!(matches!(close, Some(tungstenite::Message::Close(_))));
    }

    #[tokio::test]
    async fn queued_close_is_not_duplicated() {
        let (sink, mut sink_rx) = capture_sink();
        let (write_tx, write_rx) = mpsc::channel(16);

        let pump = tokio::spawn(write_pump(sink, write_rx, CancellationToken::new()));

        write_tx
            .send(tungstenite::Message::Close(None))
            .await
            .unwrap();
        pump.await.unwrap();

        let first = sink_rx.recv().await;
        assert!(matches!(first, Some(tungstenite::Message::Close(_))));
        assert!(sink_rx.recv().await.is_none());
    }
}
