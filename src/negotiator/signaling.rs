//! Client side of the signaling channel

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{NegotiatorError, NegotiatorResult};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// An open channel to the relay.
///
/// Frames are written by a writer task so sending never waits on the socket.
/// Inbound frames are handed over as raw bytes; `recv` returns `None` once
/// the relay side is gone.
pub struct SignalingLink {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl SignalingLink {
    /// Open a WebSocket to `url` (`ws://host:port`).
    pub async fn connect(url: &str) -> NegotiatorResult<SignalingLink> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| NegotiatorError::SignalingUnavailable(format!("{url}: {e}")))?;
        info!("Connected to signaling server {}", url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(frame)).await {
                    warn!("Failed to send signaling frame: {}", e);
                    return;
                }
            }
            // Sender dropped: leave politely.
            let _ = ws_tx.send(Message::Close(None)).await;
            let _ = ws_tx.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let raw = match frame {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling read failed: {}", e);
                        break;
                    }
                };
                if inbound_tx.send(raw).is_err() {
                    break;
                }
            }
            debug!("Signaling reader finished");
        });

        Ok(SignalingLink {
            outbound: Some(outbound),
            inbound,
            writer: Some(writer),
            reader: Some(reader),
        })
    }

    /// A link over plain channels, with no socket behind it.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> SignalingLink {
        SignalingLink {
            outbound: Some(outbound),
            inbound,
            writer: None,
            reader: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Queue a frame. Returns `false` when the link is closed.
    pub fn send(&self, frame: String) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Send a Close frame and release the socket.
    pub async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();

        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                debug!("Signaling writer did not finish in time");
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_link() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let mut link = SignalingLink::from_channels(out_tx, in_rx);

        assert!(link.is_open());
        assert!(link.send("hello".to_string()));
        assert_eq!(out_rx.recv().await.as_deref(), Some("hello"));

        in_tx.send(b"world".to_vec()).unwrap();
        assert_eq!(link.recv().await, Some(b"world".to_vec()));

        link.close().await;
        assert!(!link.is_open());
        assert!(!link.send("late".to_string()));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let err = SignalingLink::connect("ws://127.0.0.1:1")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NegotiatorError::SignalingUnavailable(_)));
    }
}
