use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message;

use crate::error::DeliveryError;
use crate::model::endpoint::Connection;

/// Relay side of one WebSocket, backed by the bounded queue its writer task drains.
#[derive(Debug, Clone)]
pub struct WsConnection {
    tx: mpsc::Sender<Message>,
}

impl WsConnection {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }
}

impl Connection for WsConnection {
    fn send(&self, frame: &str) -> Result<(), DeliveryError> {
        self.tx
            .try_send(Message::Text(frame.to_string()))
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Full,
                TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    fn close(&self) {
        // With a full queue the close frame is skipped; the writer still
        // closes the socket once the last sender is dropped.
        let _ = self.tx.try_send(Message::Close(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_and_closed_queues() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = WsConnection::new(tx);

        assert_eq!(conn.send("a"), Ok(()));
        assert_eq!(conn.send("b"), Err(DeliveryError::Full));

        assert_eq!(rx.try_recv().unwrap(), Message::Text("a".to_string()));
        drop(rx);
        assert_eq!(conn.send("c"), Err(DeliveryError::Closed));
    }
}
