//! Signaling relay
//!
//! [`Relay`] owns the set of connected endpoints and routes envelopes between
//! them. It knows nothing about the transport: the WebSocket server in
//! [`server`] feeds it connect/message/disconnect events from a single router
//! task, so that task is the only place the endpoint set is mutated.

pub mod connection;
pub mod server;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::error::{RelayError, RelayResult};
use crate::model::endpoint::{Connection, Endpoint, EndpointId, EndpointInfo};
use crate::model::envelope::Envelope;

pub use server::{RelayHandle, RelayServer};

/// Outcome of handing one frame to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Routed; `recipients` lists the endpoints whose connection accepted it.
    Delivered { recipients: Vec<EndpointId> },
    /// No eligible recipient, unknown sender, or relay shutting down.
    Dropped,
    /// The frame could not be decoded into an envelope.
    Malformed,
}

/// Relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub active_endpoints: usize,
    pub routed: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
    pub malformed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub struct Relay {
    endpoints: BTreeMap<EndpointId, Endpoint>,
    shutting_down: bool,
    stats: RelayStats,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly connected party. It can receive envelopes immediately.
    pub fn on_connect(&mut self, connection: Box<dyn Connection>) -> RelayResult<EndpointId> {
        if self.shutting_down {
            connection.close();
            return Err(RelayError::ShuttingDown);
        }

        let endpoint = Endpoint::new(connection);
        let id = endpoint.id;
        self.endpoints.insert(id, endpoint);

        info!(endpoint = %id, active = self.endpoints.len(), "Endpoint connected");
        Ok(id)
    }

    /// Decode a raw frame from `from` and route it.
    ///
    /// Malformed frames are logged and dropped; they never disconnect the sender.
    pub fn on_message(&mut self, from: EndpointId, raw: &[u8]) -> Route {
        if self.shutting_down {
            trace!(endpoint = %from, "Relay shutting down, dropping frame");
            return Route::Dropped;
        }

        if !self.endpoints.contains_key(&from) {
            debug!(endpoint = %from, "Frame from unknown endpoint dropped");
            self.stats.dropped += 1;
            return Route::Dropped;
        }

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(endpoint = %from, error = %e, "Dropping malformed frame");
                self.stats.malformed += 1;
                return Route::Malformed;
            }
        };

        debug!(
            endpoint = %from,
            event = envelope.event(),
            to = ?envelope.target(),
            "Received envelope"
        );

        self.route(from, &envelope)
    }

    /// Forward an envelope on behalf of `from`.
    ///
    /// With a target, only that endpoint receives it; without one, every
    /// connected endpoint except the sender does, once each. A failed delivery
    /// is logged and never stops delivery to the remaining recipients.
    pub fn route(&mut self, from: EndpointId, envelope: &Envelope) -> Route {
        if self.shutting_down {
            return Route::Dropped;
        }

        let recipients: Vec<EndpointId> = match envelope.target() {
            Some(target) if target == from => {
                debug!(endpoint = %from, "Envelope targeted at its own sender dropped");
                vec![]
            }
            Some(target) if self.endpoints.contains_key(&target) => vec![target],
            Some(target) => {
                debug!(endpoint = %from, to = %target, "Target not connected, dropping envelope");
                vec![]
            }
            None => self
                .endpoints
                .keys()
                .filter(|id| **id != from)
                .copied()
                .collect(),
        };

        if recipients.is_empty() {
            self.stats.dropped += 1;
            return Route::Dropped;
        }

        let frame = match envelope.forwarded_from(from).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(endpoint = %from, error = %e, "Failed to encode envelope");
                self.stats.dropped += 1;
                return Route::Dropped;
            }
        };

        self.stats.routed += 1;

        let mut delivered = Vec::with_capacity(recipients.len());
        for id in recipients {
            let Some(endpoint) = self.endpoints.get_mut(&id) else {
                continue;
            };

            match endpoint.deliver(&frame) {
                Ok(()) => {
                    self.stats.deliveries += 1;
                    delivered.push(id);
                }
                Err(e) => {
                    self.stats.failed_deliveries += 1;
                    warn!(
                        endpoint = %id,
                        sender = %from,
                        event = envelope.event(),
                        error = %e,
                        "Delivery failed"
                    );
                }
            }
        }

        self.reap();

        Route::Delivered {
            recipients: delivered,
        }
    }

    /// Remove a departed endpoint. Removing an unknown endpoint is a no-op.
    pub fn on_disconnect(&mut self, id: EndpointId) -> bool {
        let removed = self.remove(id);
        if removed {
            info!(endpoint = %id, active = self.endpoints.len(), "Endpoint disconnected");
        }
        removed
    }

    /// Remove an endpoint whose transport failed.
    pub fn on_error(&mut self, id: EndpointId, reason: &str) -> bool {
        let removed = self.remove(id);
        if removed {
            warn!(endpoint = %id, reason, active = self.endpoints.len(), "Endpoint failed");
        }
        removed
    }

    /// Close every endpoint and stop routing. Later frames are dropped silently.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        let endpoints = std::mem::take(&mut self.endpoints);
        let count = endpoints.len();
        for (_, mut endpoint) in endpoints {
            endpoint.disconnect();
        }

        info!(closed = count, "Relay shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.endpoints.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints.values().map(Endpoint::info).collect()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_endpoints: self.endpoints.len(),
            ..self.stats
        }
    }

    fn remove(&mut self, id: EndpointId) -> bool {
        match self.endpoints.remove(&id) {
            Some(mut endpoint) => {
                endpoint.disconnect();
                true
            }
            None => false,
        }
    }

    // Clean endpoints whose connection reported closed during delivery
    fn reap(&mut self) {
        self.endpoints.retain(|id, endpoint| {
            if endpoint.is_alive() {
                return true;
            }
            endpoint.disconnect();
            info!(endpoint = %id, "Reaped closed endpoint");
            false
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    /// In-memory connection that records every frame it is handed.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingConnection {
        frames: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
        fail_with: Arc<Mutex<Option<DeliveryError>>>,
    }

    impl RecordingConnection {
        pub(crate) fn frames(&self) -> Vec<serde_json::Value> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|f| serde_json::from_str(f).unwrap())
                .collect()
        }

        pub(crate) fn fail_with(&self, error: DeliveryError) {
            *self.fail_with.lock().unwrap() = Some(error);
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Connection for RecordingConnection {
        fn send(&self, frame: &str) -> Result<(), DeliveryError> {
            if let Some(e) = *self.fail_with.lock().unwrap() {
                return Err(e);
            }
            self.frames.lock().unwrap().push(frame.to_string());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn connect(relay: &mut Relay) -> (EndpointId, RecordingConnection) {
        let conn = RecordingConnection::default();
        let id = relay.on_connect(Box::new(conn.clone())).unwrap();
        (id, conn)
    }

    #[test]
    fn test_targeted_offer_and_answer() {
        let mut relay = Relay::new();
        let (a, conn_a) = connect(&mut relay);
        let (b, conn_b) = connect(&mut relay);
        let (_c, conn_c) = connect(&mut relay);

        let offer = format!(r#"{{"event":"offer","data":{{"sdp":"X"}},"target":{}}}"#, *b);
        assert_eq!(
            relay.on_message(a, offer.as_bytes()),
            Route::Delivered { recipients: vec![b] }
        );

        let answer = format!(r#"{{"event":"answer","data":{{"sdp":"Y"}},"target":{}}}"#, *a);
        assert_eq!(
            relay.on_message(b, answer.as_bytes()),
            Route::Delivered { recipients: vec![a] }
        );

        let to_b = conn_b.frames();
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["event"], "offer");
        assert_eq!(to_b[0]["data"]["sdp"], "X");
        assert_eq!(to_b[0]["from"], *a);

        let to_a = conn_a.frames();
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["data"]["sdp"], "Y");
        assert_eq!(to_a[0]["from"], *b);

        assert!(conn_c.frames().is_empty());
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let mut relay = Relay::new();
        let (a, conn_a) = connect(&mut relay);
        let (_, conn_b) = connect(&mut relay);

        for i in 0..3 {
            let frame = format!(r#"{{"event":"candidate","data":{{"candidate":"c{i}"}}}}"#);
            relay.on_message(a, frame.as_bytes());
        }

        assert!(conn_a.frames().is_empty());
        let received = conn_b.frames();
        assert_eq!(received.len(), 3);
        let order: Vec<_> = received.iter().map(|f| f["data"]["candidate"].clone()).collect();
        assert_eq!(order, vec!["c0", "c1", "c2"]);
        assert!(received.iter().all(|f| f["from"] == *a));
        assert_eq!(relay.stats().deliveries, 3);
    }

    #[test]
    fn test_one_failing_send_does_not_block_others() {
        let mut relay = Relay::new();
        let (sender, _) = connect(&mut relay);
        let (broken, conn_broken) = connect(&mut relay);
        let (healthy, conn_healthy) = connect(&mut relay);

        conn_broken.fail_with(DeliveryError::Full);

        let route = relay.on_message(sender, br#"{"event":"offer","data":{}}"#);

        assert_eq!(route, Route::Delivered { recipients: vec![healthy] });
        assert_eq!(conn_healthy.frames().len(), 1);
        // A full queue drops the envelope but keeps the endpoint.
        assert!(relay.contains(broken));
        assert_eq!(relay.stats().failed_deliveries, 1);
    }

    #[test]
    fn test_closed_recipient_is_reaped_mid_broadcast() {
        let mut relay = Relay::new();
        let (sender, _) = connect(&mut relay);
        let (gone, conn_gone) = connect(&mut relay);
        let (_, conn_other) = connect(&mut relay);

        conn_gone.fail_with(DeliveryError::Closed);

        relay.on_message(sender, br#"{"event":"candidate","data":{}}"#);
        assert_eq!(conn_other.frames().len(), 1);
        assert!(!relay.contains(gone));
        assert!(conn_gone.is_closed());

        relay.on_message(sender, br#"{"event":"candidate","data":{}}"#);
        assert!(conn_gone.frames().is_empty());
        assert_eq!(conn_other.frames().len(), 2);
    }

    #[test]
    fn test_malformed_frame_keeps_sender_connected() {
        let mut relay = Relay::new();
        let (a, conn_a) = connect(&mut relay);
        let (_, conn_b) = connect(&mut relay);

        assert_eq!(relay.on_message(a, b"{not json"), Route::Malformed);
        assert_eq!(relay.on_message(a, br#"{"data":1}"#), Route::Malformed);

        assert_eq!(relay.len(), 2);
        assert!(relay.contains(a));
        assert!(!conn_a.is_closed());
        assert!(conn_b.frames().is_empty());
        assert_eq!(relay.stats().malformed, 2);
    }

    #[test]
    fn test_target_gone_or_self_is_dropped() {
        let mut relay = Relay::new();
        let (a, _) = connect(&mut relay);
        let (b, conn_b) = connect(&mut relay);

        relay.on_disconnect(b);
        let frame = format!(r#"{{"event":"offer","target":{}}}"#, *b);
        assert_eq!(relay.on_message(a, frame.as_bytes()), Route::Dropped);
        assert!(conn_b.frames().is_empty());

        let frame = format!(r#"{{"event":"offer","target":{}}}"#, *a);
        assert_eq!(relay.on_message(a, frame.as_bytes()), Route::Dropped);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut relay = Relay::new();
        let (a, conn_a) = connect(&mut relay);

        assert!(relay.on_disconnect(a));
        assert!(conn_a.is_closed());
        assert!(!relay.on_disconnect(a));
        assert!(!relay.on_error(a, "reset"));
        assert!(relay.is_empty());
    }

    #[test]
    fn test_shutdown_closes_and_drops_later_routes() {
        let mut relay = Relay::new();
        let (a, conn_a) = connect(&mut relay);
        let (_, conn_b) = connect(&mut relay);

        relay.shutdown();
        relay.shutdown();

        assert!(relay.is_empty());
        assert!(conn_a.is_closed() && conn_b.is_closed());
        assert_eq!(relay.on_message(a, br#"{"event":"offer"}"#), Route::Dropped);

        let late = RecordingConnection::default();
        assert!(matches!(
            relay.on_connect(Box::new(late.clone())),
            Err(RelayError::ShuttingDown)
        ));
        assert!(late.is_closed());
    }

    #[test]
    fn test_unknown_event_is_forwarded() {
        let mut relay = Relay::new();
        let (a, _) = connect(&mut relay);
        let (b, conn_b) = connect(&mut relay);

        let route = relay.on_message(a, br#"{"event":"chat","data":"hello"}"#);
        assert_eq!(route, Route::Delivered { recipients: vec![b] });
        assert_eq!(conn_b.frames()[0]["data"], "hello");
    }

    #[test]
    fn test_null_data_is_forwarded() {
        let mut relay = Relay::new();
        let (a, _) = connect(&mut relay);
        let (_, conn_b) = connect(&mut relay);

        relay.on_message(a, br#"{"event":"bye","data":null}"#);
        relay.on_message(a, br#"{"event":"bye"}"#);

        let received = conn_b.frames();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].get("data"), Some(&serde_json::Value::Null));
        assert!(received[1].get("data").is_none());
    }
}
