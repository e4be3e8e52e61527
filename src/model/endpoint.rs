use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DeliveryError;

/// Identity assigned by the relay when a party connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(u64);

impl EndpointId {
    pub(crate) fn next() -> EndpointId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        EndpointId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn from_raw(raw: u64) -> EndpointId {
        EndpointId(raw)
    }
}

impl Deref for EndpointId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

/// The full-duplex transport behind one endpoint.
///
/// `send` must not block: implementations queue the frame or fail with
/// [`DeliveryError::Full`] so a slow consumer never stalls the router.
pub trait Connection: Send {
    fn send(&self, frame: &str) -> Result<(), DeliveryError>;

    /// Release the underlying transport. Called at most once per endpoint.
    fn close(&self);
}

/// A connected signaling party, owned by the relay.
pub struct Endpoint {
    pub id: EndpointId,
    connection: Box<dyn Connection>,
    alive: bool,
    closed: bool,
    connected_at: DateTime<Utc>,
    delivered: u64,
    failed: u64,
}

impl Endpoint {
    pub fn new(connection: Box<dyn Connection>) -> Endpoint {
        Endpoint {
            id: EndpointId::next(),
            connection,
            alive: true,
            closed: false,
            connected_at: Utc::now(),
            delivered: 0,
            failed: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Hand one frame to the connection. A closed connection marks the
    /// endpoint dead so the relay reaps it after the current route.
    pub fn deliver(&mut self, frame: &str) -> Result<(), DeliveryError> {
        if !self.alive {
            return Err(DeliveryError::Closed);
        }

        match self.connection.send(frame) {
            Ok(()) => {
                self.delivered += 1;
                Ok(())
            }
            Err(e) => {
                self.failed += 1;
                if e == DeliveryError::Closed {
                    self.alive = false;
                }
                Err(e)
            }
        }
    }

    /// Close the underlying connection. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        self.alive = false;
        if !self.closed {
            debug!(endpoint = %self.id, "Closing connection");
            self.closed = true;
            self.connection.close();
        }
    }

    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            id: self.id,
            connected_at: self.connected_at,
            delivered: self.delivered,
            failed: self.failed,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("alive", &self.alive)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Snapshot of an endpoint for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub id: EndpointId,
    pub connected_at: DateTime<Utc>,
    pub delivered: u64,
    pub failed: u64,
}
