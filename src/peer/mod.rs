//! Peer connection seam
//!
//! The negotiator drives session setup through [`PeerConnection`]; the
//! primitive itself (SDP generation, ICE, DTLS) lives behind it. [`rtc`]
//! provides the str0m-backed implementation.

pub mod rtc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::model::media::{MediaStream, MediaTrack, RemoteTrack};
use crate::model::session::{IceCandidate, SessionDescription};

pub use rtc::{Str0mPeer, Str0mPeerFactory};

/// Events raised by a peer connection outside of any call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate to hand to the remote side
    LocalCandidate(IceCandidate),
    /// The remote side added a track
    Track(RemoteTrack),
    /// A usable network path was found
    Connected,
    /// The network path was lost
    Disconnected,
    /// The peer transport failed and can no longer be used
    Failed(String),
}

/// One peer-to-peer connection, in the shape of the browser primitive.
#[async_trait]
pub trait PeerConnection: Send {
    async fn add_track(
        &mut self,
        stream: &MediaStream,
        track: &MediaTrack,
    ) -> Result<(), NegotiationError>;

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// The event stream. Returns `Some` only on the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    /// Release the connection. Pending operations fail with [`NegotiationError::Cancelled`].
    async fn close(&mut self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn PeerConnection>, NegotiationError>;
}
