//! Local media capture
//!
//! Capture devices sit behind [`MediaCapture`] so the negotiator can run with
//! real devices, synthetic sources, or none at all.

use async_trait::async_trait;

use crate::error::MediaError;
use crate::model::media::{MediaConstraints, MediaStream};

/// Acquires local audio/video capture.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn capture(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;

    /// Stop capturing for a stream previously returned by `capture`.
    fn release(&self, _stream: &MediaStream) {}
}

/// Capture backend for hosts without media devices. Sessions using it
/// negotiate receive-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCapture;

#[async_trait]
impl MediaCapture for NullCapture {
    async fn capture(&self, _constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        Err(MediaError::Unavailable("no capture devices".to_string()))
    }
}
