//! Data models for signaling
//!
//! This module contains the core data structures shared by the relay and the
//! negotiator: endpoints, envelopes, session payloads and media descriptions.

pub mod endpoint;
pub mod envelope;
pub mod media;
pub mod session;
