//! WebSocket signaling relay and peer negotiation for str0m sessions
//!
//! The [`relay`] forwards JSON envelopes between connected parties without
//! interpreting them. A [`negotiator`] sits on each participant: it talks to
//! the relay and drives one peer connection through offer, answer and
//! candidate exchange.

pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod model;
pub mod negotiator;
pub mod peer;
pub mod relay;
pub mod util;

pub use config::{LogFormat, NegotiatorConfig, RelayConfig};
pub use error::{NegotiatorError, NegotiatorResult, RelayError, RelayResult};
pub use model::endpoint::EndpointId;
pub use model::envelope::{Envelope, EnvelopeKind};
pub use model::session::SessionState;
pub use negotiator::{EventKind, Negotiator, NegotiatorEvent};
pub use relay::{Relay, RelayHandle, RelayServer};
