//! Local event surface of a negotiator

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use crate::model::media::{MediaStream, RemoteTrack};
use crate::model::session::{IceCandidate, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Stream,
    Track,
    Candidate,
    StateChanged,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Stream => "stream",
            EventKind::Track => "track",
            EventKind::Candidate => "candidate",
            EventKind::StateChanged => "state",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the local application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    /// Local capture succeeded
    Stream(MediaStream),
    /// The remote peer added a track
    Track(RemoteTrack),
    /// A local candidate was produced and sent
    Candidate(IceCandidate),
    StateChanged(SessionState),
    /// A negotiation or capture fault
    Error(String),
}

impl NegotiatorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NegotiatorEvent::Stream(_) => EventKind::Stream,
            NegotiatorEvent::Track(_) => EventKind::Track,
            NegotiatorEvent::Candidate(_) => EventKind::Candidate,
            NegotiatorEvent::StateChanged(_) => EventKind::StateChanged,
            NegotiatorEvent::Error(_) => EventKind::Error,
        }
    }
}

pub type Handler = Box<dyn Fn(&NegotiatorEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handlers keyed by event kind.
///
/// Handlers for a kind run synchronously in registration order. A failing
/// handler is logged and the remaining handlers still run.
#[derive(Default)]
pub struct EventRegistry {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&NegotiatorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Run every handler registered for the event's kind. Returns how many failed.
    pub fn raise(&self, event: &NegotiatorEvent) -> usize {
        let kind = event.kind();
        let Some(handlers) = self.handlers.get(&kind) else {
            return 0;
        };

        let mut failed = 0;
        for (index, handler) in handlers.iter().enumerate() {
            if let Err(e) = handler(event) {
                warn!(event = %kind, handler = index, "Event handler failed: {:#}", e);
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (kind, handlers) in &self.handlers {
            map.entry(kind, &handlers.len());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_handlers_run_in_order_past_failures() {
        let seen = Arc::new(Mutex::new(vec![]));
        let mut registry = EventRegistry::new();

        for name in ["first", "failing", "third"] {
            let seen = seen.clone();
            registry.register(EventKind::Error, move |_| {
                seen.lock().unwrap().push(name);
                if name == "failing" {
                    anyhow::bail!("handler blew up");
                }
                Ok(())
            });
        }

        let failed = registry.raise(&NegotiatorEvent::Error("boom".to_string()));

        assert_eq!(failed, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "failing", "third"]);
    }

    #[test]
    fn test_only_matching_kind_runs() {
        let mut registry = EventRegistry::new();
        registry.register(EventKind::Track, |_| panic!("track handler must not run"));

        assert_eq!(
            registry.raise(&NegotiatorEvent::StateChanged(SessionState::Connected)),
            0
        );
        assert_eq!(registry.len(EventKind::Track), 1);
        assert_eq!(registry.len(EventKind::Stream), 0);
    }
}
