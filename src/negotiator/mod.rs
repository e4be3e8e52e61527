//! Per-participant session negotiation
//!
//! A [`Negotiator`] owns one signaling link and at most one peer connection.
//! Inbound envelopes and peer events are processed one at a time by
//! [`Negotiator::next`], so session state is only ever touched from a single
//! task.

pub mod events;
pub mod signaling;

use std::collections::VecDeque;
use std::future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::NegotiatorConfig;
use crate::error::{NegotiationError, NegotiatorError, NegotiatorResult};
use crate::media::{MediaCapture, NullCapture};
use crate::model::endpoint::EndpointId;
use crate::model::envelope::{Envelope, EnvelopeKind};
use crate::model::media::{MediaConstraints, MediaStream};
use crate::model::session::{IceCandidate, SdpType, SessionDescription, SessionState};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, Str0mPeerFactory};

pub use events::{EventKind, EventRegistry, NegotiatorEvent};
pub use signaling::SignalingLink;

enum Input {
    Frame(Option<Vec<u8>>),
    Peer(Option<PeerEvent>),
}

/// One participant's side of a peer-to-peer session.
pub struct Negotiator {
    config: NegotiatorConfig,
    peers: Arc<dyn PeerConnectionFactory>,
    media: Arc<dyn MediaCapture>,
    span: Span,
    state: SessionState,
    signaling: Option<SignalingLink>,
    peer: Option<Box<dyn PeerConnection>>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    remote_peer: Option<EndpointId>,
    /// Candidates that arrived before a remote description, with their sender
    pending_candidates: VecDeque<(Option<EndpointId>, IceCandidate)>,
    local_stream: Option<MediaStream>,
    handlers: EventRegistry,
}

impl Negotiator {
    pub fn new(
        config: NegotiatorConfig,
        peers: Arc<dyn PeerConnectionFactory>,
        media: Arc<dyn MediaCapture>,
    ) -> Negotiator {
        static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);
        let session = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);

        Negotiator {
            config,
            peers,
            media,
            span: info_span!("negotiator", session),
            state: SessionState::Idle,
            signaling: None,
            peer: None,
            peer_events: None,
            remote_peer: None,
            pending_candidates: VecDeque::new(),
            local_stream: None,
            handlers: EventRegistry::new(),
        }
    }

    /// Negotiator backed by str0m peer connections and no capture devices.
    pub fn with_str0m(config: NegotiatorConfig) -> Negotiator {
        Negotiator::new(
            config,
            Arc::new(Str0mPeerFactory::default()),
            Arc::new(NullCapture),
        )
    }

    /// Log under `span` instead of the default `negotiator{session=..}` span.
    pub fn with_span(mut self, span: Span) -> Negotiator {
        self.span = span;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The endpoint this session is negotiating with, once known.
    pub fn remote_peer(&self) -> Option<EndpointId> {
        self.remote_peer
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Register a handler for local events.
    pub fn on<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&NegotiatorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.register(kind, handler);
    }

    /// Open the signaling channel to the configured server.
    pub async fn connect(&mut self) -> NegotiatorResult<()> {
        if self.state == SessionState::Closed {
            return Err(NegotiatorError::AlreadyClosed);
        }
        if self.signaling.is_some() {
            return Ok(());
        }

        let url = self.config.server_url.clone().ok_or_else(|| {
            NegotiatorError::SignalingUnavailable("no signaling server configured".to_string())
        })?;

        let span = self.span.clone();
        let link = SignalingLink::connect(&url).instrument(span).await?;
        self.attach(link)
    }

    /// Use an already open signaling link.
    pub fn attach(&mut self, link: SignalingLink) -> NegotiatorResult<()> {
        if self.state == SessionState::Closed {
            return Err(NegotiatorError::AlreadyClosed);
        }

        self.signaling = Some(link);
        if self.state == SessionState::Idle {
            self.set_state(SessionState::SignalingConnected);
        }
        Ok(())
    }

    /// Send an envelope through the relay. Nothing is sent while the channel
    /// is not open.
    pub fn emit<T: Serialize + ?Sized>(
        &self,
        kind: EnvelopeKind,
        payload: &T,
        target: Option<EndpointId>,
    ) -> NegotiatorResult<()> {
        let _enter = self.span.enter();

        if self.state == SessionState::Closed {
            return Err(NegotiatorError::AlreadyClosed);
        }
        let Some(link) = self.signaling.as_ref().filter(|link| link.is_open()) else {
            warn!(event = %kind, "Signaling channel not open, envelope not sent");
            return Ok(());
        };

        let frame = Envelope::new(kind.clone(), payload, target)?.to_frame()?;
        if link.send(frame) {
            debug!(event = %kind, to = ?target.map(|t| *t), "Sent envelope");
        } else {
            warn!(event = %kind, "Signaling channel closed, envelope not sent");
        }
        Ok(())
    }

    /// Start a negotiation by sending an offer to `target`, or to everyone.
    pub async fn call(&mut self, target: Option<EndpointId>) -> NegotiatorResult<()> {
        let span = self.span.clone();
        self.start_call(target).instrument(span).await
    }

    /// Acquire local capture and attach it to the session.
    ///
    /// A capture failure is reported as an `error` event and `Ok(None)`; the
    /// session can still negotiate receive-only.
    pub async fn get_user_media(
        &mut self,
        constraints: MediaConstraints,
    ) -> NegotiatorResult<Option<MediaStream>> {
        let span = self.span.clone();
        self.capture_media(constraints).instrument(span).await
    }

    /// Handle one inbound envelope.
    pub async fn dispatch(&mut self, envelope: Envelope) {
        let span = self.span.clone();
        self.handle_envelope(envelope).instrument(span).await
    }

    /// Process one input. Returns `false` once there is nothing left to
    /// process: the session is closed or was never connected.
    pub async fn next(&mut self) -> bool {
        let span = self.span.clone();
        self.step().instrument(span).await
    }

    /// Process inputs until the session closes.
    pub async fn run(&mut self) {
        while self.next().await {}
    }

    /// Tear the session down. Closing twice is a no-op.
    pub async fn close(&mut self) {
        let span = self.span.clone();
        self.shutdown().instrument(span).await
    }

    async fn step(&mut self) -> bool {
        if self.state == SessionState::Closed || self.signaling.is_none() {
            return false;
        }

        let input = tokio::select! {
            frame = recv_frame(&mut self.signaling) => Input::Frame(frame),
            event = recv_event(&mut self.peer_events) => Input::Peer(event),
        };

        match input {
            Input::Frame(Some(raw)) => match Envelope::parse(&raw) {
                Ok(envelope) => self.handle_envelope(envelope).await,
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            },
            Input::Frame(None) => {
                info!("Signaling channel closed");
                self.shutdown().await;
                return false;
            }
            Input::Peer(Some(event)) => self.handle_peer_event(event).await,
            Input::Peer(None) => self.peer_events = None,
        }

        true
    }

    async fn start_call(&mut self, target: Option<EndpointId>) -> NegotiatorResult<()> {
        match self.state {
            SessionState::Closed => return Err(NegotiatorError::AlreadyClosed),
            SessionState::Idle => {
                return Err(NegotiatorError::SignalingUnavailable(
                    "not connected".to_string(),
                ))
            }
            SessionState::SignalingConnected => {}
            state => {
                warn!(%state, "Negotiation already in progress, call ignored");
                return Ok(());
            }
        }

        self.remote_peer = target;
        if let Err(e) = self.send_offer().await {
            self.abort_negotiation(&e).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<(), NegotiationError> {
        self.open_peer().await?;
        let peer = self.peer.as_mut().ok_or(NegotiationError::Cancelled)?;

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;

        self.send_signal(EnvelopeKind::Offer, &offer, self.remote_peer)?;
        info!(to = ?self.remote_peer.map(|t| *t), "Offer sent");
        self.set_state(SessionState::OfferSent);
        Ok(())
    }

    async fn capture_media(
        &mut self,
        constraints: MediaConstraints,
    ) -> NegotiatorResult<Option<MediaStream>> {
        if self.state == SessionState::Closed {
            return Err(NegotiatorError::AlreadyClosed);
        }

        let stream = match self.media.capture(constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Media capture failed, continuing receive-only: {}", e);
                self.raise(NegotiatorEvent::Error(e.to_string()));
                return Ok(None);
            }
        };
        info!(stream = %stream.id, tracks = stream.tracks.len(), "Local media captured");

        if let Some(previous) = self.local_stream.replace(stream.clone()) {
            self.media.release(&previous);
        }

        let mut rejected = vec![];
        if let Some(peer) = self.peer.as_mut() {
            for track in &stream.tracks {
                if let Err(e) = peer.add_track(&stream, track).await {
                    warn!(track = %track.id, "Failed to attach track: {}", e);
                    rejected.push(e);
                }
            }
        }
        for e in rejected {
            self.raise(NegotiatorEvent::Error(e.to_string()));
        }

        self.raise(NegotiatorEvent::Stream(stream.clone()));
        Ok(Some(stream))
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        if self.state == SessionState::Closed {
            return;
        }

        let from = envelope.from();
        match envelope.kind() {
            EnvelopeKind::Offer => match envelope.payload::<SessionDescription>() {
                Ok(description) if description.kind == SdpType::Offer => {
                    self.on_offer(from, description).await
                }
                Ok(_) => warn!("Dropping offer envelope carrying an answer"),
                Err(e) => warn!("Dropping malformed offer: {}", e),
            },
            EnvelopeKind::Answer => match envelope.payload::<SessionDescription>() {
                Ok(description) if description.kind == SdpType::Answer => {
                    self.on_answer(from, description).await
                }
                Ok(_) => warn!("Dropping answer envelope carrying an offer"),
                Err(e) => warn!("Dropping malformed answer: {}", e),
            },
            EnvelopeKind::Candidate => match envelope.payload::<IceCandidate>() {
                Ok(candidate) => self.on_candidate(from, candidate).await,
                Err(e) => warn!("Dropping malformed candidate: {}", e),
            },
            EnvelopeKind::Other(event) => {
                warn!(%event, from = ?from.map(|f| *f), "Ignoring unrecognized envelope");
            }
        }
    }

    async fn on_offer(&mut self, from: Option<EndpointId>, description: SessionDescription) {
        if self.state != SessionState::SignalingConnected {
            warn!(state = %self.state, "Ignoring offer");
            return;
        }

        info!(from = ?from.map(|f| *f), "Offer received");
        self.remote_peer = from;
        if let Err(e) = self.answer_offer(from, description).await {
            self.abort_negotiation(&e).await;
        }
    }

    async fn answer_offer(
        &mut self,
        from: Option<EndpointId>,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.open_peer().await?;
        self.peer
            .as_mut()
            .ok_or(NegotiationError::Cancelled)?
            .set_remote_description(description)
            .await?;

        self.replay_candidates(from).await;

        let peer = self.peer.as_mut().ok_or(NegotiationError::Cancelled)?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;

        if from.is_none() {
            warn!("Offer carries no sender, answering to everyone");
        }
        self.send_signal(EnvelopeKind::Answer, &answer, from)?;
        self.set_state(SessionState::Answered);
        Ok(())
    }

    async fn on_answer(&mut self, from: Option<EndpointId>, description: SessionDescription) {
        if self.state != SessionState::OfferSent {
            warn!(state = %self.state, "Ignoring answer");
            return;
        }
        if let Some(expected) = self.remote_peer {
            if from != Some(expected) {
                warn!(from = ?from.map(|f| *f), "Ignoring answer from an endpoint that was not called");
                return;
            }
        }

        info!(from = ?from.map(|f| *f), "Answer received");
        self.remote_peer = from;
        if let Err(e) = self.apply_answer(from, description).await {
            self.abort_negotiation(&e).await;
        }
    }

    async fn apply_answer(
        &mut self,
        from: Option<EndpointId>,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer
            .as_mut()
            .ok_or(NegotiationError::Cancelled)?
            .set_remote_description(description)
            .await?;

        self.replay_candidates(from).await;
        self.set_state(SessionState::Negotiating);
        Ok(())
    }

    async fn on_candidate(&mut self, from: Option<EndpointId>, candidate: IceCandidate) {
        if let Some(remote) = self.remote_peer {
            if from != Some(remote) {
                debug!(from = ?from.map(|f| *f), "Ignoring candidate from another endpoint");
                return;
            }
        }

        if self.state.has_remote_description() {
            if let Some(peer) = self.peer.as_mut() {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!("Remote candidate rejected: {}", e);
                }
            }
            return;
        }

        let limit = self.config.max_pending_candidates;
        if limit == 0 {
            warn!("Candidate buffering disabled, dropping early candidate");
            return;
        }
        if self.pending_candidates.len() >= limit {
            self.pending_candidates.pop_front();
            warn!(limit, "Too many early candidates, dropped the oldest");
        }
        debug!(from = ?from.map(|f| *f), "Buffering candidate until a remote description is set");
        self.pending_candidates.push_back((from, candidate));
    }

    /// Apply candidates buffered from `from`; the rest are discarded.
    async fn replay_candidates(&mut self, from: Option<EndpointId>) {
        let pending: Vec<_> = self.pending_candidates.drain(..).collect();
        let Some(peer) = self.peer.as_mut() else {
            return;
        };

        for (sender, candidate) in pending {
            if sender != from {
                debug!(from = ?sender.map(|s| *s), "Discarding buffered candidate");
                continue;
            }
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("Buffered candidate rejected: {}", e);
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.send_signal(EnvelopeKind::Candidate, &candidate, self.remote_peer)
                {
                    warn!("Failed to send local candidate: {}", e);
                }
                self.raise(NegotiatorEvent::Candidate(candidate));
            }
            PeerEvent::Track(track) => {
                info!(mid = %track.mid, kind = ?track.kind, "Remote track added");
                self.raise(NegotiatorEvent::Track(track));
            }
            PeerEvent::Connected => match self.state {
                SessionState::Answered | SessionState::Negotiating => {
                    self.set_state(SessionState::Connected)
                }
                state => debug!(%state, "Peer connected"),
            },
            PeerEvent::Disconnected => warn!("Peer network path lost"),
            PeerEvent::Failed(reason) => {
                self.abort_negotiation(&NegotiationError::Transport(reason))
                    .await
            }
        }
    }

    fn send_signal<T: Serialize + ?Sized>(
        &self,
        kind: EnvelopeKind,
        payload: &T,
        target: Option<EndpointId>,
    ) -> Result<(), NegotiationError> {
        self.emit(kind, payload, target)
            .map_err(|e| NegotiationError::Transport(e.to_string()))
    }

    async fn open_peer(&mut self) -> Result<(), NegotiationError> {
        let mut peer = self.peers.create().await?;
        self.peer_events = peer.take_events();

        if let Some(stream) = &self.local_stream {
            for track in &stream.tracks {
                if let Err(e) = peer.add_track(stream, track).await {
                    peer.close().await;
                    return Err(e);
                }
            }
        }

        self.peer = Some(peer);
        Ok(())
    }

    async fn release_peer(&mut self) {
        self.peer_events = None;
        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
        }
    }

    /// Give up on the current negotiation and wait for a new one.
    async fn abort_negotiation(&mut self, err: &NegotiationError) {
        error!("Negotiation failed: {}", err);

        self.release_peer().await;
        self.pending_candidates.clear();
        self.remote_peer = None;
        self.set_state(SessionState::SignalingConnected);
        self.raise(NegotiatorEvent::Error(err.to_string()));
    }

    async fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        if let Some(mut link) = self.signaling.take() {
            link.close().await;
        }
        self.release_peer().await;
        if let Some(stream) = self.local_stream.take() {
            self.media.release(&stream);
        }
        self.pending_candidates.clear();
        self.remote_peer = None;

        self.set_state(SessionState::Closed);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "Session state changed");
        self.state = state;
        self.raise(NegotiatorEvent::StateChanged(state));
    }

    fn raise(&self, event: NegotiatorEvent) {
        self.handlers.raise(&event);
    }
}

async fn recv_frame(link: &mut Option<SignalingLink>) -> Option<Vec<u8>> {
    match link {
        Some(link) => link.recv().await,
        None => future::pending().await,
    }
}

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => future::pending().await,
    }
}
