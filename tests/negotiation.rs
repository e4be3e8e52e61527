use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use rover_signal::error::NegotiationError;
use rover_signal::media::NullCapture;
use rover_signal::model::media::{MediaStream, MediaTrack};
use rover_signal::model::session::{IceCandidate, SessionDescription};
use rover_signal::peer::{PeerConnection, PeerConnectionFactory, PeerEvent};
use rover_signal::{
    EventKind, Negotiator, NegotiatorConfig, RelayConfig, RelayHandle, RelayServer, SessionState,
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone, Default)]
struct FakeFactory {
    name: &'static str,
    remote: Arc<Mutex<Vec<SessionDescription>>>,
    candidates: Arc<Mutex<Vec<IceCandidate>>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>>,
}

impl FakeFactory {
    fn named(name: &'static str) -> FakeFactory {
        FakeFactory {
            name,
            ..FakeFactory::default()
        }
    }

    fn inject(&self, event: PeerEvent) {
        self.events.lock().unwrap().as_ref().unwrap().send(event).unwrap();
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(&self) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx.clone());
        Ok(Box::new(FakePeer {
            factory: self.clone(),
            events_tx: tx,
            events: Some(rx),
        }))
    }
}

struct FakePeer {
    factory: FakeFactory,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(
        &mut self,
        _stream: &MediaStream,
        _track: &MediaTrack,
    ) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription::offer(format!("v=0 {}", self.factory.name)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription::answer(format!("v=0 {}", self.factory.name)))
    }

    async fn set_local_description(
        &mut self,
        _description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let candidate = IceCandidate::new(format!("candidate:{}", self.factory.name));
        let _ = self.events_tx.send(PeerEvent::LocalCandidate(candidate));
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.factory.remote.lock().unwrap().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.factory.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.take()
    }

    async fn close(&mut self) {}
}

async fn start_relay() -> RelayHandle {
    let config = RelayConfig {
        host: "127.0.0.1".to_string(),
        ..RelayConfig::default()
    }
    .with_port(0);

    RelayServer::bind(config).await.unwrap().spawn().unwrap()
}

async fn wait_for_count(relay: &RelayHandle, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while relay.endpoints().await.len() != count {
        assert!(tokio::time::Instant::now() < deadline, "endpoint count never reached {count}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn count_candidates(negotiator: &mut Negotiator) -> Arc<Mutex<usize>> {
    let sent = Arc::new(Mutex::new(0));
    let counter = sent.clone();
    negotiator.on(EventKind::Candidate, move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });
    sent
}

/// Feed inputs to `negotiator` until `done` holds.
async fn drive(negotiator: &mut Negotiator, done: impl Fn(&Negotiator) -> bool) {
    for _ in 0..32 {
        if done(negotiator) {
            return;
        }
        let processed = tokio::time::timeout(WAIT, negotiator.next())
            .await
            .expect("timed out waiting for input");
        assert!(processed, "session closed early");
    }
    assert!(done(negotiator));
}

#[tokio::test]
async fn test_two_negotiators_through_relay() {
    let relay = start_relay().await;
    let config =
        NegotiatorConfig::default().with_server_url(format!("ws://{}", relay.local_addr()));

    let peer_a = FakeFactory::named("a");
    let peer_b = FakeFactory::named("b");
    let mut a = Negotiator::new(config.clone(), Arc::new(peer_a.clone()), Arc::new(NullCapture));
    let mut b = Negotiator::new(config, Arc::new(peer_b.clone()), Arc::new(NullCapture));

    let sent_by_a = count_candidates(&mut a);
    let sent_by_b = count_candidates(&mut b);

    a.connect().await.unwrap();
    wait_for_count(&relay, 1).await;
    b.connect().await.unwrap();
    wait_for_count(&relay, 2).await;
    let ids: Vec<_> = relay.endpoints().await.iter().map(|e| e.id).collect();

    // B calls everyone, A answers B
    b.call(None).await.unwrap();
    assert_eq!(b.state(), SessionState::OfferSent);

    drive(&mut a, |n| n.state() == SessionState::Answered).await;
    assert_eq!(a.remote_peer(), Some(ids[1]));
    assert_eq!(peer_a.remote.lock().unwrap()[0].sdp, "v=0 b");

    drive(&mut b, |n| n.state() == SessionState::Negotiating).await;
    assert_eq!(b.remote_peer(), Some(ids[0]));
    assert_eq!(peer_b.remote.lock().unwrap()[0].sdp, "v=0 a");

    // Candidates cross in both directions
    drive(&mut a, |_| *sent_by_a.lock().unwrap() == 1).await;
    let received = peer_b.candidates.clone();
    drive(&mut b, move |_| {
        !received.lock().unwrap().is_empty() && *sent_by_b.lock().unwrap() == 1
    })
    .await;
    assert_eq!(peer_b.candidates.lock().unwrap()[0].candidate, "candidate:a");

    let received = peer_a.candidates.clone();
    drive(&mut a, move |_| !received.lock().unwrap().is_empty()).await;
    assert_eq!(peer_a.candidates.lock().unwrap()[0].candidate, "candidate:b");

    peer_a.inject(PeerEvent::Connected);
    peer_b.inject(PeerEvent::Connected);
    drive(&mut a, |n| n.state() == SessionState::Connected).await;
    drive(&mut b, |n| n.state() == SessionState::Connected).await;

    a.close().await;
    b.close().await;
    wait_for_count(&relay, 0).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_relay_loss_closes_negotiator() {
    let relay = start_relay().await;
    let config =
        NegotiatorConfig::default().with_server_url(format!("ws://{}", relay.local_addr()));
    let mut negotiator = Negotiator::new(
        config,
        Arc::new(FakeFactory::named("a")),
        Arc::new(NullCapture),
    );

    negotiator.connect().await.unwrap();
    wait_for_count(&relay, 1).await;

    relay.shutdown().await;

    let finished = tokio::time::timeout(WAIT, negotiator.run()).await;
    assert!(finished.is_ok());
    assert_eq!(negotiator.state(), SessionState::Closed);
}
