//! str0m-backed peer connection
//!
//! str0m is sans-IO, so each connection gets a driver task that owns the
//! [`Rtc`] instance and its UDP socket. The driver polls output until a
//! timeout, then waits for whichever comes first: a command from the
//! negotiator, a datagram, or the timeout.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use async_trait::async_trait;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::model::media::{MediaStream, MediaTrack, RemoteTrack, TrackKind};
use crate::model::session::{IceCandidate, SdpType, SessionDescription};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent};
use crate::util::{host_candidates, select_host_address};

const COMMAND_QUEUE: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, NegotiationError>>;

enum Command {
    AddTrack {
        stream_id: String,
        track: MediaTrack,
        reply: Reply<()>,
    },
    CreateOffer {
        reply: Reply<SessionDescription>,
    },
    CreateAnswer {
        reply: Reply<SessionDescription>,
    },
    SetLocal {
        description: SessionDescription,
        reply: Reply<()>,
    },
    SetRemote {
        description: SessionDescription,
        reply: Reply<()>,
    },
    AddCandidate {
        candidate: IceCandidate,
        reply: Reply<()>,
    },
}

enum Wake {
    Command(Option<Command>),
    Datagram(std::io::Result<(usize, SocketAddr)>),
    Timeout,
}

/// Creates str0m peer connections on a fresh UDP port each.
#[derive(Debug, Clone)]
pub struct Str0mPeerFactory {
    bind: SocketAddr,
}

impl Str0mPeerFactory {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind }
    }
}

impl Default for Str0mPeerFactory {
    /// Binds an ephemeral port on the first routable interface, loopback if none.
    fn default() -> Self {
        let host = select_host_address().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self::new(SocketAddr::new(host, 0))
    }
}

#[async_trait]
impl PeerConnectionFactory for Str0mPeerFactory {
    async fn create(&self) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        let socket = UdpSocket::bind(self.bind)
            .await
            .map_err(|e| NegotiationError::Transport(format!("binding {}: {}", self.bind, e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| NegotiationError::Transport(e.to_string()))?;
        info!("Bound UDP port: {}", local);

        let mut rtc = Rtc::builder().build();
        let candidates = host_candidates(local);
        if candidates.is_empty() {
            warn!("No host candidates for {}, the peer will be unreachable", local);
        }
        for candidate in &candidates {
            rtc.add_local_candidate(candidate.clone());
        }

        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();

        let driver = Driver {
            rtc,
            socket,
            local,
            local_candidates: candidates,
            announced: false,
            tracks: vec![],
            described: false,
            pending: None,
            remote_offer: None,
            events: events_tx,
        };
        let task = tokio::spawn(driver.run(rx));

        Ok(Box::new(Str0mPeer {
            commands: Some(commands),
            events: Some(events),
            task: Some(task),
        }))
    }
}

/// Handle to a running str0m driver.
pub struct Str0mPeer {
    commands: Option<mpsc::Sender<Command>>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    task: Option<JoinHandle<()>>,
}

impl Str0mPeer {
    async fn request<T>(
        &mut self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, NegotiationError> {
        let commands = self.commands.as_ref().ok_or(NegotiationError::Cancelled)?;
        let (reply, rx) = oneshot::channel();

        commands
            .send(command(reply))
            .await
            .map_err(|_| NegotiationError::Cancelled)?;

        rx.await.map_err(|_| NegotiationError::Cancelled)?
    }
}

#[async_trait]
impl PeerConnection for Str0mPeer {
    async fn add_track(
        &mut self,
        stream: &MediaStream,
        track: &MediaTrack,
    ) -> Result<(), NegotiationError> {
        let stream_id = stream.id.clone();
        let track = track.clone();
        self.request(|reply| Command::AddTrack {
            stream_id,
            track,
            reply,
        })
        .await
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.request(|reply| Command::CreateOffer { reply }).await
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.request(|reply| Command::CreateAnswer { reply }).await
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.request(|reply| Command::SetLocal { description, reply })
            .await
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.request(|reply| Command::SetRemote { description, reply })
            .await
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.request(|reply| Command::AddCandidate { candidate, reply })
            .await
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.take()
    }

    async fn close(&mut self) {
        // Dropping the command sender stops the driver.
        self.commands = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Str0mPeer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Driver {
    rtc: Rtc,
    socket: UdpSocket,
    local: SocketAddr,
    local_candidates: Vec<Candidate>,
    announced: bool,
    /// Local tracks waiting for the first offer or answer
    tracks: Vec<(String, MediaTrack)>,
    /// Set once an offer or answer was produced; tracks can no longer be added.
    described: bool,
    pending: Option<SdpPendingOffer>,
    /// Validated SDP of the offer to answer
    remote_offer: Option<String>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut buf = vec![0; 2000];

        loop {
            let timeout = self.poll_until_timeout();
            if !self.rtc.is_alive() {
                break;
            }

            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                received = self.socket.recv_from(&mut buf) => Wake::Datagram(received),
                _ = tokio::time::sleep_until(timeout.into()) => Wake::Timeout,
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Datagram(Ok((n, source))) => self.handle_datagram(&buf[..n], source),
                Wake::Datagram(Err(e)) => match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::ConnectionReset => {}
                    _ => {
                        self.fail(format!("UDP read failed: {e}"));
                        break;
                    }
                },
                Wake::Timeout => self.handle_input(Input::Timeout(Instant::now())),
            }
        }

        self.rtc.disconnect();
        debug!("Peer driver stopped");
    }

    /// Poll all output until str0m asks to be woken at a later instant.
    fn poll_until_timeout(&mut self) -> Instant {
        loop {
            if !self.rtc.is_alive() {
                return Instant::now();
            }

            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return t,
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .try_send_to(&transmit.contents, transmit.destination)
                    {
                        debug!("Dropped datagram to {}: {}", transmit.destination, e);
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    self.fail(format!("poll_output failed: {e:?}"));
                    return Instant::now();
                }
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) {
        // Parse data to a DatagramRecv, which helps demultiplex STUN, DTLS
        // and RTP sharing the one UDP port.
        let Ok(contents) = data.try_into() else {
            return;
        };

        self.handle_input(Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.local,
                contents,
            },
        ));
    }

    fn handle_input(&mut self, input: Input) {
        if let Err(e) = self.rtc.handle_input(input) {
            self.fail(format!("handle_input failed: {e:?}"));
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("ICE connection state: {:?}", state);
                match state {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        self.emit(PeerEvent::Connected)
                    }
                    IceConnectionState::Disconnected => self.emit(PeerEvent::Disconnected),
                    _ => {}
                }
            }
            Event::MediaAdded(added) => {
                if matches!(added.direction, Direction::RecvOnly | Direction::SendRecv) {
                    self.emit(PeerEvent::Track(RemoteTrack {
                        mid: added.mid.to_string(),
                        kind: added.kind.into(),
                    }));
                }
            }
            other => debug!("Peer event: {:?}", other),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddTrack {
                stream_id,
                track,
                reply,
            } => {
                let _ = reply.send(self.add_track(stream_id, track));
            }
            Command::CreateOffer { reply } => {
                let _ = reply.send(self.create_offer());
            }
            Command::CreateAnswer { reply } => {
                let _ = reply.send(self.create_answer());
            }
            Command::SetLocal { description, reply } => {
                let _ = reply.send(self.set_local(description));
            }
            Command::SetRemote { description, reply } => {
                let _ = reply.send(self.set_remote(description));
            }
            Command::AddCandidate { candidate, reply } => {
                let _ = reply.send(self.add_candidate(candidate));
            }
        }
    }

    fn add_track(&mut self, stream_id: String, track: MediaTrack) -> Result<(), NegotiationError> {
        if self.described {
            return Err(NegotiationError::Track(format!(
                "cannot attach track {} without renegotiation",
                track.id
            )));
        }

        self.tracks.push((stream_id, track));
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.pending.is_some() {
            return Err(NegotiationError::Description(
                "an offer is already pending".to_string(),
            ));
        }

        let mut change = self.rtc.sdp_api();
        if self.tracks.is_empty() {
            // Receive-only: still ask for the remote side's media.
            change.add_media(MediaKind::Audio, Direction::RecvOnly, None, None, None);
            change.add_media(MediaKind::Video, Direction::RecvOnly, None, None, None);
        }
        for (stream_id, track) in self.tracks.drain(..) {
            change.add_media(
                track.kind.into(),
                Direction::SendRecv,
                Some(stream_id),
                Some(track.id),
                None,
            );
        }

        let Some((offer, pending)) = change.apply() else {
            return Err(NegotiationError::Description(
                "nothing to negotiate".to_string(),
            ));
        };

        self.pending = Some(pending);
        self.described = true;
        Ok(SessionDescription::offer(offer.to_string()))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.remote_offer.take().ok_or_else(|| {
            NegotiationError::Description("no remote offer to answer".to_string())
        })?;

        let offer = assign_tracks(&offer, &mut self.tracks)?;
        let offer = SdpOffer::from_sdp_string(&offer)
            .map_err(|e| NegotiationError::Description(format!("{e:?}")))?;
        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| NegotiationError::Description(format!("{e:?}")))?;

        self.described = true;
        Ok(SessionDescription::answer(answer.to_string()))
    }

    // str0m applies a local description as it creates it; setting it is the
    // point from which local candidates are announced.
    fn set_local(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        debug!("Local {:?} set", description.kind);

        if !self.announced {
            self.announced = true;
            for candidate in &self.local_candidates {
                let _ = self
                    .events
                    .send(PeerEvent::LocalCandidate(IceCandidate::new(
                        candidate.to_sdp_string(),
                    )));
            }
        }

        Ok(())
    }

    fn set_remote(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        match description.kind {
            SdpType::Offer => {
                SdpOffer::from_sdp_string(&description.sdp)
                    .map_err(|e| NegotiationError::Description(format!("{e:?}")))?;
                self.remote_offer = Some(description.sdp);
            }
            SdpType::Answer => {
                let answer = SdpAnswer::from_sdp_string(&description.sdp)
                    .map_err(|e| NegotiationError::Description(format!("{e:?}")))?;
                let pending = self.pending.take().ok_or_else(|| {
                    NegotiationError::Description("answer without a pending offer".to_string())
                })?;
                self.rtc
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(|e| NegotiationError::Description(format!("{e:?}")))?;
            }
        }

        Ok(())
    }

    fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        // An empty candidate marks the end of the remote side's gathering.
        if candidate.candidate.trim().is_empty() {
            return Ok(());
        }

        let candidate = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| NegotiationError::Candidate(format!("{e:?}")))?;
        self.rtc.add_remote_candidate(candidate);
        Ok(())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&mut self, reason: String) {
        warn!("Peer connection failed: {}", reason);
        self.rtc.disconnect();
        self.emit(PeerEvent::Failed(reason));
    }
}

/// Put each queued track on an offered m-line of its kind that we may send
/// on. str0m answers an m-line under the offer's msid, so rewriting it makes
/// the answer announce the track's own stream and track id.
fn assign_tracks(
    sdp: &str,
    tracks: &mut Vec<(String, MediaTrack)>,
) -> Result<String, NegotiationError> {
    let mut sections: Vec<Vec<String>> = vec![vec![]];
    for line in sdp.lines() {
        if line.starts_with("m=") {
            sections.push(vec![]);
        }
        if let Some(section) = sections.last_mut() {
            section.push(line.to_string());
        }
    }

    for section in sections.iter_mut().skip(1) {
        let kind = match section.first().and_then(|m| m.split_whitespace().next()) {
            Some("m=audio") => TrackKind::Audio,
            Some("m=video") => TrackKind::Video,
            _ => continue,
        };
        // Offered recvonly or sendrecv means the answer may send
        if !section.iter().any(|l| l == "a=recvonly" || l == "a=sendrecv") {
            continue;
        }
        let Some(index) = tracks.iter().position(|(_, track)| track.kind == kind) else {
            continue;
        };

        let (stream_id, track) = tracks.remove(index);
        section.retain(|l| !l.starts_with("a=msid:"));
        let at = section
            .iter()
            .position(|l| l.starts_with("a=mid:"))
            .map_or(section.len(), |i| i + 1);
        section.insert(
            at,
            format!("a=msid:{} {}", msid_token(&stream_id), msid_token(&track.id)),
        );
    }

    if let Some((_, track)) = tracks.first() {
        return Err(NegotiationError::Track(format!(
            "offer has no {:?} m-line to carry track {}",
            track.kind, track.id
        )));
    }

    let mut rewritten = sections.concat().join("\r\n");
    rewritten.push_str("\r\n");
    Ok(rewritten)
}

fn msid_token(id: &str) -> String {
    id.chars().filter(char::is_ascii_graphic).take(64).collect()
}
