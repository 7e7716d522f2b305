//! The session state machine itself (spec §4.5): `Idle -> Gathering ->
//! Gathered -> Connecting -> Connected -> Disconnected -> Closed`.
//!
//! Grounded on `media-core/src/session/state.rs`'s state-name vocabulary,
//! restructured so every transition is a synchronous method returning
//! [`SessionEvent`]s for `Agent::loop_once` to dispatch, instead of the
//! teacher's `tokio::sync::mpsc` event channel per session.

use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use super::ice::{Candidate, CandidateType, IceEngine, IceEvent};
use super::rtp::{MediaBackend, RtpEndpoint};
use super::SessionHandle;
use crate::config::{AgentConfig, IceRole};
use crate::error::{Error, Result};
use crate::sdp::{self, Direction as SdpDirection, MediaDescription, MediaKind, SdpCandidate, SdpSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Gathering,
    Gathered,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl From<StreamDirection> for SdpDirection {
    fn from(d: StreamDirection) -> Self {
        match d {
            StreamDirection::SendRecv => SdpDirection::SendRecv,
            StreamDirection::SendOnly => SdpDirection::SendOnly,
            StreamDirection::RecvOnly => SdpDirection::RecvOnly,
            StreamDirection::Inactive => SdpDirection::Inactive,
        }
    }
}

/// Per-stream negotiated/negotiable state (spec §3 "Session" per-stream
/// descriptor).
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub direction: StreamDirection,
    pub codec: String,
    pub payload_type: u8,
    pub sample_rate: u32,
    pub local_rtp_port: u16,
    pub remote_rtp_endpoint: Option<SocketAddr>,
}

/// Events raised by session-state transitions, for `Agent::loop_once` to
/// translate into the caller's `on_session_*` callbacks (spec §4.6 ordering
/// guarantee: `sdp_ready` precedes `connected`).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SdpReady(String),
    Connected,
    Disconnected(String),
    GatherFailed(String),
    IceFailed(String),
    MediaError(String),
}

pub struct Session {
    handle: SessionHandle,
    state: SessionState,
    local_address: IpAddr,
    ice_enabled: bool,
    ice_role: IceRole,
    rtcp_mux_local: bool,
    stun: (String, u16),
    turn: Option<(String, u16, String, String)>,
    gather_timeout_ms: u64,
    connect_timeout_ms: u64,
    gather_started_at_ms: Option<u64>,
    connect_started_at_ms: Option<u64>,
    streams: Vec<StreamDescriptor>,
    local_sdp: Option<SdpSession>,
    remote_sdp: Option<SdpSession>,
    ice: Box<dyn IceEngine>,
    rtp: std::collections::HashMap<usize, Box<dyn RtpEndpoint>>,
    media_backend: Option<Box<dyn MediaBackend>>,
    rtcp_enabled: bool,
    last_rtcp_ms: Option<u64>,
    connected_emitted: bool,
}

/// Default RTCP report interval (spec §4.5/§6: "default 5 s").
const RTCP_INTERVAL_MS: u64 = 5_000;

impl Session {
    /// Build the initial stream list from `config`'s media enablement flags,
    /// one [`StreamDescriptor`] per enabled kind, in codec-preference order
    /// (spec §4.5 "`a=rtpmap` entries in preference order").
    pub fn new(
        handle: SessionHandle,
        config: &AgentConfig,
        local_address: IpAddr,
        ice: Box<dyn IceEngine>,
    ) -> Result<Session> {
        let mut streams = Vec::new();
        if config.audio.enabled {
            let codec = config
                .audio
                .codec
                .split(',')
                .next()
                .unwrap_or("PCMU")
                .trim()
                .to_string();
            let payload_type = sdp::payload_type_for(&codec)
                .ok_or_else(|| Error::ConfigInvalid(format!("unknown audio codec: {codec}")))?;
            streams.push(StreamDescriptor {
                kind: StreamKind::Audio,
                direction: StreamDirection::SendRecv,
                payload_type,
                sample_rate: sdp::clock_rate_for(&codec, config.audio.sample_rate),
                codec,
                local_rtp_port: config.audio.rtp_port,
                remote_rtp_endpoint: None,
            });
        }
        if config.video.enabled {
            let codec = config
                .video
                .codec
                .split(',')
                .next()
                .unwrap_or("H264")
                .trim()
                .to_string();
            let payload_type = sdp::payload_type_for(&codec)
                .ok_or_else(|| Error::ConfigInvalid(format!("unknown video codec: {codec}")))?;
            streams.push(StreamDescriptor {
                kind: StreamKind::Video,
                direction: StreamDirection::SendRecv,
                payload_type,
                sample_rate: 90_000,
                codec,
                local_rtp_port: config.video.rtp_port,
                remote_rtp_endpoint: None,
            });
        }
        if streams.is_empty() {
            return Err(Error::ConfigInvalid(
                "at least one media stream must be enabled".into(),
            ));
        }

        Ok(Session {
            handle,
            state: SessionState::Idle,
            local_address,
            ice_enabled: config.ice_enabled,
            ice_role: config.ice_role,
            rtcp_mux_local: config.rtcp_mux,
            stun: (config.stun_server.clone(), config.stun_port),
            turn: if config.enable_turn {
                Some((
                    config.turn.server.clone(),
                    config.turn.port,
                    config.turn.username.clone(),
                    config.turn.password.clone(),
                ))
            } else {
                None
            },
            gather_timeout_ms: config.ice_gather_timeout_ms,
            connect_timeout_ms: config.ice_connect_timeout_ms,
            gather_started_at_ms: None,
            connect_started_at_ms: None,
            streams,
            local_sdp: None,
            remote_sdp: None,
            ice,
            rtp: std::collections::HashMap::new(),
            media_backend: None,
            rtcp_enabled: true,
            last_rtcp_ms: None,
            connected_emitted: false,
        })
    }

    /// Attach the `RtpEndpoint` for the stream at `stream_index` (spec §6
    /// `RtpEndpoint`; construction and codec wiring are the caller's
    /// responsibility — this crate only drives the lifecycle).
    pub fn bind_rtp(&mut self, stream_index: usize, endpoint: Box<dyn RtpEndpoint>) {
        self.rtp.insert(stream_index, endpoint);
    }

    /// Attach the capture/playback backend (spec §6 `MediaBackend`).
    pub fn bind_media_backend(&mut self, backend: Box<dyn MediaBackend>) {
        self.media_backend = Some(backend);
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_sdp_text(&self) -> Option<String> {
        self.local_sdp.as_ref().map(SdpSession::to_sdp_string)
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    /// `Idle -> Gathering`: kick off ICE candidate collection. When ICE is
    /// disabled this degenerates to an immediate Gathered transition using
    /// only the host address, matching an ICE-lite-free deployment, and the
    /// `sdp_ready` event is returned directly rather than through
    /// `poll_ice` (there is no asynchronous gather to await).
    pub fn gather_candidates(&mut self, now_ms: u64) -> Result<Option<SessionEvent>> {
        if self.state != SessionState::Idle {
            return Err(Error::InvalidState(format!(
                "gather_candidates requires Idle, was {:?}",
                self.state
            )));
        }
        self.gather_started_at_ms = Some(now_ms);
        if !self.ice_enabled {
            self.build_local_sdp(&[], None, None);
            self.state = SessionState::Gathered;
            return Ok(self.local_sdp_text().map(SessionEvent::SdpReady));
        }
        self.state = SessionState::Gathering;
        let stun = (self.stun.0.as_str(), self.stun.1);
        let turn = self
            .turn
            .as_ref()
            .map(|(h, p, u, pw)| (h.as_str(), *p, u.as_str(), pw.as_str()));
        self.ice.gather(self.ice_role, stun, turn)?;
        Ok(None)
    }

    /// Parse and negotiate a remote SDP offer/answer (spec §4.5
    /// `set_remote_sdp`). Picks the highest-priority common payload type per
    /// stream by codec name; fails with `SdpIncompatible` if a mandated
    /// stream has none.
    pub fn set_remote_sdp(&mut self, sdp_text: &str) -> Result<()> {
        let remote = SdpSession::parse(sdp_text)?;
        for stream in &mut self.streams {
            let kind = match stream.kind {
                StreamKind::Audio => MediaKind::Audio,
                StreamKind::Video => MediaKind::Video,
            };
            let remote_media = remote
                .media
                .iter()
                .find(|m| matches_kind(m, kind))
                .ok_or_else(|| {
                    Error::SdpIncompatible(format!("remote SDP has no {:?} media section", stream.kind))
                })?;
            let common = remote_media
                .rtpmaps
                .iter()
                .find(|r| r.codec.eq_ignore_ascii_case(&stream.codec));
            let Some(common) = common else {
                return Err(Error::SdpIncompatible(format!(
                    "no common codec for {:?}: local offers {}, remote offers {:?}",
                    stream.kind,
                    stream.codec,
                    remote_media.rtpmaps.iter().map(|r| r.codec.clone()).collect::<Vec<_>>()
                )));
            };
            stream.payload_type = common.payload_type;

            if !self.ice_enabled {
                stream.remote_rtp_endpoint =
                    Some(SocketAddr::new(remote_media.connection_address, remote_media.port));
            }
            if remote_media.rtcp_mux && self.rtcp_mux_local {
                // Both sides opted in (SPEC_FULL.md §11 decision 2).
            }
        }

        if self.ice_enabled {
            if let Some(first) = remote.media.first() {
                let ufrag = first.ice_ufrag.clone().unwrap_or_default();
                let pwd = first.ice_pwd.clone().unwrap_or_default();
                let candidates: Vec<Candidate> = remote
                    .media
                    .iter()
                    .flat_map(|m| m.candidates.iter())
                    .map(|c| Candidate {
                        foundation: c.foundation.clone(),
                        component: c.component,
                        transport: c.transport.clone(),
                        priority: c.priority,
                        address: SocketAddr::new(c.address, c.port),
                        typ: parse_candidate_type(&c.typ),
                    })
                    .collect();
                debug!(count = candidates.len(), "recorded remote ICE candidates");
                self.ice.set_remote(&candidates, &ufrag, &pwd)?;
            }
        }

        self.remote_sdp = Some(remote);
        Ok(())
    }

    /// `Gathered -> Connecting`: start ICE connectivity checks. When ICE is
    /// disabled this moves straight to Connected and returns the `connected`
    /// event directly, matching `gather_candidates`'s synchronous shortcut.
    pub fn start_ice(&mut self, now_ms: u64) -> Result<Option<SessionEvent>> {
        if self.state != SessionState::Gathered {
            return Err(Error::InvalidState(format!(
                "start_ice requires Gathered, was {:?}",
                self.state
            )));
        }
        self.connect_started_at_ms = Some(now_ms);
        if !self.ice_enabled {
            self.state = SessionState::Connected;
            self.connected_emitted = true;
            return Ok(Some(SessionEvent::Connected));
        }
        self.state = SessionState::Connecting;
        self.ice.start()?;
        Ok(None)
    }

    /// Drain ICE engine events and timeout checks; called once per
    /// `Agent::loop_once` for every non-terminal session.
    pub fn poll_ice(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        if self.state == SessionState::Gathering {
            if let Some(started) = self.gather_started_at_ms {
                if now_ms.saturating_sub(started) > self.gather_timeout_ms {
                    self.state = SessionState::Disconnected;
                    events.push(SessionEvent::GatherFailed("ice_gather_timeout_ms exceeded".into()));
                    return events;
                }
            }
        }
        if self.state == SessionState::Connecting {
            if let Some(started) = self.connect_started_at_ms {
                if now_ms.saturating_sub(started) > self.connect_timeout_ms {
                    self.state = SessionState::Disconnected;
                    events.push(SessionEvent::IceFailed("ice_connect_timeout_ms exceeded".into()));
                    return events;
                }
            }
        }

        for event in self.ice.poll_events() {
            match event {
                IceEvent::GatherComplete { candidates, ufrag, pwd } => {
                    self.build_local_sdp(&candidates, Some(ufrag), Some(pwd));
                    self.state = SessionState::Gathered;
                    if let Some(text) = self.local_sdp_text() {
                        events.push(SessionEvent::SdpReady(text));
                    }
                }
                IceEvent::GatherFailed { reason } => {
                    self.state = SessionState::Disconnected;
                    events.push(SessionEvent::GatherFailed(reason));
                }
                IceEvent::PairNominated(result) => {
                    if let Some(stream) = self.streams.get_mut(result.stream_index) {
                        stream.remote_rtp_endpoint = Some(result.remote_address);
                    }
                    if self.state == SessionState::Connecting && !self.connected_emitted {
                        self.state = SessionState::Connected;
                        self.connected_emitted = true;
                        events.push(SessionEvent::Connected);
                    }
                }
                IceEvent::ConnectFailed { reason } => {
                    self.state = SessionState::Disconnected;
                    events.push(SessionEvent::IceFailed(reason));
                }
            }
        }
        events
    }

    /// Tear down ICE/RTP (any state -> Disconnected -> Closed).
    pub fn stop(&mut self, reason: &str) -> SessionEvent {
        self.state = SessionState::Closed;
        SessionEvent::Disconnected(reason.to_string())
    }

    /// Drive one round of outbound media (capture -> packetize -> ICE send)
    /// and the RTCP interval (spec §4.5: "RTCP reports are emitted on an
    /// interval derived from bandwidth, default 5 s, until Disconnected").
    /// A no-op until a backend/endpoint is bound and the session is
    /// Connected. Called once per `Agent::loop_once` per live session.
    pub fn pump_media(&mut self, now_ms: u64) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.state != SessionState::Connected {
            return events;
        }

        if let Some(backend) = self.media_backend.as_mut() {
            loop {
                match backend.capture() {
                    Ok(Some(frame)) => {
                        if let Some(endpoint) = self.rtp.get_mut(&0) {
                            match endpoint.packetize(&frame) {
                                Ok(packets) => {
                                    for packet in packets {
                                        if let Err(e) = self.ice.send(0, &packet) {
                                            events.push(SessionEvent::MediaError(e.to_string()));
                                        }
                                    }
                                }
                                Err(e) => events.push(SessionEvent::MediaError(e.to_string())),
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        events.push(SessionEvent::MediaError(e.to_string()));
                        break;
                    }
                }
            }
        }

        if self.rtcp_enabled && now_ms.saturating_sub(self.last_rtcp_ms.unwrap_or(0)) >= RTCP_INTERVAL_MS {
            self.last_rtcp_ms = Some(now_ms);
            for (index, endpoint) in self.rtp.iter_mut() {
                match endpoint.emit_rtcp() {
                    Ok(report) if !report.is_empty() => {
                        if let Err(e) = self.ice.send(*index, &report) {
                            events.push(SessionEvent::MediaError(e.to_string()));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => events.push(SessionEvent::MediaError(e.to_string())),
                }
            }
        }
        events
    }

    /// Route one inbound RTP/RTCP packet to whichever stream's
    /// ICE-nominated remote endpoint matches `from` (spec §8 invariant: "the
    /// remote endpoint used for RTP send equals a pair that was observed
    /// nominated by ICE" — the same match governs receive), depacketize it,
    /// and hand a completed frame to the bound media backend.
    pub fn feed_rtp(&mut self, from: SocketAddr, packet: &[u8]) -> Result<()> {
        let Some(index) = self.streams.iter().position(|s| s.remote_rtp_endpoint == Some(from)) else {
            return Ok(());
        };
        let Some(endpoint) = self.rtp.get_mut(&index) else {
            return Ok(());
        };
        if let Some(frame) = endpoint.depacketize(packet)? {
            if let Some(backend) = self.media_backend.as_mut() {
                backend.play(frame)?;
            }
        }
        Ok(())
    }

    /// Feed an inbound STUN/TURN frame to the ICE engine (spec §4.1: "STUN/
    /// RTP -> M -> ICE/RTP subsystems").
    pub fn feed_ice(&mut self, bytes: &[u8]) -> Result<()> {
        self.ice.feed(bytes)
    }

    fn build_local_sdp(&mut self, candidates: &[Candidate], ufrag: Option<String>, pwd: Option<String>) {
        let session_id = self.handle.0;
        let media = self
            .streams
            .iter()
            .map(|s| {
                let sdp_candidates: Vec<SdpCandidate> = candidates
                    .iter()
                    .map(|c| SdpCandidate {
                        foundation: c.foundation.clone(),
                        component: c.component,
                        transport: c.transport.clone(),
                        priority: c.priority,
                        address: c.address.ip(),
                        port: c.address.port(),
                        typ: c.typ.as_str().to_string(),
                    })
                    .collect();
                let connection_address = if self.ice_enabled && !sdp_candidates.is_empty() {
                    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
                } else {
                    self.local_address
                };
                MediaDescription {
                    kind: match s.kind {
                        StreamKind::Audio => MediaKind::Audio,
                        StreamKind::Video => MediaKind::Video,
                    },
                    port: s.local_rtp_port,
                    rtcp_port: if self.rtcp_mux_local { None } else { Some(s.local_rtp_port + 1) },
                    connection_address,
                    direction: s.direction.into(),
                    rtpmaps: vec![crate::sdp::RtpMap {
                        payload_type: s.payload_type,
                        codec: s.codec.clone(),
                        clock_rate: s.sample_rate,
                    }],
                    rtcp_mux: self.rtcp_mux_local,
                    ice_ufrag: ufrag.clone(),
                    ice_pwd: pwd.clone(),
                    candidates: sdp_candidates,
                }
            })
            .collect();

        self.local_sdp = Some(SdpSession {
            origin_user: "sip-ua-core".to_string(),
            session_id,
            session_version: 1,
            connection_address: self.local_address,
            media,
        });
    }
}

fn matches_kind(media: &MediaDescription, kind: MediaKind) -> bool {
    media.kind == kind
}

fn parse_candidate_type(s: &str) -> CandidateType {
    match s {
        "srflx" => CandidateType::ServerReflexive,
        "relay" => CandidateType::Relayed,
        _ => CandidateType::Host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::media::ice::{Candidate, CandidateType, IceEvent};
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct FakeIce {
        events: Vec<IceEvent>,
        gather_called: bool,
        start_called: bool,
    }

    impl IceEngine for FakeIce {
        fn gather(&mut self, _role: IceRole, _stun: (&str, u16), _turn: Option<(&str, u16, &str, &str)>) -> Result<()> {
            self.gather_called = true;
            self.events.push(IceEvent::GatherComplete {
                candidates: vec![Candidate {
                    foundation: "1".into(),
                    component: 1,
                    transport: "UDP".into(),
                    priority: 2130706431,
                    address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 40000),
                    typ: CandidateType::Host,
                }],
                ufrag: "ufrag1".into(),
                pwd: "pwd1".into(),
            });
            Ok(())
        }
        fn set_remote(&mut self, _candidates: &[Candidate], _ufrag: &str, _pwd: &str) -> Result<()> {
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            self.start_called = true;
            self.events.push(IceEvent::PairNominated(super::super::ice::CandidatePairResult {
                stream_index: 0,
                local_address: "192.0.2.10:40000".parse().unwrap(),
                remote_address: "192.0.2.20:50000".parse().unwrap(),
                priority: 1,
                nominated: true,
            }));
            Ok(())
        }
        fn send(&mut self, _stream_index: usize, _bytes: &[u8]) -> Result<usize> {
            Ok(0)
        }
        fn feed(&mut self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
        fn poll_events(&mut self) -> Vec<IceEvent> {
            std::mem::take(&mut self.events)
        }
    }

    fn config_with_ice() -> AgentConfig {
        AgentConfig::builder()
            .server("sip.example.com", 5060)
            .identity("alice", "secret")
            .stun("stun.example.com", 3478)
            .ice(true, IceRole::Controlling)
            .build()
            .unwrap()
    }

    #[test]
    fn sdp_ready_precedes_connected() {
        let cfg = config_with_ice();
        let mut session = Session::new(
            SessionHandle(1),
            &cfg,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            Box::new(FakeIce::default()),
        )
        .unwrap();

        session.gather_candidates(0).unwrap();
        assert_eq!(session.state(), SessionState::Gathering);
        let events = session.poll_ice(10);
        assert!(matches!(events[0], SessionEvent::SdpReady(_)));
        assert_eq!(session.state(), SessionState::Gathered);

        session.start_ice(10).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        let events = session.poll_ice(20);
        assert!(matches!(events[0], SessionEvent::Connected));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn no_common_codec_is_incompatible() {
        let cfg = AgentConfig::builder()
            .server("sip.example.com", 5060)
            .identity("alice", "secret")
            .build()
            .unwrap();
        let mut session = Session::new(
            SessionHandle(1),
            &cfg,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            Box::new(FakeIce::default()),
        )
        .unwrap();
        let remote = "v=0\r\no=bob 1 1 IN IP4 192.0.2.20\r\ns=-\r\nc=IN IP4 192.0.2.20\r\nt=0 0\r\nm=audio 50000 RTP/AVP 111\r\na=rtpmap:111 OPUS/48000\r\n";
        let err = session.set_remote_sdp(remote).unwrap_err();
        assert!(matches!(err, Error::SdpIncompatible(_)));
    }

    #[test]
    fn remote_endpoint_follows_nominated_pair() {
        let cfg = config_with_ice();
        let mut session = Session::new(
            SessionHandle(1),
            &cfg,
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
            Box::new(FakeIce::default()),
        )
        .unwrap();
        session.gather_candidates(0).unwrap();
        session.poll_ice(0);
        session.start_ice(0).unwrap();
        session.poll_ice(0);
        assert_eq!(
            session.streams()[0].remote_rtp_endpoint,
            Some("192.0.2.20:50000".parse().unwrap())
        );
    }
}
