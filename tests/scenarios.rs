//! Concrete call-flow scenarios against the public `Agent` facade, driven
//! over an in-memory `ByteTransport` double instead of real sockets —
//! matching the teacher's pattern of testing the transaction/dialog layer
//! against a mock transport rather than UDP.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use sip_ua_core::config::{AgentConfig, IceRole};
use sip_ua_core::media::{Candidate, CandidatePairResult, CandidateType, IceEngine, IceEvent};
use sip_ua_core::sip::codec::{DefaultSipCodec, SipCodec};
use sip_ua_core::sip::message::{CSeq, Headers, Message, Method, NamedUri, Request, Response, ViaHeader};
use sip_ua_core::transport::{ByteTransport, Destination, FrameKind, Inbound};
use sip_ua_core::{Agent, AgentHandlers, CallState, Result};

fn local_addr() -> Destination {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 15060)
}

fn server_addr() -> Destination {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5060)
}

fn peer_addr() -> Destination {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 20)), 6000)
}

fn config() -> AgentConfig {
    AgentConfig::builder()
        .server("127.0.0.1", 5060)
        .identity("alice", "secret")
        .expires(300)
        .build()
        .unwrap()
}

fn config_with_ice() -> AgentConfig {
    AgentConfig::builder()
        .server("127.0.0.1", 5060)
        .identity("alice", "secret")
        .stun("198.51.100.1", 3478)
        .ice(true, IceRole::Controlling)
        .build()
        .unwrap()
}

const PCMU_SDP: &str = "v=0\r\no=bob 1 1 IN IP4 198.51.100.20\r\ns=-\r\nc=IN IP4 198.51.100.20\r\nt=0 0\r\nm=audio 40000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
const OPUS_ONLY_SDP: &str = "v=0\r\no=bob 1 1 IN IP4 198.51.100.20\r\ns=-\r\nc=IN IP4 198.51.100.20\r\nt=0 0\r\nm=audio 40000 RTP/AVP 111\r\na=rtpmap:111 OPUS/48000\r\n";

/// An in-memory substrate: `send` records bytes instead of writing to a
/// socket, `poll` drains whatever the test has queued via `push_response`/
/// `push_request`. Cloning shares the underlying queues (`Rc`), so the test
/// keeps a handle to script against after the original is moved into `Agent`.
#[derive(Clone)]
struct ScriptedTransport {
    local: Destination,
    sent: Rc<RefCell<Vec<(Vec<u8>, Destination)>>>,
    inbound: Rc<RefCell<VecDeque<Inbound>>>,
}

impl ScriptedTransport {
    fn new(local: Destination) -> Self {
        ScriptedTransport {
            local,
            sent: Rc::new(RefCell::new(Vec::new())),
            inbound: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Drain and parse everything sent since the last call.
    fn take_sent(&self) -> Vec<Message> {
        self.sent
            .borrow_mut()
            .drain(..)
            .map(|(bytes, _to)| DefaultSipCodec.parse(&bytes).expect("agent emitted a parsable SIP frame"))
            .collect()
    }

    fn push_response(&self, resp: Response, from: Destination) {
        let bytes = DefaultSipCodec.encode(&Message::Response(resp));
        self.inbound.borrow_mut().push_back(Inbound { kind: FrameKind::Sip, data: bytes, from });
    }

    fn push_request(&self, req: Request, from: Destination) {
        let bytes = DefaultSipCodec.encode(&Message::Request(req));
        self.inbound.borrow_mut().push_back(Inbound { kind: FrameKind::Sip, data: bytes, from });
    }
}

impl ByteTransport for ScriptedTransport {
    fn send(&mut self, bytes: &[u8], dst: Option<Destination>) -> Result<usize> {
        self.sent.borrow_mut().push((bytes.to_vec(), dst.unwrap_or(self.local)));
        Ok(bytes.len())
    }

    fn poll(&mut self, _timeout_ms: u64, on_frame: &mut dyn FnMut(Inbound)) -> Result<()> {
        for frame in self.inbound.borrow_mut().drain(..) {
            on_frame(frame);
        }
        Ok(())
    }

    fn local_address(&self) -> Destination {
        self.local
    }

    fn close(&mut self) {}
}

fn as_request(message: &Message) -> &Request {
    match message {
        Message::Request(r) => r,
        Message::Response(_) => panic!("expected a request, got a response"),
    }
}

fn as_response(message: &Message) -> &Response {
    match message {
        Message::Response(r) => r,
        Message::Request(_) => panic!("expected a response, got a request"),
    }
}

fn final_response(branch: &str, call_id: &str, cseq: u32, method: Method, status: u16, reason: &str, to_tag: Option<&str>, body: Vec<u8>) -> Response {
    let mut to = NamedUri::new("sip:alice@127.0.0.1");
    if let Some(tag) = to_tag {
        to = to.with_tag(tag);
    }
    Response {
        status_code: status,
        reason_phrase: reason.to_string(),
        headers: Headers {
            via: vec![ViaHeader { protocol: "SIP/2.0/UDP".into(), sent_by: "127.0.0.1:5060".into(), branch: branch.to_string() }],
            from: Some(NamedUri::new("sip:alice@127.0.0.1")),
            to: Some(to),
            call_id: Some(call_id.to_string()),
            cseq: Some(CSeq { seq: cseq, method }),
            expires: if status == 200 && method == Method::Register { Some(300) } else { None },
            ..Default::default()
        },
        body,
    }
}

/// A scripted `IceEngine` double that completes gathering and nomination
/// synchronously, the same shape `media::session`'s own `FakeIce` test
/// double uses (see `src/media/session.rs`).
#[derive(Default)]
struct ScriptedIce {
    events: Vec<IceEvent>,
}

impl IceEngine for ScriptedIce {
    fn gather(&mut self, _role: IceRole, _stun: (&str, u16), _turn: Option<(&str, u16, &str, &str)>) -> Result<()> {
        self.events.push(IceEvent::GatherComplete {
            candidates: vec![Candidate {
                foundation: "1".into(),
                component: 1,
                transport: "UDP".into(),
                priority: 2_130_706_431,
                address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 40000),
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
        self.events.push(IceEvent::PairNominated(CandidatePairResult {
            stream_index: 0,
            local_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 40000),
            remote_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 20)), 40000),
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

fn incoming_invite(call_id: &str, branch: &str, sdp: &str) -> Request {
    Request {
        method: Method::Invite,
        request_uri: "sip:alice@127.0.0.1".to_string(),
        headers: Headers {
            via: vec![ViaHeader { protocol: "SIP/2.0/UDP".into(), sent_by: "198.51.100.20:6000".into(), branch: branch.to_string() }],
            from: Some(NamedUri::new("sip:bob@example.com").with_tag("bobtag")),
            to: Some(NamedUri::new("sip:alice@127.0.0.1")),
            call_id: Some(call_id.to_string()),
            cseq: Some(CSeq { seq: 1, method: Method::Invite }),
            content_type: Some("application/sdp".to_string()),
            ..Default::default()
        },
        body: sdp.as_bytes().to_vec(),
    }
}

#[test]
fn registration_happy_path_retries_with_digest_then_registers() {
    let transport = ScriptedTransport::new(local_addr());
    let script = transport.clone();
    let states = Rc::new(RefCell::new(Vec::new()));
    let s = states.clone();
    let handlers = AgentHandlers::new().on_registration_state(move |state, code| s.borrow_mut().push((state, code)));

    let mut agent = Agent::create_with_transport(config(), handlers, Box::new(transport)).unwrap();
    agent.start().unwrap();
    agent.register();
    agent.loop_once(0).unwrap();

    let sent = script.take_sent();
    assert_eq!(sent.len(), 1);
    let first = as_request(&sent[0]);
    assert_eq!(first.method, Method::Register);
    let call_id = first.headers.call_id.clone().unwrap();
    let branch1 = first.headers.via[0].branch.clone();

    script.push_response(
        final_response(&branch1, &call_id, 1, Method::Register, 401, "Unauthorized", None, Vec::new()),
        server_addr(),
    );
    let mut challenge = final_response(&branch1, &call_id, 1, Method::Register, 401, "Unauthorized", None, Vec::new());
    challenge.headers.www_authenticate = Some("Digest realm=\"example\", nonce=\"xyz\", qop=\"auth\"".to_string());
    // Replace the queued plain 401 with one that actually carries the challenge.
    script.inbound.borrow_mut().clear();
    script.push_response(challenge, server_addr());
    agent.loop_once(0).unwrap();

    let retried = script.take_sent();
    assert_eq!(retried.len(), 1);
    let second = as_request(&retried[0]);
    assert_eq!(second.method, Method::Register);
    let auth = second.headers.authorization.clone().expect("retried REGISTER carries Authorization");
    assert!(auth.starts_with("Digest username=\"alice\""));
    assert!(auth.contains("nc=00000001"));
    let branch2 = second.headers.via[0].branch.clone();
    let cseq2 = second.headers.cseq.unwrap().seq;

    script.push_response(
        final_response(&branch2, &call_id, cseq2, Method::Register, 200, "OK", Some("srvtag"), Vec::new()),
        server_addr(),
    );
    agent.loop_once(0).unwrap();

    assert_eq!(*states.borrow(), vec![(sip_ua_core::RegistrationState::Registered, 200)]);
}

#[test]
fn outgoing_call_negotiates_ice_then_connects() {
    let transport = ScriptedTransport::new(local_addr());
    let script = transport.clone();

    let sdp_ready = Rc::new(RefCell::new(None));
    let sr = sdp_ready.clone();
    let call_states = Rc::new(RefCell::new(Vec::new()));
    let cs = call_states.clone();
    let connected = Rc::new(RefCell::new(false));
    let c = connected.clone();
    let handlers = AgentHandlers::new()
        .on_session_sdp_ready(move |_session, sdp| *sr.borrow_mut() = Some(sdp))
        .on_call_state(move |_dialog, state| cs.borrow_mut().push(state))
        .on_session_connected(move |_session| *c.borrow_mut() = true);

    let mut agent = Agent::create_with_transport(config_with_ice(), handlers, Box::new(transport)).unwrap();
    agent.set_ice_factory(|| Box::new(ScriptedIce::default()));
    agent.start().unwrap();

    let _dialog = agent.make_call("sip:bob@example.com").unwrap();

    let sdp1 = sdp_ready.borrow().clone().expect("sdp_ready must precede the INVITE");
    assert!(sdp1.contains("a=ice-ufrag:"));
    assert!(sdp1.contains("a=candidate:"));

    let sent = script.take_sent();
    assert_eq!(sent.len(), 1);
    let invite = as_request(&sent[0]);
    assert_eq!(invite.method, Method::Invite);
    let branch = invite.headers.via[0].branch.clone();
    let call_id = invite.headers.call_id.clone().unwrap();
    let cseq = invite.headers.cseq.unwrap().seq;

    script.push_response(final_response(&branch, &call_id, cseq, Method::Invite, 180, "Ringing", Some("bobtag"), Vec::new()), peer_addr());
    agent.loop_once(0).unwrap();
    assert_eq!(*call_states.borrow(), vec![CallState::Ringing]);

    script.push_response(
        final_response(&branch, &call_id, cseq, Method::Invite, 200, "OK", Some("bobtag"), PCMU_SDP.as_bytes().to_vec()),
        peer_addr(),
    );
    agent.loop_once(0).unwrap();
    assert_eq!(*call_states.borrow(), vec![CallState::Ringing, CallState::Connected]);

    let after_200 = script.take_sent();
    assert!(after_200.iter().any(|m| matches!(m, Message::Request(r) if r.method == Method::Ack)));

    agent.loop_once(0).unwrap();
    assert!(*connected.borrow(), "on_session_connected should fire once ICE nominates a pair");
}

#[test]
fn incoming_call_is_rejected_as_busy_after_on_incoming_call() {
    let transport = ScriptedTransport::new(local_addr());
    let script = transport.clone();

    let incoming = Rc::new(RefCell::new(None));
    let inc = incoming.clone();
    let handlers = AgentHandlers::new().on_incoming_call(move |dialog, from, to, sdp| {
        *inc.borrow_mut() = Some((dialog, from, to, sdp));
    });

    let mut agent = Agent::create_with_transport(config(), handlers, Box::new(transport)).unwrap();
    agent.start().unwrap();

    script.push_request(incoming_invite("call-busy", "z9hG4bKbusy1", PCMU_SDP), peer_addr());
    agent.loop_once(0).unwrap();

    let (dialog, from, _to, sdp) = incoming.borrow_mut().take().expect("on_incoming_call should fire");
    assert_eq!(from, "sip:bob@example.com");
    assert!(sdp.is_some());

    agent.reject_call(&dialog, 486).unwrap();

    let sent = script.take_sent();
    assert_eq!(sent.len(), 1);
    let resp = as_response(&sent[0]);
    assert_eq!(resp.status_code, 486);

    // The dialog must reach Terminated and be dropped from the store, not
    // leaked as a permanently-early entry (spec §8 scenario 3).
    assert!(
        agent.hangup(&dialog).is_err(),
        "rejected dialog should no longer exist in the store"
    );
}

#[test]
fn bye_mid_call_transitions_session_state_to_hangup() {
    let transport = ScriptedTransport::new(local_addr());
    let script = transport.clone();

    let call_states = Rc::new(RefCell::new(Vec::new()));
    let cs = call_states.clone();
    let disconnected = Rc::new(RefCell::new(false));
    let d = disconnected.clone();
    let handlers = AgentHandlers::new()
        .on_call_state(move |_dialog, state| cs.borrow_mut().push(state))
        .on_session_disconnected(move |_session, _reason| *d.borrow_mut() = true);

    let mut agent = Agent::create_with_transport(config(), handlers, Box::new(transport)).unwrap();
    agent.start().unwrap();

    let dialog = agent.make_call("sip:bob@example.com").unwrap();
    let invite = as_request(&script.take_sent()[0]).clone();
    let branch = invite.headers.via[0].branch.clone();
    let call_id = invite.headers.call_id.clone().unwrap();
    let cseq = invite.headers.cseq.unwrap().seq;

    script.push_response(
        final_response(&branch, &call_id, cseq, Method::Invite, 200, "OK", Some("bobtag"), PCMU_SDP.as_bytes().to_vec()),
        peer_addr(),
    );
    agent.loop_once(0).unwrap();
    script.take_sent(); // drain the ACK

    agent.hangup(&dialog).unwrap();
    let bye = script.take_sent();
    assert_eq!(bye.len(), 1);
    let bye_req = as_request(&bye[0]);
    assert_eq!(bye_req.method, Method::Bye);
    let bye_branch = bye_req.headers.via[0].branch.clone();
    let bye_cseq = bye_req.headers.cseq.unwrap().seq;

    script.push_response(
        final_response(&bye_branch, &call_id, bye_cseq, Method::Bye, 200, "OK", Some("bobtag"), Vec::new()),
        peer_addr(),
    );
    agent.loop_once(0).unwrap();

    assert_eq!(*call_states.borrow(), vec![CallState::Connected, CallState::Hangup]);
    assert!(*disconnected.borrow());
}

#[test]
fn cancel_before_answer_fails_the_call_with_487() {
    let transport = ScriptedTransport::new(local_addr());
    let script = transport.clone();

    let call_states = Rc::new(RefCell::new(Vec::new()));
    let cs = call_states.clone();
    let handlers = AgentHandlers::new().on_call_state(move |_dialog, state| cs.borrow_mut().push(state));

    let mut agent = Agent::create_with_transport(config(), handlers, Box::new(transport)).unwrap();
    agent.start().unwrap();

    let dialog = agent.make_call("sip:bob@example.com").unwrap();
    let invite = as_request(&script.take_sent()[0]).clone();
    let invite_branch = invite.headers.via[0].branch.clone();
    let call_id = invite.headers.call_id.clone().unwrap();
    let cseq = invite.headers.cseq.unwrap().seq;

    agent.cancel(&dialog).unwrap();
    let cancel_sent = script.take_sent();
    assert_eq!(cancel_sent.len(), 1);
    assert_eq!(as_request(&cancel_sent[0]).method, Method::Cancel);

    script.push_response(final_response(&invite_branch, &call_id, cseq, Method::Cancel, 200, "OK", Some("bobtag"), Vec::new()), peer_addr());
    agent.loop_once(0).unwrap();

    script.push_response(final_response(&invite_branch, &call_id, cseq, Method::Invite, 487, "Request Terminated", Some("bobtag"), Vec::new()), peer_addr());
    agent.loop_once(0).unwrap();

    let final_sent = script.take_sent();
    assert!(final_sent.iter().any(|m| matches!(m, Message::Request(r) if r.method == Method::Ack)));
    assert_eq!(*call_states.borrow(), vec![CallState::Failed { code: 487 }]);
}

#[test]
fn incoming_invite_with_incompatible_codec_is_rejected_without_a_session() {
    let transport = ScriptedTransport::new(local_addr());
    let script = transport.clone();

    let called = Rc::new(RefCell::new(false));
    let c = called.clone();
    let handlers = AgentHandlers::new().on_incoming_call(move |_d, _from, _to, _sdp| *c.borrow_mut() = true);

    let mut agent = Agent::create_with_transport(config(), handlers, Box::new(transport)).unwrap();
    agent.start().unwrap();

    script.push_request(incoming_invite("call-incompatible", "z9hG4bKincompat1", OPUS_ONLY_SDP), peer_addr());
    agent.loop_once(0).unwrap();

    assert!(!*called.borrow(), "on_incoming_call must not fire when no codec is common");
    let sent = script.take_sent();
    assert_eq!(sent.len(), 1);
    let resp = as_response(&sent[0]);
    assert_eq!(resp.status_code, 488);

    // The auto-rejected dialog must not linger as the single allowed
    // outstanding incoming call (spec §8 scenario 3/6, §11 decision 1): a
    // second, distinct incoming INVITE must still reach on_incoming_call
    // rather than being auto-486'd as busy.
    script.push_request(incoming_invite("call-after-488", "z9hG4bKafter1", PCMU_SDP), peer_addr());
    agent.loop_once(0).unwrap();
    assert!(
        *called.borrow(),
        "a fresh incoming call must not be treated as busy after the earlier dialog was rejected"
    );
}
