//! ICE capability interface (spec §6 `IceEngine`). The ICE/STUN/TURN
//! protocol machinery itself is an external collaborator (spec §1); this
//! crate only defines the narrow interface the media coordinator drives.

use crate::config::IceRole;
use crate::error::Result;

/// One candidate pair ICE has nominated for a stream (spec §3 "Candidate
/// pair result").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePairResult {
    pub stream_index: usize,
    pub local_address: std::net::SocketAddr,
    pub remote_address: std::net::SocketAddr,
    pub priority: u64,
    pub nominated: bool,
}

/// A single gathered local candidate, as it appears in `a=candidate:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub transport: String,
    pub priority: u32,
    pub address: std::net::SocketAddr,
    pub typ: CandidateType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relayed,
}

impl CandidateType {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relayed => "relay",
        }
    }
}

/// Events the ICE engine raises asynchronously as connectivity checks
/// proceed; `Session::poll_ice` drains these each `loop_once`.
#[derive(Debug, Clone)]
pub enum IceEvent {
    GatherComplete { candidates: Vec<Candidate>, ufrag: String, pwd: String },
    GatherFailed { reason: String },
    PairNominated(CandidatePairResult),
    ConnectFailed { reason: String },
}

/// Capability interface consumed from the external ICE/STUN/TURN engine
/// (spec §6).
pub trait IceEngine {
    /// Begin gathering host + server-reflexive + (if enabled) relayed
    /// candidates. Non-blocking: completion is reported through
    /// `poll_events`.
    fn gather(&mut self, role: IceRole, stun: (&str, u16), turn: Option<(&str, u16, &str, &str)>) -> Result<()>;

    /// Install the remote candidates/credentials parsed out of the answer or
    /// offer SDP.
    fn set_remote(&mut self, candidates: &[Candidate], ufrag: &str, pwd: &str) -> Result<()>;

    /// Begin connectivity checks using the negotiated role/credentials.
    fn start(&mut self) -> Result<()>;

    /// Send application bytes on the nominated pair for `stream_index`.
    fn send(&mut self, stream_index: usize, bytes: &[u8]) -> Result<usize>;

    /// Feed inbound bytes classified as STUN/TURN to the engine.
    fn feed(&mut self, bytes: &[u8]) -> Result<()>;

    /// Drain queued [`IceEvent`]s produced since the last call.
    fn poll_events(&mut self) -> Vec<IceEvent>;
}

/// A do-nothing [`IceEngine`] used when `AgentConfig::ice_enabled` is
/// `false`. `Session`'s state machine never calls any of these methods in
/// that mode (`gather_candidates`/`start_ice` both short-circuit straight to
/// `Gathered`/`Connected`), so this only needs to exist to satisfy
/// `Session::new`'s constructor, which always takes an `IceEngine` box
/// regardless of whether ICE is negotiated.
#[derive(Debug, Default)]
pub struct NullIceEngine;

impl IceEngine for NullIceEngine {
    fn gather(&mut self, _role: IceRole, _stun: (&str, u16), _turn: Option<(&str, u16, &str, &str)>) -> Result<()> {
        Ok(())
    }

    fn set_remote(&mut self, _candidates: &[Candidate], _ufrag: &str, _pwd: &str) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, _stream_index: usize, _bytes: &[u8]) -> Result<usize> {
        Ok(0)
    }

    fn feed(&mut self, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<IceEvent> {
        Vec::new()
    }
}
