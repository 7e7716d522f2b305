//! Media session coordinator (component M).
//!
//! Binds ICE candidate gathering, SDP offer/answer generation and parsing,
//! and RTP/RTCP endpoint lifecycle behind the state machine in spec §4.5:
//! `Idle -> Gathering -> Gathered -> Connecting -> Connected -> Disconnected
//! -> Closed`. ICE and RTP are opaque capability objects (spec §9 "ICE/RTP
//! fit") — this module never touches STUN or RTP bytes directly, mirroring
//! how `rvoip-media-core`'s session layer treats `rtp-core`/`ice-core` as
//! black boxes behind trait objects.

mod ice;
mod rtp;
mod session;

pub use ice::{Candidate, CandidatePairResult, CandidateType, IceEngine, IceEvent, NullIceEngine};
pub use rtp::{MediaBackend, MediaFrame, RtpEndpoint};
pub use session::{Session, SessionEvent, SessionState, StreamDescriptor, StreamDirection, StreamKind};

/// Opaque handle to a [`Session`], issued by `Agent`. Dialogs hold this
/// (spec §3: "associated session handle (weak)") rather than an owned
/// `Session`, so a session's lifetime is governed entirely by the agent
/// facade that actually owns the backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);
