//! `sip-ua-core`: signaling and media session coordination core for an
//! embeddable SIP user agent (spec.md §1).
//!
//! This crate owns the SIP transaction/dialog state machines, the media
//! session coordinator that wires SDP offer/answer generation to opaque
//! ICE/RTP capability objects, and the transport demux that classifies
//! inbound datagrams as SIP/STUN/RTP. Everything below `loop_once` runs on
//! the caller's thread; the crate never spawns one of its own (spec §5).
//!
//! The SIP message codec, the ICE/STUN/TURN engine, the RTP packetizer, and
//! audio/video capture/playback are external collaborators, consumed
//! through the capability traits in [`transport`], [`media::ice`], and
//! [`media::rtp`] (spec §6). This crate ships a default `SipCodec`
//! ([`sip::codec::DefaultSipCodec`]) and a no-op [`media::NullIceEngine`],
//! but callers are free to substitute their own.

pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod media;
pub mod sdp;
pub mod sip;
pub mod time;
pub mod timer;
pub mod transport;

pub use agent::{Agent, AgentHandlers};
pub use config::AgentConfig;
pub use error::{Error, Result};
pub use media::SessionHandle;
pub use sip::{CallState, DialogHandle, RegistrationState};
