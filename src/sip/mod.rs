//! The SIP agent (component S) and its supporting message/transaction/dialog
//! machinery (component D). Module layout mirrors the teacher's crate split
//! (`sip-core` for message modeling/parsing, `transaction-core` +
//! `dialog-core` for the transaction/dialog layer, `sip-client` for the
//! call-control facade) collapsed into submodules of one crate per
//! `SPEC_FULL.md` §0.

pub mod agent;
pub mod codec;
pub mod dialog;
pub mod encoder;
pub mod framing;
pub mod message;
pub mod parser;
pub mod transaction;

pub use agent::{AgentEvent, CallState, RegistrationState, SipAction, SipAgent, TimerKind};
pub use dialog::{DialogHandle, DialogState};
