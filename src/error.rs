//! Crate-wide error type.
//!
//! One variant per error kind enumerated in the specification's error handling
//! design. Every fallible path in this crate returns `Result<T>` rather than
//! panicking; recoverable failures (a single transient send error, one auth
//! challenge, one ICE retry) are handled internally and never reach here.

use thiserror::Error;

/// A type alias for handling `Result`s with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the SIP agent, media coordinator, or
/// transport demux.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A transport failed to bind or connect during `open`.
    #[error("transport init failed: {0}")]
    TransportInit(String),

    /// A transport failed to write bytes to the wire.
    #[error("transport send failed: {0}")]
    TransportSend(String),

    /// A stream transport observed a persistent disconnect.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The SIP codec could not parse an inbound message.
    #[error("SIP parse error: {0}")]
    SipParse(String),

    /// A parsed SIP message violates a protocol requirement (missing required
    /// header, malformed CSeq, mismatched branch, etc).
    #[error("SIP protocol violation: {0}")]
    SipProtocolViolation(String),

    /// A second digest challenge arrived for a request that already retried
    /// once, or no usable credentials were configured.
    #[error("authentication rejected: {0}")]
    AuthReject(String),

    /// A transaction exhausted its retransmit budget (64*T1) without a final
    /// response.
    #[error("timeout waiting for response")]
    Timeout,

    /// An INVITE was answered with a final non-2xx response.
    #[error("call failed: {code} {reason}")]
    CallFailed {
        /// Upstream SIP status code.
        code: u16,
        /// Upstream SIP reason phrase.
        reason: String,
    },

    /// The requested operation is not valid for the dialog's/session's
    /// current state (e.g. `cancel` on a confirmed dialog).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The SDP body could not be parsed.
    #[error("SDP parse error: {0}")]
    SdpParse(String),

    /// The SDP body parsed but offered no media compatible with local
    /// configuration.
    #[error("SDP incompatible: {0}")]
    SdpIncompatible(String),

    /// ICE candidate gathering did not complete within
    /// `ice_gather_timeout_ms`.
    #[error("ICE candidate gathering failed: {0}")]
    IceGatherFailed(String),

    /// ICE connectivity checks did not converge within
    /// `ice_connect_timeout_ms`.
    #[error("ICE connectivity failed: {0}")]
    IceFailed(String),

    /// Sending RTP/RTCP through the negotiated path failed repeatedly.
    #[error("media transport error: {0}")]
    MediaTransportError(String),

    /// A bounded internal resource (transaction table, dialog table, timer
    /// wheel) is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// `AgentConfig` failed cross-field validation at construction time.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl Error {
    /// Stable, kind-only name for the `on_error(kind, detail)` callback
    /// (spec §6), decoupled from the `Display` text so callers can match on
    /// it without parsing `to_string()`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::TransportInit(_) => "transport_init",
            Error::TransportSend(_) => "transport_send",
            Error::TransportClosed(_) => "transport_closed",
            Error::SipParse(_) => "sip_parse",
            Error::SipProtocolViolation(_) => "sip_protocol_violation",
            Error::AuthReject(_) => "auth_reject",
            Error::Timeout => "timeout",
            Error::CallFailed { .. } => "call_failed",
            Error::InvalidState(_) => "invalid_state",
            Error::SdpParse(_) => "sdp_parse",
            Error::SdpIncompatible(_) => "sdp_incompatible",
            Error::IceGatherFailed(_) => "ice_gather_failed",
            Error::IceFailed(_) => "ice_failed",
            Error::MediaTransportError(_) => "media_transport_error",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::ConfigInvalid(_) => "config_invalid",
        }
    }
}
