//! Transport demux (component T).
//!
//! Presents a uniform `send`/`poll` interface over pluggable byte substrates
//! and classifies each inbound datagram as SIP, STUN/TURN, or RTP/RTCP before
//! handing it to the caller-registered receive callback. One substrate is
//! active per transport instance; `Agent` owns exactly one.
//!
//! Module layout mirrors `rvoip-sip-transport`: one file per substrate behind
//! a shared `ByteTransport` trait, generalized here from async `tokio::net` to
//! blocking `std::net` with an explicit `poll(timeout_ms)` call, per spec §5's
//! no-hidden-threads model.

mod udp;
#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "tls")]
mod tls;
#[cfg(feature = "mqtt")]
mod mqtt;

pub use udp::UdpTransport;
#[cfg(feature = "tcp")]
pub use tcp::TcpTransport;
#[cfg(feature = "tls")]
pub use tls::TlsTransport;
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttClient, MqttMessage, MqttTransport, RumqttcClient};

use crate::error::Result;

/// A destination address. For connection-oriented substrates (TCP/TLS/MQTT)
/// this is ignored; `send` always targets the connected peer.
pub type Destination = std::net::SocketAddr;

/// What an inbound frame was classified as, per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Sip,
    StunOrTurn,
    RtpOrRtcp,
}

/// Classify a single inbound frame by its leading bytes (spec §4.1).
/// Returns `None` when the frame matches none of the known shapes; the
/// demux increments a drop counter and discards it in that case.
pub fn classify(frame: &[u8]) -> Option<FrameKind> {
    if frame.len() >= 20 {
        // STUN magic cookie 0x2112A442 at bytes 4..8, leading two bits 0b00.
        let leading = frame[0] >> 6;
        if leading == 0 && frame[4..8] == [0x21, 0x12, 0xA4, 0x42] {
            return Some(FrameKind::StunOrTurn);
        }
    }
    if frame.len() >= 2 {
        let first_byte_is_rtp_version = (frame[0] >> 6) == 2;
        if first_byte_is_rtp_version && (0x80..=0xBF).contains(&frame[0]) {
            return Some(FrameKind::RtpOrRtcp);
        }
    }
    if looks_like_sip(frame) {
        return Some(FrameKind::Sip);
    }
    None
}

fn looks_like_sip(frame: &[u8]) -> bool {
    let text = match std::str::from_utf8(frame.get(0..32.min(frame.len())).unwrap_or(b"")) {
        Ok(s) => s,
        Err(_) => return false,
    };
    const METHODS: &[&str] = &[
        "INVITE", "ACK", "BYE", "CANCEL", "REGISTER", "OPTIONS", "MESSAGE", "INFO",
        "PRACK", "SUBSCRIBE", "NOTIFY", "UPDATE", "REFER", "PUBLISH",
    ];
    if METHODS.iter().any(|m| text.starts_with(m)) {
        return true;
    }
    text.starts_with("SIP/2.0")
}

/// A demultiplexed inbound frame, delivered to the agent facade's receive
/// callback by `poll`.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub kind: FrameKind,
    pub data: Vec<u8>,
    pub from: Destination,
}

/// Capability interface consumed by the SIP agent and media coordinator
/// (spec §6 `ByteTransport`). Implemented by each concrete substrate below;
/// callers needing a substrate this crate doesn't ship can implement it
/// directly (`TransportType::Custom`).
pub trait ByteTransport {
    /// Write `bytes` to `dst` (ignored for connection-oriented substrates).
    /// Returns the number of bytes written.
    fn send(&mut self, bytes: &[u8], dst: Option<Destination>) -> Result<usize>;

    /// Drive non-blocking I/O for up to `timeout_ms`, invoking `on_frame` once
    /// per classified inbound frame. Returns once the timeout elapses or once
    /// all currently available work is drained, whichever comes first.
    fn poll(&mut self, timeout_ms: u64, on_frame: &mut dyn FnMut(Inbound)) -> Result<()>;

    /// The local address this transport is bound to.
    fn local_address(&self) -> Destination;

    /// Release the underlying socket/stream. Idempotent.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invite_as_sip() {
        let frame = b"INVITE sip:bob@example.com SIP/2.0\r\n";
        assert_eq!(classify(frame), Some(FrameKind::Sip));
    }

    #[test]
    fn classifies_status_line_as_sip() {
        let frame = b"SIP/2.0 200 OK\r\n";
        assert_eq!(classify(frame), Some(FrameKind::Sip));
    }

    #[test]
    fn classifies_rtp_by_leading_byte() {
        // version 2, no padding/extension, 0 CSRC => 0x80.
        let frame = [0x80u8, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(classify(&frame), Some(FrameKind::RtpOrRtcp));
    }

    #[test]
    fn classifies_stun_by_magic_cookie() {
        let mut frame = vec![0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xA4, 0x42];
        frame.extend_from_slice(&[0u8; 12]);
        assert_eq!(classify(&frame), Some(FrameKind::StunOrTurn));
    }

    #[test]
    fn unrecognized_frame_is_dropped() {
        let frame = b"\x05\x05garbage";
        assert_eq!(classify(frame), None);
    }
}
