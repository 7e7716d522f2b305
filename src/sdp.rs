//! SDP (RFC 4566) model, generation, and parsing, with the RFC 5245/8839 ICE
//! attributes spec §6 requires when ICE is enabled.
//!
//! Grounded on `sip-core/src/types/sdp.rs`'s line-oriented model (one struct
//! per attribute family) but trimmed to exactly the attributes spec §4.5/§6
//! name: `v=`, `o=`, `s=`, `c=`, `t=`, `m=`, `a=rtpmap`, the direction
//! attributes, `a=rtcp-mux`, `a=ice-ufrag`/`a=ice-pwd`, `a=candidate`. No
//! `serde` derives here — this module is never serialized to anything but
//! the SDP wire text itself.

use crate::error::{Error, Result};
use crate::media::CandidateType;

/// Static RFC 3551 payload types and the dynamic types spec §6 names.
pub fn static_payload_type(codec: &str) -> Option<u8> {
    match codec.to_ascii_uppercase().as_str() {
        "PCMU" => Some(0),
        "PCMA" => Some(8),
        "G722" => Some(9),
        _ => None,
    }
}

/// Preferred dynamic payload type for codecs without a static assignment.
/// These are this crate's own defaults (spec §6 lists them as the dynamic
/// types a deployment commonly uses, not a fixed requirement), so a peer
/// offering a different dynamic number for the same codec name is still
/// matched by name, not number, during negotiation.
pub fn default_dynamic_payload_type(codec: &str) -> Option<u8> {
    match codec.to_ascii_uppercase().as_str() {
        "OPUS" => Some(111),
        "AAC" => Some(97),
        "H264" => Some(96),
        "H265" => Some(98),
        "VP8" => Some(100),
        "VP9" => Some(101),
        _ => None,
    }
}

pub fn payload_type_for(codec: &str) -> Option<u8> {
    static_payload_type(codec).or_else(|| default_dynamic_payload_type(codec))
}

pub fn clock_rate_for(codec: &str, configured_sample_rate: u32) -> u32 {
    match codec.to_ascii_uppercase().as_str() {
        "PCMU" | "PCMA" => 8000,
        "G722" => 8000, // RFC 3551: G.722 clock rate is 8000 despite 16kHz sampling.
        "OPUS" => 48000,
        _ => configured_sample_rate,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    fn parse(s: &str) -> Option<MediaKind> {
        match s {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Option<Direction> {
        match s {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub codec: String,
    pub clock_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpCandidate {
    pub foundation: String,
    pub component: u8,
    pub transport: String,
    pub priority: u32,
    pub address: std::net::IpAddr,
    pub port: u16,
    pub typ: String,
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub kind: MediaKind,
    pub port: u16,
    pub rtcp_port: Option<u16>,
    pub connection_address: std::net::IpAddr,
    pub direction: Direction,
    pub rtpmaps: Vec<RtpMap>,
    pub rtcp_mux: bool,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub candidates: Vec<SdpCandidate>,
}

/// A complete SDP session description (offer or answer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub origin_user: String,
    pub session_id: u64,
    pub session_version: u64,
    pub connection_address: std::net::IpAddr,
    pub media: Vec<MediaDescription>,
}

impl SdpSession {
    pub fn to_sdp_string(&self) -> String {
        let mut out = String::new();
        out.push_str("v=0\r\n");
        out.push_str(&format!(
            "o={} {} {} IN IP4 {}\r\n",
            self.origin_user, self.session_id, self.session_version, self.connection_address
        ));
        out.push_str("s=-\r\n");
        out.push_str(&format!("c=IN IP4 {}\r\n", self.connection_address));
        out.push_str("t=0 0\r\n");

        for m in &self.media {
            let fmts: Vec<String> = m.rtpmaps.iter().map(|r| r.payload_type.to_string()).collect();
            out.push_str(&format!(
                "m={} {} RTP/AVP {}\r\n",
                m.kind.as_str(),
                m.port,
                fmts.join(" ")
            ));
            out.push_str(&format!("c=IN IP4 {}\r\n", m.connection_address));
            for rtpmap in &m.rtpmaps {
                out.push_str(&format!(
                    "a=rtpmap:{} {}/{}\r\n",
                    rtpmap.payload_type, rtpmap.codec, rtpmap.clock_rate
                ));
            }
            out.push_str(&format!("a={}\r\n", m.direction.as_str()));
            if m.rtcp_mux {
                out.push_str("a=rtcp-mux\r\n");
            } else if let Some(rtcp_port) = m.rtcp_port {
                out.push_str(&format!("a=rtcp:{rtcp_port}\r\n"));
            }
            if let Some(ufrag) = &m.ice_ufrag {
                out.push_str(&format!("a=ice-ufrag:{ufrag}\r\n"));
            }
            if let Some(pwd) = &m.ice_pwd {
                out.push_str(&format!("a=ice-pwd:{pwd}\r\n"));
            }
            for c in &m.candidates {
                out.push_str(&format!(
                    "a=candidate:{} {} {} {} {} {} typ {}\r\n",
                    c.foundation, c.component, c.transport, c.priority, c.address, c.port, c.typ
                ));
            }
        }
        out
    }

    /// Parse tolerant of CRLF or LF line endings; unknown attributes are
    /// ignored (spec §4.5 "SDP parsing tolerance").
    pub fn parse(text: &str) -> Result<SdpSession> {
        let mut origin_user = String::new();
        let mut session_id = 0u64;
        let mut session_version = 0u64;
        let mut session_level_address: Option<std::net::IpAddr> = None;
        let mut media: Vec<MediaDescription> = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r');
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                continue;
            }
            let (kind, value) = (line.as_bytes()[0], &line[2..]);
            match kind {
                b'o' => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin_user = parts[0].to_string();
                        session_id = parts[1].parse().unwrap_or(0);
                        session_version = parts[2].parse().unwrap_or(0);
                        session_level_address = parts[5].parse().ok();
                    }
                }
                b'c' if media.is_empty() => {
                    session_level_address = parse_connection_address(value);
                }
                b'm' => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(Error::SdpParse(format!("malformed m= line: {value}")));
                    }
                    let kind = MediaKind::parse(parts[0])
                        .ok_or_else(|| Error::SdpParse(format!("unsupported media type: {}", parts[0])))?;
                    let port: u16 = parts[1]
                        .parse()
                        .map_err(|_| Error::SdpParse(format!("invalid m= port: {}", parts[1])))?;
                    let fmts: Vec<u8> = parts[3..].iter().filter_map(|p| p.parse().ok()).collect();
                    media.push(MediaDescription {
                        kind,
                        port,
                        rtcp_port: if port == 0 { None } else { Some(port + 1) },
                        connection_address: session_level_address
                            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
                        direction: Direction::SendRecv,
                        rtpmaps: fmts
                            .into_iter()
                            .map(|pt| RtpMap {
                                payload_type: pt,
                                codec: String::new(),
                                clock_rate: 0,
                            })
                            .collect(),
                        rtcp_mux: false,
                        ice_ufrag: None,
                        ice_pwd: None,
                        candidates: Vec::new(),
                    });
                }
                b'c' => {
                    if let (Some(addr), Some(last)) = (parse_connection_address(value), media.last_mut()) {
                        last.connection_address = addr;
                    }
                }
                b'a' => {
                    if let Some(last) = media.last_mut() {
                        apply_media_attribute(last, value);
                    }
                }
                _ => {}
            }
        }

        if media.is_empty() {
            return Err(Error::SdpParse("no m= lines present".into()));
        }

        Ok(SdpSession {
            origin_user,
            session_id,
            session_version,
            connection_address: session_level_address
                .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            media,
        })
    }
}

fn parse_connection_address(value: &str) -> Option<std::net::IpAddr> {
    // "IN IP4 <address>" or "IN IP6 <address>".
    value.split_whitespace().nth(2)?.parse().ok()
}

fn apply_media_attribute(media: &mut MediaDescription, value: &str) {
    if let Some(rest) = value.strip_prefix("rtpmap:") {
        let mut parts = rest.splitn(2, ' ');
        let Some(pt_str) = parts.next() else { return };
        let Some(codec_part) = parts.next() else { return };
        let Ok(pt) = pt_str.parse::<u8>() else { return };
        let mut codec_parts = codec_part.splitn(2, '/');
        let codec = codec_parts.next().unwrap_or("").to_string();
        let clock_rate = codec_parts.next().and_then(|s| s.split('/').next()).and_then(|s| s.parse().ok()).unwrap_or(0);
        if let Some(entry) = media.rtpmaps.iter_mut().find(|r| r.payload_type == pt) {
            entry.codec = codec;
            entry.clock_rate = clock_rate;
        }
        return;
    }
    if let Some(dir) = Direction::parse(value) {
        media.direction = dir;
        return;
    }
    if value == "rtcp-mux" {
        media.rtcp_mux = true;
        return;
    }
    if let Some(ufrag) = value.strip_prefix("ice-ufrag:") {
        media.ice_ufrag = Some(ufrag.to_string());
        return;
    }
    if let Some(pwd) = value.strip_prefix("ice-pwd:") {
        media.ice_pwd = Some(pwd.to_string());
        return;
    }
    if let Some(cand) = value.strip_prefix("candidate:") {
        if let Some(parsed) = parse_candidate(cand) {
            media.candidates.push(parsed);
        }
        return;
    }
    // Unknown attribute: ignored per spec §4.5 tolerance.
}

fn parse_candidate(value: &str) -> Option<SdpCandidate> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 8 {
        return None;
    }
    Some(SdpCandidate {
        foundation: parts[0].to_string(),
        component: parts[1].parse().ok()?,
        transport: parts[2].to_string(),
        priority: parts[3].parse().ok()?,
        address: parts[4].parse().ok()?,
        port: parts[5].parse().ok()?,
        typ: parts[7].to_string(),
    })
}

impl From<CandidateType> for &'static str {
    fn from(value: CandidateType) -> Self {
        value.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_session() -> SdpSession {
        SdpSession {
            origin_user: "alice".to_string(),
            session_id: 123,
            session_version: 1,
            connection_address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            media: vec![MediaDescription {
                kind: MediaKind::Audio,
                port: 40000,
                rtcp_port: Some(40001),
                connection_address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                direction: Direction::SendRecv,
                rtpmaps: vec![RtpMap {
                    payload_type: 0,
                    codec: "PCMU".to_string(),
                    clock_rate: 8000,
                }],
                rtcp_mux: false,
                ice_ufrag: Some("ufrag1".to_string()),
                ice_pwd: Some("pwd1".to_string()),
                candidates: vec![SdpCandidate {
                    foundation: "1".to_string(),
                    component: 1,
                    transport: "UDP".to_string(),
                    priority: 2130706431,
                    address: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                    port: 40000,
                    typ: "host".to_string(),
                }],
            }],
        }
    }

    #[test]
    fn generates_required_lines() {
        let text = sample_session().to_sdp_string();
        assert!(text.starts_with("v=0\r\n"));
        assert!(text.contains("m=audio 40000 RTP/AVP 0\r\n"));
        assert!(text.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(text.contains("a=ice-ufrag:ufrag1\r\n"));
        assert!(text.contains("a=candidate:1 1 UDP 2130706431 192.0.2.1 40000 typ host\r\n"));
    }

    #[test]
    fn round_trips_through_parse() {
        let original = sample_session();
        let text = original.to_sdp_string();
        let parsed = SdpSession::parse(&text).expect("parses");
        assert_eq!(parsed.media.len(), 1);
        assert_eq!(parsed.media[0].rtpmaps[0].codec, "PCMU");
        assert_eq!(parsed.media[0].direction, Direction::SendRecv);
        assert_eq!(parsed.media[0].candidates.len(), 1);
        assert_eq!(parsed.media[0].ice_ufrag.as_deref(), Some("ufrag1"));
    }

    #[test]
    fn tolerates_lf_line_endings() {
        let text = "v=0\no=a 1 1 IN IP4 127.0.0.1\ns=-\nc=IN IP4 127.0.0.1\nt=0 0\nm=audio 5000 RTP/AVP 0\na=rtpmap:0 PCMU/8000\n";
        let parsed = SdpSession::parse(text).expect("parses LF-only SDP");
        assert_eq!(parsed.media[0].port, 5000);
    }

    #[test]
    fn rejects_zero_media_lines() {
        let err = SdpSession::parse("v=0\r\no=a 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n").unwrap_err();
        assert!(matches!(err, Error::SdpParse(_)));
    }
}
