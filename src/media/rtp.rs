//! RTP/RTCP and media backend capability interfaces (spec §6 `RtpEndpoint`,
//! `MediaBackend`). The packetizer/depacketizer and capture/playback device
//! code are external collaborators (spec §1); this crate only defines the
//! interface the media coordinator drives per stream.

use crate::error::Result;

/// One decoded (for inbound) or to-be-encoded (for outbound) media frame.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub timestamp: u32,
    pub data: Vec<u8>,
    pub marker: bool,
}

/// Capability interface for one stream's RTP/RTCP handling (spec §6).
pub trait RtpEndpoint {
    /// Turn an outbound frame into one or more RTP packets.
    fn packetize(&mut self, frame: &MediaFrame) -> Result<Vec<Vec<u8>>>;

    /// Turn one inbound RTP packet into a frame, if it completes one
    /// (depacketizers may buffer partial frames across several packets).
    fn depacketize(&mut self, packet: &[u8]) -> Result<Option<MediaFrame>>;

    /// Build an RTCP report for the interval elapsed since the last call
    /// (spec §4.5: "emitted on an interval derived from bandwidth, default
    /// 5s, until Disconnected").
    fn emit_rtcp(&mut self) -> Result<Vec<u8>>;
}

/// Capability interface for capture/playback (spec §6 `MediaBackend`); the
/// concrete file/memory/device implementation lives outside this crate.
pub trait MediaBackend {
    /// Pull the next captured frame to send, if one is ready.
    fn capture(&mut self) -> Result<Option<MediaFrame>>;

    /// Push a decoded inbound frame to the playback sink.
    fn play(&mut self, frame: MediaFrame) -> Result<()>;
}
