//! Immutable-after-creation agent configuration.
//!
//! Mirrors the option set in spec §3/§6: server/identity, transport selection,
//! TLS material, MQTT parameters, media enablement and codec preferences, and
//! ICE/STUN/TURN coordinates. Built with [`AgentConfigBuilder`] so callers
//! don't hand-assemble a thirty-field struct; `build()` performs the
//! cross-field validation that makes `ConfigInvalid` raisable synchronously
//! from `Agent::create`.

use crate::error::{Error, Result};

/// Selects the byte substrate the transport demux binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Udp,
    Tcp,
    Tls,
    Mqtt,
    /// A caller-supplied `ByteTransport` impl, bypassing the built-in
    /// substrates entirely.
    Custom,
}

/// ICE agent role. `Lite` implies the agent never gathers relayed candidates
/// and only responds to connectivity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
    Lite,
}

/// Selects where captured/played media frames come from, per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaBackendType {
    File,
    Memory,
    Device,
}

/// In-memory TLS material: no filesystem dependency (spec §9 "Memory mode
/// TLS").
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// MQTT substrate coordinates (spec §6 "MQTT substrate").
#[derive(Debug, Clone, Default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub pub_topic: String,
    pub sub_topic: String,
}

/// TURN relay coordinates.
#[derive(Debug, Clone, Default)]
pub struct TurnConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Per-media-kind codec and port preferences.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub enabled: bool,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// 0 = auto-allocate.
    pub rtp_port: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            enabled: true,
            codec: "PCMU".to_string(),
            sample_rate: 8000,
            channels: 1,
            rtp_port: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub enabled: bool,
    pub codec: String,
    pub width: u16,
    pub height: u16,
    pub fps: u8,
    /// 0 = auto-allocate.
    pub rtp_port: u16,
}

impl Default for VideoConfig {
    fn default() -> Self {
        VideoConfig {
            enabled: false,
            codec: "H264".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            rtp_port: 0,
        }
    }
}

/// Identity presented to the registrar/proxy and used to populate From/
/// Contact headers.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
}

/// The complete, immutable agent configuration. Construct via
/// [`AgentConfigBuilder`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub transport_type: TransportType,
    pub server_host: String,
    pub server_port: u16,
    pub local_port: u16,
    pub identity: Identity,
    pub expires: u32,

    pub tls: TlsMaterial,
    pub mqtt: MqttConfig,

    pub stun_server: String,
    pub stun_port: u16,
    pub enable_turn: bool,
    pub turn: TurnConfig,

    pub ice_enabled: bool,
    pub ice_role: IceRole,
    pub ice_gather_timeout_ms: u64,
    pub ice_connect_timeout_ms: u64,
    /// Off by default; only negotiated when both sides offer it (see
    /// SPEC_FULL.md §11, Open Question decision 2).
    pub rtcp_mux: bool,

    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub media_backend: MediaBackendType,

    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }
}

/// Fluent builder for [`AgentConfig`], mirroring the crate's call-control
/// builders: every `with_*` consumes and returns `Self`.
#[derive(Debug, Clone)]
pub struct AgentConfigBuilder {
    transport_type: TransportType,
    server_host: String,
    server_port: u16,
    local_port: u16,
    identity: Identity,
    expires: u32,
    tls: TlsMaterial,
    mqtt: MqttConfig,
    stun_server: String,
    stun_port: u16,
    enable_turn: bool,
    turn: TurnConfig,
    ice_enabled: bool,
    ice_role: IceRole,
    ice_gather_timeout_ms: u64,
    ice_connect_timeout_ms: u64,
    rtcp_mux: bool,
    audio: AudioConfig,
    video: VideoConfig,
    media_backend: MediaBackendType,
    t1_ms: u64,
    t2_ms: u64,
    t4_ms: u64,
}

impl Default for AgentConfigBuilder {
    fn default() -> Self {
        AgentConfigBuilder {
            transport_type: TransportType::Udp,
            server_host: String::new(),
            server_port: 5060,
            local_port: 0,
            identity: Identity::default(),
            expires: 3600,
            tls: TlsMaterial::default(),
            mqtt: MqttConfig::default(),
            stun_server: String::new(),
            stun_port: 3478,
            enable_turn: false,
            turn: TurnConfig::default(),
            ice_enabled: false,
            ice_role: IceRole::Controlling,
            ice_gather_timeout_ms: 5_000,
            ice_connect_timeout_ms: 10_000,
            rtcp_mux: false,
            audio: AudioConfig::default(),
            video: VideoConfig::default(),
            media_backend: MediaBackendType::Memory,
            t1_ms: 500,
            t2_ms: 4_000,
            t4_ms: 5_000,
        }
    }
}

impl AgentConfigBuilder {
    pub fn server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server_host = host.into();
        self.server_port = port;
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn identity(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.identity.username = username.into();
        self.identity.password = password.into();
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.identity.display_name = Some(name.into());
        self
    }

    pub fn expires(mut self, seconds: u32) -> Self {
        self.expires = seconds;
        self
    }

    pub fn transport(mut self, kind: TransportType) -> Self {
        self.transport_type = kind;
        self
    }

    pub fn tls_material(mut self, ca: Vec<u8>, cert: Vec<u8>, key: Vec<u8>) -> Self {
        self.tls = TlsMaterial { ca, cert, key };
        self
    }

    pub fn mqtt(mut self, cfg: MqttConfig) -> Self {
        self.mqtt = cfg;
        self
    }

    pub fn stun(mut self, host: impl Into<String>, port: u16) -> Self {
        self.stun_server = host.into();
        self.stun_port = port;
        self
    }

    pub fn turn(mut self, cfg: TurnConfig) -> Self {
        self.enable_turn = true;
        self.turn = cfg;
        self
    }

    pub fn ice(mut self, enabled: bool, role: IceRole) -> Self {
        self.ice_enabled = enabled;
        self.ice_role = role;
        self
    }

    pub fn ice_timeouts(mut self, gather_ms: u64, connect_ms: u64) -> Self {
        self.ice_gather_timeout_ms = gather_ms;
        self.ice_connect_timeout_ms = connect_ms;
        self
    }

    pub fn rtcp_mux(mut self, enabled: bool) -> Self {
        self.rtcp_mux = enabled;
        self
    }

    pub fn audio(mut self, cfg: AudioConfig) -> Self {
        self.audio = cfg;
        self
    }

    pub fn video(mut self, cfg: VideoConfig) -> Self {
        self.video = cfg;
        self
    }

    pub fn media_backend(mut self, kind: MediaBackendType) -> Self {
        self.media_backend = kind;
        self
    }

    pub fn transaction_timers(mut self, t1_ms: u64, t2_ms: u64, t4_ms: u64) -> Self {
        self.t1_ms = t1_ms;
        self.t2_ms = t2_ms;
        self.t4_ms = t4_ms;
        self
    }

    /// Validate cross-field invariants and produce the immutable
    /// [`AgentConfig`]. Mirrors §7: "`ConfigInvalid` is raised synchronously
    /// from `create`".
    pub fn build(self) -> Result<AgentConfig> {
        if self.server_host.is_empty() {
            return Err(Error::ConfigInvalid("server_host must not be empty".into()));
        }
        if self.identity.username.is_empty() {
            return Err(Error::ConfigInvalid("identity.username must not be empty".into()));
        }
        if self.transport_type == TransportType::Mqtt {
            if self.mqtt.broker_host.is_empty()
                || self.mqtt.pub_topic.is_empty()
                || self.mqtt.sub_topic.is_empty()
            {
                return Err(Error::ConfigInvalid(
                    "mqtt transport requires broker_host, pub_topic and sub_topic".into(),
                ));
            }
        }
        if self.transport_type == TransportType::Tls
            && (self.tls.cert.is_empty() || self.tls.key.is_empty())
        {
            return Err(Error::ConfigInvalid(
                "tls transport requires in-memory cert and key material".into(),
            ));
        }
        if self.enable_turn && self.turn.server.is_empty() {
            return Err(Error::ConfigInvalid(
                "enable_turn requires a turn server host".into(),
            ));
        }
        if self.ice_enabled && self.stun_server.is_empty() && !self.enable_turn {
            return Err(Error::ConfigInvalid(
                "ice requires at least a stun server or turn relay".into(),
            ));
        }
        if !self.audio.enabled && !self.video.enabled {
            return Err(Error::ConfigInvalid(
                "at least one of audio or video must be enabled".into(),
            ));
        }

        Ok(AgentConfig {
            transport_type: self.transport_type,
            server_host: self.server_host,
            server_port: self.server_port,
            local_port: self.local_port,
            identity: self.identity,
            expires: self.expires,
            tls: self.tls,
            mqtt: self.mqtt,
            stun_server: self.stun_server,
            stun_port: self.stun_port,
            enable_turn: self.enable_turn,
            turn: self.turn,
            ice_enabled: self.ice_enabled,
            ice_role: self.ice_role,
            ice_gather_timeout_ms: self.ice_gather_timeout_ms,
            ice_connect_timeout_ms: self.ice_connect_timeout_ms,
            rtcp_mux: self.rtcp_mux,
            audio: self.audio,
            video: self.video,
            media_backend: self.media_backend,
            t1_ms: self.t1_ms,
            t2_ms: self.t2_ms,
            t4_ms: self.t4_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_server_host() {
        let err = AgentConfig::builder()
            .identity("alice", "secret")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_mqtt_without_topics() {
        let err = AgentConfig::builder()
            .server("sip.example.com", 5060)
            .identity("alice", "secret")
            .transport(TransportType::Mqtt)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn builds_with_minimal_fields() {
        let cfg = AgentConfig::builder()
            .server("sip.example.com", 5060)
            .identity("alice", "secret")
            .build()
            .expect("valid config");
        assert_eq!(cfg.server_port, 5060);
        assert_eq!(cfg.expires, 3600);
    }
}
