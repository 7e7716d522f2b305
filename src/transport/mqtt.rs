//! Publish/subscribe substrate: one SIP message per MQTT payload, published
//! on `pub_topic` and received on `sub_topic` (spec §6 "MQTT substrate",
//! decision recorded in SPEC_FULL.md §11). QoS 1 for signaling, matching the
//! framing contract this crate settled on for the underspecified original.
//!
//! `MqttTransport` drives an injected `MqttClient` capability rather than a
//! concrete broker type, the same one-level-up indirection `ByteTransport`
//! itself gives callers over substrates; `RumqttcClient` is this crate's
//! default implementation, grounded on `timlisemer-virtual_matter_bridge`'s
//! use of `rumqttc`'s blocking client, the only variant that fits this
//! crate's cooperative polling model.

use std::time::Duration;

use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use tracing::{debug, warn};

use super::{classify, ByteTransport, Destination, Inbound};
use crate::config::MqttConfig;
use crate::error::{Error, Result};

/// A single inbound publish, decoupled from any concrete broker client's
/// own event type.
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Capability interface for the MQTT broker connection `MqttTransport`
/// drives (spec §6 `ByteTransport`, specialized to pub/sub). Connecting to a
/// broker is itself an external collaborator per §1; this trait is the seam
/// that makes the concrete client library pluggable.
pub trait MqttClient {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;
    fn subscribe(&mut self, topic: &str) -> Result<()>;
    /// Block for at most `timeout_ms`, returning the next inbound publish if
    /// one arrives before the deadline.
    fn poll(&mut self, timeout_ms: u64) -> Result<Option<MqttMessage>>;
    fn disconnect(&mut self);
}

/// Default `MqttClient`, backed by `rumqttc`'s blocking `Client`/`Connection`
/// pair.
pub struct RumqttcClient {
    client: Client,
    connection: Connection,
}

impl RumqttcClient {
    pub fn connect(cfg: &MqttConfig) -> Result<Self> {
        let mut options = MqttOptions::new(
            cfg.client_id.clone(),
            cfg.broker_host.clone(),
            cfg.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        let (client, connection) = Client::new(options, 64);
        Ok(RumqttcClient { client, connection })
    }
}

impl MqttClient for RumqttcClient {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| Error::TransportSend(format!("mqtt publish failed: {e}")))
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| Error::TransportInit(format!("mqtt subscribe failed: {e}")))
    }

    fn poll(&mut self, timeout_ms: u64) -> Result<Option<MqttMessage>> {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    return Ok(Some(MqttMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }));
                }
                Ok(Ok(_other_event)) => {
                    if std::time::Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Ok(Err(e)) => {
                    return Err(Error::TransportClosed(format!("mqtt connection error: {e}")));
                }
                Err(_timeout) => return Ok(None),
            }
        }
    }

    fn disconnect(&mut self) {
        let _ = self.client.disconnect();
    }
}

pub struct MqttTransport {
    client: Box<dyn MqttClient>,
    pub_topic: String,
}

impl MqttTransport {
    pub fn open(cfg: &MqttConfig) -> Result<Self> {
        Self::with_client(cfg, Box::new(RumqttcClient::connect(cfg)?))
    }

    /// Open against an injected `MqttClient`, so the concrete broker library
    /// can be swapped without touching `MqttTransport` itself.
    pub fn with_client(cfg: &MqttConfig, mut client: Box<dyn MqttClient>) -> Result<Self> {
        client.subscribe(&cfg.sub_topic)?;
        debug!(broker = %cfg.broker_host, sub = %cfg.sub_topic, pub_topic = %cfg.pub_topic, "mqtt transport opened");
        Ok(MqttTransport {
            client,
            pub_topic: cfg.pub_topic.clone(),
        })
    }
}

impl ByteTransport for MqttTransport {
    fn send(&mut self, bytes: &[u8], _dst: Option<Destination>) -> Result<usize> {
        // The publish topic is fixed at open() time (cfg.pub_topic); callers
        // address the single configured peer, matching the pub/sub contract.
        self.client.publish(&self.pub_topic, bytes)?;
        Ok(bytes.len())
    }

    fn poll(&mut self, timeout_ms: u64, on_frame: &mut dyn FnMut(Inbound)) -> Result<()> {
        if let Some(msg) = self.client.poll(timeout_ms)? {
            match classify(&msg.payload) {
                Some(kind) => on_frame(Inbound {
                    kind,
                    data: msg.payload,
                    from: "0.0.0.0:0".parse().unwrap(),
                }),
                None => warn!(topic = %msg.topic, "dropping unclassifiable mqtt payload"),
            }
        }
        Ok(())
    }

    fn local_address(&self) -> Destination {
        "0.0.0.0:0".parse().unwrap()
    }

    fn close(&mut self) {
        self.client.disconnect();
    }
}
