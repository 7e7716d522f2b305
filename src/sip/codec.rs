//! The `SipCodec` capability interface (spec §6) and this crate's default
//! implementation over [`super::parser`]/[`super::encoder`].

use super::message::Message;
use crate::error::Result;

/// Encode/parse boundary the agent depends on. Swappable by a caller that
/// wants a different wire codec; [`DefaultSipCodec`] is what `Agent` uses
/// unless overridden.
pub trait SipCodec {
    fn encode(&self, message: &Message) -> Vec<u8>;
    /// Parse a complete message's bytes. Framing (finding the message
    /// boundary) happens in the transport layer, not here.
    fn parse(&self, bytes: &[u8]) -> Result<Message>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSipCodec;

impl SipCodec for DefaultSipCodec {
    fn encode(&self, message: &Message) -> Vec<u8> {
        super::encoder::encode(message)
    }

    fn parse(&self, bytes: &[u8]) -> Result<Message> {
        super::parser::parse(bytes)
    }
}
