//! SIP message model (RFC 3261 §7).
//!
//! The underlying SIP message codec is, per spec §1, an external collaborator
//! behind the [`crate::sip::codec::SipCodec`] capability trait; this module is
//! the crate's own default implementation of that trait's vocabulary, the way
//! `rvoip-sip-transport` still ships a concrete `UdpTransport` behind its
//! `Transport` trait even though transports are themselves pluggable.

use std::fmt;

/// The nine request methods this core constructs or dispatches on (spec
/// §4.4 names REGISTER/INVITE/ACK/BYE/CANCEL/MESSAGE explicitly; OPTIONS and
/// a generic fallback round out what a real deployment sees on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Message,
    Info,
    Other,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Message => "MESSAGE",
            Method::Info => "INFO",
            Method::Other => "UNKNOWN",
        }
    }

    pub fn parse(token: &str) -> Method {
        match token {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "MESSAGE" => Method::Message,
            "INFO" => Method::Info,
            _ => Method::Other,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single header line, preserved as a name/value pair. Multiple headers
/// with the same name (e.g. `Via`) appear as repeated entries, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// `Via` header fields relevant to transaction matching (RFC 3261 §8.1.1.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub protocol: String,
    pub sent_by: String,
    /// The `z9hG4bK`-prefixed branch token (spec §4.4).
    pub branch: String,
}

impl ViaHeader {
    pub fn to_header_value(&self) -> String {
        format!(
            "{} {};branch={}",
            self.protocol, self.sent_by, self.branch
        )
    }
}

/// `From`/`To` header fields: a display name, a URI, and an optional tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedUri {
    pub display_name: Option<String>,
    pub uri: String,
    pub tag: Option<String>,
}

impl NamedUri {
    pub fn new(uri: impl Into<String>) -> Self {
        NamedUri {
            display_name: None,
            uri: uri.into(),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn to_header_value(&self) -> String {
        let mut s = String::new();
        if let Some(name) = &self.display_name {
            s.push_str(&format!("\"{name}\" "));
        }
        s.push_str(&format!("<{}>", self.uri));
        if let Some(tag) = &self.tag {
            s.push_str(&format!(";tag={tag}"));
        }
        s
    }
}

/// `CSeq` header: sequence number plus method, monotonic per dialog
/// direction (spec §3 Dialog invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

/// The well-understood headers named in spec §4.4, parsed into a structured
/// form; anything else remains in `extra` as raw name/value pairs in wire
/// order, so encoding round-trips unrecognized headers untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Headers {
    pub via: Vec<ViaHeader>,
    pub from: Option<NamedUri>,
    pub to: Option<NamedUri>,
    pub call_id: Option<String>,
    pub cseq: Option<CSeq>,
    pub contact: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<usize>,
    pub www_authenticate: Option<String>,
    pub proxy_authenticate: Option<String>,
    pub authorization: Option<String>,
    pub proxy_authorization: Option<String>,
    pub expires: Option<u32>,
    pub extra: Vec<Header>,
}

/// A SIP request message: request-line, headers, optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub request_uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// A SIP response message: status-line, headers, optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status_code)
    }
    pub fn is_failure(&self) -> bool {
        self.status_code >= 400
    }
    pub fn is_auth_challenge(&self) -> bool {
        self.status_code == 401 || self.status_code == 407
    }
}

/// Either half of the request/response pair, as delivered by the transport
/// demux after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            Message::Request(r) => &r.body,
            Message::Response(r) => &r.body,
        }
    }
}
