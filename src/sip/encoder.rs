//! Wire encoding for SIP messages. Pairs with [`super::parser`] to form the
//! default [`super::codec::SipCodec`] implementation.
//!
//! Spec §9 "Retransmit storage": the transaction layer retains the encoded
//! bytes this module produces and never re-serializes from headers on
//! retransmit, so this module's output only needs to be correct once per
//! message, not idempotent across calls with mutated header state.

use super::message::{Headers, Message, Request, Response};

pub fn encode(message: &Message) -> Vec<u8> {
    match message {
        Message::Request(req) => encode_request(req),
        Message::Response(resp) => encode_response(resp),
    }
}

fn encode_request(req: &Request) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!("{} {} SIP/2.0\r\n", req.method, req.request_uri));
    encode_headers(&req.headers, req.body.len(), &mut out);
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&req.body);
    bytes
}

fn encode_response(resp: &Response) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(&format!(
        "SIP/2.0 {} {}\r\n",
        resp.status_code, resp.reason_phrase
    ));
    encode_headers(&resp.headers, resp.body.len(), &mut out);
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&resp.body);
    bytes
}

fn encode_headers(headers: &Headers, body_len: usize, out: &mut String) {
    for via in &headers.via {
        out.push_str(&format!("Via: {}\r\n", via.to_header_value()));
    }
    if let Some(from) = &headers.from {
        out.push_str(&format!("From: {}\r\n", from.to_header_value()));
    }
    if let Some(to) = &headers.to {
        out.push_str(&format!("To: {}\r\n", to.to_header_value()));
    }
    if let Some(call_id) = &headers.call_id {
        out.push_str(&format!("Call-ID: {call_id}\r\n"));
    }
    if let Some(cseq) = &headers.cseq {
        out.push_str(&format!("CSeq: {} {}\r\n", cseq.seq, cseq.method));
    }
    if let Some(contact) = &headers.contact {
        out.push_str(&format!("Contact: {contact}\r\n"));
    }
    if let Some(expires) = headers.expires {
        out.push_str(&format!("Expires: {expires}\r\n"));
    }
    if let Some(www) = &headers.www_authenticate {
        out.push_str(&format!("WWW-Authenticate: {www}\r\n"));
    }
    if let Some(proxy) = &headers.proxy_authenticate {
        out.push_str(&format!("Proxy-Authenticate: {proxy}\r\n"));
    }
    if let Some(auth) = &headers.authorization {
        out.push_str(&format!("Authorization: {auth}\r\n"));
    }
    if let Some(auth) = &headers.proxy_authorization {
        out.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    if let Some(ct) = &headers.content_type {
        out.push_str(&format!("Content-Type: {ct}\r\n"));
    }
    for extra in &headers.extra {
        out.push_str(&format!("{}: {}\r\n", extra.name, extra.value));
    }
    out.push_str(&format!("Content-Length: {body_len}\r\n"));
    out.push_str("\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::message::{CSeq, Method, NamedUri};

    #[test]
    fn encodes_register_request() {
        let req = Request {
            method: Method::Register,
            request_uri: "sip:example.com".to_string(),
            headers: Headers {
                from: Some(NamedUri::new("sip:alice@example.com").with_tag("abc")),
                to: Some(NamedUri::new("sip:alice@example.com")),
                call_id: Some("callid1".to_string()),
                cseq: Some(CSeq {
                    seq: 1,
                    method: Method::Register,
                }),
                expires: Some(3600),
                ..Default::default()
            },
            body: Vec::new(),
        };
        let bytes = encode_request(&req);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("REGISTER sip:example.com SIP/2.0\r\n"));
        assert!(text.contains("Expires: 3600\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }
}
