//! Wire parsing for SIP messages (RFC 3261 §7; request/status lines parsed
//! with `nom`, headers parsed line-by-line and folded into [`Headers`]).
//!
//! Framing (how many bytes make up one message) is handled one layer up —
//! [`crate::sip::framing`] for TCP/TLS, UDP datagram boundaries as-is — this
//! module only turns a complete message's bytes into a [`Message`].

use nom::bytes::complete::{tag, take_until, take_while1};
use nom::character::complete::{char, digit1, space1};
use nom::combinator::map_res;
use nom::sequence::tuple;
use nom::IResult;

use super::message::{CSeq, Header, Headers, Message, Method, NamedUri, Request, Response, ViaHeader};
use crate::error::{Error, Result};

/// Parse a complete, already-delimited SIP message.
pub fn parse(bytes: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::SipParse(format!("message is not valid utf-8: {e}")))?;
    let (header_block, body) = split_header_body(text)?;
    let mut lines = header_block.lines();
    let start_line = lines
        .next()
        .ok_or_else(|| Error::SipParse("empty message".into()))?;

    let headers = parse_headers(lines)?;

    if let Ok((_, (code, reason))) = parse_status_line(start_line) {
        return Ok(Message::Response(Response {
            status_code: code,
            reason_phrase: reason.to_string(),
            headers,
            body: body.as_bytes().to_vec(),
        }));
    }

    let (_, (method, uri)) = parse_request_line(start_line)
        .map_err(|e| Error::SipParse(format!("invalid start line: {e}")))?;
    Ok(Message::Request(Request {
        method,
        request_uri: uri.to_string(),
        headers,
        body: body.as_bytes().to_vec(),
    }))
}

fn split_header_body(text: &str) -> Result<(&str, &str)> {
    if let Some(pos) = text.find("\r\n\r\n") {
        Ok((&text[..pos], &text[pos + 4..]))
    } else if let Some(pos) = text.find("\n\n") {
        Ok((&text[..pos], &text[pos + 2..]))
    } else {
        // No body, no trailing blank line (some transports omit it for
        // zero-length bodies); treat the whole text as headers.
        Ok((text, ""))
    }
}

fn parse_request_line(line: &str) -> IResult<&str, (Method, &str)> {
    let (rest, (method_token, _, uri, _, _version)) = tuple((
        take_while1(|c: char| c.is_ascii_alphabetic()),
        space1,
        take_until(" "),
        space1,
        tag("SIP/2.0"),
    ))(line)?;
    Ok((rest, (Method::parse(method_token), uri)))
}

fn parse_status_line(line: &str) -> IResult<&str, (u16, &str)> {
    let (rest, (_, _, code, _, reason)) = tuple((
        tag("SIP/2.0"),
        space1,
        map_res(digit1, |s: &str| s.parse::<u16>()),
        space1,
        nom::combinator::rest,
    ))(line)?;
    Ok((rest, (code, reason)))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::default();
    for raw in lines {
        let line = raw.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::SipParse(format!("malformed header line: {line:?}")))?;
        let name = name.trim();
        let value = value.trim();
        fold_header(&mut headers, name, value)?;
    }
    Ok(headers)
}

fn fold_header(headers: &mut Headers, name: &str, value: &str) -> Result<()> {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "via" | "v" => headers.via.push(parse_via(value)?),
        "from" | "f" => headers.from = Some(parse_named_uri(value)),
        "to" | "t" => headers.to = Some(parse_named_uri(value)),
        "call-id" | "i" => headers.call_id = Some(value.to_string()),
        "cseq" => headers.cseq = Some(parse_cseq(value)?),
        "contact" | "m" => headers.contact = Some(value.to_string()),
        "content-type" | "c" => headers.content_type = Some(value.to_string()),
        "content-length" | "l" => {
            headers.content_length = Some(
                value
                    .parse()
                    .map_err(|_| Error::SipParse(format!("invalid Content-Length: {value}")))?,
            )
        }
        "www-authenticate" => headers.www_authenticate = Some(value.to_string()),
        "proxy-authenticate" => headers.proxy_authenticate = Some(value.to_string()),
        "authorization" => headers.authorization = Some(value.to_string()),
        "proxy-authorization" => headers.proxy_authorization = Some(value.to_string()),
        "expires" => {
            headers.expires = Some(
                value
                    .parse()
                    .map_err(|_| Error::SipParse(format!("invalid Expires: {value}")))?,
            )
        }
        _ => headers.extra.push(Header::new(name, value)),
    }
    Ok(())
}

fn parse_via(value: &str) -> Result<ViaHeader> {
    let (proto_part, rest) = value
        .split_once(' ')
        .ok_or_else(|| Error::SipParse(format!("malformed Via: {value}")))?;
    let (sent_by, params) = rest.split_once(';').unwrap_or((rest, ""));
    let branch = params
        .split(';')
        .find_map(|p| p.trim().strip_prefix("branch="))
        .ok_or_else(|| Error::SipProtocolViolation(format!("Via missing branch: {value}")))?;
    Ok(ViaHeader {
        protocol: proto_part.trim().to_string(),
        sent_by: sent_by.trim().to_string(),
        branch: branch.trim().to_string(),
    })
}

fn parse_named_uri(value: &str) -> NamedUri {
    let (before_params, tag_value) = match value.split_once(";tag=") {
        Some((a, b)) => (a, Some(b.trim().to_string())),
        None => (value, None),
    };
    let trimmed = before_params.trim();
    if let Some(open) = trimmed.find('<') {
        let close = trimmed.find('>').unwrap_or(trimmed.len());
        let uri = trimmed[open + 1..close.max(open + 1)].to_string();
        let display = trimmed[..open].trim().trim_matches('"');
        NamedUri {
            display_name: if display.is_empty() {
                None
            } else {
                Some(display.to_string())
            },
            uri,
            tag: tag_value,
        }
    } else {
        NamedUri {
            display_name: None,
            uri: trimmed.to_string(),
            tag: tag_value,
        }
    }
}

fn parse_cseq(value: &str) -> Result<CSeq> {
    let (seq_str, method_str) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| Error::SipParse(format!("malformed CSeq: {value}")))?;
    let seq = seq_str
        .parse()
        .map_err(|_| Error::SipParse(format!("invalid CSeq number: {seq_str}")))?;
    Ok(CSeq {
        seq,
        method: Method::parse(method_str.trim()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invite() -> Vec<u8> {
        concat!(
            "INVITE sip:bob@example.com SIP/2.0\r\n",
            "Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK776asdhds\r\n",
            "From: \"Alice\" <sip:alice@example.com>;tag=1928301774\r\n",
            "To: <sip:bob@example.com>\r\n",
            "Call-ID: a84b4c76e66710@pc33.example.com\r\n",
            "CSeq: 314159 INVITE\r\n",
            "Contact: <sip:alice@pc33.example.com>\r\n",
            "Content-Type: application/sdp\r\n",
            "Content-Length: 4\r\n",
            "\r\n",
            "v=0\n"
        )
        .as_bytes()
        .to_vec()
    }

    #[test]
    fn parses_invite_request() {
        let msg = parse(&sample_invite()).expect("parses");
        match msg {
            Message::Request(req) => {
                assert_eq!(req.method, Method::Invite);
                assert_eq!(req.request_uri, "sip:bob@example.com");
                assert_eq!(req.headers.via.len(), 1);
                assert_eq!(req.headers.via[0].branch, "z9hG4bK776asdhds");
                assert_eq!(req.headers.from.as_ref().unwrap().tag.as_deref(), Some("1928301774"));
                assert_eq!(req.headers.cseq.unwrap().seq, 314159);
                assert_eq!(req.body, b"v=0\n");
            }
            Message::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn parses_status_line() {
        let raw = b"SIP/2.0 200 OK\r\nCall-ID: x\r\nContent-Length: 0\r\n\r\n";
        let msg = parse(raw).expect("parses");
        match msg {
            Message::Response(resp) => {
                assert_eq!(resp.status_code, 200);
                assert_eq!(resp.reason_phrase, "OK");
            }
            Message::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn rejects_missing_branch() {
        let raw = b"SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP h:5060\r\nContent-Length: 0\r\n\r\n";
        let err = parse(raw).unwrap_err();
        assert!(matches!(err, Error::SipProtocolViolation(_)));
    }
}
