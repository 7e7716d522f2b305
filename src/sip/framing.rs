//! Stream framing shared by TCP/TLS: one SIP message is the header block up
//! to the blank line, followed by exactly `Content-Length` bytes of body.

/// Returns the byte length of the first complete SIP message in `buf`, if
/// one is present, so the caller can split it off. Returns `None` if more
/// bytes are needed.
pub fn find_complete_message(buf: &[u8]) -> Option<usize> {
    let header_end = find_header_end(buf)?;
    let headers = std::str::from_utf8(&buf[..header_end]).ok()?;
    let content_length = headers
        .split("\r\n")
        .chain(headers.split('\n'))
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length")
                || name.trim().eq_ignore_ascii_case("l")
            {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let body_start = find_body_start(buf)?;
    let total = body_start + content_length;
    if buf.len() >= total {
        Some(total)
    } else {
        None
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    find_blank_line(buf).map(|(start, _)| start)
}

fn find_body_start(buf: &[u8]) -> Option<usize> {
    find_blank_line(buf).map(|(_, end)| end)
}

/// Locate the CRLFCRLF or LFLF separator. Returns `(header_end, body_start)`.
fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = windows_find(buf, b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    windows_find(buf, b"\n\n").map(|pos| (pos, pos + 2))
}

fn windows_find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_message_with_zero_length_body() {
        let msg = b"OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        assert_eq!(find_complete_message(msg), Some(msg.len()));
    }

    #[test]
    fn waits_for_full_body() {
        let partial = b"INVITE sip:a@b SIP/2.0\r\nContent-Length: 10\r\n\r\n12345";
        assert_eq!(find_complete_message(partial), None);
        let full = b"INVITE sip:a@b SIP/2.0\r\nContent-Length: 10\r\n\r\n1234567890";
        assert_eq!(find_complete_message(full), Some(full.len()));
    }

    #[test]
    fn tolerates_lf_only_line_endings() {
        let msg = b"OPTIONS sip:a@b SIP/2.0\nContent-Length: 0\n\n";
        assert_eq!(find_complete_message(msg), Some(msg.len()));
    }
}
