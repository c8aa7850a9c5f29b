//! Shared CRLF/blank-line-terminated message framing used by both the
//! RTSP ingest protocol ([`super::request`]) and the monitor control
//! protocol ([`crate::monitor::control`]): a request line, then
//! case-insensitive `Key: Value` headers, a blank line, and an optional
//! `Content-Length`-sized body.
//!
//! Grounded on `examples/original_source/media/RtspConnect.cc`'s
//! `extractRequestLine`/`extractBody` and `MonitorServer.cc`'s
//! `parseRequest` — both scan the accumulated connection buffer for
//! `"\r\n\r\n"` before attempting to interpret anything, which is what
//! makes pipelined-request support possible: a caller repeatedly calls
//! [`try_parse_head`] against the front of a persistent per-connection
//! buffer and only consumes the bytes of one complete message at a time.

use crate::error::{ParseErrorKind, RelayError, Result};

/// The parsed head (request line + headers) of one message, plus where
/// the body (if any) begins.
pub struct ParsedHead {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    /// Offset into the original buffer where the body starts.
    pub body_start: usize,
}

impl ParsedHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Scans `buf` for a complete header block (request line + headers,
/// terminated by a blank line). Returns `Ok(None)` if more bytes are
/// needed, not an error — only a genuinely malformed head is an `Err`.
pub fn try_parse_head(buf: &[u8], monitor: bool) -> Result<Option<ParsedHead>> {
    let Some(header_end) = find_subslice(buf, b"\r\n\r\n") else {
        return Ok(None);
    };
    let make_err = |kind| {
        if monitor {
            RelayError::MonitorParse { kind }
        } else {
            RelayError::Parse { kind }
        }
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| make_err(ParseErrorKind::InvalidHeader))?;
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| make_err(ParseErrorKind::EmptyRequest))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| make_err(ParseErrorKind::InvalidHeader))?;
        headers.push((key.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(ParsedHead {
        request_line,
        headers,
        body_start: header_end + 4,
    }))
}

/// Given a parsed head and the full buffer, returns the body bytes and
/// the total number of bytes consumed (head + body) once the declared
/// `Content-Length` has fully arrived, or `None` if the body is still
/// incomplete.
pub fn try_take_body(buf: &[u8], head: &ParsedHead) -> Option<(Vec<u8>, usize)> {
    let needed = head.content_length();
    let end = head.body_start + needed;
    if buf.len() < end {
        return None;
    }
    Some((buf[head.body_start..end].to_vec(), end))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_none_until_blank_line_arrives() {
        let buf = b"OPTIONS rtsp://host/cam RTSP/1.0\r\nCSeq: 1\r\n";
        assert!(try_parse_head(buf, false).unwrap().is_none());
    }

    #[test]
    fn parses_headers_once_blank_line_present() {
        let buf = b"OPTIONS rtsp://host/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let head = try_parse_head(buf, false).unwrap().unwrap();
        assert_eq!(head.request_line, "OPTIONS rtsp://host/cam RTSP/1.0");
        assert_eq!(head.header("cseq"), Some("1"));
        assert_eq!(head.body_start, buf.len());
    }

    #[test]
    fn waits_for_full_content_length_body() {
        let buf = b"ANNOUNCE rtsp://host/cam RTSP/1.0\r\nContent-Length: 10\r\n\r\n12345";
        let head = try_parse_head(buf, false).unwrap().unwrap();
        assert!(try_take_body(buf, &head).is_none());
    }

    #[test]
    fn yields_body_once_fully_received() {
        let buf = b"ANNOUNCE rtsp://host/cam RTSP/1.0\r\nContent-Length: 5\r\n\r\nhello_extra_pipelined_bytes";
        let head = try_parse_head(buf, false).unwrap().unwrap();
        let (body, consumed) = try_take_body(buf, &head).unwrap();
        assert_eq!(body, b"hello");
        assert_eq!(&buf[consumed..], b"_extra_pipelined_bytes");
    }

    #[test]
    fn rejects_header_without_colon() {
        let buf = b"OPTIONS rtsp://host/cam RTSP/1.0\r\nnotaheader\r\n\r\n";
        assert!(try_parse_head(buf, false).is_err());
    }
}
