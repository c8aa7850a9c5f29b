use crate::error::{ParseErrorKind, RelayError, Result};

use super::wire::{self, ParsedHead};

/// A parsed RTSP request (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2.
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, ANNOUNCE, SETUP, RECORD, TEARDOWN).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/cam-A`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Body bytes, read per a declared `Content-Length` (e.g. the ANNOUNCE
    /// SDP description).
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Attempts to parse exactly one request from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet contain a complete request
    /// (caller should read more bytes and retry); `Ok(Some((req, n)))` once
    /// one is available, where `n` is the number of bytes consumed — the
    /// caller drains `buf[..n]` and may immediately call this again on the
    /// remainder to support pipelined requests arriving in a single read.
    pub fn try_parse(buf: &[u8]) -> Result<Option<(RtspRequest, usize)>> {
        let Some(head) = wire::try_parse_head(buf, false)? else {
            return Ok(None);
        };
        let Some((body, consumed)) = wire::try_take_body(buf, &head) else {
            return Ok(None);
        };
        Ok(Some((Self::from_head(head, body)?, consumed)))
    }

    fn from_head(head: ParsedHead, body: Vec<u8>) -> Result<Self> {
        let parts: Vec<&str> = head.request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RelayError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }
        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();
        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }
        Ok(RtspRequest {
            method,
            uri,
            version,
            headers: head.headers,
            body,
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = b"OPTIONS rtsp://localhost:8554/cam-A RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let (req, consumed) = RtspRequest::try_parse(raw).unwrap().unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://localhost:8554/cam-A");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("1"));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn parse_announce_with_body() {
        let sdp = b"v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=cam\r\n";
        let raw = format!(
            "ANNOUNCE rtsp://localhost/cam-A RTSP/1.0\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n",
            sdp.len()
        );
        let mut buf = raw.into_bytes();
        buf.extend_from_slice(sdp);

        let (req, consumed) = RtspRequest::try_parse(&buf).unwrap().unwrap();
        assert_eq!(req.method, "ANNOUNCE");
        assert_eq!(req.body, sdp);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn incomplete_body_waits_for_more_bytes() {
        let raw = b"ANNOUNCE rtsp://localhost/cam RTSP/1.0\r\nContent-Length: 20\r\n\r\nshort";
        assert!(RtspRequest::try_parse(raw).unwrap().is_none());
    }

    #[test]
    fn pipelined_requests_parse_one_at_a_time() {
        let raw = b"OPTIONS rtsp://h/c RTSP/1.0\r\nCSeq: 1\r\n\r\nSETUP rtsp://h/c RTSP/1.0\r\nCSeq: 2\r\n\r\n";
        let (first, consumed) = RtspRequest::try_parse(raw).unwrap().unwrap();
        assert_eq!(first.method, "OPTIONS");
        let (second, consumed2) = RtspRequest::try_parse(&raw[consumed..]).unwrap().unwrap();
        assert_eq!(second.method, "SETUP");
        assert_eq!(consumed + consumed2, raw.len());
    }

    #[test]
    fn empty_buffer_returns_none_not_error() {
        assert!(RtspRequest::try_parse(b"").unwrap().is_none());
    }

    #[test]
    fn invalid_request_line_is_an_error() {
        let raw = b"JUST_A_METHOD\r\n\r\n";
        assert!(RtspRequest::try_parse(raw).is_err());
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = b"OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let (req, _) = RtspRequest::try_parse(raw).unwrap().unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("cseq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }
}
