//! The monitor control line protocol (§4.5, §6): ASCII, CRLF-terminated,
//! blank-line-terminated, with an optional header-like key/value body —
//! the same shape as the RTSP framing in [`crate::protocol::wire`] but
//! with no protocol-version token on the request line, and no status
//! line prefix on responses.
//!
//! Grounded on `examples/original_source/media/MonitorServer.cc`'s
//! `parseRequest` (request line is just `METHOD URL\r\n`, no version)
//! and `sendRespond` (`"{code} {text}\r\nCSeq: {n}\r\n..."` — the
//! original never writes an `RTSP/1.0` equivalent prefix here, unlike
//! its own RTSP-side `sendResponse`).

use crate::protocol::wire::{self, ParsedHead};

use crate::error::Result;

/// One parsed control-line request (`SETUP`, `MESSAGE`, `ADDCAM`,
/// `DELCAM`).
#[derive(Debug)]
pub struct ControlRequest {
    pub method: String,
    /// The `<ip:port>` token following the method.
    pub arg: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ControlRequest {
    /// Mirrors [`crate::protocol::request::RtspRequest::try_parse`]:
    /// `Ok(None)` means "need more bytes", not an error.
    pub fn try_parse(buf: &[u8]) -> Result<Option<(ControlRequest, usize)>> {
        let Some(head) = wire::try_parse_head(buf, true)? else {
            return Ok(None);
        };
        let Some((body, consumed)) = wire::try_take_body(buf, &head) else {
            return Ok(None);
        };
        Ok(Some((Self::from_head(head, body)?, consumed)))
    }

    fn from_head(head: ParsedHead, body: Vec<u8>) -> Result<Self> {
        use crate::error::{ParseErrorKind, RelayError};

        let mut parts = head.request_line.splitn(2, ' ');
        let method = parts
            .next()
            .filter(|m| !m.is_empty())
            .ok_or(RelayError::MonitorParse {
                kind: ParseErrorKind::InvalidRequestLine,
            })?
            .to_string();
        let arg = parts.next().unwrap_or("").trim().to_string();

        Ok(ControlRequest {
            method,
            arg,
            headers: head.headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("Cseq").and_then(|v| v.trim().parse().ok())
    }
}

/// A control-line response: `"{code} {text}\r\n"` followed by headers,
/// a blank line, and an optional body — with **no** version prefix
/// (that's the one divergence from [`crate::protocol::response::RtspResponse`]).
#[must_use]
pub struct ControlResponse {
    pub code: u16,
    pub text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl ControlResponse {
    pub fn new(code: u16, text: &str) -> Self {
        Self {
            code,
            text: text.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn serialize(&self) -> String {
        let mut out = format!("{} {}\r\n", self.code, self.text);
        for (k, v) in &self.headers {
            out.push_str(&format!("{k}: {v}\r\n"));
        }
        if let Some(body) = &self.body {
            out.push_str(&format!("Content-Length: {}\r\n", body.len()));
            out.push_str("\r\n");
            out.push_str(body);
        } else {
            out.push_str("\r\n");
        }
        out
    }
}

/// A server-initiated request (`ADDCAM`/`DELCAM`), serialized the same
/// way the original emits them: `"{METHOD} {arg}\r\nCseq: {n}\r\nSessionId: {name}\r\n\r\n"`.
pub fn build_push_request(method: &str, arg: &str, cseq: u32, session_id: &str) -> String {
    format!("{method} {arg}\r\nCseq: {cseq}\r\nSessionId: {session_id}\r\n\r\n")
}

/// One `<stream_name>: <rtp_port> <rtcp_port> <conv_id>` body line, as
/// sent in a `MESSAGE` body (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraBinding {
    pub stream_name: String,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub conv: u32,
}

/// Parses a `MESSAGE` body's key/value lines into camera bindings.
pub fn parse_message_body(body: &[u8]) -> Vec<CameraBinding> {
    let text = String::from_utf8_lossy(body);
    let mut bindings = Vec::new();
    for line in text.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let nums: Vec<&str> = rest.split_whitespace().collect();
        if nums.len() != 3 {
            continue;
        }
        let (Ok(rtp_port), Ok(rtcp_port), Ok(conv)) =
            (nums[0].parse(), nums[1].parse(), nums[2].parse())
        else {
            continue;
        };
        bindings.push(CameraBinding {
            stream_name: name.trim().to_string(),
            rtp_port,
            rtcp_port,
            conv,
        });
    }
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_setup_request_without_version_token() {
        let raw = b"SETUP 192.168.1.50:9000\r\nCseq: 1\r\n\r\n";
        let (req, consumed) = ControlRequest::try_parse(raw).unwrap().unwrap();
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.arg, "192.168.1.50:9000");
        assert_eq!(req.cseq(), Some(1));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn parses_message_request_with_body() {
        let body = b"cam-A: 40000 40001 4242\r\ncam-B: 40002 40003 4243\r\n";
        let raw = format!(
            "MESSAGE 192.168.1.50:9000\r\nCseq: 2\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut buf = raw.into_bytes();
        buf.extend_from_slice(body);

        let (req, _) = ControlRequest::try_parse(&buf).unwrap().unwrap();
        assert_eq!(req.method, "MESSAGE");
        let bindings = parse_message_body(&req.body);
        assert_eq!(
            bindings,
            vec![
                CameraBinding { stream_name: "cam-A".into(), rtp_port: 40000, rtcp_port: 40001, conv: 4242 },
                CameraBinding { stream_name: "cam-B".into(), rtp_port: 40002, rtcp_port: 40003, conv: 4243 },
            ]
        );
    }

    #[test]
    fn response_has_no_version_prefix() {
        let resp = ControlResponse::ok().add_header("CamNum", "2");
        let s = resp.serialize();
        assert!(s.starts_with("200 OK\r\n"));
        assert!(!s.contains("RTSP/1.0"));
    }

    #[test]
    fn builds_addcam_push_request() {
        let msg = build_push_request("ADDCAM", "10.0.0.1:9000", 7, "cam-A");
        assert_eq!(msg, "ADDCAM 10.0.0.1:9000\r\nCseq: 7\r\nSessionId: cam-A\r\n\r\n");
    }
}
