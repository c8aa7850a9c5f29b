//! SDP (Session Description Protocol) handling for the ingest direction
//! (RFC 4566): unlike a DESCRIBE-serving RTSP server, this relay never
//! generates SDP — the camera's ANNOUNCE carries it inbound. Per §3's
//! data model, `stream_name` is derived from the ANNOUNCE URL path, not
//! from the SDP body, so the body itself is stored verbatim on the
//! [`crate::session::IngestSession`] and only summarized here for
//! logging.
//!
//! `examples/original_source/media/RtspConnect.cc`'s `handleAnnounce`
//! does the same — it extracts the body via `Content-Length` and stores
//! it on `_sdp` without parsing further.

/// A short summary of an inbound ANNOUNCE SDP body, extracted for log
/// lines only — never used for session negotiation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SdpSummary {
    pub session_name: Option<String>,
    pub media_line_count: usize,
}

pub fn summarize(sdp: &str) -> SdpSummary {
    let mut summary = SdpSummary::default();
    for line in sdp.lines() {
        if let Some(name) = line.strip_prefix("s=") {
            summary.session_name = Some(name.trim().to_string());
        } else if line.starts_with("m=") {
            summary.media_line_count += 1;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_session_name_and_media_count() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=cam-A\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\nm=video 0 RTP/AVP 96\r\n";
        let summary = summarize(sdp);
        assert_eq!(summary.session_name.as_deref(), Some("cam-A"));
        assert_eq!(summary.media_line_count, 1);
    }

    #[test]
    fn empty_sdp_yields_empty_summary() {
        assert_eq!(summarize(""), SdpSummary::default());
    }
}
