use crate::transport::Endpoint;

/// Negotiated RTP/RTCP transport for an [`super::IngestSession`] (§4.2
/// "Transport negotiation (SETUP)").
///
/// The `Transport` header determines which variant is created:
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP/UDP;unicast;client_port=8000-8001
/// Server → Client:
///   Transport: RTP/AVP/UDP;unicast;client_port=8000-8001;server_port=10000-10001
///
/// Client → Server:
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// Server → Client:
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone)]
pub enum Transport {
    Udp {
        server_rtp: Endpoint,
        server_rtcp: Endpoint,
        client_rtp: Endpoint,
        client_rtcp: Endpoint,
    },
    TcpInterleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

/// What the client's `Transport` header asked for, before the server has
/// allocated ports or assigned default channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    Udp {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    Tcp {
        rtp_channel: Option<u8>,
        rtcp_channel: Option<u8>,
    },
}

impl TransportRequest {
    /// Parse the `Transport` header value (§4.2). Recognizes
    /// `RTP/AVP/UDP;unicast;client_port=P-P+1` and
    /// `RTP/AVP/TCP;unicast;interleaved=A-B` (the `interleaved` parameter
    /// is optional — the caller defaults to channels 0/1 when absent).
    pub fn parse(header: &str) -> Option<Self> {
        if header.contains("TCP") {
            for part in header.split(';') {
                if let Some(chans) = part.trim().strip_prefix("interleaved=") {
                    let mut it = chans.split('-');
                    let a: u8 = it.next()?.trim().parse().ok()?;
                    let b: u8 = it
                        .next()
                        .and_then(|s| s.trim().parse().ok())
                        .unwrap_or(a + 1);
                    return Some(TransportRequest::Tcp {
                        rtp_channel: Some(a),
                        rtcp_channel: Some(b),
                    });
                }
            }
            return Some(TransportRequest::Tcp {
                rtp_channel: None,
                rtcp_channel: None,
            });
        }

        for part in header.split(';') {
            if let Some(ports) = part.trim().strip_prefix("client_port=") {
                let mut it = ports.split('-');
                let rtp: u16 = it.next()?.trim().parse().ok()?;
                let rtcp: u16 = it.next().and_then(|s| s.trim().parse().ok()).unwrap_or(rtp + 1);
                return Some(TransportRequest::Udp {
                    client_rtp_port: rtp,
                    client_rtcp_port: rtcp,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udp_transport() {
        let req = TransportRequest::parse("RTP/AVP/UDP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(
            req,
            TransportRequest::Udp {
                client_rtp_port: 5000,
                client_rtcp_port: 5001
            }
        );
    }

    #[test]
    fn parse_tcp_transport_with_explicit_channels() {
        let req = TransportRequest::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
        assert_eq!(
            req,
            TransportRequest::Tcp {
                rtp_channel: Some(2),
                rtcp_channel: Some(3)
            }
        );
    }

    #[test]
    fn parse_tcp_transport_defaults_channels_when_absent() {
        let req = TransportRequest::parse("RTP/AVP/TCP;unicast").unwrap();
        assert_eq!(
            req,
            TransportRequest::Tcp {
                rtp_channel: None,
                rtcp_channel: None
            }
        );
    }

    #[test]
    fn parse_rejects_unrecognized_header() {
        assert!(TransportRequest::parse("RTP/AVP;multicast").is_none());
    }
}
