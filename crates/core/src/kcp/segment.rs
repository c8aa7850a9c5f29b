//! Wire format for the reliable-UDP ARQ segment header (§6): 24 bytes,
//! little-endian, matching the widely-deployed KCP header layout referenced
//! by `examples/original_source/camera/kcp.c`'s `ikcp_create`/`kcp_init`
//! (conv demultiplexing there reads the first 4 bytes as a little-endian
//! `conv`, via `kcp_getu32`).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                              conv                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     cmd       |     frg       |              wnd              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                               ts                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                               sn                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                               una                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                               len                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             data (len)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

pub const HEADER_LEN: usize = 24;

pub const CMD_PUSH: u8 = 81;
pub const CMD_ACK: u8 = 82;

#[derive(Debug, Clone)]
pub struct Segment {
    pub conv: u32,
    pub cmd: u8,
    /// Fragment count remaining after this one (0 on the last fragment of a
    /// user message) — mirrors KCP's `frg` field.
    pub frg: u8,
    /// Receive window the sender is currently advertising.
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    /// Cumulative ack: every `sn` below this has been received by the sender
    /// of this segment.
    pub una: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.conv.to_le_bytes());
        out.push(self.cmd);
        out.push(self.frg);
        out.extend_from_slice(&self.wnd.to_le_bytes());
        out.extend_from_slice(&self.ts.to_le_bytes());
        out.extend_from_slice(&self.sn.to_le_bytes());
        out.extend_from_slice(&self.una.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    /// Parse one segment from the front of `buf`, returning it along with
    /// the number of bytes consumed. A single UDP datagram may carry
    /// several segments packed back to back.
    pub fn decode(buf: &[u8]) -> Option<(Segment, usize)> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let conv = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let cmd = buf[4];
        let frg = buf[5];
        let wnd = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let ts = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let sn = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let una = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let len = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;
        if buf.len() < HEADER_LEN + len {
            return None;
        }
        let data = buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        Some((
            Segment {
                conv,
                cmd,
                frg,
                wnd,
                ts,
                sn,
                una,
                data,
            },
            HEADER_LEN + len,
        ))
    }
}

/// Reads just the leading `conv` field without fully parsing a segment —
/// used by the demultiplexer on the shared UDP socket to route an incoming
/// datagram to the right endpoint before it is otherwise touched.
pub fn peek_conv(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes(buf[0..4].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let seg = Segment {
            conv: 0x1234_5678,
            cmd: CMD_PUSH,
            frg: 2,
            wnd: 128,
            ts: 999,
            sn: 7,
            una: 3,
            data: vec![1, 2, 3, 4, 5],
        };
        let mut buf = Vec::new();
        seg.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN + 5);

        let (decoded, consumed) = Segment::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.conv, seg.conv);
        assert_eq!(decoded.cmd, seg.cmd);
        assert_eq!(decoded.frg, seg.frg);
        assert_eq!(decoded.sn, seg.sn);
        assert_eq!(decoded.data, seg.data);
    }

    #[test]
    fn peek_conv_reads_first_four_bytes_le() {
        let seg = Segment {
            conv: 42,
            cmd: CMD_ACK,
            frg: 0,
            wnd: 128,
            ts: 0,
            sn: 0,
            una: 0,
            data: vec![],
        };
        let mut buf = Vec::new();
        seg.encode_into(&mut buf);
        assert_eq!(peek_conv(&buf), Some(42));
    }
}
