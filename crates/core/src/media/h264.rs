//! RTP → H.264 depacketizer (RFC 6184).
//!
//! Reassembles an incoming RTP stream back into Annex-B NAL units, handling:
//!
//! - **Single NALU** (RFC 6184 §5.6, NAL types 1–23) — payload is the NAL
//!   unit itself.
//! - **STAP-A** (type 24, §5.7.1) — one RTP packet aggregates several NAL
//!   units, each prefixed by a 16-bit big-endian length.
//! - **FU-A** (type 28, §5.8) — one NAL unit fragmented across several RTP
//!   packets, reassembled using the fragment's start/end bits.
//!
//! RTP packets may arrive out of order; a bounded reorder buffer holds up to
//! [`MAX_REORDER_BUFFER`] packets keyed by sequence number and drains them in
//! sequence order, eagerly evicting the oldest buffered packet once the
//! buffer is full so a single missing packet cannot stall the stream
//! indefinitely. A wide-enough forward gap (a run of packets presumed lost
//! rather than merely reordered) catches `expected_seq` up to the next
//! packet actually in hand even when the buffer itself never fills, so a
//! loss deeper than a few packets but shallower than the buffer doesn't
//! stall the stream either.

use std::collections::BTreeMap;

use super::NalUnit;
use super::rtp::{RtpPacket, seq_after};

/// Maximum number of out-of-order RTP packets buffered before the oldest is
/// force-drained. Matches the original unpacker's `MAX_BUFFER`.
pub const MAX_REORDER_BUFFER: usize = 64;

/// Modular distance ahead of `expected_seq` beyond which an inbound packet is
/// treated as proof that the intervening range was lost rather than merely
/// reordered, so `expected_seq` catches up to it instead of waiting forever
/// for packets that count-based overflow eviction would never see (the gap
/// can be smaller than [`MAX_REORDER_BUFFER`] packets wide and still never
/// fill the buffer).
const LARGE_GAP_THRESHOLD: u16 = (MAX_REORDER_BUFFER / 2) as u16;

struct BufferedPacket {
    timestamp: u32,
    payload: Vec<u8>,
}

/// Per-stream depacketizer state. One instance per ingest session (SSRC).
pub struct H264Depacketizer {
    reorder: BTreeMap<u16, BufferedPacket>,
    expected_seq: u16,
    first_packet: bool,

    assembling: bool,
    current_nal_type: u8,
    current_timestamp: u32,
    assembling_buf: Vec<u8>,
}

impl Default for H264Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self {
            reorder: BTreeMap::new(),
            expected_seq: 0,
            first_packet: true,
            assembling: false,
            current_nal_type: 0,
            current_timestamp: 0,
            assembling_buf: Vec::new(),
        }
    }

    /// Feed one raw RTP packet (header + payload). Returns every NAL unit
    /// that became ready to emit as a result — zero, one, or several (a
    /// STAP-A packet can yield several; draining after a reorder-buffer
    /// overflow or a sequence catch-up can also yield several).
    pub fn push(&mut self, raw: &[u8]) -> Vec<NalUnit> {
        let mut out = Vec::new();
        let Some(pkt) = RtpPacket::parse(raw) else {
            tracing::debug!(len = raw.len(), "RTP packet too short, dropped");
            return out;
        };

        if self.reorder.contains_key(&pkt.sequence) {
            tracing::debug!(seq = pkt.sequence, "duplicate RTP sequence dropped");
            return out;
        }
        // A packet whose sequence has already been drained past `expected_seq`
        // is a duplicate of one already delivered, even though it's no longer
        // sitting in `reorder` — without this check it would be re-inserted
        // as a "new" low-numbered entry and eventually replayed as a second
        // NAL emission once the buffer cycles it out via overflow eviction.
        if !self.first_packet && seq_after(self.expected_seq, pkt.sequence) {
            tracing::debug!(seq = pkt.sequence, expected = self.expected_seq, "stale/already-delivered RTP sequence dropped");
            return out;
        }

        self.reorder.insert(
            pkt.sequence,
            BufferedPacket {
                timestamp: pkt.timestamp,
                payload: pkt.payload.to_vec(),
            },
        );

        // A gap this wide will never trip the count-based overflow check
        // below on its own (a handful of packets arriving far ahead of
        // `expected_seq` doesn't grow `reorder` past `MAX_REORDER_BUFFER`
        // entries) and `expected_seq` can never be reached if the missing
        // range is gone for good, so the stream would stall forever without
        // this catch-up: jump straight to the earliest packet actually in
        // hand and resume draining from there.
        if !self.first_packet && looks_like_loss(self.expected_seq, pkt.sequence) {
            let catch_up_to = *self.reorder.keys().next().unwrap();
            tracing::warn!(
                expected = self.expected_seq,
                seq = pkt.sequence,
                catch_up_to,
                "large sequence gap, eagerly catching up past missing packets"
            );
            self.expected_seq = catch_up_to;
        }

        if self.reorder.len() > MAX_REORDER_BUFFER {
            let oldest_seq = *self.reorder.keys().next().unwrap();
            let oldest = self.reorder.remove(&oldest_seq).unwrap();
            tracing::warn!(seq = oldest_seq, "reorder buffer full, force-draining oldest");
            self.process_packet(oldest_seq, oldest, &mut out);
        }

        if self.first_packet {
            self.expected_seq = pkt.sequence;
            self.first_packet = false;
        }

        while let Some(next) = self.reorder.remove(&self.expected_seq) {
            self.process_packet(self.expected_seq, next, &mut out);
            self.expected_seq = self.expected_seq.wrapping_add(1);
        }

        out
    }

    /// Process and emit every packet still held in the reorder buffer, in
    /// sequence order. Called when a session tears down so no buffered
    /// video is silently discarded.
    pub fn flush(&mut self) -> Vec<NalUnit> {
        let mut out = Vec::new();
        let seqs: Vec<u16> = self.reorder.keys().copied().collect();
        for seq in seqs {
            if let Some(pkt) = self.reorder.remove(&seq) {
                self.process_packet(seq, pkt, &mut out);
            }
        }
        out
    }

    fn process_packet(&mut self, seq: u16, pkt: BufferedPacket, out: &mut Vec<NalUnit>) {
        if pkt.payload.is_empty() {
            return;
        }
        let nal_type = pkt.payload[0] & 0x1f;
        match nal_type {
            1..=23 => {
                out.push(annex_b(pkt.timestamp, &pkt.payload));
            }
            24 => self.handle_stap_a(seq, &pkt, out),
            28 => self.handle_fu_a(&pkt, out),
            other => {
                tracing::debug!(nal_type = other, seq, "unsupported NAL type ignored");
            }
        }
    }

    /// STAP-A (RFC 6184 §5.7.1): one or more `NALU Size (16 bit) | NALU`
    /// entries back to back; the leading byte of the STAP-A payload is the
    /// STAP-A NAL header itself, not part of any aggregation unit.
    fn handle_stap_a(&mut self, seq: u16, pkt: &BufferedPacket, out: &mut Vec<NalUnit>) {
        let mut cursor = &pkt.payload[1..];
        while cursor.len() > 2 {
            let size = u16::from_be_bytes([cursor[0], cursor[1]]) as usize;
            cursor = &cursor[2..];
            if size == 0 || size > cursor.len() {
                tracing::warn!(seq, size, "malformed STAP-A aggregation unit, dropped");
                break;
            }
            out.push(annex_b(pkt.timestamp, &cursor[..size]));
            cursor = &cursor[size..];
        }
    }

    /// FU-A (RFC 6184 §5.8): `FU indicator | FU header | fragment...`.
    /// Intermediate and end fragments are appended only while a start
    /// fragment has already been observed for the in-progress assembly — a
    /// fragment with a mismatched timestamp, or one seen before any start
    /// fragment, discards whatever assembly is in progress rather than
    /// silently stitching unrelated data together.
    fn handle_fu_a(&mut self, pkt: &BufferedPacket, out: &mut Vec<NalUnit>) {
        if pkt.payload.len() < 2 {
            return;
        }
        let fu_indicator = pkt.payload[0];
        let fu_header = pkt.payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let nal_type = fu_header & 0x1f;
        let reconstructed_nal = (fu_indicator & 0xe0) | nal_type;

        if start {
            self.assembling = true;
            self.current_timestamp = pkt.timestamp;
            self.current_nal_type = nal_type;
            self.assembling_buf.clear();
            self.assembling_buf.extend_from_slice(&[0, 0, 0, 1]);
            self.assembling_buf.push(reconstructed_nal);
            self.assembling_buf.extend_from_slice(&pkt.payload[2..]);
            if end {
                out.push(NalUnit {
                    timestamp: self.current_timestamp,
                    data: std::mem::take(&mut self.assembling_buf),
                });
                self.assembling = false;
            }
        } else if self.assembling && pkt.timestamp == self.current_timestamp {
            self.assembling_buf.extend_from_slice(&pkt.payload[2..]);
            if end {
                out.push(NalUnit {
                    timestamp: self.current_timestamp,
                    data: std::mem::take(&mut self.assembling_buf),
                });
                self.assembling = false;
            }
        } else {
            tracing::warn!(
                nal_type = self.current_nal_type,
                "FU-A fragment with no preceding start (or timestamp mismatch), discarded"
            );
            self.assembling = false;
        }
    }
}

fn annex_b(timestamp: u32, nal: &[u8]) -> NalUnit {
    let mut data = Vec::with_capacity(4 + nal.len());
    data.extend_from_slice(&[0, 0, 0, 1]);
    data.extend_from_slice(nal);
    NalUnit { timestamp, data }
}

/// Detects a forward sequence gap large enough that the missing packets are
/// assumed lost rather than merely reordered. Used by [`H264Depacketizer::push`]
/// to decide when to eagerly catch `expected_seq` up to an inbound packet
/// instead of waiting indefinitely for a range that's gone for good.
fn looks_like_loss(expected: u16, observed: u16) -> bool {
    seq_after(observed, expected) && observed.wrapping_sub(expected) >= LARGE_GAP_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 12 + payload.len()];
        buf[0] = 0x80;
        buf[1] = ((marker as u8) << 7) | 96;
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        buf[8..12].copy_from_slice(&0xaabb_ccddu32.to_be_bytes());
        buf[12..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn single_nalu_passthrough() {
        let mut dep = H264Depacketizer::new();
        let payload = [0x67, 1, 2, 3]; // nal_type 7 (SPS)
        let nals = dep.push(&rtp_packet(1, 1000, true, &payload));
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].data, [0, 0, 0, 1, 0x67, 1, 2, 3]);
    }

    #[test]
    fn fu_a_reassembles_across_fragments() {
        let mut dep = H264Depacketizer::new();
        // Original NAL type 5 (IDR), NRI bits 0b01 -> fu_indicator = 0x60 | 28
        let fu_indicator = 0x60 | 28;
        let start_header = 0x80 | 5;
        let mid_header = 5;
        let end_header = 0x40 | 5;

        let mut frag1 = vec![fu_indicator, start_header];
        frag1.extend_from_slice(&[0xAA, 0xBB]);
        let mut frag2 = vec![fu_indicator, mid_header];
        frag2.extend_from_slice(&[0xCC, 0xDD]);
        let mut frag3 = vec![fu_indicator, end_header];
        frag3.extend_from_slice(&[0xEE]);

        assert!(dep.push(&rtp_packet(10, 5000, false, &frag1)).is_empty());
        assert!(dep.push(&rtp_packet(11, 5000, false, &frag2)).is_empty());
        let nals = dep.push(&rtp_packet(12, 5000, true, &frag3));

        assert_eq!(nals.len(), 1);
        assert_eq!(
            nals[0].data,
            vec![0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]
        );
    }

    #[test]
    fn fu_a_intermediate_without_start_is_discarded() {
        let mut dep = H264Depacketizer::new();
        let fu_indicator = 0x60 | 28;
        let mid_header = 5; // neither start nor end
        let mut frag = vec![fu_indicator, mid_header];
        frag.extend_from_slice(&[1, 2, 3]);

        let nals = dep.push(&rtp_packet(1, 1000, false, &frag));
        assert!(nals.is_empty());
        assert!(!dep.assembling);
    }

    #[test]
    fn fu_a_timestamp_mismatch_discards_in_progress_assembly() {
        let mut dep = H264Depacketizer::new();
        let fu_indicator = 0x60 | 28;
        let start = vec![fu_indicator, 0x80 | 5, 1, 2];
        let other_ts_mid = vec![fu_indicator, 5, 3, 4];

        assert!(dep.push(&rtp_packet(1, 1000, false, &start)).is_empty());
        let nals = dep.push(&rtp_packet(2, 2000, false, &other_ts_mid));
        assert!(nals.is_empty());
        assert!(!dep.assembling);
    }

    #[test]
    fn stap_a_splits_aggregated_units() {
        let mut dep = H264Depacketizer::new();
        let sps = [0x67, 1, 2];
        let pps = [0x68, 3, 4];
        let mut payload = vec![24]; // STAP-A NAL header
        payload.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        payload.extend_from_slice(&sps);
        payload.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        payload.extend_from_slice(&pps);

        let nals = dep.push(&rtp_packet(1, 1000, true, &payload));
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].data, [0, 0, 0, 1, 0x67, 1, 2]);
        assert_eq!(nals[1].data, [0, 0, 0, 1, 0x68, 3, 4]);
    }

    #[test]
    fn out_of_order_packets_reorder_before_emitting() {
        let mut dep = H264Depacketizer::new();
        let a = dep.push(&rtp_packet(2, 2000, true, &[0x67]));
        assert!(a.is_empty(), "seq 2 held back waiting for seq 1");
        let b = dep.push(&rtp_packet(1, 1000, true, &[0x68]));
        assert_eq!(b.len(), 2, "seq 1 arriving drains 1 then 2");
        assert_eq!(b[0].timestamp, 1000);
        assert_eq!(b[1].timestamp, 2000);
    }

    #[test]
    fn duplicate_sequence_dropped() {
        let mut dep = H264Depacketizer::new();
        dep.push(&rtp_packet(1, 1000, true, &[0x67]));
        let nals = dep.push(&rtp_packet(1, 1000, true, &[0x67]));
        assert!(nals.is_empty());
    }

    #[test]
    fn duplicate_of_already_drained_sequence_is_never_replayed() {
        let mut dep = H264Depacketizer::new();
        assert_eq!(dep.push(&rtp_packet(100, 9000, true, &[0x67])).len(), 1);
        // seq 100 is long gone from `reorder` by now; a late duplicate must
        // still be dropped rather than silently re-buffered.
        assert!(dep.push(&rtp_packet(100, 9000, true, &[0x67])).is_empty());

        // Push enough new packets to cycle the buffer well past capacity;
        // if the duplicate had been re-buffered it would resurface here as
        // a second emission for timestamp 9000.
        let mut count_9000 = 0;
        for seq in 101..=(101 + MAX_REORDER_BUFFER as u16 + 5) {
            for nal in dep.push(&rtp_packet(seq, seq as u32 * 10, true, &[0x67])) {
                if nal.timestamp == 9000 {
                    count_9000 += 1;
                }
            }
        }
        assert!(count_9000 <= 1, "duplicate must not be replayed after buffer churn");
    }

    #[test]
    fn large_gap_catches_up_past_missing_packets() {
        // Reproduces the scenario verbatim: after delivering seq 100, feed
        // 100, 165, 166, 167. The duplicate 100 is dropped, and 165..167 are
        // delivered via eager catch-up despite the missing 101..164 — the
        // gap (64) is far too narrow to ever trip the count-based overflow
        // eviction (it would need 65 buffered entries), so without the
        // sequence-gap catch-up the stream would stall forever waiting for
        // seq 101.
        let mut dep = H264Depacketizer::new();
        assert_eq!(dep.push(&rtp_packet(100, 100_000, true, &[0x67])).len(), 1);

        assert!(
            dep.push(&rtp_packet(100, 100_000, true, &[0x67])).is_empty(),
            "duplicate of already-delivered seq 100 dropped"
        );

        let mut delivered = Vec::new();
        delivered.extend(dep.push(&rtp_packet(165, 165_000, true, &[0x67])));
        delivered.extend(dep.push(&rtp_packet(166, 166_000, true, &[0x67])));
        delivered.extend(dep.push(&rtp_packet(167, 167_000, true, &[0x67])));

        assert_eq!(delivered.len(), 3, "165..167 delivered despite missing 101..164");
        assert_eq!(delivered[0].timestamp, 165_000);
        assert_eq!(delivered[1].timestamp, 166_000);
        assert_eq!(delivered[2].timestamp, 167_000);
    }

    #[test]
    fn reorder_buffer_overflow_force_drains_oldest() {
        let mut dep = H264Depacketizer::new();
        // Hold back seq 0 implicitly by never sending it; fill the buffer
        // past capacity with seq 1..=MAX_REORDER_BUFFER+1 so the oldest
        // (seq 1) is force-drained once the buffer exceeds capacity.
        let mut drained_any = false;
        for seq in 1..=(MAX_REORDER_BUFFER as u16 + 1) {
            let nals = dep.push(&rtp_packet(seq, seq as u32, true, &[0x67]));
            if !nals.is_empty() {
                drained_any = true;
            }
        }
        assert!(drained_any, "overflow must force-drain the oldest packet");
    }
}
