//! Reliable-UDP ARQ endpoint (§4.4): a compact KCP-shaped selective-repeat
//! protocol, message-oriented, running over a caller-owned UDP socket.
//!
//! The wire format and tunables ([`Config::DEFAULT`]) are grounded in
//! `examples/original_source/media/MonitorServer.cc`'s `kcp_init` —
//! `ikcp_nodelay(kcp, 1, 10, 2, 0)`, `ikcp_wndsize(kcp, 128, 128)`,
//! `ikcp_setmtu(kcp, 1450)` — translated to parameter names matching the
//! public contract in spec.md §4.4. The reference `ikcp` C implementation
//! itself is not part of the retrieved source (only the thin wrapper in
//! `camera/kcp.c`/`car_detect_qt/kcphandler.cpp` is), so the ARQ state
//! machine below is an original implementation of the publicly documented
//! KCP protocol shape, not a line-for-line port.
//!
//! This module never touches a socket directly: the owner feeds received
//! datagrams in via [`Endpoint::input`] and the endpoint calls back into an
//! `output` closure to transmit, matching `kcp_output`'s
//! `udp_send(socket, buf, len)` indirection (here, a real Rust socket
//! handle rather than a raw `void *user` pointer).

pub mod segment;

use std::collections::{BTreeMap, VecDeque};
use std::io;

use segment::{CMD_ACK, CMD_PUSH, HEADER_LEN, Segment};

/// Tunables. [`Config::default`] matches the spec's required defaults
/// exactly and should not be changed per-flow; it exists as a struct (not
/// bare constants) so tests can exercise smaller windows without waiting on
/// real wall-clock timing.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub mtu: usize,
    pub send_window: u32,
    pub recv_window: u32,
    pub interval_ms: u32,
    pub fast_resend: u32,
    /// `false` disables the exponential RTO backoff applied on repeated
    /// timeouts of the same segment — "no congestion backoff" per spec.md
    /// §4.4 (the original's literal `ikcp_nodelay(.., nc=0)` call leaves
    /// congestion shaping on; this implementation instead follows spec.md's
    /// explicit requirement, recorded in DESIGN.md).
    pub congestion_backoff: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: 1450,
            send_window: 128,
            recv_window: 128,
            interval_ms: 10,
            fast_resend: 2,
            congestion_backoff: false,
        }
    }
}

struct SendSeg {
    sn: u32,
    frg: u8,
    data: Vec<u8>,
    xmit: u32,
    rto: u32,
    resend_at: u32,
    fastack: u32,
    /// Timestamp of this segment's first transmission, fixed across
    /// retransmits so `on_ack` can sample a real RTT via Karn's algorithm.
    send_ts: u32,
}

struct RecvSeg {
    sn: u32,
    frg: u8,
    data: Vec<u8>,
}

/// One reliable-UDP flow, keyed by `conv` on the shared socket it runs over.
pub struct Endpoint {
    conv: u32,
    cfg: Config,
    output: Box<dyn FnMut(&[u8]) -> io::Result<()> + Send>,

    send_backlog: VecDeque<(u8, Vec<u8>)>,
    snd_buf: VecDeque<SendSeg>,
    snd_nxt: u32,
    snd_una: u32,

    rcv_buf: BTreeMap<u32, RecvSeg>,
    rcv_queue: VecDeque<RecvSeg>,
    rcv_nxt: u32,

    pending_acks: Vec<(u32, u32)>, // (sn, ts) to acknowledge
    remote_wnd: u32,

    srtt: i32,
    rttvar: i32,
    rto: u32,

    current_ms: u32,
    last_input_ms: u32,
    /// User-level backlog ceiling (§4.4 failure semantics: "implementations
    /// SHOULD impose a ceiling and drop oldest"). Measured in whole
    /// messages, not bytes.
    backlog_ceiling: usize,
}

const INITIAL_RTO: u32 = 200;
const MIN_RTO: u32 = 30;
const MAX_RTO: u32 = 60_000;
const DEAD_PEER_THRESHOLD_MS: u32 = 30_000;

impl Endpoint {
    /// `new(conv, peer_endpoint, udp_send_fn) -> Endpoint` per the public
    /// contract. `peer_endpoint` is folded into `output` by the caller
    /// (typically `move |buf| socket.send_to(buf, peer)`), so the endpoint
    /// itself stays transport-agnostic.
    pub fn new(conv: u32, output: impl FnMut(&[u8]) -> io::Result<()> + Send + 'static) -> Self {
        Self::with_config(conv, Config::default(), output)
    }

    pub fn with_config(
        conv: u32,
        cfg: Config,
        output: impl FnMut(&[u8]) -> io::Result<()> + Send + 'static,
    ) -> Self {
        Self {
            conv,
            cfg,
            output: Box::new(output),
            send_backlog: VecDeque::new(),
            snd_buf: VecDeque::new(),
            snd_nxt: 0,
            snd_una: 0,
            rcv_buf: BTreeMap::new(),
            rcv_queue: VecDeque::new(),
            rcv_nxt: 0,
            pending_acks: Vec::new(),
            remote_wnd: cfg.recv_window,
            srtt: 0,
            rttvar: 0,
            rto: INITIAL_RTO,
            current_ms: 0,
            last_input_ms: 0,
            backlog_ceiling: 256,
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    fn mss(&self) -> usize {
        self.cfg.mtu - HEADER_LEN
    }

    /// Enqueue a user message; fragmented internally if larger than one
    /// segment's worth of MSS. Returns immediately — actual transmission
    /// happens on the next `update`.
    pub fn send(&mut self, data: &[u8]) {
        let mss = self.mss();
        let frag_count = data.len().div_ceil(mss).max(1);
        if frag_count > 256 {
            tracing::warn!(conv = self.conv, len = data.len(), "message too large to fragment, dropped");
            return;
        }
        if self.send_backlog.len() >= self.backlog_ceiling {
            tracing::warn!(conv = self.conv, "send backlog at ceiling, dropping oldest message");
            self.send_backlog.pop_front();
        }
        for i in 0..frag_count {
            let start = i * mss;
            let end = (start + mss).min(data.len());
            let frg = (frag_count - 1 - i) as u8;
            self.send_backlog.push_back((frg, data[start..end].to_vec()));
        }
    }

    /// Feed one received UDP datagram (possibly several segments packed
    /// back to back).
    pub fn input(&mut self, mut buf: &[u8]) {
        self.last_input_ms = self.current_ms;
        while let Some((seg, consumed)) = Segment::decode(buf) {
            if seg.conv != self.conv {
                tracing::warn!(expected = self.conv, got = seg.conv, "conv mismatch, segment dropped");
                break;
            }
            self.remote_wnd = seg.wnd as u32;
            self.ack_una(seg.una);

            match seg.cmd {
                CMD_ACK => self.on_ack(seg.sn),
                CMD_PUSH => self.on_push(seg),
                other => tracing::debug!(cmd = other, "unknown ARQ command ignored"),
            }

            buf = &buf[consumed..];
        }
    }

    fn ack_una(&mut self, una: u32) {
        if seq_gt(una, self.snd_una) {
            self.snd_una = una;
        }
        self.snd_buf.retain(|s| !seq_lt(s.sn, self.snd_una));
    }

    fn on_ack(&mut self, sn: u32) {
        let mut acked = None; // (rtt, xmit) of the segment this ack satisfies
        let before_len = self.snd_buf.len();
        let now = self.current_ms;
        self.snd_buf.retain(|s| {
            if s.sn == sn {
                acked = Some((now.wrapping_sub(s.send_ts), s.xmit));
                false
            } else {
                true
            }
        });
        if self.snd_buf.len() < before_len {
            // Duplicate-ACK counting for fast resend: every still-outstanding
            // segment older than the one just acked gets a fastack bump.
            for s in self.snd_buf.iter_mut() {
                if seq_lt(s.sn, sn) {
                    s.fastack += 1;
                }
            }
        }
        // Karn's algorithm: only sample RTT from a segment acked on its
        // first transmission, so a retransmit's ack can't be mistaken for
        // the original send's round-trip time.
        if let Some((rtt, 1)) = acked {
            self.update_rtt(rtt);
        }
    }

    /// Jacobson/Karels smoothing of `srtt`/`rttvar`, deriving `rto` the same
    /// way `ikcp_update_ack` does (srtt + max(interval, 4*rttvar), clamped).
    fn update_rtt(&mut self, rtt: u32) {
        let rtt = rtt as i32;
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
        } else {
            let delta = (rtt - self.srtt).abs();
            self.rttvar = (3 * self.rttvar + delta) / 4;
            self.srtt = (7 * self.srtt + rtt) / 8;
            if self.srtt < 1 {
                self.srtt = 1;
            }
        }
        let rto = self.srtt + (self.cfg.interval_ms as i32).max(4 * self.rttvar);
        self.rto = (rto.max(0) as u32).clamp(MIN_RTO, MAX_RTO);
    }

    fn on_push(&mut self, seg: Segment) {
        self.pending_acks.push((seg.sn, seg.ts));

        let window_hi = self.rcv_nxt.wrapping_add(self.cfg.recv_window);
        if seq_lt(seg.sn, self.rcv_nxt) || !seq_lt(seg.sn, window_hi) {
            return; // out of window: duplicate or beyond capacity, ack-only
        }
        self.rcv_buf.entry(seg.sn).or_insert(RecvSeg {
            sn: seg.sn,
            frg: seg.frg,
            data: seg.data,
        });

        while let Some(next) = self.rcv_buf.remove(&self.rcv_nxt) {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.rcv_queue.push_back(next);
        }
    }

    /// Returns the next complete, reassembled user message if one is ready.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        let first_frg = self.rcv_queue.front()?.frg;
        let needed = first_frg as usize + 1;
        if self.rcv_queue.len() < needed {
            return None;
        }
        let mut message = Vec::new();
        for _ in 0..needed {
            let seg = self.rcv_queue.pop_front().unwrap();
            message.extend_from_slice(&seg.data);
        }
        Some(message)
    }

    /// Drives retransmissions, window admission, and ACK emission. MUST be
    /// called at least every `interval_ms` (10 ms at the default config)
    /// while the flow is active.
    pub fn update(&mut self, now_ms: u32) {
        self.current_ms = now_ms;
        self.admit_from_backlog(now_ms);
        self.flush_acks(now_ms);
        self.retransmit_due(now_ms);
    }

    fn admit_from_backlog(&mut self, now_ms: u32) {
        let window = self.cfg.send_window.min(self.remote_wnd.max(1));
        while !self.send_backlog.is_empty() && self.snd_buf.len() < window as usize {
            let (frg, data) = self.send_backlog.pop_front().unwrap();
            let sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(SendSeg {
                sn,
                frg,
                data,
                xmit: 0,
                rto: self.rto,
                resend_at: now_ms,
                fastack: 0,
                send_ts: now_ms,
            });
        }
    }

    fn retransmit_due(&mut self, now_ms: u32) {
        let wnd_avail = (self.cfg.recv_window as usize)
            .saturating_sub(self.rcv_buf.len())
            .min(u16::MAX as usize) as u16;
        let una = self.rcv_nxt;
        let conv = self.conv;

        for seg in self.snd_buf.iter_mut() {
            let due = seg.xmit == 0 || now_ms >= seg.resend_at || seg.fastack >= 2;
            if !due {
                continue;
            }
            let wire = Segment {
                conv,
                cmd: CMD_PUSH,
                frg: seg.frg,
                wnd: wnd_avail,
                ts: now_ms,
                sn: seg.sn,
                una,
                data: seg.data.clone(),
            };
            let mut buf = Vec::with_capacity(wire.encoded_len());
            wire.encode_into(&mut buf);
            if let Err(err) = (self.output)(&buf) {
                tracing::debug!(conv, %err, "ARQ segment send failed");
            }
            seg.xmit += 1;
            seg.fastack = 0;
            let backoff = if self.cfg.congestion_backoff { seg.xmit.min(5) } else { 1 };
            seg.rto = (self.rto * backoff).max(MIN_RTO);
            seg.resend_at = now_ms + seg.rto;
        }
    }

    fn flush_acks(&mut self, now_ms: u32) {
        if self.pending_acks.is_empty() {
            return;
        }
        let conv = self.conv;
        let una = self.rcv_nxt;
        let wnd_avail = (self.cfg.recv_window as usize)
            .saturating_sub(self.rcv_buf.len())
            .min(u16::MAX as usize) as u16;
        for (sn, _ts) in std::mem::take(&mut self.pending_acks) {
            let wire = Segment {
                conv,
                cmd: CMD_ACK,
                frg: 0,
                wnd: wnd_avail,
                ts: now_ms,
                sn,
                una,
                data: Vec::new(),
            };
            let mut buf = Vec::with_capacity(wire.encoded_len());
            wire.encode_into(&mut buf);
            if let Err(err) = (self.output)(&buf) {
                tracing::debug!(conv, %err, "ARQ ack send failed");
            }
        }
    }

    /// Earliest time at which `update` will have outstanding work, so an
    /// event loop can size its wait instead of always polling at a fixed
    /// cadence.
    pub fn check(&self, now_ms: u32) -> u32 {
        if !self.send_backlog.is_empty() || !self.pending_acks.is_empty() {
            return now_ms;
        }
        self.snd_buf
            .iter()
            .map(|s| s.resend_at)
            .min()
            .unwrap_or(now_ms + self.cfg.interval_ms)
    }

    /// `true` once `now_ms - last_input` exceeds the dead-peer threshold —
    /// the owning component (MonitorServer) tears the flow down when this
    /// fires, per §4.4's failure semantics.
    pub fn is_dead_peer(&self, now_ms: u32) -> bool {
        self.last_input_ms != 0 && now_ms.wrapping_sub(self.last_input_ms) > DEAD_PEER_THRESHOLD_MS
    }
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn linked_pair() -> (Endpoint, Endpoint, Arc<Mutex<VecDeque<Vec<u8>>>>, Arc<Mutex<VecDeque<Vec<u8>>>>) {
        let a_to_b = Arc::new(Mutex::new(VecDeque::new()));
        let b_to_a = Arc::new(Mutex::new(VecDeque::new()));

        let a_out = a_to_b.clone();
        let a = Endpoint::new(777, move |buf: &[u8]| {
            a_out.lock().unwrap().push_back(buf.to_vec());
            Ok(())
        });
        let b_out = b_to_a.clone();
        let b = Endpoint::new(777, move |buf: &[u8]| {
            b_out.lock().unwrap().push_back(buf.to_vec());
            Ok(())
        });
        (a, b, a_to_b, b_to_a)
    }

    fn pump(a: &mut Endpoint, b: &mut Endpoint, a_to_b: &Arc<Mutex<VecDeque<Vec<u8>>>>, b_to_a: &Arc<Mutex<VecDeque<Vec<u8>>>>, rounds: u32) {
        let mut now = 0u32;
        for _ in 0..rounds {
            now += 10;
            a.update(now);
            b.update(now);
            for pkt in a_to_b.lock().unwrap().drain(..) {
                b.input(&pkt);
            }
            for pkt in b_to_a.lock().unwrap().drain(..) {
                a.input(&pkt);
            }
        }
    }

    #[test]
    fn delivers_small_message() {
        let (mut a, mut b, a_to_b, b_to_a) = linked_pair();
        a.send(b"hello reliable world");
        pump(&mut a, &mut b, &a_to_b, &b_to_a, 5);

        let msg = b.recv().expect("message should be delivered");
        assert_eq!(msg, b"hello reliable world");
    }

    #[test]
    fn reassembles_fragmented_message() {
        let (mut a, mut b, a_to_b, b_to_a) = linked_pair();
        let cfg = Config { mtu: 24 + 10, ..Config::default() }; // mss = 10 bytes/segment
        a = Endpoint::with_config(777, cfg, {
            let out = a_to_b.clone();
            move |buf: &[u8]| {
                out.lock().unwrap().push_back(buf.to_vec());
                Ok(())
            }
        });
        let payload = vec![0xABu8; 35]; // spans 4 fragments at mss=10
        a.send(&payload);
        pump(&mut a, &mut b, &a_to_b, &b_to_a, 10);

        let msg = b.recv().expect("fragmented message should reassemble");
        assert_eq!(msg, payload);
    }

    #[test]
    fn retransmits_when_ack_is_lost() {
        let (mut a, mut b, a_to_b, b_to_a) = linked_pair();
        a.send(b"retransmit me");

        // First round: a sends, but drop the datagram before b ever sees it
        a.update(10);
        a_to_b.lock().unwrap().clear();

        // Advance far enough that the RTO fires and a retransmits.
        a.update(10 + INITIAL_RTO + 10);
        assert!(!a_to_b.lock().unwrap().is_empty(), "segment should have been retransmitted");

        pump(&mut a, &mut b, &a_to_b, &b_to_a, 5);
        assert_eq!(b.recv().unwrap(), b"retransmit me");
    }

    #[test]
    fn dead_peer_detection() {
        let (mut a, _b, _a_to_b, _b_to_a) = linked_pair();
        a.input(&{
            let seg = Segment { conv: 777, cmd: CMD_ACK, frg: 0, wnd: 128, ts: 0, sn: 0, una: 0, data: vec![] };
            let mut buf = Vec::new();
            seg.encode_into(&mut buf);
            buf
        });
        assert!(!a.is_dead_peer(1000));
        assert!(a.is_dead_peer(1 + DEAD_PEER_THRESHOLD_MS + 1));
    }
}
