//! The ARQ protocol engine.
//!
//! [`KcpEngine`] is a pure state machine: user payloads go in through
//! [`send`](KcpEngine::send), inbound datagrams through
//! [`input`](KcpEngine::input), reassembled messages come out through
//! [`recv`](KcpEngine::recv), and [`flush`](KcpEngine::flush) drives every
//! wire-side action through the caller-supplied output sink. The owner is
//! responsible for serializing calls and for scheduling flushes; nothing in
//! here blocks or spawns.

use crate::buffer_pool;
use crate::config::KcpConfig;
use crate::congestion::{default_congestion, CongestionControl};
use crate::error::{KcpError, Result};
use crate::protocol::constants::*;
use crate::protocol::{current_ms, time_diff, KcpHeader, Segment, SeqNum, Timestamp};
use crate::rate::DeliveryRate;
use crate::snmp::SNMP;

use bytes::BytesMut;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

/// Sink for outbound datagrams.
///
/// Called synchronously from [`KcpEngine::flush`] with one encoded datagram.
/// The first `reserved` bytes of the slice are caller-owned framing space;
/// the engine never touches them. The engine reuses the buffer immediately
/// after the call returns, so the sink must copy or transmit before then.
pub type OutputFn = Box<dyn FnMut(&[u8]) + Send>;

/// Monotonic millisecond clock. Engines default to a process-epoch clock;
/// tests substitute a manually advanced one.
pub type ClockFn = Box<dyn Fn() -> Timestamp + Send + Sync>;

/// Extra grace added to the very first transmission deadline of a segment.
/// Retransmissions get no slack.
const RTO_SLACK: u32 = 500;

/// Idle flushes before the congestion machinery cold-restarts.
const QUIESCENT_MAX: i32 = 200;

/// Smoothed RTT state, RFC 6298 flavoured.
#[derive(Debug)]
struct RttState {
    srtt: i32,
    rttvar: i32,
    rto: u32,
    minrto: u32,
}

impl RttState {
    fn update(&mut self, rtt: i32, interval: u32) {
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttvar = rtt >> 1;
        } else {
            let mut delta = rtt - self.srtt;
            self.srtt += delta >> 3;
            if delta < 0 {
                delta = -delta;
            }
            if rtt < self.srtt - self.rttvar {
                // sample below the expected floor gets 8x reduced weight
                self.rttvar += (delta - self.rttvar) >> 5;
            } else {
                self.rttvar += (delta - self.rttvar) >> 2;
            }
        }
        let rto = (self.srtt as u32).wrapping_add(interval.max((self.rttvar as u32) << 2));
        self.rto = rto.clamp(self.minrto, IKCP_RTO_MAX);
    }
}

/// Pipe-filling probe state for the LOL controller.
#[derive(Debug, Default)]
struct LolState {
    filled_pipe: bool,
    full_bw_count: u32,
    full_bw: f64,
    last_fill_time: Timestamp,
    gain: f64,
}

/// Diagnostic snapshot of one engine's internal state.
#[derive(Debug, Clone, Copy)]
pub struct KcpStats {
    pub srtt: i32,
    pub rttvar: i32,
    pub rto: u32,
    pub min_rtt: f64,
    pub avg_ack_rate: f64,
    pub max_ack_rate: f64,
    pub delivered: f64,
    pub cwnd: f64,
    pub ssthresh: u32,
    pub wmax: f64,
    pub snd_wnd: u32,
    pub rcv_wnd: u32,
    pub rmt_wnd: u32,
    pub snd_una: SeqNum,
    pub snd_nxt: SeqNum,
    pub rcv_nxt: SeqNum,
    pub trans: u64,
    pub retrans: u64,
    pub filled_pipe: bool,
    pub quiescent: i32,
    pub nodelay: bool,
    pub wait_snd: usize,
}

/// Reliable-ARQ state machine for one conversation.
pub struct KcpEngine {
    conv: u32,
    mtu: u32,
    mss: u32,

    snd_una: SeqNum,
    snd_nxt: SeqNum,
    rcv_nxt: SeqNum,

    ssthresh: u32,
    rtt: RttState,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    probe: u32,

    cwnd: f64,
    wmax: f64,

    interval: u32,
    ts_flush: Timestamp,
    updated: bool,
    ts_probe: Timestamp,
    probe_wait: u32,

    is_dead: bool,

    trans: u64,
    retrans: u64,

    dre: DeliveryRate,
    lol: LolState,
    cc: CongestionControl,

    fastresend: u32,
    nodelay: bool,
    nocwnd: bool,
    stream: bool,

    snd_queue: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,

    acklist: Vec<(SeqNum, Timestamp)>,

    buffer: BytesMut,
    reserved: usize,
    output: OutputFn,
    clock: ClockFn,

    quiescent: i32,
}

impl KcpEngine {
    /// Create an engine with protocol defaults.
    ///
    /// `conv` must match on both peers or datagrams are rejected. `output`
    /// is invoked from within [`flush`](Self::flush) for every outbound
    /// datagram.
    pub fn new(conv: u32, output: OutputFn) -> Self {
        Self {
            conv,
            mtu: IKCP_MTU_DEF,
            mss: IKCP_MTU_DEF - IKCP_OVERHEAD,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: IKCP_THRESH_INIT,
            rtt: RttState {
                srtt: 0,
                rttvar: 0,
                rto: IKCP_RTO_DEF,
                minrto: IKCP_RTO_MIN,
            },
            snd_wnd: IKCP_WND_SND,
            rcv_wnd: IKCP_WND_RCV,
            rmt_wnd: IKCP_WND_RCV,
            probe: 0,
            cwnd: 0.0,
            wmax: (1u64 << 30) as f64,
            interval: IKCP_INTERVAL,
            ts_flush: IKCP_INTERVAL,
            updated: false,
            ts_probe: 0,
            probe_wait: 0,
            is_dead: false,
            trans: 0,
            retrans: 0,
            dre: DeliveryRate::default(),
            lol: LolState::default(),
            cc: default_congestion(),
            fastresend: 0,
            nodelay: false,
            nocwnd: false,
            stream: false,
            snd_queue: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buffer: BytesMut::with_capacity(IKCP_MTU_DEF as usize),
            reserved: 0,
            output,
            clock: Box::new(current_ms),
            quiescent: QUIESCENT_MAX,
        }
    }

    /// Create an engine and apply `config` in one step.
    pub fn with_config(conv: u32, config: &KcpConfig, output: OutputFn) -> Result<Self> {
        let mut kcp = Self::new(conv, output);
        kcp.set_mtu(config.mtu)?;
        kcp.reserve_bytes(config.reserved)?;
        kcp.wnd_size(config.snd_wnd, config.rcv_wnd);
        kcp.set_nodelay(
            config.nodelay.nodelay,
            config.nodelay.interval,
            config.nodelay.resend,
            config.nodelay.nocwnd,
        );
        kcp.stream = config.stream;
        kcp.cc = config.congestion;
        Ok(kcp)
    }

    /// Replace the engine's clock. Intended for tests driving virtual time.
    pub fn set_clock(&mut self, clock: ClockFn) {
        self.clock = clock;
    }

    /// Conversation id this engine was built with.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Current maximum segment payload size.
    pub fn mss(&self) -> u32 {
        self.mss
    }

    /// True once a segment's retransmission timeout has exceeded the
    /// protocol maximum; the conversation should be torn down.
    pub fn is_dead(&self) -> bool {
        self.is_dead
    }

    /// Segments queued plus in flight, for backpressure decisions.
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// Diagnostic snapshot of the engine's timers, windows, and rate state.
    pub fn stats(&self) -> KcpStats {
        KcpStats {
            srtt: self.rtt.srtt,
            rttvar: self.rtt.rttvar,
            rto: self.rtt.rto,
            min_rtt: self.dre.min_rtt,
            avg_ack_rate: self.dre.avg_ack_rate,
            max_ack_rate: self.dre.max_ack_rate,
            delivered: self.dre.delivered,
            cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            wmax: self.wmax,
            snd_wnd: self.snd_wnd,
            rcv_wnd: self.rcv_wnd,
            rmt_wnd: self.rmt_wnd,
            snd_una: self.snd_una,
            snd_nxt: self.snd_nxt,
            rcv_nxt: self.rcv_nxt,
            trans: self.trans,
            retrans: self.retrans,
            filled_pipe: self.lol.filled_pipe,
            quiescent: self.quiescent,
            nodelay: self.nodelay,
            wait_snd: self.wait_snd(),
        }
    }

    // ------------------------------------------------------------------
    // configuration knobs
    // ------------------------------------------------------------------

    /// Change the MTU. Requires `mtu >= 50` and `mtu > 24`; the current
    /// reserved-byte setting must still fit.
    pub fn set_mtu(&mut self, mtu: u32) -> Result<()> {
        if mtu < 50 || mtu <= IKCP_OVERHEAD {
            return Err(KcpError::InvalidConfig("mtu below minimum"));
        }
        if self.reserved >= (mtu - IKCP_OVERHEAD) as usize {
            return Err(KcpError::InvalidConfig("reserved bytes exceed mtu"));
        }
        self.mtu = mtu;
        self.mss = mtu - IKCP_OVERHEAD - self.reserved as u32;
        self.buffer = BytesMut::with_capacity(mtu as usize);
        Ok(())
    }

    /// Keep `n` bytes at the head of every outbound datagram untouched for
    /// an outer framing layer. Fails if `n >= mtu - 24`.
    pub fn reserve_bytes(&mut self, n: usize) -> Result<()> {
        if n >= (self.mtu - IKCP_OVERHEAD) as usize {
            return Err(KcpError::InvalidConfig("reserved bytes exceed mtu"));
        }
        self.reserved = n;
        self.mss = self.mtu - IKCP_OVERHEAD - n as u32;
        Ok(())
    }

    /// Tune the latency profile: `nodelay` lowers the RTO floor to 30 ms,
    /// `interval` is the flush period clamped to [10, 5000] ms, `resend`
    /// is the fast-retransmit duplicate-ack threshold (0 disables), and
    /// `nocwnd` turns off congestion-window gating.
    pub fn set_nodelay(&mut self, nodelay: bool, interval: u32, resend: u32, nocwnd: bool) {
        self.nodelay = nodelay;
        self.rtt.minrto = if nodelay { IKCP_RTO_NDL } else { IKCP_RTO_MIN };
        self.interval = interval.clamp(10, 5000);
        self.fastresend = resend;
        self.nocwnd = nocwnd;
    }

    /// Set the local send and receive windows in segments; zero leaves the
    /// corresponding window unchanged.
    pub fn wnd_size(&mut self, snd_wnd: u32, rcv_wnd: u32) {
        if snd_wnd > 0 {
            self.snd_wnd = snd_wnd;
        }
        if rcv_wnd > 0 {
            self.rcv_wnd = rcv_wnd;
        }
    }

    /// Switch between message mode (boundaries preserved via fragment
    /// counters) and byte-stream mode (tail segments packed).
    pub fn set_stream(&mut self, stream: bool) {
        self.stream = stream;
    }

    /// Select the congestion controller for this engine.
    pub fn set_congestion(&mut self, cc: CongestionControl) {
        self.cc = cc;
    }

    // ------------------------------------------------------------------
    // send path
    // ------------------------------------------------------------------

    /// Queue a payload for transmission.
    ///
    /// In message mode the payload is fragmented into at most 255 segments
    /// and reassembled as one unit on the peer. In stream mode bytes are
    /// packed onto the tail of the previous pending segment first.
    pub fn send(&mut self, mut payload: &[u8]) -> Result<()> {
        self.quiescent = QUIESCENT_MAX;
        if payload.is_empty() {
            return Err(KcpError::EmptyPayload);
        }

        let mss = self.mss as usize;

        if self.stream {
            if let Some(last) = self.snd_queue.back_mut() {
                if last.data.len() < mss {
                    let room = mss - last.data.len();
                    let extend = room.min(payload.len());
                    last.data.extend_from_slice(&payload[..extend]);
                    last.header.len = last.data.len() as u32;
                    payload = &payload[extend..];
                }
            }
            if payload.is_empty() {
                return Ok(());
            }
        }

        let count = if payload.len() <= mss {
            1
        } else {
            payload.len().div_ceil(mss)
        };
        if count > 255 {
            return Err(KcpError::OversizedMessage { fragments: count });
        }

        let total = payload.len();
        for i in 0..count {
            let size = payload.len().min(mss);
            let mut data = buffer_pool::take();
            data.extend_from_slice(&payload[..size]);

            let mut header = KcpHeader::new(self.conv, IKCP_CMD_PUSH);
            header.len = size as u32;
            header.frg = if self.stream { 0 } else { (count - i - 1) as u8 };

            self.snd_queue.push_back(Segment::new(header, data));
            payload = &payload[size..];
        }

        trace!(
            conv = self.conv,
            bytes = total,
            fragments = count,
            "queued for send"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // receive path
    // ------------------------------------------------------------------

    /// Size of the next complete message, or `None` if none is ready.
    pub fn peek_size(&self) -> Option<usize> {
        let seg = self.rcv_queue.front()?;
        if seg.header.frg == 0 {
            return Some(seg.data.len());
        }
        if self.rcv_queue.len() < seg.header.frg as usize + 1 {
            return None;
        }

        let mut length = 0;
        for seg in &self.rcv_queue {
            length += seg.data.len();
            if seg.header.frg == 0 {
                break;
            }
        }
        Some(length)
    }

    /// Copy the next complete message into `buffer`, returning the number
    /// of bytes written. Fails without touching state when nothing is ready
    /// or the buffer is smaller than [`peek_size`](Self::peek_size).
    pub fn recv(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let peek = self.peek_size().ok_or(KcpError::NotReady)?;
        if peek > buffer.len() {
            return Err(KcpError::BufferTooSmall { needed: peek });
        }

        let fast_recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        // merge fragments into the destination, recycling payload slots
        let mut n = 0;
        while let Some(mut seg) = self.rcv_queue.pop_front() {
            buffer[n..n + seg.data.len()].copy_from_slice(&seg.data);
            n += seg.data.len();
            let frg = seg.header.frg;
            buffer_pool::recycle(mem::take(&mut seg.data));
            if frg == 0 {
                break;
            }
        }

        self.drain_rcv_buf();

        // a full window just opened up: tell the peer without waiting to be
        // asked
        if self.rcv_queue.len() < self.rcv_wnd as usize && fast_recover {
            self.probe |= IKCP_ASK_TELL;
        }

        trace!(conv = self.conv, bytes = n, "message delivered");
        Ok(n)
    }

    /// Move contiguous segments out of the reorder buffer while the
    /// delivery queue has window room.
    fn drain_rcv_buf(&mut self) {
        while self
            .rcv_buf
            .front()
            .is_some_and(|seg| {
                seg.header.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize
            })
        {
            if let Some(seg) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    // ------------------------------------------------------------------
    // input path
    // ------------------------------------------------------------------

    /// Feed one inbound datagram (possibly several back-to-back segments)
    /// into the engine.
    ///
    /// `regular` marks datagrams genuinely delivered by the network, as
    /// opposed to ones reconstructed by an outer erasure-coding layer; only
    /// regular datagrams update the remote window and the RTT estimate.
    /// `ack_nodelay` flushes queued ACKs immediately instead of waiting for
    /// the next scheduled flush.
    pub fn input(&mut self, data: &[u8], regular: bool, ack_nodelay: bool) -> Result<()> {
        self.quiescent = QUIESCENT_MAX;
        let prev_una = self.snd_una;
        if data.len() < IKCP_OVERHEAD as usize {
            return Err(KcpError::Truncated);
        }

        let mut latest: Timestamp = 0;
        let mut saw_ack = false;
        let mut in_segs: u64 = 0;
        let mut rest = data;

        while rest.len() >= IKCP_OVERHEAD as usize {
            let Some(hdr) = KcpHeader::decode(&mut rest) else {
                break;
            };
            if hdr.conv != self.conv {
                warn!(
                    conv = self.conv,
                    datagram_conv = hdr.conv,
                    "conversation mismatch"
                );
                return Err(KcpError::ConvMismatch {
                    expected: self.conv,
                    got: hdr.conv,
                });
            }
            let len = hdr.len as usize;
            if rest.len() < len {
                return Err(KcpError::LengthMismatch);
            }
            if !matches!(
                hdr.cmd,
                IKCP_CMD_PUSH | IKCP_CMD_ACK | IKCP_CMD_WASK | IKCP_CMD_WINS
            ) {
                return Err(KcpError::UnknownCommand(hdr.cmd));
            }

            // only regular datagrams carry a trustworthy window update
            if regular {
                self.rmt_wnd = hdr.wnd as u32;
            }
            self.parse_una(hdr.una);
            self.shrink_buf();

            match hdr.cmd {
                IKCP_CMD_ACK => {
                    self.parse_ack(hdr.sn);
                    self.parse_fastack(hdr.sn, hdr.ts);
                    saw_ack = true;
                    latest = hdr.ts;
                }
                IKCP_CMD_PUSH => {
                    let mut repeat = true;
                    if time_diff(hdr.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        // ack everything below the window top, including
                        // duplicates, so the peer's buffer can drain
                        self.ack_push(hdr.sn, hdr.ts);
                        if time_diff(hdr.sn, self.rcv_nxt) >= 0 {
                            repeat = self.parse_data(&hdr, &rest[..len]);
                        }
                    }
                    if regular && repeat {
                        SNMP.repeat_segs.fetch_add(1, Ordering::Relaxed);
                    }
                }
                IKCP_CMD_WASK => {
                    self.probe |= IKCP_ASK_TELL;
                }
                _ => {
                    // IKCP_CMD_WINS: the window was already applied above
                }
            }

            in_segs += 1;
            rest = &rest[len..];
        }
        SNMP.in_segs.fetch_add(in_segs, Ordering::Relaxed);

        // one RTT sample per datagram, from the newest ack it carried
        if saw_ack && regular {
            let current = (self.clock)();
            if time_diff(current, latest) >= 0 {
                self.update_rtt(time_diff(current, latest));
            }
        }

        if !self.nocwnd {
            let acks = time_diff(self.snd_una, prev_una);
            if acks > 0 {
                self.trans += acks as u64;
                match self.cc {
                    CongestionControl::Bic => self.bic_on_ack(acks),
                    CongestionControl::Lol => self.lol_on_ack(acks),
                }
            }
        }

        if ack_nodelay && !self.acklist.is_empty() {
            self.flush(true);
        }
        Ok(())
    }

    /// Drop everything below the peer's cumulative ack point.
    fn parse_una(&mut self, una: SeqNum) {
        let mut count = 0;
        for seg in self.snd_buf.iter_mut() {
            if time_diff(una, seg.header.sn) > 0 {
                let app_limited = self.snd_queue.is_empty();
                let now = (self.clock)();
                self.dre
                    .on_ack(seg.header.sn, seg.data.len(), now, app_limited);
                buffer_pool::recycle(mem::take(&mut seg.data));
                count += 1;
            } else {
                break;
            }
        }
        if count > 0 {
            self.snd_buf.drain(..count);
        }
    }

    /// Mark one segment selectively acknowledged. It stays in the buffer;
    /// removal waits for cumulative una so the segments behind it never
    /// shift. Its payload slot is released right away.
    fn parse_ack(&mut self, sn: SeqNum) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if sn == seg.header.sn {
                seg.acked = true;
                let app_limited = self.snd_queue.is_empty();
                let now = (self.clock)();
                self.dre.on_ack(sn, seg.data.len(), now, app_limited);
                buffer_pool::recycle(mem::take(&mut seg.data));
                break;
            }
            if time_diff(sn, seg.header.sn) < 0 {
                break;
            }
        }
    }

    /// Count this ack against every older in-flight segment that was sent
    /// no later than it, feeding the fast-retransmit trigger.
    fn parse_fastack(&mut self, sn: SeqNum, ts: Timestamp) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if time_diff(sn, seg.header.sn) < 0 {
                break;
            } else if sn != seg.header.sn && time_diff(seg.header.ts, ts) <= 0 {
                seg.fastack += 1;
            }
        }
    }

    fn shrink_buf(&mut self) {
        if let Some(seg) = self.snd_buf.front() {
            self.snd_una = seg.header.sn;
        } else {
            self.snd_una = self.snd_nxt;
        }
    }

    fn ack_push(&mut self, sn: SeqNum, ts: Timestamp) {
        self.quiescent = QUIESCENT_MAX;
        self.acklist.push((sn, ts));
    }

    /// Insert a data segment into the reorder buffer, copying its payload
    /// into a pooled slot only if it is new. Returns true for duplicates.
    fn parse_data(&mut self, hdr: &KcpHeader, payload: &[u8]) -> bool {
        let sn = hdr.sn;
        if time_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0
            || time_diff(sn, self.rcv_nxt) < 0
        {
            return true;
        }

        // reverse scan: arrivals are usually near the tail
        let mut insert_idx = 0;
        let mut repeat = false;
        for i in (0..self.rcv_buf.len()).rev() {
            let seg = &self.rcv_buf[i];
            if seg.header.sn == sn {
                repeat = true;
                break;
            }
            if time_diff(sn, seg.header.sn) > 0 {
                insert_idx = i + 1;
                break;
            }
        }

        if !repeat {
            let mut data = buffer_pool::take();
            data.extend_from_slice(payload);
            let seg = Segment::new(hdr.clone(), data);
            if insert_idx == self.rcv_buf.len() {
                self.rcv_buf.push_back(seg);
            } else {
                self.rcv_buf.insert(insert_idx, seg);
            }
        }

        self.drain_rcv_buf();
        repeat
    }

    fn update_rtt(&mut self, rtt: i32) {
        let now = (self.clock)();
        self.dre.update_min_rtt(rtt, now);
        self.rtt.update(rtt, self.interval);
    }

    fn wnd_unused(&self) -> u16 {
        if self.rcv_queue.len() < self.rcv_wnd as usize {
            (self.rcv_wnd as usize - self.rcv_queue.len()) as u16
        } else {
            0
        }
    }

    // ------------------------------------------------------------------
    // flush
    // ------------------------------------------------------------------

    /// Emit pending ACKs, probes, new data, and retransmissions through the
    /// output sink. With `ack_only` set, stops after the ACKs.
    ///
    /// Returns the caller's next-wake-up hint in ms: the time until the
    /// nearest retransmission deadline, capped at the flush interval.
    pub fn flush(&mut self, ack_only: bool) -> u32 {
        if self.is_dead {
            return self.interval;
        }

        let (minrto, busy) = self.flush_impl(ack_only);

        // a run of do-nothing flushes means the line went cold; restart the
        // pipe estimation from scratch
        if !busy {
            self.quiescent -= 1;
            if self.quiescent <= 0 {
                self.quiescent = 0;
                self.lol.filled_pipe = false;
                self.lol.full_bw_count = 0;
                self.lol.full_bw = 0.0;
                self.cwnd = 4.0;
            }
        }
        minrto
    }

    fn flush_impl(&mut self, ack_only: bool) -> (u32, bool) {
        let mut busy = false;
        let mtu = self.mtu as usize;
        let reserved = self.reserved;

        // template for ACK and probe segments
        let mut seg = KcpHeader::new(self.conv, IKCP_CMD_ACK);
        seg.wnd = self.wnd_unused();
        seg.una = self.rcv_nxt;

        self.buffer.resize(reserved, 0);

        // pending acknowledgments first
        let last = self.acklist.len().wrapping_sub(1);
        for (i, &(sn, ts)) in self.acklist.iter().enumerate() {
            busy = true;
            make_space(
                &mut self.output,
                &mut self.buffer,
                mtu,
                reserved,
                KcpHeader::SIZE,
            );
            // stale acks below rcv_nxt are bufferbloat jitter; drop them,
            // but always let the final one through
            if sn >= self.rcv_nxt || i == last {
                seg.sn = sn;
                seg.ts = ts;
                seg.encode(&mut self.buffer);
                SNMP.out_segs.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.acklist.clear();

        if ack_only {
            busy |= flush_remaining(&mut self.output, &mut self.buffer, reserved);
            return (self.interval, busy);
        }

        // zero remote window: schedule escalating probes
        if self.rmt_wnd == 0 {
            let current = (self.clock)();
            if self.probe_wait == 0 {
                self.probe_wait = IKCP_PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if time_diff(current, self.ts_probe) >= 0 {
                if self.probe_wait < IKCP_PROBE_INIT {
                    self.probe_wait = IKCP_PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > IKCP_PROBE_LIMIT {
                    self.probe_wait = IKCP_PROBE_LIMIT;
                }
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= IKCP_ASK_SEND;
            }
            busy = true;
        } else if self.ts_probe != 0 || self.probe_wait != 0 {
            self.ts_probe = 0;
            self.probe_wait = 0;
            busy = true;
        }

        if self.probe & IKCP_ASK_SEND != 0 {
            seg.cmd = IKCP_CMD_WASK;
            make_space(
                &mut self.output,
                &mut self.buffer,
                mtu,
                reserved,
                KcpHeader::SIZE,
            );
            seg.encode(&mut self.buffer);
            SNMP.out_segs.fetch_add(1, Ordering::Relaxed);
            busy = true;
        }

        if self.probe & IKCP_ASK_TELL != 0 {
            seg.cmd = IKCP_CMD_WINS;
            make_space(
                &mut self.output,
                &mut self.buffer,
                mtu,
                reserved,
                KcpHeader::SIZE,
            );
            seg.encode(&mut self.buffer);
            SNMP.out_segs.fetch_add(1, Ordering::Relaxed);
            busy = true;
        }

        if self.probe != 0 {
            self.probe = 0;
            busy = true;
        }

        // effective window gates promotion from the staging queue
        let mut cwnd_limit = self.snd_wnd.min(self.rmt_wnd);
        if !self.nocwnd {
            cwnd_limit = cwnd_limit.min(self.cwnd as u32);
        }

        if !self.snd_queue.is_empty() {
            busy = true;
        }
        let mut promoted = 0usize;
        while time_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd_limit)) < 0 {
            let Some(mut newseg) = self.snd_queue.pop_front() else {
                break;
            };
            newseg.header.conv = self.conv;
            newseg.header.cmd = IKCP_CMD_PUSH;
            newseg.header.sn = self.snd_nxt;
            self.dre.on_send(newseg.header.sn);
            self.snd_buf.push_back(newseg);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            promoted += 1;
        }

        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };

        // retransmission pass over everything in flight
        let mut current = (self.clock)();
        let mut minrto = self.interval as i32;
        let mut change: u64 = 0;
        let mut lost_segs: u64 = 0;
        let mut fast_retrans_segs: u64 = 0;
        let mut early_retrans_segs: u64 = 0;
        let mut dead = false;

        for i in 0..self.snd_buf.len() {
            busy = true;
            let segment = &mut self.snd_buf[i];
            if segment.acked {
                continue;
            }

            let mut needsend = false;
            if segment.xmit == 0 {
                // first transmission gets the full rto plus slack
                needsend = true;
                segment.rto = self.rtt.rto;
                segment.resendts = current.wrapping_add(segment.rto).wrapping_add(RTO_SLACK);
                self.trans += 1;
            } else if segment.fastack >= resent {
                needsend = true;
                segment.fastack = 0;
                segment.rto = self.rtt.rto;
                segment.resendts = current.wrapping_add(segment.rto);
                change += 1;
                fast_retrans_segs += 1;
            } else if segment.fastack > 0 && promoted == 0 {
                // nothing new went out, so a single duplicate ack is
                // already a strong loss hint
                needsend = true;
                segment.fastack = 0;
                segment.rto = self.rtt.rto;
                segment.resendts = current.wrapping_add(segment.rto);
                change += 1;
                early_retrans_segs += 1;
            } else if time_diff(current, segment.resendts) >= 0 {
                needsend = true;
                segment.rto *= 2;
                segment.fastack = 0;
                segment.resendts = current.wrapping_add(segment.rto);
                if segment.rto > IKCP_RTO_MAX {
                    warn!(
                        conv = self.conv,
                        sn = segment.header.sn,
                        rto = segment.rto,
                        "retransmission timeout exceeded, marking link dead"
                    );
                    dead = true;
                }
                lost_segs += 1;
            }

            if needsend {
                current = (self.clock)();
                segment.xmit += 1;
                segment.header.ts = current;
                segment.header.wnd = seg.wnd;
                segment.header.una = seg.una;
                segment.header.len = segment.data.len() as u32;

                let need = KcpHeader::SIZE + segment.data.len();
                make_space(&mut self.output, &mut self.buffer, mtu, reserved, need);
                segment.header.encode(&mut self.buffer);
                self.buffer.extend_from_slice(&segment.data);
                SNMP.out_segs.fetch_add(1, Ordering::Relaxed);
            }

            let trto = time_diff(segment.resendts, current);
            if trto > 0 && trto < minrto {
                minrto = trto;
            }

            if dead {
                self.is_dead = true;
                break;
            }
        }

        busy |= flush_remaining(&mut self.output, &mut self.buffer, reserved);

        let mut sum = lost_segs;
        if lost_segs > 0 {
            SNMP.lost_segs.fetch_add(lost_segs, Ordering::Relaxed);
        }
        if fast_retrans_segs > 0 {
            SNMP.fast_retrans_segs
                .fetch_add(fast_retrans_segs, Ordering::Relaxed);
            sum += fast_retrans_segs;
        }
        if early_retrans_segs > 0 {
            SNMP.early_retrans_segs
                .fetch_add(early_retrans_segs, Ordering::Relaxed);
            sum += early_retrans_segs;
        }
        if sum > 0 {
            SNMP.retrans_segs.fetch_add(sum, Ordering::Relaxed);
            self.retrans += sum;
        }

        if !self.nocwnd {
            match self.cc {
                CongestionControl::Bic => {
                    if lost_segs > 10 || change > 20 {
                        self.bic_on_loss();
                    }
                }
                CongestionControl::Lol => {
                    // recovery is driven by the rate measurements, not by
                    // cutting the window here
                    #[cfg(feature = "lol-loss-cut")]
                    if lost_segs > 0 {
                        self.cwnd = 1.0;
                    }
                }
            }
            if self.cwnd < 32.0 {
                self.cwnd = 32.0;
            }
        }

        (minrto as u32, busy)
    }

    // ------------------------------------------------------------------
    // interval driver
    // ------------------------------------------------------------------

    /// Interval-scheduled flush driver. Call repeatedly (for example from a
    /// timer); flushes whenever the configured interval has elapsed and
    /// resynchronizes after clock jumps larger than ten seconds.
    ///
    /// Returns the ms until the engine next wants attention.
    pub fn update(&mut self) -> u32 {
        let current = (self.clock)();
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = time_diff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush(false)
        } else {
            (-slap) as u32
        }
    }

    /// When the next [`update`](Self::update) is actually needed, in ms
    /// from now: the sooner of the scheduled flush and the earliest
    /// retransmission deadline.
    pub fn check(&self) -> u32 {
        let current = (self.clock)();
        if !self.updated {
            return 0;
        }

        let mut ts_flush = self.ts_flush;
        if !(-10_000..10_000).contains(&time_diff(current, ts_flush)) {
            ts_flush = current;
        }
        if time_diff(current, ts_flush) >= 0 {
            return 0;
        }

        let tm_flush = -time_diff(current, ts_flush);
        let mut tm_packet = i32::MAX;
        for seg in &self.snd_buf {
            let diff = time_diff(seg.resendts, current);
            if diff <= 0 {
                return 0;
            }
            if diff < tm_packet {
                tm_packet = diff;
            }
        }

        tm_packet.min(tm_flush).min(self.interval as i32) as u32
    }

    // ------------------------------------------------------------------
    // congestion control
    // ------------------------------------------------------------------

    fn bic_on_ack(&mut self, acks: i32) {
        for _ in 0..acks {
            let mut bicinc = if self.cwnd < self.wmax {
                (self.wmax - self.cwnd) / 2.0
            } else {
                self.cwnd - self.wmax
            };
            bicinc = bicinc.clamp(1.0, 64.0);
            self.cwnd += bicinc / self.cwnd;
            if self.cwnd as u32 > self.rmt_wnd {
                self.cwnd = self.rmt_wnd as f64;
            }
        }
        trace!(cwnd = self.cwnd, wmax = self.wmax, "bic window advanced");
    }

    fn bic_on_loss(&mut self) {
        debug!(cwnd = self.cwnd, "loss detected, shrinking bic window");
        let beta = 0.125;
        if self.cwnd < self.wmax {
            self.wmax = self.cwnd * (2.0 - beta) / 2.0;
        } else {
            self.wmax = self.cwnd;
        }
        self.cwnd *= 1.0 - beta;
    }

    fn lol_on_ack(&mut self, acks: i32) {
        let now = (self.clock)();
        let bdp_segs = self.dre.bdp() / self.mss as f64 + 16.0;

        self.lol.gain = 1.0;
        if !self.lol.filled_pipe {
            if self.dre.max_ack_rate > self.lol.full_bw {
                // measured bandwidth still growing
                self.lol.full_bw = self.dre.max_ack_rate;
                self.lol.full_bw_count = 0;
            } else {
                self.lol.full_bw_count += 1;
            }
            if self.lol.full_bw_count >= 3 {
                self.lol.filled_pipe = true;
                self.lol.last_fill_time = now;
                self.lol.gain /= 2.89;
                debug!(full_bw = self.lol.full_bw, "pipe filled");
            }
        }
        if !self.lol.filled_pipe {
            self.lol.gain *= 2.89;
        }

        // oscillate the gain through a six-slot cycle paced by min rtt
        if self.dre.min_rtt > 0.0 {
            let period = (now as f64 / self.dre.min_rtt) as u64 % 6;
            if period == 0 {
                self.lol.gain *= 1.25;
            } else if period == 1 {
                self.lol.gain *= 0.75;
            }
        }

        let target_bdp = bdp_segs * 4.0;
        if target_bdp > self.cwnd + acks as f64 {
            self.cwnd += acks as f64;
        } else {
            self.cwnd = (self.cwnd + target_bdp) / 2.0;
        }
        if self.cwnd < 4.0 {
            self.cwnd = 4.0;
        }

        trace!(
            max_rate = self.dre.max_ack_rate,
            avg_rate = self.dre.avg_ack_rate,
            cwnd = self.cwnd,
            gain = self.lol.gain,
            min_rtt = self.dre.min_rtt,
            filled_for_ms = if self.lol.filled_pipe {
                time_diff(now, self.lol.last_fill_time)
            } else {
                0
            },
            loss_pct = if self.trans > 0 {
                self.retrans as f64 / self.trans as f64 * 100.0
            } else {
                0.0
            },
            "lol window updated"
        );
    }
}

/// Emit the working buffer if appending `need` more bytes would overflow
/// the MTU, then rewind past the reserved prefix.
fn make_space(output: &mut OutputFn, buffer: &mut BytesMut, mtu: usize, reserved: usize, need: usize) {
    if buffer.len() + need > mtu {
        (output)(&buffer[..]);
        buffer.truncate(reserved);
    }
}

/// Emit whatever the working buffer holds beyond the reserved prefix.
/// Returns true if a datagram went out.
fn flush_remaining(output: &mut OutputFn, buffer: &mut BytesMut, reserved: usize) -> bool {
    if buffer.len() > reserved {
        (output)(&buffer[..]);
        true
    } else {
        false
    }
}
