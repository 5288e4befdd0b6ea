//! Wire-level protocol types: constants, the 24-byte segment header codec,
//! and wrap-aware timestamp/sequence arithmetic.

use bytes::{Buf, BufMut, BytesMut};
use std::sync::LazyLock;
use std::time::Instant;

/// Protocol constants shared with every interoperable implementation.
pub mod constants {
    pub const IKCP_RTO_NDL: u32 = 30; // no-delay min rto
    pub const IKCP_RTO_MIN: u32 = 100; // normal min rto
    pub const IKCP_RTO_DEF: u32 = 200; // default rto
    pub const IKCP_RTO_MAX: u32 = 60000; // max rto
    pub const IKCP_CMD_PUSH: u8 = 81; // cmd: push data
    pub const IKCP_CMD_ACK: u8 = 82; // cmd: ack
    pub const IKCP_CMD_WASK: u8 = 83; // cmd: window probe (ask)
    pub const IKCP_CMD_WINS: u8 = 84; // cmd: window size (tell)
    pub const IKCP_ASK_SEND: u32 = 1; // need to send IKCP_CMD_WASK
    pub const IKCP_ASK_TELL: u32 = 2; // need to send IKCP_CMD_WINS
    pub const IKCP_WND_SND: u32 = 32; // default send window
    pub const IKCP_WND_RCV: u32 = 32; // default receive window
    pub const IKCP_MTU_DEF: u32 = 1400; // default mtu
    pub const IKCP_INTERVAL: u32 = 100; // default flush interval
    pub const IKCP_OVERHEAD: u32 = 24; // segment header overhead
    pub const IKCP_THRESH_INIT: u32 = 2; // initial slow start threshold
    pub const IKCP_PROBE_INIT: u32 = 7000; // 7 secs to probe window size
    pub const IKCP_PROBE_LIMIT: u32 = 120000; // up to 120 secs to probe window
}

use constants::*;

/// Conversation ID type
pub type ConvId = u32;

/// Sequence number type
pub type SeqNum = u32;

/// Timestamp type (milliseconds since engine epoch, wraps every ~49 days)
pub type Timestamp = u32;

static REF_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Monotonic milliseconds since process startup, truncated to u32.
pub fn current_ms() -> Timestamp {
    REF_TIME.elapsed().as_millis() as Timestamp
}

/// Signed wrap-aware difference between two u32 timestamps or sequence
/// numbers. Positive when `later` is ahead of `earlier`.
pub fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Segment header, 24 bytes little-endian on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KcpHeader {
    pub conv: ConvId,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: Timestamp,
    pub sn: SeqNum,
    pub una: SeqNum,
    pub len: u32,
}

impl KcpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = IKCP_OVERHEAD as usize;

    /// Create a header with all sequencing fields zeroed.
    pub fn new(conv: ConvId, cmd: u8) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            len: 0,
        }
    }

    /// Append the encoded header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    /// Decode a header from the front of `buf`, advancing it by
    /// [`KcpHeader::SIZE`]. Returns `None` if fewer bytes remain.
    pub fn decode<B: Buf>(buf: &mut B) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }

        Some(Self {
            conv: buf.get_u32_le(),
            cmd: buf.get_u8(),
            frg: buf.get_u8(),
            wnd: buf.get_u16_le(),
            ts: buf.get_u32_le(),
            sn: buf.get_u32_le(),
            una: buf.get_u32_le(),
            len: buf.get_u32_le(),
        })
    }

    /// Command name for log output.
    pub fn cmd_str(&self) -> &'static str {
        match self.cmd {
            IKCP_CMD_PUSH => "PUSH",
            IKCP_CMD_ACK => "ACK",
            IKCP_CMD_WASK => "WASK",
            IKCP_CMD_WINS => "WINS",
            _ => "UNKNOWN",
        }
    }
}

/// In-flight segment: wire header plus payload and retransmission state.
#[derive(Debug)]
pub struct Segment {
    pub header: KcpHeader,
    pub data: BytesMut,

    /// Absolute retransmission deadline in ms.
    pub resendts: Timestamp,
    /// Current per-segment retransmission timeout.
    pub rto: u32,
    /// How many ACKs for later sequence numbers this segment has seen.
    pub fastack: u32,
    /// Transmission count, 0 until first flush.
    pub xmit: u32,
    /// Selectively acknowledged; kept in place until cumulative una passes.
    pub acked: bool,
}

impl Segment {
    pub fn new(header: KcpHeader, data: BytesMut) -> Self {
        Self {
            header,
            data,
            resendts: 0,
            rto: IKCP_RTO_DEF,
            fastack: 0,
            xmit: 0,
            acked: false,
        }
    }
}
