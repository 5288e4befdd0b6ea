//! Configuration types for the protocol engine.

use crate::congestion::{default_congestion, CongestionControl};
use crate::protocol::constants;

/// Latency/throughput trade-off knobs, grouped the way they are usually
/// tuned together.
#[derive(Debug, Clone)]
pub struct NoDelayConfig {
    /// Enable no-delay mode (lowers the RTO floor to 30 ms)
    pub nodelay: bool,
    /// Flush interval in milliseconds, clamped to [10, 5000]
    pub interval: u32,
    /// Fast-resend threshold in duplicate-ack hits, 0 disables
    pub resend: u32,
    /// Disable congestion-window gating
    pub nocwnd: bool,
}

impl NoDelayConfig {
    /// Balanced defaults for bulk transfer.
    pub fn normal() -> Self {
        Self {
            nodelay: false,
            interval: constants::IKCP_INTERVAL,
            resend: 0,
            nocwnd: false,
        }
    }

    /// Lower latency at some bandwidth cost.
    pub fn fast() -> Self {
        Self {
            nodelay: true,
            interval: 40,
            resend: 2,
            nocwnd: false,
        }
    }

    /// Minimum latency, congestion window disabled.
    pub fn turbo() -> Self {
        Self {
            nodelay: true,
            interval: 10,
            resend: 2,
            nocwnd: true,
        }
    }

    pub fn custom(nodelay: bool, interval: u32, resend: u32, nocwnd: bool) -> Self {
        Self {
            nodelay,
            interval,
            resend,
            nocwnd,
        }
    }
}

impl Default for NoDelayConfig {
    fn default() -> Self {
        Self::normal()
    }
}

/// Engine configuration. Only protocol-level settings live here; transport
/// and session concerns belong to the owner driving the engine.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    /// Maximum transmission unit
    pub mtu: u32,
    /// Send window in segments
    pub snd_wnd: u32,
    /// Receive window in segments
    pub rcv_wnd: u32,
    /// Latency profile
    pub nodelay: NoDelayConfig,
    /// Bytes at the head of every outbound datagram left untouched for an
    /// outer framing layer
    pub reserved: usize,
    /// Byte-stream mode: no message boundaries, tail segments are packed
    pub stream: bool,
    /// Congestion-window update strategy
    pub congestion: CongestionControl,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: constants::IKCP_MTU_DEF,
            snd_wnd: constants::IKCP_WND_SND,
            rcv_wnd: constants::IKCP_WND_RCV,
            nodelay: NoDelayConfig::normal(),
            reserved: 0,
            stream: false,
            congestion: default_congestion(),
        }
    }
}

impl KcpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn window_size(mut self, snd_wnd: u32, rcv_wnd: u32) -> Self {
        self.snd_wnd = snd_wnd;
        self.rcv_wnd = rcv_wnd;
        self
    }

    pub fn normal_mode(mut self) -> Self {
        self.nodelay = NoDelayConfig::normal();
        self
    }

    pub fn fast_mode(mut self) -> Self {
        self.nodelay = NoDelayConfig::fast();
        self
    }

    pub fn turbo_mode(mut self) -> Self {
        self.nodelay = NoDelayConfig::turbo();
        self
    }

    pub fn nodelay_config(mut self, nodelay: NoDelayConfig) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn reserved(mut self, reserved: usize) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn congestion(mut self, congestion: CongestionControl) -> Self {
        self.congestion = congestion;
        self
    }
}
