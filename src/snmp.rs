//! Process-wide segment counters, accumulated atomically across all engines.

use std::sync::atomic::{AtomicU64, Ordering};

/// SNMP-style counters. One instance exists per process; engines update it
/// with relaxed atomic adds on their hot paths.
#[derive(Debug, Default)]
pub struct Snmp {
    /// Segments encoded onto the wire
    pub out_segs: AtomicU64,
    /// Segments parsed from inbound datagrams
    pub in_segs: AtomicU64,
    /// Duplicate data segments received
    pub repeat_segs: AtomicU64,
    /// Segments retransmitted after an RTO
    pub lost_segs: AtomicU64,
    /// Segments retransmitted after enough duplicate ACKs
    pub fast_retrans_segs: AtomicU64,
    /// Segments retransmitted early while the send queue was idle
    pub early_retrans_segs: AtomicU64,
    /// All retransmitted segments
    pub retrans_segs: AtomicU64,
}

impl Snmp {
    /// Copy the current counter values.
    pub fn snapshot(&self) -> SnmpSnapshot {
        SnmpSnapshot {
            out_segs: self.out_segs.load(Ordering::Relaxed),
            in_segs: self.in_segs.load(Ordering::Relaxed),
            repeat_segs: self.repeat_segs.load(Ordering::Relaxed),
            lost_segs: self.lost_segs.load(Ordering::Relaxed),
            fast_retrans_segs: self.fast_retrans_segs.load(Ordering::Relaxed),
            early_retrans_segs: self.early_retrans_segs.load(Ordering::Relaxed),
            retrans_segs: self.retrans_segs.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.out_segs.store(0, Ordering::Relaxed);
        self.in_segs.store(0, Ordering::Relaxed);
        self.repeat_segs.store(0, Ordering::Relaxed);
        self.lost_segs.store(0, Ordering::Relaxed);
        self.fast_retrans_segs.store(0, Ordering::Relaxed);
        self.early_retrans_segs.store(0, Ordering::Relaxed);
        self.retrans_segs.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`Snmp`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnmpSnapshot {
    pub out_segs: u64,
    pub in_segs: u64,
    pub repeat_segs: u64,
    pub lost_segs: u64,
    pub fast_retrans_segs: u64,
    pub early_retrans_segs: u64,
    pub retrans_segs: u64,
}

lazy_static::lazy_static! {
    /// Global counter instance
    pub static ref SNMP: Snmp = Snmp::default();
}

/// Access the global counters.
pub fn snmp() -> &'static Snmp {
    &SNMP
}
