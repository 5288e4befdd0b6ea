//! Delivery-rate estimation.
//!
//! Tracks how fast the peer is actually absorbing data: a per-segment
//! delivered-bytes counter snapshotted at send time, an EWMA of the per-ack
//! rate, a windowed maximum of that average, and the minimum observed RTT.
//! The LOL controller sizes its window from the resulting BDP estimate.

use crate::protocol::{time_diff, SeqNum, Timestamp};
use std::collections::HashMap;

/// Both the max-rate and min-RTT windows go stale after this long.
const STALE_AFTER_MS: i32 = 10_000;

#[derive(Debug, Default)]
pub(crate) struct DeliveryRate {
    /// Total payload bytes ever acknowledged.
    pub delivered: f64,
    /// When the last acknowledgment arrived.
    pub del_time: Timestamp,
    /// `delivered` at the moment each in-flight segment was sent.
    pp_delivered: HashMap<SeqNum, f64>,
    /// `del_time` at the moment each in-flight segment was sent.
    pp_del_time: HashMap<SeqNum, Timestamp>,
    /// EWMA of per-ack delivery rate in bytes/sec.
    pub avg_ack_rate: f64,
    /// Windowed maximum of `avg_ack_rate`.
    pub max_ack_rate: f64,
    pub max_ack_time: Timestamp,
    /// Lowest RTT sample in the current window, in ms. Zero until sampled.
    pub min_rtt: f64,
    pub min_rtt_time: Timestamp,
}

impl DeliveryRate {
    /// Snapshot the delivered counter for a segment entering the in-flight
    /// buffer. The entry lives until the segment is acknowledged.
    pub fn on_send(&mut self, sn: SeqNum) {
        self.pp_delivered.insert(sn, self.delivered);
        self.pp_del_time.insert(sn, self.del_time);
    }

    /// Account for an acknowledged segment of `bytes` payload. Entries are
    /// removed here on both the selective-ack and cumulative-una paths, so a
    /// long-lived conversation cannot leak snapshots.
    pub fn on_ack(&mut self, sn: SeqNum, bytes: usize, now: Timestamp, app_limited: bool) {
        self.delivered += bytes as f64;
        self.del_time = now;

        let Some(p_delivered) = self.pp_delivered.remove(&sn) else {
            return;
        };
        let data_acked = self.delivered - p_delivered;
        let Some(p_del_time) = self.pp_del_time.remove(&sn) else {
            return;
        };

        // ms clock; clamp so a same-tick ack cannot divide by zero
        let ack_elapsed = time_diff(self.del_time, p_del_time).max(1) as f64 / 1000.0;
        let ack_rate = data_acked / ack_elapsed;

        self.avg_ack_rate = self.avg_ack_rate * 0.99 + ack_rate * 0.01;
        if self.max_ack_rate < self.avg_ack_rate
            || (!app_limited && time_diff(now, self.max_ack_time) > STALE_AFTER_MS)
        {
            self.max_ack_rate = self.avg_ack_rate;
            self.max_ack_time = self.del_time;
        }
    }

    /// Fold a fresh RTT sample into the min-RTT window.
    pub fn update_min_rtt(&mut self, rtt: i32, now: Timestamp) {
        if self.min_rtt == 0.0
            || (rtt as f64) < self.min_rtt
            || time_diff(now, self.min_rtt_time) > STALE_AFTER_MS
        {
            self.min_rtt = rtt as f64;
            self.min_rtt_time = now;
        }
    }

    /// Bandwidth-delay product estimate in bytes. The 20 ms pad keeps the
    /// estimate useful on very low-latency paths.
    pub fn bdp(&self) -> f64 {
        (self.min_rtt + 20.0) * 0.001 * self.max_ack_rate
    }
}
