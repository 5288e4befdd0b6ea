//! Congestion-controller selection.
//!
//! Each engine carries its own controller choice, fixed at construction; the
//! process-wide value here only supplies the default for newly built engines.

use std::sync::atomic::{AtomicU8, Ordering};

/// Congestion-window update strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionControl {
    /// Classical loss-based binary-increase control.
    Bic,
    /// Rate/BDP-based control driven by delivery-rate measurements.
    Lol,
}

const CC_BIC: u8 = 0;
const CC_LOL: u8 = 1;

static DEFAULT_CC: AtomicU8 = AtomicU8::new(CC_LOL);

/// Set the process-wide default controller for engines built afterwards.
pub fn set_default_congestion(cc: CongestionControl) {
    let v = match cc {
        CongestionControl::Bic => CC_BIC,
        CongestionControl::Lol => CC_LOL,
    };
    DEFAULT_CC.store(v, Ordering::Relaxed);
}

/// The current process-wide default controller.
pub fn default_congestion() -> CongestionControl {
    match DEFAULT_CC.load(Ordering::Relaxed) {
        CC_BIC => CongestionControl::Bic,
        _ => CongestionControl::Lol,
    }
}
