//! Pure synchronous ARQ transport engine.
//!
//! This crate implements a reliable, ordered, message-and-stream transport
//! layered over an unreliable datagram substrate, with two pluggable
//! congestion controllers: classical BIC and the rate/BDP-driven LOL
//! strategy. The engine is a single-owner state machine with no I/O, no
//! runtime, and no internal locking. It accepts payloads and datagrams,
//! emits datagrams through a caller-supplied sink, and hands back
//! reassembled messages on demand.
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  kcp-lol                            │
//! │                                     │
//! │  protocol     ← wire types/codec   │
//! │  engine       ← state machine      │
//! │  rate         ← delivery estimator │
//! │  congestion   ← BIC / LOL choice   │
//! │  config       ← tuning             │
//! │  error        ← boundary taxonomy  │
//! │  buffer_pool  ← pooled payloads    │
//! │  snmp         ← global counters    │
//! └─────────────────────────────────────┘
//! ```
//!
//! The owner drives the engine: serialize all calls, feed received
//! datagrams to [`KcpEngine::input`], and call [`KcpEngine::update`] (or
//! [`KcpEngine::flush`] directly) on the cadence suggested by their return
//! values.
//!
//! ```no_run
//! use kcp_lol::{KcpConfig, KcpEngine};
//!
//! let config = KcpConfig::new().window_size(128, 128);
//! let mut kcp = KcpEngine::with_config(
//!     0x11223344,
//!     &config,
//!     Box::new(|datagram: &[u8]| {
//!         // hand the datagram to the socket layer
//!         let _ = datagram;
//!     }),
//! )
//! .unwrap();
//!
//! kcp.send(b"hello").unwrap();
//! kcp.update();
//! ```

pub mod buffer_pool;
pub mod config;
pub mod congestion;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod snmp;

mod rate;

pub use config::{KcpConfig, NoDelayConfig};
pub use congestion::{default_congestion, set_default_congestion, CongestionControl};
pub use engine::{ClockFn, KcpEngine, KcpStats, OutputFn};
pub use error::{KcpError, Result};
pub use protocol::{ConvId, KcpHeader, SeqNum, Timestamp};
pub use snmp::{snmp, Snmp, SnmpSnapshot};
