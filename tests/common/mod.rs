//! Shared harness for paired-engine tests: a manually advanced clock, a
//! queue-backed output sink, and transfer helpers.

#![allow(dead_code)]

use kcp_lol::engine::{ClockFn, OutputFn};
use kcp_lol::{KcpConfig, KcpEngine, KcpHeader};

use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Captured outbound datagrams of one engine.
pub type PacketQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// Manually advanced millisecond clock shared by a pair of engines.
#[derive(Clone)]
pub struct TestClock(Arc<AtomicU32>);

impl TestClock {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(0)))
    }

    pub fn starting_at(ms: u32) -> Self {
        Self(Arc::new(AtomicU32::new(ms)))
    }

    pub fn advance(&self, ms: u32) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn now(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clock_fn(&self) -> ClockFn {
        let t = self.0.clone();
        Box::new(move || t.load(Ordering::SeqCst))
    }
}

/// Output sink that captures every datagram into a queue.
pub fn queue_output(queue: PacketQueue) -> OutputFn {
    Box::new(move |buf: &[u8]| queue.lock().unwrap().push_back(buf.to_vec()))
}

/// Build an engine wired to a fresh capture queue and the shared test clock.
pub fn make_engine(conv: u32, config: &KcpConfig, clock: &TestClock) -> (KcpEngine, PacketQueue) {
    let queue: PacketQueue = Arc::new(Mutex::new(VecDeque::new()));
    let mut kcp = KcpEngine::with_config(conv, config, queue_output(queue.clone()))
        .expect("valid test config");
    kcp.set_clock(clock.clock_fn());
    (kcp, queue)
}

/// Take every captured datagram out of a queue.
pub fn drain(queue: &PacketQueue) -> Vec<Vec<u8>> {
    queue.lock().unwrap().drain(..).collect()
}

/// Deliver every captured datagram from `src_queue` into `dst`, in order,
/// lossless.
pub fn transfer(src_queue: &PacketQueue, dst: &mut KcpEngine) {
    for packet in drain(src_queue) {
        let _ = dst.input(&packet, true, false);
    }
}

/// Read every complete message currently deliverable.
pub fn recv_all(kcp: &mut KcpEngine) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(size) = kcp.peek_size() {
        let mut buf = vec![0u8; size];
        let n = kcp.recv(&mut buf).expect("peeked message must be readable");
        buf.truncate(n);
        out.push(buf);
    }
    out
}

/// Decode all segment headers in one datagram.
pub fn decode_segments(datagram: &[u8]) -> Vec<KcpHeader> {
    let mut rest = datagram;
    let mut out = Vec::new();
    while let Some(hdr) = KcpHeader::decode(&mut rest) {
        rest = &rest[hdr.len as usize..];
        out.push(hdr);
    }
    out
}

/// Build a raw single-segment datagram, for injecting hand-crafted peer
/// behavior such as window updates.
pub fn raw_segment(conv: u32, cmd: u8, wnd: u16) -> Vec<u8> {
    let mut hdr = KcpHeader::new(conv, cmd);
    hdr.wnd = wnd;
    let mut buf = BytesMut::new();
    hdr.encode(&mut buf);
    buf.to_vec()
}
