//! Paired-engine integration tests over an ideal in-order link.

mod common;

use common::*;
use kcp_lol::protocol::constants::{IKCP_CMD_ACK, IKCP_CMD_PUSH, IKCP_CMD_WINS, IKCP_OVERHEAD};
use kcp_lol::{KcpConfig, KcpError};

/// Default test tuning: fast resend on, congestion window active.
fn test_config() -> KcpConfig {
    let mut config = KcpConfig::new();
    config.nodelay.resend = 2;
    config
}

#[test]
fn basic_send_recv() {
    let clock = TestClock::new();
    let (mut a, a_out) = make_engine(1, &test_config(), &clock);
    let (mut b, b_out) = make_engine(1, &test_config(), &clock);

    a.send(b"hello").unwrap();
    // the first flush only arms the congestion window
    a.flush(false);
    a.flush(false);
    transfer(&a_out, &mut b);

    assert_eq!(b.peek_size(), Some(5));
    let mut buf = [0u8; 16];
    assert_eq!(b.recv(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");

    // ack flows back and clears the in-flight buffer
    b.flush(false);
    transfer(&b_out, &mut a);
    assert_eq!(a.stats().snd_una, 1);
    assert_eq!(a.wait_snd(), 0);
    assert_eq!(a.stats().delivered, 5.0);
}

#[test]
fn fragmentation_preserves_message() {
    let clock = TestClock::new();
    let (mut a, a_out) = make_engine(2, &test_config(), &clock);
    let (mut b, _b_out) = make_engine(2, &test_config(), &clock);

    let mss = a.mss() as usize;
    assert_eq!(mss, 1376);

    let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
    a.send(&payload).unwrap();
    assert_eq!(a.wait_snd(), 8);

    a.flush(false);
    a.flush(false);

    let datagrams = drain(&a_out);
    let headers: Vec<_> = datagrams
        .iter()
        .flat_map(|d| decode_segments(d))
        .collect();
    assert_eq!(headers.len(), 8);
    for (i, hdr) in headers.iter().enumerate() {
        assert_eq!(hdr.cmd, IKCP_CMD_PUSH);
        assert_eq!(hdr.sn, i as u32);
        assert_eq!(hdr.frg, (7 - i) as u8);
        let expect_len = if i < 7 { mss } else { 10_000 - 7 * mss };
        assert_eq!(hdr.len as usize, expect_len);
    }

    for datagram in &datagrams {
        b.input(datagram, true, false).unwrap();
    }
    assert_eq!(b.peek_size(), Some(10_000));
    let mut buf = vec![0u8; 10_000];
    assert_eq!(b.recv(&mut buf).unwrap(), 10_000);
    assert_eq!(buf, payload);
}

#[test]
fn exact_mss_is_single_unfragmented_segment() {
    let clock = TestClock::new();
    let (mut a, a_out) = make_engine(3, &test_config(), &clock);

    let mss = a.mss() as usize;
    a.send(&vec![0xAB; mss]).unwrap();
    assert_eq!(a.wait_snd(), 1);

    a.flush(false);
    a.flush(false);
    let datagrams = drain(&a_out);
    assert_eq!(datagrams.len(), 1);
    assert_eq!(datagrams[0].len(), IKCP_OVERHEAD as usize + mss);

    let headers = decode_segments(&datagrams[0]);
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].frg, 0);
    assert_eq!(headers[0].len as usize, mss);
}

#[test]
fn conv_mismatch_rejects_datagram() {
    let clock = TestClock::new();
    let (mut a, a_out) = make_engine(100, &test_config(), &clock);
    let (mut b, _b_out) = make_engine(999, &test_config(), &clock);

    a.send(b"mismatch").unwrap();
    a.flush(false);
    a.flush(false);

    for packet in drain(&a_out) {
        assert!(matches!(
            b.input(&packet, true, false),
            Err(KcpError::ConvMismatch { .. })
        ));
    }
    assert_eq!(b.peek_size(), None);
}

#[test]
fn truncated_and_unknown_command_inputs() {
    let clock = TestClock::new();
    let (mut b, _b_out) = make_engine(7, &test_config(), &clock);

    assert_eq!(b.input(&[0u8; 10], true, false), Err(KcpError::Truncated));

    let bogus = raw_segment(7, 99, 32);
    assert_eq!(b.input(&bogus, true, false), Err(KcpError::UnknownCommand(99)));

    // declared length larger than the datagram
    let mut lying = raw_segment(7, IKCP_CMD_PUSH, 32);
    lying[20] = 200; // len field, little-endian low byte
    assert_eq!(b.input(&lying, true, false), Err(KcpError::LengthMismatch));
}

#[test]
fn recv_with_short_buffer_leaves_state_intact() {
    let clock = TestClock::new();
    let (mut a, a_out) = make_engine(4, &test_config(), &clock);
    let (mut b, _b_out) = make_engine(4, &test_config(), &clock);

    a.send(b"hello").unwrap();
    a.flush(false);
    a.flush(false);
    transfer(&a_out, &mut b);

    let mut short = [0u8; 4];
    assert_eq!(
        b.recv(&mut short),
        Err(KcpError::BufferTooSmall { needed: 5 })
    );

    // the message is still there in full
    assert_eq!(b.peek_size(), Some(5));
    let mut buf = [0u8; 5];
    assert_eq!(b.recv(&mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
}

#[test]
fn duplicate_acks_advance_una_once() {
    let clock = TestClock::new();
    let (mut a, a_out) = make_engine(5, &test_config(), &clock);
    let (mut b, b_out) = make_engine(5, &test_config(), &clock);

    a.send(b"hello").unwrap();
    a.flush(false);
    a.flush(false);
    transfer(&a_out, &mut b);

    let mut buf = [0u8; 8];
    b.recv(&mut buf).unwrap();
    b.flush(false);

    let acks = drain(&b_out);
    assert_eq!(acks.len(), 1);

    a.input(&acks[0], true, false).unwrap();
    assert_eq!(a.stats().snd_una, 1);
    assert_eq!(a.stats().delivered, 5.0);

    // replaying the same ack changes nothing
    a.input(&acks[0], true, false).unwrap();
    assert_eq!(a.stats().snd_una, 1);
    assert_eq!(a.stats().delivered, 5.0);
}

#[test]
fn ack_nodelay_flushes_acks_immediately() {
    let clock = TestClock::new();
    let (mut a, a_out) = make_engine(6, &test_config(), &clock);
    let (mut b, b_out) = make_engine(6, &test_config(), &clock);

    a.send(b"ping").unwrap();
    a.flush(false);
    a.flush(false);

    for packet in drain(&a_out) {
        b.input(&packet, true, true).unwrap();
    }

    // the ack went out without any explicit flush on b
    let datagrams = drain(&b_out);
    assert!(!datagrams.is_empty());
    let headers = decode_segments(&datagrams[0]);
    assert_eq!(headers[0].cmd, IKCP_CMD_ACK);
    assert_eq!(headers[0].sn, 0);
}

#[test]
fn stale_acks_are_filtered_except_the_last() {
    let clock = TestClock::new();
    let (mut a, a_out) = make_engine(8, &test_config(), &clock);
    let (mut b, b_out) = make_engine(8, &test_config(), &clock);

    a.send(&vec![1u8; 700]).unwrap();
    a.send(&vec![2u8; 700]).unwrap();
    a.flush(false);
    a.flush(false);
    let datagrams = drain(&a_out);
    assert_eq!(datagrams.len(), 2);

    // deliver sn 0 and flush its ack normally
    b.input(&datagrams[0], true, false).unwrap();
    b.flush(false);
    drain(&b_out);

    // now a duplicate of sn 0 followed by sn 1: the stale ack for sn 0 is
    // dropped, the newest one always goes out
    b.input(&datagrams[0], true, false).unwrap();
    b.input(&datagrams[1], true, false).unwrap();
    b.flush(false);

    let ack_headers: Vec<_> = drain(&b_out)
        .iter()
        .flat_map(|d| decode_segments(d))
        .filter(|h| h.cmd == IKCP_CMD_ACK)
        .collect();
    assert_eq!(ack_headers.len(), 1);
    assert_eq!(ack_headers[0].sn, 1);
}

#[test]
fn stream_mode_packs_and_delivers_bytes() {
    let clock = TestClock::new();
    let mut config = test_config();
    config.stream = true;
    let (mut a, a_out) = make_engine(9, &config, &clock);
    let (mut b, _b_out) = make_engine(9, &config, &clock);

    a.send(b"hello ").unwrap();
    a.send(b"world").unwrap();
    assert_eq!(a.wait_snd(), 1);

    a.flush(false);
    a.flush(false);
    transfer(&a_out, &mut b);

    assert_eq!(b.peek_size(), Some(11));
    let mut buf = [0u8; 11];
    assert_eq!(b.recv(&mut buf).unwrap(), 11);
    assert_eq!(&buf, b"hello world");
}

#[test]
fn window_advertisement_and_fast_recover() {
    let clock = TestClock::new();
    let mut config = test_config();
    config.rcv_wnd = 2;
    let (mut b, b_out) = make_engine(10, &config, &clock);
    let (mut a, a_out) = make_engine(10, &test_config(), &clock);

    a.send(b"one").unwrap();
    a.send(b"two").unwrap();
    a.flush(false);
    a.flush(false);
    transfer(&a_out, &mut b);

    // b's delivery queue is full, so it advertises a zero window
    b.flush(false);
    transfer(&b_out, &mut a);
    assert_eq!(a.stats().rmt_wnd, 0);

    // draining triggers an unsolicited window update
    let messages = recv_all(&mut b);
    assert_eq!(messages.len(), 2);
    b.flush(false);

    let datagrams = drain(&b_out);
    let wins: Vec<_> = datagrams
        .iter()
        .flat_map(|d| decode_segments(d))
        .filter(|h| h.cmd == IKCP_CMD_WINS)
        .collect();
    assert_eq!(wins.len(), 1);
    assert_eq!(wins[0].wnd, 2);

    for datagram in &datagrams {
        a.input(datagram, true, false).unwrap();
    }
    assert_eq!(a.stats().rmt_wnd, 2);
}

#[test]
fn timestamps_survive_clock_wraparound() {
    let clock = TestClock::starting_at(u32::MAX - 500);
    let (mut a, a_out) = make_engine(11, &test_config(), &clock);
    let (mut b, b_out) = make_engine(11, &test_config(), &clock);

    a.send(b"across the wrap").unwrap();
    for _ in 0..8 {
        clock.advance(100); // steps the shared clock straight through zero
        a.flush(false);
        transfer(&a_out, &mut b);
        b.flush(false);
        transfer(&b_out, &mut a);
    }

    let messages = recv_all(&mut b);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0], b"across the wrap");
    assert_eq!(a.stats().snd_una, 1);
    assert!(!a.is_dead());
}

#[test]
fn update_flushes_on_interval() {
    let clock = TestClock::new();
    let (mut a, a_out) = make_engine(12, &test_config(), &clock);

    a.send(b"scheduled").unwrap();
    a.update(); // first call flushes immediately and arms cwnd
    a.update();
    assert!(drain(&a_out).is_empty(), "interval has not elapsed yet");

    clock.advance(100);
    a.update();
    let datagrams = drain(&a_out);
    assert_eq!(datagrams.len(), 1);
    assert_eq!(decode_segments(&datagrams[0])[0].cmd, IKCP_CMD_PUSH);

    // with data in flight, check() points at a deadline within the rto
    let hint = a.check();
    assert!(hint <= a.stats().rto + 500);
}
