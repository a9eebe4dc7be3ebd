//! Integration tests driving real `CephClient`s over loopback TCP (§8).
//!
//! These complement the sans-IO unit tests in `ceph-messenger` and
//! `ceph-snap` (which exercise the protocol state machine and the realm
//! forest directly) by checking that the facade actually moves bytes
//! end to end.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use ceph::{CephClient, ClientConfig};
use ceph_messenger::{
    EntityType, Identity, Message, MessengerEvent,
    message::decode_message,
    wire::{BANNER, ConnectReply, ConnectReplyMsg, FrameTag, decode_connect_frame, encode_ack_frame, encode_connect_reply_frame},
};

fn listening_client() -> CephClient {
    let config = ClientConfig { listen_addr: Some("127.0.0.1:0".parse().unwrap()), ..ClientConfig::default() };
    CephClient::initialize(config).unwrap()
}

fn dialing_client(mon_addr: std::net::SocketAddr) -> CephClient {
    let config = ClientConfig { mon_addrs: vec![mon_addr], ..ClientConfig::default() };
    CephClient::initialize(config).unwrap()
}

/// Scenario 1 (§8): a fresh lossless connection delivers messages in order.
#[test]
fn plain_round_trip_over_loopback() {
    let mut server = listening_client();
    let server_addr = server.local_addr().unwrap();

    let received: Arc<Mutex<Vec<MessengerEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let received_for_thread = received.clone();
    let server_thread = thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen_messages = 0;
        while std::time::Instant::now() < deadline && seen_messages < 3 {
            let events = server.poll(Some(Duration::from_millis(100))).unwrap();
            for event in &events {
                if matches!(event, MessengerEvent::Message { .. }) {
                    seen_messages += 1;
                }
            }
            received_for_thread.lock().unwrap().extend(events);
        }
    });

    let mut client_a = dialing_client(server_addr);
    let peer = client_a.connect_mon().unwrap();
    let server_identity = Identity::new(EntityType::Mon, 0, server_addr);

    for i in 1..=3u16 {
        let msg = Message::new(client_a.identity(), server_identity, i, format!("payload-{i}").into_bytes());
        client_a.send(peer, msg).unwrap();
    }

    server_thread.join().unwrap();

    let events = received.lock().unwrap();
    let messages: Vec<&Message> = events
        .iter()
        .filter_map(|e| match e {
            MessengerEvent::Message { msg, .. } => Some(msg),
            _ => None,
        })
        .collect();

    assert_eq!(messages.len(), 3);
    for (idx, msg) in messages.iter().enumerate() {
        assert_eq!(msg.header.msg_type, idx as u16 + 1);
        assert_eq!(&*msg.front, format!("payload-{}", idx + 1).as_bytes());
    }
    assert!(events.iter().any(|e| matches!(e, MessengerEvent::Connected { .. })));
}

/// A connection whose peer stops responding entirely (no ACK, no KEEPALIVE_ACK)
/// faults once `keepalive_timeout` elapses, without either side ever sending
/// `CLOSE` — the property SPEC_FULL.md §8 adds to the scenario list.
#[test]
fn keepalive_timeout_faults_silent_peer() {
    let mut server = listening_client();
    let server_addr = server.local_addr().unwrap();

    // Accept the handshake, then stop driving the server's event loop so it
    // never reads or acks anything further — simulating a peer that has
    // gone silent without ever closing the socket.
    let accepted = Arc::new(Mutex::new(false));
    let accepted_for_thread = accepted.clone();
    let server_thread = thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            let events = server.poll(Some(Duration::from_millis(50))).unwrap();
            if events.iter().any(|e| matches!(e, MessengerEvent::Connected { .. })) {
                *accepted_for_thread.lock().unwrap() = true;
                break;
            }
        }
    });

    let mut config = ClientConfig { keepalive_interval: "20ms".into(), keepalive_timeout: "120ms".into(), ..ClientConfig::default() };
    config.mon_addrs = vec![server_addr];
    config.mon_lossy = true;
    let mut client_a = CephClient::initialize(config).unwrap();
    let peer = client_a.connect_mon().unwrap();

    server_thread.join().unwrap();
    assert!(*accepted.lock().unwrap(), "server never completed the handshake");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut saw_disconnect = false;
    while std::time::Instant::now() < deadline && !saw_disconnect {
        let events = client_a.poll(Some(Duration::from_millis(50))).unwrap();
        saw_disconnect |= events.iter().any(|e| matches!(e, MessengerEvent::Disconnected { peer: p } if *p == peer));
    }

    assert!(saw_disconnect, "lossy connection should fault on keepalive timeout");
}

fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).unwrap();
    let tag = header[0];
    let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (tag, payload)
}

fn write_frame(stream: &mut TcpStream, tag: u8, payload: &[u8]) {
    let mut header = [0u8; 5];
    header[0] = tag;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    stream.write_all(&header).unwrap();
    stream.write_all(payload).unwrap();
}

/// Plays the target side of the banner/connect handshake by hand, replying
/// `READY` with `in_seq_acked` set to whatever this fake peer wants A to
/// believe it already has. Used instead of a second real `CephClient` so the
/// test can pick the exact moment the first connection dies.
fn handshake_as_target(stream: &mut TcpStream, global_seq: u32, in_seq_acked: u64) {
    stream.write_all(BANNER).unwrap();
    let mut banner = vec![0u8; BANNER.len()];
    stream.read_exact(&mut banner).unwrap();
    assert_eq!(banner, BANNER);

    let (tag, payload) = read_frame(stream);
    assert_eq!(tag, FrameTag::Connect as u8);
    let connect = decode_connect_frame(&payload).expect("malformed CONNECT payload");

    let reply_msg = ConnectReplyMsg { global_seq, connect_seq: connect.connect_seq, in_seq_acked };
    let payload = encode_connect_reply_frame(ConnectReply::Ready, &reply_msg);
    write_frame(stream, FrameTag::ConnectReply as u8, &payload);
}

/// Scenario 2 (§8): a transient socket fault on a lossless connection must
/// re-send exactly the un-acked tail of `out_sent`, and the peer (who already
/// saw the messages that made it through before the drop) must dispatch the
/// new arrivals exactly once. This plays the fixed side of A (`fault`/
/// `drive_reconnects` preserving `out_sent`/`out_queue` across the backoff
/// window) against a hand-rolled peer so the test can choose precisely when
/// the first connection dies and what `in_seq_acked` the reconnect reply
/// carries, matching the worked numbers `m3,m4,m5` resent / `m4,m5` dispatched.
#[test]
fn transient_disconnect_resends_unacked_tail_exactly_once() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let fake_peer = thread::spawn(move || {
        let (mut first, _) = listener.accept().unwrap();
        first.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        handshake_as_target(&mut first, 1, 0);

        // Read m1..m3, acking m2; the connection dies before m3 is acked and
        // before m4/m5 (already in flight from A) are ever read.
        let mut first_seen = Vec::new();
        while first_seen.len() < 3 {
            let (tag, payload) = read_frame(&mut first);
            if tag != FrameTag::Msg as u8 {
                continue;
            }
            let msg = decode_message(&payload).expect("malformed MSG payload");
            first_seen.push(msg.header.seq);
            if msg.header.seq == 2 {
                write_frame(&mut first, FrameTag::Ack as u8, &encode_ack_frame(2));
            }
        }
        drop(first);

        // A notices the drop, backs off, and redials. Report that we only
        // ever acked up to seq 2, so A resends everything after that.
        let (mut second, _) = listener.accept().unwrap();
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        handshake_as_target(&mut second, 2, 2);

        // `in_seq` already sits at 3 from the first connection: m3 arrives
        // again but must be dropped as a duplicate, not re-dispatched.
        let mut in_seq = 3u64;
        let mut redelivered = Vec::new();
        while redelivered.len() < 2 {
            let (tag, payload) = read_frame(&mut second);
            if tag != FrameTag::Msg as u8 {
                continue;
            }
            let msg = decode_message(&payload).expect("malformed MSG payload");
            if msg.header.seq <= in_seq {
                continue;
            }
            in_seq = msg.header.seq;
            redelivered.push(msg.header.seq);
        }

        (first_seen, redelivered)
    });

    let config = ClientConfig {
        mon_addrs: vec![addr],
        backoff_base: "10ms".to_string(),
        backoff_max: "40ms".to_string(),
        ..ClientConfig::default()
    };
    let mut client_a = CephClient::initialize(config).unwrap();
    let peer = client_a.connect_mon().unwrap();
    let server_identity = Identity::new(EntityType::Mon, 0, addr);

    for i in 1..=5u16 {
        let msg = Message::new(client_a.identity(), server_identity, i, format!("payload-{i}").into_bytes());
        let _ = client_a.send(peer, msg);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline && !fake_peer.is_finished() {
        let _ = client_a.poll(Some(Duration::from_millis(20)));
    }

    assert!(fake_peer.is_finished(), "fake peer never observed the resend within the deadline");
    let (first_seen, redelivered) = fake_peer.join().unwrap();
    assert_eq!(first_seen, vec![1, 2, 3], "peer should see m1..m3 before the drop");
    assert_eq!(redelivered, vec![4, 5], "reconnect must resend m3..m5 but dedup m3, dispatching only m4,m5");
}
