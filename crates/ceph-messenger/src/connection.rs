use std::collections::VecDeque;

use ceph_timing::{Backoff, Duration, Instant, Repeater};
use tracing::{debug, warn};

use crate::{
    entity::Identity,
    error::ConnectionError,
    message::{Message, MessageHeader},
    state::{ConnFlags, ConnState},
    wire::ConnectReply,
};

/// Capability set supplied by the connection's owner (§6, "connection operations").
///
/// `get`/`put` are reference counting on the opaque owner handle and are left to
/// the owner's own `Clone`/`Drop`; everything else is a callback invoked at a
/// specific point in the protocol state machine.
pub trait ConnectionOps {
    /// A successfully framed, CRC-verified message arrived from `peer`.
    fn dispatch(&mut self, peer: &Identity, msg: Message);

    /// `peer` replied `RESETSESSION`: it has no memory of this session.
    fn peer_reset(&mut self, peer: &Identity);

    /// Header received, body not yet read. The returned message is the
    /// destination the body is assembled into before `dispatch` (§4.5);
    /// `None` means the body is still consumed off the wire but the message
    /// is discarded rather than dispatched.
    fn alloc_msg(&mut self, peer: &Identity, hdr: &MessageHeader) -> Option<Message>;

    /// Middle section declared in `hdr` (§6). `Err` discards the message the
    /// same way a `None` from `alloc_msg` would. Most owners never see a
    /// middle section and can rely on the default.
    fn alloc_middle(&mut self, peer: &Identity, hdr: &MessageHeader) -> Result<(), ConnectionError> {
        let (_, _) = (peer, hdr);
        Ok(())
    }

    /// Data section declared in `hdr`: `want` is `hdr.data_len` (§6). `Err`
    /// discards the message the same way a `None` from `alloc_msg` would.
    fn prepare_pages(&mut self, peer: &Identity, hdr: &MessageHeader, want: usize) -> Result<(), ConnectionError> {
        let (_, _, _) = (peer, hdr, want);
        Ok(())
    }
}

/// Per-peer session state: queues, sequence counters, and the primary/flag state
/// machine. Owns no socket; the `tcp` module drives bytes through it.
pub struct Connection {
    pub peer: Identity,
    pub state: ConnState,
    pub flags: ConnFlags,

    /// Messages assigned a `seq` but not yet handed to the send cursor.
    pub out_queue: VecDeque<Message>,
    /// Messages handed to the send cursor, awaiting the peer's ack.
    pub out_sent: VecDeque<Message>,
    /// Last sequence number assigned to an outgoing message.
    pub out_seq: u64,

    /// Highest sequence number dispatched so far.
    pub in_seq: u64,
    /// Highest sequence number the peer has been told we received.
    pub in_seq_acked: u64,

    /// Local attempt counter for this (local, peer) pair.
    pub connect_seq: u32,
    /// Most recently observed value of the peer's `global_seq`.
    pub peer_global_seq: u32,

    pub backoff: Backoff,

    /// Last time any frame was received from the peer, including `KEEPALIVE`
    /// and `KEEPALIVE_ACK` (§4.9): any traffic counts as a liveness signal.
    pub last_rx: Instant,
    /// Paces outbound `KEEPALIVE` frames (§4.9).
    pub keepalive: Repeater,
    /// `last_rx.elapsed() > keepalive_timeout` faults the connection (§4.9, §7).
    pub keepalive_timeout: Duration,
}

/// Default interval between outbound keepalives (§4.9).
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Default liveness timeout; a little over `DEFAULT_KEEPALIVE_INTERVAL` so a
/// single delayed keepalive round-trip does not spuriously fault (§4.9).
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);

impl Connection {
    pub fn new(peer: Identity, lossy: bool) -> Self {
        let mut flags = ConnFlags::empty();
        if lossy {
            flags.insert(ConnFlags::LOSSYTX | ConnFlags::LOSSYRX);
        }
        Self {
            peer,
            state: ConnState::New,
            flags,
            out_queue: VecDeque::new(),
            out_sent: VecDeque::new(),
            out_seq: 0,
            in_seq: 0,
            in_seq_acked: 0,
            connect_seq: 0,
            peer_global_seq: 0,
            backoff: Backoff::default(),
            last_rx: Instant::now(),
            keepalive: Repeater::every(DEFAULT_KEEPALIVE_INTERVAL),
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }

    /// Records that a frame of any kind just arrived (§4.9).
    pub fn note_rx(&mut self) {
        self.last_rx = Instant::now();
    }

    /// Whether it is time to send another `KEEPALIVE` (§4.9).
    pub fn keepalive_due(&mut self) -> bool {
        self.state == ConnState::Open && self.keepalive.fired()
    }

    /// Whether the peer has gone quiet for longer than `keepalive_timeout`
    /// (§4.9, §7).
    pub fn keepalive_timed_out(&self) -> bool {
        self.state == ConnState::Open && self.last_rx.elapsed() > self.keepalive_timeout
    }

    /// Overrides the keepalive interval/timeout pair, e.g. from a
    /// deployment's `ClientConfig` (§4.9).
    pub fn set_keepalive(&mut self, interval: Duration, timeout: Duration) {
        self.keepalive.set_interval(interval);
        self.keepalive_timeout = timeout;
    }

    #[inline]
    pub fn is_lossy(&self) -> bool {
        self.flags.contains(ConnFlags::LOSSYTX)
    }

    /// `ceph_con_send`: assigns the next sequence number and queues the message
    /// for the send path (§4.4). Transitions `NEW -> CONNECTING` is the caller's
    /// responsibility once it has opened a socket.
    pub fn queue_send(&mut self, mut msg: Message) {
        self.out_seq += 1;
        msg.header.seq = self.out_seq;
        ceph_utils::safe_assert!(
            self.out_sent.back().is_none_or(|m| m.header.seq < msg.header.seq),
            "out_seq assigned out of order: {} after {:?}",
            msg.header.seq,
            self.out_sent.back().map(|m| m.header.seq)
        );
        self.out_queue.push_back(msg);
        self.flags.insert(ConnFlags::WRITE_PENDING);
    }

    /// Moves the front of `out_queue` to `out_sent`, sealing its CRCs, ready for
    /// the send cursor to serialise. Returns `None` once the queue is drained.
    pub fn next_to_send(&mut self) -> Option<Message> {
        let mut msg = self.out_queue.pop_front()?;
        msg.seal();
        self.out_sent.push_back(msg.clone());
        if self.out_queue.is_empty() {
            self.flags.remove(ConnFlags::WRITE_PENDING);
        }
        Some(msg)
    }

    /// An ACK with sequence `s` arrived: releases every `out_sent` message with
    /// `seq <= s` (§4.5).
    pub fn on_ack(&mut self, acked: u64) {
        while let Some(front) = self.out_sent.front() {
            if front.header.seq <= acked {
                self.out_sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether an ACK is owed to the peer and, if so, what sequence to ack.
    pub fn pending_ack(&self) -> Option<u64> {
        (self.in_seq > self.in_seq_acked).then_some(self.in_seq)
    }

    pub fn mark_acked(&mut self, seq: u64) {
        self.in_seq_acked = seq;
    }

    /// Processes a fully framed, CRC-verified inbound message. `alloc_msg` gates
    /// whether the owner wants this message at all and supplies the destination
    /// it is assembled into; `alloc_middle`/`prepare_pages` gate the middle/data
    /// sections the same way (§6). Duplicates (`seq <= in_seq`) are then
    /// silently dropped, matching replay semantics across reconnects (§4.5, §8
    /// reconnect-idempotence law).
    pub fn on_message<O: ConnectionOps>(&mut self, msg: Message, owner: &mut O) {
        let Some(mut dest) = owner.alloc_msg(&self.peer, &msg.header) else {
            debug!(seq = msg.header.seq, "owner declined message, discarding");
            return;
        };
        if msg.header.middle_len > 0 {
            if let Err(err) = owner.alloc_middle(&self.peer, &msg.header) {
                warn!(seq = msg.header.seq, %err, "owner rejected middle section, discarding message");
                return;
            }
        }
        if msg.header.data_len > 0 {
            if let Err(err) = owner.prepare_pages(&self.peer, &msg.header, msg.header.data_len as usize) {
                warn!(seq = msg.header.seq, %err, "owner rejected data pages, discarding message");
                return;
            }
        }
        if msg.header.seq <= self.in_seq {
            debug!(seq = msg.header.seq, in_seq = self.in_seq, "dropping duplicate message");
            return;
        }
        self.in_seq = msg.header.seq;
        dest.header = msg.header;
        dest.footer = msg.footer;
        dest.front = msg.front;
        dest.middle = msg.middle;
        dest.data = msg.data;
        owner.dispatch(&self.peer, dest);
    }

    /// Begins an outbound connection attempt: `NEW -> CONNECTING`.
    pub fn begin_connecting(&mut self) {
        self.state = ConnState::Connecting;
        self.connect_seq += 1;
    }

    /// Applies a connect reply received while `CONNECTING`. Returns `true` if the
    /// connection is now usable (`OPEN`) and the caller should flush `out_queue`.
    pub fn handle_connect_reply<O: ConnectionOps>(
        &mut self,
        reply: ConnectReply,
        their_global_seq: u32,
        their_connect_seq: u32,
        peer_last_acked: u64,
        owner: &mut O,
    ) -> bool {
        match reply {
            ConnectReply::Ready => {
                self.peer_global_seq = their_global_seq;
                self.connect_seq = their_connect_seq;
                self.state = ConnState::Open;
                self.backoff.reset();
                self.note_rx();
                self.keepalive.reset();
                if !self.is_lossy() {
                    self.requeue_unacked(peer_last_acked);
                }
                true
            }
            ConnectReply::RetryGlobal => {
                self.peer_global_seq = their_global_seq.max(self.peer_global_seq) + 1;
                self.state = ConnState::Connecting;
                false
            }
            ConnectReply::RetrySession => {
                self.connect_seq = their_connect_seq;
                self.state = ConnState::Connecting;
                false
            }
            ConnectReply::Wait => {
                self.state = ConnState::Wait;
                false
            }
            ConnectReply::ResetSession => {
                self.apply_session_reset(owner);
                self.state = ConnState::Connecting;
                false
            }
            ConnectReply::BadProtoVer | ConnectReply::BadAuthorizer => {
                warn!(peer = %self.peer, ?reply, "connect refused permanently");
                self.state = ConnState::Closed;
                false
            }
        }
    }

    /// Re-queues every `out_sent` message the peer has not acked yet, preserving
    /// original sequence numbers so the peer's `in_seq` dedup still applies
    /// (§4.2 lossless connections).
    fn requeue_unacked(&mut self, peer_last_acked: u64) {
        let mut still_sent = VecDeque::with_capacity(self.out_sent.len());
        while let Some(msg) = self.out_sent.pop_front() {
            if msg.header.seq > peer_last_acked {
                still_sent.push_back(msg);
            }
        }
        for msg in still_sent.into_iter().rev() {
            self.out_queue.push_front(msg);
        }
        if !self.out_queue.is_empty() {
            self.flags.insert(ConnFlags::WRITE_PENDING);
        }
    }

    /// `RESETSESSION`: drop `out_sent`, zero both sequence counters, and notify
    /// the owner (§4.2, §7). Not reported to the caller as an error.
    pub fn apply_session_reset<O: ConnectionOps>(&mut self, owner: &mut O) {
        self.out_sent.clear();
        self.in_seq = 0;
        self.out_seq = 0;
        self.in_seq_acked = 0;
        owner.peer_reset(&self.peer);
    }

    /// A transport fault occurred. Lossy connections close permanently and drop
    /// everything queued; lossless connections fall back to `CONNECTING` and
    /// schedule a backoff-delayed reconnect (§4.3, §7).
    pub fn fault(&mut self) {
        if self.is_lossy() {
            self.out_queue.clear();
            self.out_sent.clear();
            self.state = ConnState::Closed;
            self.flags.insert(ConnFlags::SOCK_CLOSED);
        } else {
            self.state = ConnState::Connecting;
        }
    }

    /// Delay before the next reconnect attempt, advancing the backoff state.
    pub fn next_backoff_delay(&mut self) -> ceph_timing::Duration {
        self.backoff.next_delay()
    }

    /// `ceph_con_close`. For `LOSSYTX` connections this drops `out_queue` and
    /// `out_sent` (§4.2).
    pub fn close(&mut self) {
        if self.is_lossy() {
            self.out_queue.clear();
            self.out_sent.clear();
        }
        self.state = ConnState::Closed;
    }

    /// Connect-race tiebreaker: the side whose address compares lower replies
    /// `WAIT` and waits for the other side's connect (§4.2).
    pub fn resolve_connect_race(&self, our_addr: &std::net::SocketAddr) -> ConnectReply {
        if crate::entity::addr_must_defer(our_addr, &self.peer.addr) {
            ConnectReply::Wait
        } else {
            ConnectReply::Ready
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::entity::EntityType;

    struct RecordingOwner {
        dispatched: Vec<u64>,
        resets: u32,
        accept: bool,
        reject_middle: bool,
        reject_data: bool,
    }

    impl ConnectionOps for RecordingOwner {
        fn dispatch(&mut self, _peer: &Identity, msg: Message) {
            self.dispatched.push(msg.header.seq);
        }

        fn peer_reset(&mut self, _peer: &Identity) {
            self.resets += 1;
        }

        fn alloc_msg(&mut self, _peer: &Identity, _hdr: &MessageHeader) -> Option<Message> {
            // A distinct placeholder (seq 0, type 0) so tests can tell whether
            // `on_message` actually dispatches this destination or the raw
            // wire-decoded message it was supposed to be assembled into.
            self.accept.then(|| Message::new(peer(), peer(), 0, vec![]))
        }

        fn alloc_middle(&mut self, _peer: &Identity, _hdr: &MessageHeader) -> Result<(), ConnectionError> {
            if self.reject_middle { Err(ConnectionError::Protocol("middle rejected")) } else { Ok(()) }
        }

        fn prepare_pages(&mut self, _peer: &Identity, _hdr: &MessageHeader, _want: usize) -> Result<(), ConnectionError> {
            if self.reject_data { Err(ConnectionError::Protocol("data rejected")) } else { Ok(()) }
        }
    }

    fn peer() -> Identity {
        Identity::new(EntityType::Osd, 0, "10.0.0.2:6800".parse::<SocketAddr>().unwrap())
    }

    fn msg(seq: u64) -> Message {
        let mut m = Message::new(peer(), peer(), 1, vec![]);
        m.header.seq = seq;
        m
    }

    #[test]
    fn out_sent_never_exceeds_out_seq() {
        let mut conn = Connection::new(peer(), false);
        for _ in 0..3 {
            conn.queue_send(Message::new(peer(), peer(), 1, vec![]));
        }
        while let Some(_m) = conn.next_to_send() {}
        assert!(conn.out_sent.iter().all(|m| m.header.seq <= conn.out_seq));
        assert_eq!(conn.out_seq, 3);
    }

    #[test]
    fn duplicate_messages_are_dropped() {
        let mut conn = Connection::new(peer(), false);
        let mut owner = RecordingOwner { dispatched: vec![], resets: 0, accept: true, reject_middle: false, reject_data: false };
        conn.on_message(msg(1), &mut owner);
        conn.on_message(msg(2), &mut owner);
        conn.on_message(msg(1), &mut owner);
        assert_eq!(owner.dispatched, vec![1, 2]);
        assert_eq!(conn.in_seq, 2);
    }

    /// The object `dispatch` receives is the one `alloc_msg` allocated, with
    /// the wire-decoded sections copied into it — not the raw parsed message
    /// bypassing that allocation (§4.5).
    #[test]
    fn dispatch_receives_wire_front_copied_into_allocated_destination() {
        struct FrontCapturingOwner {
            captured: Vec<Vec<u8>>,
        }
        impl ConnectionOps for FrontCapturingOwner {
            fn dispatch(&mut self, _peer: &Identity, msg: Message) {
                self.captured.push(msg.front.to_vec());
            }
            fn peer_reset(&mut self, _peer: &Identity) {}
            fn alloc_msg(&mut self, _peer: &Identity, _hdr: &MessageHeader) -> Option<Message> {
                Some(Message::new(peer(), peer(), 0, vec![0xAA]))
            }
        }
        let mut conn = Connection::new(peer(), false);
        let mut owner = FrontCapturingOwner { captured: vec![] };
        let mut wire_msg = msg(1);
        wire_msg.front = vec![1, 2, 3].into();
        conn.on_message(wire_msg, &mut owner);
        assert_eq!(owner.captured, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn rejected_middle_section_discards_message() {
        let mut conn = Connection::new(peer(), false);
        let mut owner = RecordingOwner { dispatched: vec![], resets: 0, accept: true, reject_middle: true, reject_data: false };
        let mut m = msg(1);
        m.header.middle_len = 4;
        conn.on_message(m, &mut owner);
        assert!(owner.dispatched.is_empty());
        assert_eq!(conn.in_seq, 0);
    }

    #[test]
    fn rejected_data_section_discards_message() {
        let mut conn = Connection::new(peer(), false);
        let mut owner = RecordingOwner { dispatched: vec![], resets: 0, accept: true, reject_middle: false, reject_data: true };
        let mut m = msg(1);
        m.header.data_len = 4096;
        conn.on_message(m, &mut owner);
        assert!(owner.dispatched.is_empty());
        assert_eq!(conn.in_seq, 0);
    }

    #[test]
    fn declined_alloc_msg_is_not_dispatched() {
        let mut conn = Connection::new(peer(), false);
        let mut owner = RecordingOwner { dispatched: vec![], resets: 0, accept: false, reject_middle: false, reject_data: false };
        conn.on_message(msg(1), &mut owner);
        assert!(owner.dispatched.is_empty());
        assert_eq!(conn.in_seq, 0);
    }

    #[test]
    fn ack_releases_out_sent_up_to_seq() {
        let mut conn = Connection::new(peer(), false);
        for _ in 0..5 {
            conn.queue_send(Message::new(peer(), peer(), 1, vec![]));
        }
        while conn.next_to_send().is_some() {}
        conn.on_ack(2);
        assert_eq!(conn.out_sent.len(), 3);
        assert!(conn.out_sent.iter().all(|m| m.header.seq > 2));
    }

    #[test]
    fn reset_session_drops_out_sent_and_notifies_owner() {
        let mut conn = Connection::new(peer(), false);
        let mut owner = RecordingOwner { dispatched: vec![], resets: 0, accept: true, reject_middle: false, reject_data: false };
        conn.queue_send(Message::new(peer(), peer(), 1, vec![]));
        conn.next_to_send();
        conn.in_seq = 4;
        conn.apply_session_reset(&mut owner);
        assert!(conn.out_sent.is_empty());
        assert_eq!(conn.in_seq, 0);
        assert_eq!(owner.resets, 1);
    }

    #[test]
    fn keepalive_not_due_or_timed_out_before_open() {
        let mut conn = Connection::new(peer(), false);
        assert!(!conn.keepalive_due());
        assert!(!conn.keepalive_timed_out());
    }

    #[test]
    fn keepalive_timeout_requires_open_state() {
        let mut conn = Connection::new(peer(), false);
        conn.state = ConnState::Open;
        conn.keepalive_timeout = ceph_timing::Duration::ZERO;
        assert!(conn.keepalive_timed_out());
        conn.state = ConnState::Connecting;
        assert!(!conn.keepalive_timed_out());
    }

    #[test]
    fn note_rx_resets_the_liveness_clock() {
        let mut conn = Connection::new(peer(), false);
        conn.state = ConnState::Open;
        conn.keepalive_timeout = ceph_timing::Duration::ZERO;
        assert!(conn.keepalive_timed_out());
        conn.note_rx();
        conn.keepalive_timeout = ceph_timing::Duration::from_secs(60);
        assert!(!conn.keepalive_timed_out());
    }

    #[test]
    fn lossy_fault_closes_permanently_and_drops_queues() {
        let mut conn = Connection::new(peer(), true);
        conn.queue_send(Message::new(peer(), peer(), 1, vec![]));
        conn.fault();
        assert_eq!(conn.state, ConnState::Closed);
        assert!(conn.out_queue.is_empty());
    }

    #[test]
    fn lossless_fault_falls_back_to_connecting() {
        let mut conn = Connection::new(peer(), false);
        conn.queue_send(Message::new(peer(), peer(), 1, vec![]));
        conn.fault();
        assert_eq!(conn.state, ConnState::Connecting);
        assert_eq!(conn.out_queue.len(), 1);
    }

    #[test]
    fn lower_address_side_waits() {
        let mut conn = Connection::new(peer(), false);
        conn.peer = peer();
        let higher_local: SocketAddr = "10.0.0.5:6800".parse().unwrap();
        assert_eq!(conn.resolve_connect_race(&higher_local), ConnectReply::Ready);
        let lower_local: SocketAddr = "10.0.0.1:6800".parse().unwrap();
        assert_eq!(conn.resolve_connect_race(&lower_local), ConnectReply::Wait);
    }
}
