//! Process-wide driver: owns the `mio::Poll`, multiplexes many [`Connection`]s
//! over non-blocking TCP, and drives the banner/connect handshake that a bare
//! `Connection` cannot perform on its own (it has no socket).
//!
//! The handshake (banner exchange, `Connect`/`ConnectReply` frames) is done
//! with blocking reads/writes on the still-unregistered stream, per
//! [`TcpStream::write_all_blocking`]; only once a peer reaches `Open` is its
//! stream registered for readiness-driven framing.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    time::Duration as StdDuration,
};

use ceph_timing::Instant;
use mio::{Events, Interest, Poll, Token, net::TcpListener};
use tracing::{debug, warn};

use crate::{
    connection::{Connection, ConnectionOps},
    entity::Identity,
    error::{ConnectionError, Result},
    message::{Message, MessageHeader, decode_message, encode_message},
    state::ConnState as SessionState,
    tcp::{ConnState as StreamConnState, RawFrame, TcpStream},
    wire::{
        CONNECT_FLAG_LOSSY, ConnectMsg, ConnectReply, ConnectReplyMsg, FrameTag,
        decode_ack_frame, decode_connect_frame, decode_connect_reply_frame, encode_ack_frame,
        encode_connect_frame, encode_connect_reply_frame,
    },
};

/// Token identifying one peer connection inside a [`Messenger`]. A
/// fault-and-backoff reconnect mints a fresh socket and a fresh `PeerToken`;
/// callers learn the new one from the `Connected` event the retry produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerToken(Token);

impl std::fmt::Display for PeerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0.0)
    }
}

/// What [`Messenger::poll`] hands back for the caller to act on.
#[derive(Debug)]
pub enum MessengerEvent {
    /// A connection finished its handshake and is ready to carry traffic.
    Connected { peer: PeerToken, identity: Identity },
    /// A fully framed, deduplicated message arrived.
    Message { peer: PeerToken, msg: Message },
    /// The peer sent `RESETSESSION`: sequence counters on both sides are back
    /// to zero and any assumptions about delivered messages must be dropped.
    PeerReset { peer: PeerToken },
    /// The connection's socket closed. Lossless peers are already scheduled
    /// for a backoff-delayed reconnect; lossy peers are gone for good.
    Disconnected { peer: PeerToken },
}

struct PeerEntry {
    conn: Connection,
    stream: Option<TcpStream>,
    addr: SocketAddr,
}

struct PendingReconnect {
    token: Token,
    /// The faulted connection itself, carrying its still-unacked `out_sent`,
    /// queued `out_queue`, and sequence counters across the backoff window so
    /// the handshake that follows can splice them into the new socket instead
    /// of starting from an empty connection (§3.1, §4.2 lossless reconnect).
    conn: Connection,
    not_before: Instant,
}

/// Multiplexes [`Connection`]s for many peers over non-blocking TCP.
///
/// One `Messenger` corresponds to one `ceph_messenger` instance (§6): it owns
/// the process-wide `global_seq` counter and, optionally, a listening socket
/// for inbound connections.
pub struct Messenger {
    identity: Identity,
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    listener_token: Token,
    peers: HashMap<Token, PeerEntry>,
    token_by_peer: HashMap<PeerToken, Token>,
    addr_to_token: HashMap<SocketAddr, Token>,
    pending_reconnect: Vec<PendingReconnect>,
    next_token: usize,
    global_seq: u32,
    collected: Vec<MessengerEvent>,
}

/// Caps the number of times a single `connect()` call will chase
/// `RETRY_GLOBAL`/`RETRY_SESSION`/`WAIT` replies before giving up.
const MAX_HANDSHAKE_ATTEMPTS: u32 = 16;

impl Messenger {
    pub fn new(identity: Identity) -> io::Result<Self> {
        Ok(Self {
            identity,
            poll: Poll::new()?,
            events: Events::with_capacity(128),
            listener: None,
            listener_token: Token(usize::MAX),
            peers: HashMap::new(),
            token_by_peer: HashMap::new(),
            addr_to_token: HashMap::new(),
            pending_reconnect: Vec::new(),
            next_token: 0,
            global_seq: 0,
            collected: Vec::new(),
        })
    }

    /// Opens a listening socket for inbound connections, per the `bind`/accept
    /// side of §4.1.
    pub fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut listener = TcpListener::bind(addr)?;
        let token = self.alloc_token();
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;
        self.listener = Some(listener);
        self.listener_token = token;
        Ok(())
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn next_global_seq(&mut self) -> u32 {
        self.global_seq += 1;
        self.global_seq
    }

    /// Opens an outbound connection to `peer`, running the banner/connect
    /// handshake to completion (§4.1, §4.2). Returns once the connection is
    /// `Open` or has been refused permanently.
    pub fn connect(&mut self, peer: Identity, lossy: bool) -> Result<PeerToken> {
        let mut conn = Connection::new(peer, lossy);
        conn.begin_connecting();
        self.connect_with(conn)
    }

    /// Runs the handshake against an already-constructed `Connection`,
    /// reusing its queues and sequence counters rather than starting from an
    /// empty one. Used both by [`Self::connect`] (a fresh `Connection`) and by
    /// [`Self::drive_reconnects`] (a faulted connection whose `out_sent` must
    /// survive the reconnect).
    fn connect_with(&mut self, mut conn: Connection) -> Result<PeerToken> {
        let token = self.alloc_token();
        let addr = conn.peer.addr;
        let (stream, reply) = self.run_outbound_handshake(&mut conn, token)?;
        self.finish_connect(token, conn, stream, addr, reply)
    }

    fn run_outbound_handshake(
        &mut self,
        conn: &mut Connection,
        token: Token,
    ) -> Result<(TcpStream, ConnectReplyMsg)> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            if attempts > MAX_HANDSHAKE_ATTEMPTS {
                return Err(ConnectionError::Protocol("handshake did not converge"));
            }

            let mio_stream = connect_and_wait(conn.peer.addr)?;
            let mut stream = TcpStream::from_stream(mio_stream, conn.peer.addr, token)?;

            exchange_banner(&mut stream)?;

            let global_seq = self.next_global_seq();
            let msg = ConnectMsg {
                features: 0,
                host_type: self.identity.entity_type as u32,
                global_seq,
                connect_seq: conn.connect_seq,
                flags: if conn.is_lossy() { CONNECT_FLAG_LOSSY } else { 0 },
            };
            write_frame_blocking(&mut stream, FrameTag::Connect as u8, &encode_connect_frame(&msg))?;

            let (tag, payload) = read_frame_blocking(&mut stream)?;
            if FrameTag::from_u8(tag) != Some(FrameTag::ConnectReply) {
                return Err(ConnectionError::Protocol("expected CONNECT_REPLY frame"));
            }
            let (code, reply) = decode_connect_reply_frame(&payload)
                .ok_or(ConnectionError::Protocol("malformed CONNECT_REPLY payload"))?;

            let mut sink = NullOps;
            let ready = conn.handle_connect_reply(
                code,
                reply.global_seq,
                reply.connect_seq,
                reply.in_seq_acked,
                &mut sink,
            );

            match code {
                ConnectReply::Ready => return Ok((stream, reply)),
                ConnectReply::BadProtoVer | ConnectReply::BadAuthorizer => {
                    return Err(ConnectionError::Refused(code));
                }
                ConnectReply::RetryGlobal | ConnectReply::RetrySession => {
                    debug_assert!(!ready);
                    continue;
                }
                ConnectReply::Wait => {
                    std::thread::sleep(StdDuration::from_millis(50));
                    continue;
                }
                ConnectReply::ResetSession => continue,
            }
        }
    }

    fn finish_connect(
        &mut self,
        token: Token,
        conn: Connection,
        mut stream: TcpStream,
        addr: SocketAddr,
        _reply: ConnectReplyMsg,
    ) -> Result<PeerToken> {
        stream.register(self.poll.registry())?;
        let peer_token = PeerToken(token);
        self.peers.insert(token, PeerEntry { conn, stream: Some(stream), addr });
        self.token_by_peer.insert(peer_token, token);
        self.addr_to_token.insert(addr, token);
        // A reconnect may have just requeued unacked `out_sent` messages onto
        // `out_queue` (§4.2 lossless reconnect); get them moving right away
        // rather than waiting for the next caller-initiated `send`.
        self.flush(token)?;
        Ok(peer_token)
    }

    /// Accepts one inbound connection off the listener and runs the responder
    /// side of the handshake. Uses `resolve_connect_race` when we already have
    /// an outbound attempt in flight to the same peer (§4.2).
    fn accept_one(&mut self) -> io::Result<()> {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return Ok(()),
            };
            let (mio_stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };

            if let Err(err) = self.run_inbound_handshake(mio_stream, addr) {
                warn!(%addr, ?err, "inbound handshake failed");
            }
        }
    }

    fn run_inbound_handshake(&mut self, mio_stream: mio::net::TcpStream, addr: SocketAddr) -> io::Result<()> {
        let token = self.alloc_token();
        let mut stream = TcpStream::from_stream(mio_stream, addr, token)?;

        exchange_banner(&mut stream)?;
        let (tag, payload) = read_frame_blocking(&mut stream)?;
        if FrameTag::from_u8(tag) != Some(FrameTag::Connect) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "expected CONNECT frame"));
        }
        let Some(their_connect) = decode_connect_frame(&payload) else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed CONNECT payload"));
        };

        let peer_entity_type = crate::entity::EntityType::Client;
        let peer = Identity::new(peer_entity_type, 0, addr);

        let existing = self.addr_to_token.get(&addr).copied();
        let reply = if let Some(existing_token) = existing {
            if let Some(entry) = self.peers.get(&existing_token) {
                entry.conn.resolve_connect_race(&addr)
            } else {
                ConnectReply::Ready
            }
        } else {
            ConnectReply::Ready
        };

        let global_seq = self.next_global_seq();
        let reply_msg = ConnectReplyMsg {
            global_seq,
            connect_seq: their_connect.connect_seq,
            in_seq_acked: 0,
        };
        write_frame_blocking(
            &mut stream,
            FrameTag::ConnectReply as u8,
            &encode_connect_reply_frame(reply, &reply_msg),
        )?;

        if reply != ConnectReply::Ready {
            return Ok(());
        }

        let lossy = their_connect.flags & CONNECT_FLAG_LOSSY != 0;
        let mut conn = Connection::new(peer, lossy);
        conn.state = SessionState::Open;
        conn.connect_seq = their_connect.connect_seq;
        conn.peer_global_seq = their_connect.global_seq;

        stream.register(self.poll.registry())?;
        let peer_token = PeerToken(token);
        self.peers.insert(token, PeerEntry { conn, stream: Some(stream), addr });
        self.token_by_peer.insert(peer_token, token);
        self.addr_to_token.insert(addr, token);
        self.collected.push(MessengerEvent::Connected { peer: peer_token, identity: peer });
        Ok(())
    }

    /// Queues `msg` for `peer` and flushes whatever is ready to go.
    pub fn send(&mut self, peer: PeerToken, msg: Message) -> Result<()> {
        let token = *self.token_by_peer.get(&peer).ok_or(ConnectionError::Protocol("unknown peer"))?;
        let entry = self.peers.get_mut(&token).ok_or(ConnectionError::Protocol("unknown peer"))?;
        entry.conn.queue_send(msg);
        self.flush(token)
    }

    fn flush(&mut self, token: Token) -> Result<()> {
        let registry = self.poll.registry();
        let Some(entry) = self.peers.get_mut(&token) else { return Ok(()) };
        let Some(stream) = entry.stream.as_mut() else { return Ok(()) };
        while let Some(msg) = entry.conn.next_to_send() {
            let payload = encode_message(&msg);
            if stream.write_frame(registry, FrameTag::Msg as u8, &payload) == StreamConnState::Disconnected {
                self.fault(token);
                return Err(ConnectionError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")));
            }
        }
        if let Some(seq) = entry.conn.pending_ack() {
            if stream.write_frame(registry, FrameTag::Ack as u8, &encode_ack_frame(seq))
                == StreamConnState::Disconnected
            {
                self.fault(token);
                return Err(ConnectionError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")));
            }
            entry.conn.mark_acked(seq);
        }
        Ok(())
    }

    /// Drives the event loop once: accepts new inbound connections, reads and
    /// dispatches framed traffic, retries connections whose backoff has
    /// elapsed, and drains whatever [`MessengerEvent`]s resulted.
    pub fn poll(&mut self, timeout: Option<StdDuration>) -> io::Result<Vec<MessengerEvent>> {
        self.drive_reconnects();
        self.drive_keepalives();

        self.poll.poll(&mut self.events, timeout)?;
        let events: Vec<_> = self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

        for (token, readable, writable) in events {
            if token == self.listener_token {
                self.accept_one()?;
                continue;
            }
            self.service(token, readable, writable);
        }

        Ok(std::mem::take(&mut self.collected))
    }

    /// Sends a due `KEEPALIVE` on every open connection and faults any whose
    /// peer has gone quiet past `keepalive_timeout` (§4.9).
    fn drive_keepalives(&mut self) {
        let due: Vec<Token> = self
            .peers
            .iter_mut()
            .filter(|(_, entry)| entry.conn.keepalive_due())
            .map(|(token, _)| *token)
            .collect();
        for token in due {
            let registry = self.poll.registry();
            if let Some(entry) = self.peers.get_mut(&token) {
                if let Some(stream) = entry.stream.as_mut() {
                    let _ = stream.write_frame(registry, FrameTag::Keepalive as u8, &[]);
                }
            }
        }

        let timed_out: Vec<Token> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.conn.keepalive_timed_out())
            .map(|(token, _)| *token)
            .collect();
        for token in timed_out {
            warn!(peer = %self.peers[&token].conn.peer, "keepalive timeout, faulting connection");
            self.fault(token);
        }
    }

    fn service(&mut self, token: Token, readable: bool, writable: bool) {
        let registry = self.poll.registry();
        let mut frames: Vec<(u8, Vec<u8>)> = Vec::new();
        let outcome = {
            let Some(entry) = self.peers.get_mut(&token) else { return };
            let Some(stream) = entry.stream.as_mut() else { return };
            stream.poll_with_readiness(registry, readable, writable, &mut |_tok, frame: RawFrame<'_>| {
                frames.push((frame.tag, frame.payload.to_vec()));
            })
        };

        for (tag, payload) in frames {
            self.handle_frame(token, tag, &payload);
        }

        if outcome == StreamConnState::Disconnected {
            self.fault(token);
        }
    }

    fn handle_frame(&mut self, token: Token, tag: u8, payload: &[u8]) {
        let Some(frame_tag) = FrameTag::from_u8(tag) else {
            warn!(tag, "unrecognised frame tag, dropping");
            return;
        };

        if let Some(entry) = self.peers.get_mut(&token) {
            entry.conn.note_rx();
        }

        match frame_tag {
            FrameTag::Msg => {
                let Some(msg) = decode_message(payload) else {
                    warn!(err = %ConnectionError::Protocol("malformed MSG payload"), "faulting connection");
                    self.fault(token);
                    return;
                };
                if let Some(section) = msg.first_crc_mismatch() {
                    let err = ConnectionError::CrcMismatch { section };
                    warn!(seq = msg.header.seq, %err, "faulting connection");
                    self.fault(token);
                    return;
                }
                let peer_token = PeerToken(token);
                let mut collector = EventCollector { peer: peer_token, events: &mut self.collected };
                if let Some(entry) = self.peers.get_mut(&token) {
                    entry.conn.on_message(msg, &mut collector);
                }
                self.flush_best_effort(token);
            }
            FrameTag::Ack => {
                let Some(seq) = decode_ack_frame(payload) else { return };
                if let Some(entry) = self.peers.get_mut(&token) {
                    entry.conn.on_ack(seq);
                }
            }
            FrameTag::Keepalive => {
                let registry = self.poll.registry();
                if let Some(entry) = self.peers.get_mut(&token) {
                    if let Some(stream) = entry.stream.as_mut() {
                        let _ = stream.write_frame(registry, FrameTag::KeepaliveAck as u8, &[]);
                    }
                }
            }
            FrameTag::KeepaliveAck => {}
            FrameTag::Close => self.fault(token),
            FrameTag::Connect | FrameTag::ConnectReply => {
                debug!("handshake frame arrived on an established connection, ignoring");
            }
        }
    }

    fn flush_best_effort(&mut self, token: Token) {
        let _ = self.flush(token);
    }

    /// A socket fault: schedules a backoff-delayed reconnect for lossless
    /// peers, drops the entry for lossy ones (§4.3).
    fn fault(&mut self, token: Token) {
        let Some(mut entry) = self.peers.remove(&token) else { return };
        if let Some(mut stream) = entry.stream.take() {
            let _ = stream.close(self.poll.registry());
        }
        entry.conn.fault();

        let peer_token = PeerToken(token);
        self.collected.push(MessengerEvent::Disconnected { peer: peer_token });
        self.addr_to_token.remove(&entry.addr);

        self.token_by_peer.remove(&peer_token);

        if entry.conn.state == SessionState::Connecting {
            let delay = entry.conn.next_backoff_delay();
            self.pending_reconnect.push(PendingReconnect {
                token,
                conn: entry.conn,
                not_before: Instant::now() + delay,
            });
        }
    }

    fn drive_reconnects(&mut self) {
        let now = Instant::now();
        let due: Vec<_> = self
            .pending_reconnect
            .iter()
            .enumerate()
            .filter(|(_, r)| r.not_before <= now)
            .map(|(i, _)| i)
            .collect();

        for &i in due.iter().rev() {
            let reconnect = self.pending_reconnect.swap_remove(i);
            let identity = reconnect.conn.peer;
            let mut conn = reconnect.conn;
            conn.begin_connecting();
            match self.connect_with(conn) {
                Ok(new_peer) => {
                    self.collected.push(MessengerEvent::Connected { peer: new_peer, identity });
                }
                Err(err) => {
                    warn!(peer = %identity, ?err, "reconnect attempt failed, rescheduling");
                    let token = reconnect.token;
                    self.token_by_peer.retain(|_, t| *t != token);
                }
            }
        }
    }

    /// Closes `peer`'s connection, bypassing reconnect (§4.2 `ceph_con_close`).
    pub fn close(&mut self, peer: PeerToken) {
        let Some(token) = self.token_by_peer.remove(&peer) else { return };
        if let Some(mut entry) = self.peers.remove(&token) {
            entry.conn.close();
            if let Some(mut stream) = entry.stream.take() {
                let _ = stream.close(self.poll.registry());
            }
            self.addr_to_token.remove(&entry.addr);
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// The bound listener's local address, e.g. to discover the ephemeral
    /// port chosen after binding to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no listener bound"))?
            .local_addr()
    }

    /// Overrides `peer`'s keepalive interval/timeout pair (§4.9).
    pub fn set_keepalive(&mut self, peer: PeerToken, interval: StdDuration, timeout: StdDuration) {
        let Some(&token) = self.token_by_peer.get(&peer) else { return };
        if let Some(entry) = self.peers.get_mut(&token) {
            entry.conn.set_keepalive(
                ceph_timing::Duration::from_nanos(interval.as_nanos() as u64),
                ceph_timing::Duration::from_nanos(timeout.as_nanos() as u64),
            );
        }
    }

    /// Overrides `peer`'s reconnect backoff bounds (§4.3), e.g. from a
    /// deployment's `ClientConfig`.
    pub fn set_backoff(&mut self, peer: PeerToken, backoff: ceph_timing::Backoff) {
        let Some(&token) = self.token_by_peer.get(&peer) else { return };
        if let Some(entry) = self.peers.get_mut(&token) {
            entry.conn.backoff = backoff;
        }
    }
}

/// Feeds decoded events into the shared collector instead of a per-call
/// owner; the `Messenger` is itself the only long-lived `ConnectionOps`
/// implementor, so it always accepts every message (there is no
/// application-level admission policy at this layer).
struct EventCollector<'a> {
    peer: PeerToken,
    events: &'a mut Vec<MessengerEvent>,
}

impl ConnectionOps for EventCollector<'_> {
    fn dispatch(&mut self, _peer: &Identity, msg: Message) {
        self.events.push(MessengerEvent::Message { peer: self.peer, msg });
    }

    fn peer_reset(&mut self, _peer: &Identity) {
        self.events.push(MessengerEvent::PeerReset { peer: self.peer });
    }

    fn alloc_msg(&mut self, _peer: &Identity, _hdr: &MessageHeader) -> Option<Message> {
        Some(Message::new(self.identity_placeholder(), self.identity_placeholder(), 0, vec![]))
    }
}

impl EventCollector<'_> {
    fn identity_placeholder(&self) -> Identity {
        Identity::new(crate::entity::EntityType::Client, 0, "0.0.0.0:0".parse().unwrap())
    }
}

/// No-op owner used only for the initial handshake's `handle_connect_reply`
/// call, which needs a `ConnectionOps` to satisfy `RESETSESSION` but cannot
/// yet have dispatched anything to lose.
struct NullOps;

impl ConnectionOps for NullOps {
    fn dispatch(&mut self, _peer: &Identity, _msg: Message) {}
    fn peer_reset(&mut self, _peer: &Identity) {}
    fn alloc_msg(&mut self, _peer: &Identity, _hdr: &MessageHeader) -> Option<Message> {
        None
    }
}

/// Opens a non-blocking connection to `addr` and blocks (via a throwaway
/// `Poll`) until it either completes or fails. `TcpStream::connect` returns
/// before the three-way handshake finishes; `connect()`'s own poll loop isn't
/// running yet to tell us when it does.
fn connect_and_wait(addr: SocketAddr) -> io::Result<mio::net::TcpStream> {
    let mut stream = mio::net::TcpStream::connect(addr)?;
    let poll = Poll::new()?;
    let wait_token = Token(0);
    poll.registry().register(&mut stream, wait_token, Interest::WRITABLE)?;
    let mut events = Events::with_capacity(4);
    let deadline = Instant::now() + ceph_timing::Duration::from_secs(10);

    loop {
        let remaining = deadline.saturating_sub(Instant::now());
        if remaining == ceph_timing::Duration::ZERO {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
        }
        poll.poll(&mut events, Some(remaining.into()))?;
        if events.iter().any(|e| e.token() == wait_token) {
            if let Some(err) = stream.take_error()? {
                return Err(err);
            }
            poll.registry().deregister(&mut stream)?;
            return Ok(stream);
        }
    }
}

fn exchange_banner(stream: &mut TcpStream) -> io::Result<()> {
    retry_blocking(|| stream.write_all_blocking(crate::wire::BANNER))?;
    let mut banner = vec![0u8; crate::wire::BANNER.len()];
    retry_blocking(|| stream.read_exact_blocking(&mut banner))?;
    if banner != crate::wire::BANNER {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "banner mismatch"));
    }
    Ok(())
}

fn write_frame_blocking(stream: &mut TcpStream, tag: u8, payload: &[u8]) -> io::Result<()> {
    let mut header = [0u8; 5];
    header[0] = tag;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    retry_blocking(|| stream.write_all_blocking(&header))?;
    retry_blocking(|| stream.write_all_blocking(payload))
}

fn read_frame_blocking(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    retry_blocking(|| stream.read_exact_blocking(&mut header))?;
    let tag = header[0];
    let len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    retry_blocking(|| stream.read_exact_blocking(&mut payload))?;
    Ok((tag, payload))
}

fn retry_blocking<F>(mut f: F) -> io::Result<()>
where
    F: FnMut() -> io::Result<()>,
{
    let deadline = Instant::now() + ceph_timing::Duration::from_secs(10);
    loop {
        match f() {
            Ok(()) => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() > deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake I/O timed out"));
                }
                std::thread::sleep(StdDuration::from_millis(2));
            }
            Err(e) => return Err(e),
        }
    }
}
