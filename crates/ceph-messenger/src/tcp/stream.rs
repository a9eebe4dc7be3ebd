use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Registry, Token, event::Event};
use tracing::{debug, warn};

/// Tag byte prefix.
const TAG_SIZE: usize = 1;
/// Frame length prefix (payload length, not including tag or length fields).
const LEN_HEADER_SIZE: usize = core::mem::size_of::<u32>();
const FRAME_HEADER_SIZE: usize = TAG_SIZE + LEN_HEADER_SIZE;
const RX_BUF_SIZE: usize = 32 * 1024;

/// Response type for all external calls: `Disconnected` means the peer is gone
/// and the caller must tear down and, for lossless peers, schedule a reconnect.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

/// A raw frame pulled off the wire: tag byte plus payload.
pub struct RawFrame<'a> {
    pub tag: u8,
    pub payload: &'a [u8],
}

enum ReadOutcome<'a> {
    FrameDone { tag: u8, payload: &'a [u8] },
    WouldBlock,
    Disconnected,
}

#[derive(Clone, Copy)]
enum RxState {
    ReadingHeader { buf: [u8; FRAME_HEADER_SIZE], have: usize },
    ReadingPayload { tag: u8, msg_len: usize, offset: usize },
}

/// Non-blocking, mio-backed byte transport for tag-prefixed frames:
///   - 1-byte tag
///   - 4-byte LE payload length
///   - payload bytes
///
/// This is purely a byte mover; frame *meaning* (MSG/ACK/KEEPALIVE/CLOSE, and
/// everything inside a MSG payload) belongs to [`crate::connection::Connection`]
/// and [`crate::wire`]. Partial reads/writes are resumed transparently; writes
/// that would block are copied into a backlog and flushed on the next
/// writable event.
pub struct TcpStream {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    /// Token this stream is registered under. Needed to reregister interest
    /// (mio requires the original token on every reregister call).
    token: Token,

    rx_state: RxState,
    rx_buf: Vec<u8>,
    header_buf: [u8; FRAME_HEADER_SIZE],
    send_buf: Vec<u8>,
    send_backlog: VecDeque<Vec<u8>>,

    /// Invariant: `writable_armed == !send_backlog.is_empty()`
    writable_armed: bool,
}

impl TcpStream {
    pub const SEND_BUF_SIZE: usize = 32 * 1024;

    pub(crate) fn from_stream(
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        token: Token,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        set_socket_buf_size(&stream, Self::SEND_BUF_SIZE);
        Ok(Self {
            stream,
            peer_addr,
            token,
            rx_state: RxState::ReadingHeader { buf: [0; FRAME_HEADER_SIZE], have: 0 },
            rx_buf: vec![0; RX_BUF_SIZE],
            header_buf: [0; FRAME_HEADER_SIZE],
            send_buf: vec![0; Self::SEND_BUF_SIZE],
            send_backlog: VecDeque::with_capacity(16),
            writable_armed: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Polls the socket and invokes `on_frame` for each fully assembled frame.
    /// `payload` is only valid for the duration of the callback.
    pub fn poll_with<F>(&mut self, registry: &Registry, ev: &Event, on_frame: &mut F) -> ConnState
    where
        F: for<'a> FnMut(Token, RawFrame<'a>),
    {
        self.poll_with_readiness(registry, ev.is_readable(), ev.is_writable(), on_frame)
    }

    /// Same as [`Self::poll_with`] but takes raw readiness bits instead of a
    /// `mio::event::Event`, for callers (like a multi-peer driver) that have
    /// already demultiplexed an `Events` batch into per-token booleans and
    /// have no `Event` of their own to hand back.
    pub fn poll_with_readiness<F>(
        &mut self,
        registry: &Registry,
        readable: bool,
        writable: bool,
        on_frame: &mut F,
    ) -> ConnState
    where
        F: for<'a> FnMut(Token, RawFrame<'a>),
    {
        if readable {
            loop {
                match self.read_frame() {
                    ReadOutcome::FrameDone { tag, payload } => on_frame(self.token, RawFrame { tag, payload }),
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Disconnected => return ConnState::Disconnected,
                }
            }
        }

        if writable && self.drain_backlog(registry) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    /// Writes a tag-prefixed frame immediately, or enqueues it if the write
    /// would block or a backlog is already draining.
    pub fn write_frame(&mut self, registry: &Registry, tag: u8, payload: &[u8]) -> ConnState {
        self.send_buf.clear();
        self.send_buf.extend_from_slice(payload);
        self.header_buf[0] = tag;
        self.header_buf[TAG_SIZE..FRAME_HEADER_SIZE]
            .copy_from_slice(&(self.send_buf.len() as u32).to_le_bytes());

        let len = self.send_buf.len();

        if !self.send_backlog.is_empty() {
            self.enqueue_back(registry, self.header_buf.to_vec());
            return self.enqueue_back(registry, self.send_buf[..len].to_vec());
        }

        match self
            .stream
            .write_vectored(&[IoSlice::new(&self.header_buf), IoSlice::new(&self.send_buf[..len])])
        {
            Ok(0) => {
                warn!("tcp: stream failed to write, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == len + FRAME_HEADER_SIZE => ConnState::Alive,
            Ok(n) if n < FRAME_HEADER_SIZE => {
                let data = self.send_buf[..len].to_vec();
                self.enqueue_front(registry, data);
                let header_rest = self.header_buf[n..FRAME_HEADER_SIZE].to_vec();
                self.enqueue_front(registry, header_rest)
            }
            Ok(n) => {
                let data = self.send_buf[n - FRAME_HEADER_SIZE..len].to_vec();
                self.enqueue_front(registry, data)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue_back(registry, self.header_buf.to_vec());
                self.enqueue_back(registry, self.send_buf[..len].to_vec())
            }
            Err(err) => {
                warn!(?err, "tcp: stream write fail");
                ConnState::Disconnected
            }
        }
    }

    /// Blocking convenience used only during the banner/connect handshake,
    /// before the stream is registered for readiness-driven framing.
    pub fn write_all_blocking(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)
    }

    pub fn read_exact_blocking(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf)
    }

    fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "tcp: write from backlog");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE) {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    fn read_frame(&mut self) -> ReadOutcome<'_> {
        loop {
            match self.rx_state {
                RxState::ReadingHeader { mut buf, mut have } => {
                    while have < FRAME_HEADER_SIZE {
                        match self.stream.read(&mut buf[have..]) {
                            Ok(0) => return ReadOutcome::Disconnected,
                            Ok(n) => {
                                have += n;
                                if have == FRAME_HEADER_SIZE {
                                    let tag = buf[0];
                                    let msg_len = u32::from_le_bytes(
                                        buf[TAG_SIZE..FRAME_HEADER_SIZE].try_into().unwrap(),
                                    ) as usize;
                                    if msg_len > self.rx_buf.len() {
                                        debug!(need_len = msg_len, "tcp: rx buffer resized");
                                        self.rx_buf.resize(msg_len, 0);
                                    }
                                    self.rx_state = RxState::ReadingPayload { tag, msg_len, offset: 0 };
                                }
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingHeader { buf, have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "tcp: read header");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                }

                RxState::ReadingPayload { tag, msg_len, mut offset } => {
                    while offset < msg_len {
                        match self.stream.read(&mut self.rx_buf[offset..msg_len]) {
                            Ok(0) => return ReadOutcome::Disconnected,
                            Ok(n) => {
                                offset += n;
                                if offset == msg_len {
                                    self.rx_state = RxState::ReadingHeader {
                                        buf: [0; FRAME_HEADER_SIZE],
                                        have: 0,
                                    };
                                    return ReadOutcome::FrameDone { tag, payload: &self.rx_buf[..msg_len] };
                                }
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingPayload { tag, msg_len, offset };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "tcp: read payload");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                }
            }
        }
    }

    fn enqueue_front(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_front(data);
        self.arm_writable(registry)
    }

    fn enqueue_back(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: poll reregister");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!("terminating connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.peer_addr
    }
}

pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
