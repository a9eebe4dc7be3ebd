//! Wire-level constants and the connect/connect-reply handshake records.
//!
//! All multi-byte integers on the wire are little-endian. Bit-exact tag values
//! are internal to this implementation; only the banner length and the
//! handshake record layout are load-bearing for interop within a deployment.

/// Fixed ASCII token exchanged first by both sides of a new connection.
pub const BANNER: &[u8] = b"ceph v027";
pub const CEPH_BANNER_MAX_LEN: usize = 30;

/// Single-byte tag prefixing every frame on the stream, including the
/// handshake records (modeled as frames rather than a separate raw-byte
/// exchange so the whole protocol flows through one framer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    Connect = 0,
    Msg = 1,
    Ack = 2,
    Keepalive = 3,
    KeepaliveAck = 4,
    Close = 5,
    ConnectReply = 6,
}

impl FrameTag {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Connect),
            1 => Some(Self::Msg),
            2 => Some(Self::Ack),
            3 => Some(Self::Keepalive),
            4 => Some(Self::KeepaliveAck),
            5 => Some(Self::Close),
            6 => Some(Self::ConnectReply),
            _ => None,
        }
    }
}

/// Reply code sent by the target of a connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReply {
    Ready = 0,
    BadProtoVer = 1,
    BadAuthorizer = 2,
    ResetSession = 3,
    Wait = 4,
    RetrySession = 5,
    RetryGlobal = 6,
}

impl ConnectReply {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Ready),
            1 => Some(Self::BadProtoVer),
            2 => Some(Self::BadAuthorizer),
            3 => Some(Self::ResetSession),
            4 => Some(Self::Wait),
            5 => Some(Self::RetrySession),
            6 => Some(Self::RetryGlobal),
            _ => None,
        }
    }
}

/// Sent by the initiator immediately after the banner exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ConnectMsg {
    pub features: u64,
    pub host_type: u32,
    pub global_seq: u32,
    pub connect_seq: u32,
    pub flags: u8,
}

pub const CONNECT_MSG_LEN: usize = 8 + 4 + 4 + 4 + 1;

impl ConnectMsg {
    pub fn encode(&self) -> [u8; CONNECT_MSG_LEN] {
        let mut buf = [0u8; CONNECT_MSG_LEN];
        buf[0..8].copy_from_slice(&self.features.to_le_bytes());
        buf[8..12].copy_from_slice(&self.host_type.to_le_bytes());
        buf[12..16].copy_from_slice(&self.global_seq.to_le_bytes());
        buf[16..20].copy_from_slice(&self.connect_seq.to_le_bytes());
        buf[20] = self.flags;
        buf
    }

    pub fn decode(buf: &[u8; CONNECT_MSG_LEN]) -> Self {
        Self {
            features: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            host_type: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            global_seq: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            connect_seq: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            flags: buf[20],
        }
    }
}

/// `LOSSYTX`-equivalent bit on [`ConnectMsg::flags`]: the initiator is declaring
/// this connection lossy (see §4.2).
pub const CONNECT_FLAG_LOSSY: u8 = 1 << 0;

/// Sent by the target on `Ready`, carrying its view of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ConnectReplyMsg {
    pub global_seq: u32,
    pub connect_seq: u32,
    pub in_seq_acked: u64,
}

pub const CONNECT_REPLY_LEN: usize = 4 + 4 + 8;

impl ConnectReplyMsg {
    pub fn encode(&self) -> [u8; CONNECT_REPLY_LEN] {
        let mut buf = [0u8; CONNECT_REPLY_LEN];
        buf[0..4].copy_from_slice(&self.global_seq.to_le_bytes());
        buf[4..8].copy_from_slice(&self.connect_seq.to_le_bytes());
        buf[8..16].copy_from_slice(&self.in_seq_acked.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; CONNECT_REPLY_LEN]) -> Self {
        Self {
            global_seq: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            connect_seq: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            in_seq_acked: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// Payload of a `Connect` frame: banner token followed by the connect record.
pub fn encode_connect_frame(msg: &ConnectMsg) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BANNER.len() + CONNECT_MSG_LEN);
    buf.extend_from_slice(BANNER);
    buf.extend_from_slice(&msg.encode());
    buf
}

pub fn decode_connect_frame(payload: &[u8]) -> Option<ConnectMsg> {
    if payload.len() != BANNER.len() + CONNECT_MSG_LEN || &payload[..BANNER.len()] != BANNER {
        return None;
    }
    let body: &[u8; CONNECT_MSG_LEN] = payload[BANNER.len()..].try_into().ok()?;
    Some(ConnectMsg::decode(body))
}

/// Payload of a `ConnectReply` frame: one reply-code byte followed by the reply
/// record (zeroed when the reply is not `Ready`).
pub fn encode_connect_reply_frame(code: ConnectReply, msg: &ConnectReplyMsg) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + CONNECT_REPLY_LEN);
    buf.push(code as u8);
    buf.extend_from_slice(&msg.encode());
    buf
}

pub fn decode_connect_reply_frame(payload: &[u8]) -> Option<(ConnectReply, ConnectReplyMsg)> {
    if payload.len() != 1 + CONNECT_REPLY_LEN {
        return None;
    }
    let code = ConnectReply::from_u8(payload[0])?;
    let body: &[u8; CONNECT_REPLY_LEN] = payload[1..].try_into().ok()?;
    Some((code, ConnectReplyMsg::decode(body)))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

pub fn encode_ack_frame(seq: u64) -> [u8; 8] {
    seq.to_le_bytes()
}

pub fn decode_ack_frame(payload: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(payload.try_into().ok()?))
}
