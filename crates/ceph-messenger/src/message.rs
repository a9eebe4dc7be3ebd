use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use crate::entity::{EntityType, Identity};

/// Header carried at the front of every `MSG` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub src: Identity,
    pub dst: Identity,
    pub msg_type: u16,
    pub seq: u64,
    pub front_len: u32,
    pub middle_len: u32,
    pub data_len: u32,
    pub data_off: u64,
}

/// Per-section CRCs plus the continuation flag, carried after the payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageFooter {
    pub header_crc: u32,
    pub front_crc: u32,
    pub middle_crc: u32,
    pub data_crc: u32,
    pub more_to_follow: bool,
}

/// A framed, sequenced message. Reference-counted: once queued it may be observed
/// by both the send path (in `out_sent`, awaiting ack) and, transiently, by a
/// caller still holding its own handle.
///
/// The data payload models the wire protocol's page-vector: conceptually those
/// pages are borrowed from the owner's allocator and never copied by the
/// messenger, so callers should prefer `Arc` sharing over cloning `data`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub footer: MessageFooter,
    pub front: Arc<[u8]>,
    pub middle: Option<Arc<[u8]>>,
    pub data: Option<Arc<[u8]>>,
}

impl Message {
    pub fn new(src: Identity, dst: Identity, msg_type: u16, front: Vec<u8>) -> Self {
        let front: Arc<[u8]> = front.into();
        Self {
            header: MessageHeader {
                src,
                dst,
                msg_type,
                seq: 0,
                front_len: front.len() as u32,
                middle_len: 0,
                data_len: 0,
                data_off: 0,
            },
            footer: MessageFooter::default(),
            front,
            middle: None,
            data: None,
        }
    }

    pub fn with_middle(mut self, middle: Vec<u8>) -> Self {
        self.header.middle_len = middle.len() as u32;
        self.middle = Some(middle.into());
        self
    }

    pub fn with_data(mut self, data: Vec<u8>, data_off: u64) -> Self {
        self.header.data_len = data.len() as u32;
        self.header.data_off = data_off;
        self.data = Some(data.into());
        self
    }

    /// Computes and stamps the per-section CRCs, called just before a message is
    /// handed to the send cursor.
    pub fn seal(&mut self) {
        self.footer.header_crc = crate::wire::crc32(&header_crc_bytes(&self.header));
        self.footer.front_crc = crate::wire::crc32(&self.front);
        self.footer.middle_crc = self.middle.as_deref().map(crate::wire::crc32).unwrap_or(0);
        self.footer.data_crc = self.data.as_deref().map(crate::wire::crc32).unwrap_or(0);
    }

    /// Verifies every section's CRC against the footer, as done at receive time
    /// before the message is dispatched.
    pub fn verify_crcs(&self) -> bool {
        self.first_crc_mismatch().is_none()
    }

    /// Returns the name of the first section whose CRC disagrees with the
    /// footer, or `None` if every section verifies. Checked in header/front/
    /// middle/data order, matching §4.1's independent per-section CRCs.
    pub fn first_crc_mismatch(&self) -> Option<&'static str> {
        if crate::wire::crc32(&header_crc_bytes(&self.header)) != self.footer.header_crc {
            return Some("header");
        }
        if crate::wire::crc32(&self.front) != self.footer.front_crc {
            return Some("front");
        }
        if self.middle.as_deref().map(crate::wire::crc32).unwrap_or(0) != self.footer.middle_crc {
            return Some("middle");
        }
        if self.data.as_deref().map(crate::wire::crc32).unwrap_or(0) != self.footer.data_crc {
            return Some("data");
        }
        None
    }
}

fn encode_entity_type(t: EntityType) -> u8 {
    match t {
        EntityType::Mon => 0,
        EntityType::Mds => 1,
        EntityType::Osd => 2,
        EntityType::Client => 3,
        EntityType::Admin => 4,
    }
}

fn decode_entity_type(b: u8) -> Option<EntityType> {
    match b {
        0 => Some(EntityType::Mon),
        1 => Some(EntityType::Mds),
        2 => Some(EntityType::Osd),
        3 => Some(EntityType::Client),
        4 => Some(EntityType::Admin),
        _ => None,
    }
}

fn encode_identity(buf: &mut Vec<u8>, id: &Identity) {
    buf.push(encode_entity_type(id.entity_type));
    buf.extend_from_slice(&id.entity_num.to_le_bytes());
    match id.addr {
        SocketAddr::V4(v4) => {
            buf.push(4);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_le_bytes());
        }
        SocketAddr::V6(v6) => {
            buf.push(6);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_le_bytes());
        }
    }
}

fn decode_identity(buf: &[u8], pos: &mut usize) -> Option<Identity> {
    let entity_type = decode_entity_type(*buf.get(*pos)?)?;
    *pos += 1;
    let entity_num = u64::from_le_bytes(buf.get(*pos..*pos + 8)?.try_into().ok()?);
    *pos += 8;
    let kind = *buf.get(*pos)?;
    *pos += 1;
    let addr = match kind {
        4 => {
            let octets: [u8; 4] = buf.get(*pos..*pos + 4)?.try_into().ok()?;
            *pos += 4;
            let port = u16::from_le_bytes(buf.get(*pos..*pos + 2)?.try_into().ok()?);
            *pos += 2;
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
        }
        6 => {
            let octets: [u8; 16] = buf.get(*pos..*pos + 16)?.try_into().ok()?;
            *pos += 16;
            let port = u16::from_le_bytes(buf.get(*pos..*pos + 2)?.try_into().ok()?);
            *pos += 2;
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
        _ => return None,
    };
    Some(Identity::new(entity_type, entity_num, addr))
}

/// Serialises a message's header, footer, and sections into a single `MSG`
/// frame payload.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + msg.front.len());
    encode_identity(&mut buf, &msg.header.src);
    encode_identity(&mut buf, &msg.header.dst);
    buf.extend_from_slice(&msg.header.msg_type.to_le_bytes());
    buf.extend_from_slice(&msg.header.seq.to_le_bytes());
    buf.extend_from_slice(&msg.header.data_off.to_le_bytes());
    buf.extend_from_slice(&msg.footer.header_crc.to_le_bytes());
    buf.extend_from_slice(&msg.footer.front_crc.to_le_bytes());
    buf.extend_from_slice(&msg.footer.middle_crc.to_le_bytes());
    buf.extend_from_slice(&msg.footer.data_crc.to_le_bytes());
    buf.push(msg.footer.more_to_follow as u8);
    buf.extend_from_slice(&(msg.front.len() as u32).to_le_bytes());
    buf.extend_from_slice(&msg.front);
    buf.extend_from_slice(&(msg.middle.as_deref().map_or(0, <[u8]>::len) as u32).to_le_bytes());
    if let Some(middle) = &msg.middle {
        buf.extend_from_slice(middle);
    }
    buf.extend_from_slice(&(msg.data.as_deref().map_or(0, <[u8]>::len) as u32).to_le_bytes());
    if let Some(data) = &msg.data {
        buf.extend_from_slice(data);
    }
    buf
}

/// Inverse of [`encode_message`]. Returns `None` on any structural corruption;
/// CRC verification is a separate step ([`Message::verify_crcs`]).
pub fn decode_message(buf: &[u8]) -> Option<Message> {
    let mut pos = 0;
    let src = decode_identity(buf, &mut pos)?;
    let dst = decode_identity(buf, &mut pos)?;
    let msg_type = u16::from_le_bytes(buf.get(pos..pos + 2)?.try_into().ok()?);
    pos += 2;
    let seq = u64::from_le_bytes(buf.get(pos..pos + 8)?.try_into().ok()?);
    pos += 8;
    let data_off = u64::from_le_bytes(buf.get(pos..pos + 8)?.try_into().ok()?);
    pos += 8;
    let header_crc = u32::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?);
    pos += 4;
    let front_crc = u32::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?);
    pos += 4;
    let middle_crc = u32::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?);
    pos += 4;
    let data_crc = u32::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?);
    pos += 4;
    let more_to_follow = *buf.get(pos)? != 0;
    pos += 1;

    let front_len = u32::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?) as usize;
    pos += 4;
    let front: Arc<[u8]> = buf.get(pos..pos + front_len)?.into();
    pos += front_len;

    let middle_len = u32::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?) as usize;
    pos += 4;
    let middle = (middle_len > 0).then(|| buf.get(pos..pos + middle_len)).flatten().map(Arc::from);
    pos += middle_len;

    let data_len = u32::from_le_bytes(buf.get(pos..pos + 4)?.try_into().ok()?) as usize;
    pos += 4;
    let data = (data_len > 0).then(|| buf.get(pos..pos + data_len)).flatten().map(Arc::from);

    Some(Message {
        header: MessageHeader {
            src,
            dst,
            msg_type,
            seq,
            front_len: front_len as u32,
            middle_len: middle_len as u32,
            data_len: data_len as u32,
            data_off,
        },
        footer: MessageFooter { header_crc, front_crc, middle_crc, data_crc, more_to_follow },
        front,
        middle,
        data,
    })
}

fn header_crc_bytes(hdr: &MessageHeader) -> [u8; 30] {
    let mut buf = [0u8; 30];
    buf[0..2].copy_from_slice(&hdr.msg_type.to_le_bytes());
    buf[2..10].copy_from_slice(&hdr.seq.to_le_bytes());
    buf[10..14].copy_from_slice(&hdr.front_len.to_le_bytes());
    buf[14..18].copy_from_slice(&hdr.middle_len.to_le_bytes());
    buf[18..22].copy_from_slice(&hdr.data_len.to_le_bytes());
    buf[22..30].copy_from_slice(&hdr.data_off.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::entity::EntityType;

    fn ident(num: u64) -> Identity {
        Identity::new(EntityType::Client, num, "127.0.0.1:6800".parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn seal_then_verify_round_trips() {
        let mut msg = Message::new(ident(1), ident(2), 7, vec![1, 2, 3]).with_data(vec![9; 16], 0);
        msg.seal();
        assert!(msg.verify_crcs());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut msg = Message::new(ident(1), ident(2), 7, vec![1, 2, 3]);
        msg.seal();
        msg.front = vec![9, 9, 9].into();
        assert!(!msg.verify_crcs());
    }

    #[test]
    fn wire_encoding_round_trips() {
        let mut msg = Message::new(ident(1), ident(2), 42, vec![1, 2, 3])
            .with_middle(vec![4, 5])
            .with_data(vec![6; 8], 100);
        msg.header.seq = 7;
        msg.seal();

        let bytes = encode_message(&msg);
        let decoded = decode_message(&bytes).expect("decodes");
        assert_eq!(decoded, msg);
        assert!(decoded.verify_crcs());
    }

    #[test]
    fn ipv6_identity_round_trips() {
        let addr: SocketAddr = "[::1]:6800".parse().unwrap();
        let id = Identity::new(EntityType::Mds, 3, addr);
        let msg = Message::new(id, id, 1, vec![]);
        let bytes = encode_message(&msg);
        let decoded = decode_message(&bytes).unwrap();
        assert_eq!(decoded.header.src, id);
    }
}
