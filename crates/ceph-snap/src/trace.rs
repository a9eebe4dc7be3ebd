//! Wire decoding for snap trace messages (§6). All multi-byte integers are
//! little-endian, mirroring `ceph_messenger::wire`'s framing conventions.

use crate::error::{Result, SnapError};

/// Wire `msg_type` tag for a snap update/split notification (§2's "incoming
/// messages are dispatched by type, including snapshot updates that drive
/// the snap engine"). Representative value, matching the real cluster's
/// `CEPH_MSG_CLIENT_SNAP`.
pub const CEPH_MSG_CLIENT_SNAP: u16 = 0x203;

/// `snap_head.op` (§6). Matches the real cluster's `CEPH_SNAP_OP_*` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapOp {
    Update = 0,
    Create = 1,
    Destroy = 2,
    Split = 3,
}

impl SnapOp {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Update),
            1 => Some(Self::Create),
            2 => Some(Self::Destroy),
            3 => Some(Self::Split),
            _ => None,
        }
    }

    pub fn is_split(self) -> bool {
        matches!(self, Self::Split)
    }
}

pub const SNAP_HEAD_LEN: usize = 1 + 8 + 4 + 4 + 4;

/// Fixed header in front of every snap notification (§6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapHead {
    pub op: SnapOp,
    /// Valid only when `op == Split`: the realm the listed inodes/realms are
    /// moving out of.
    pub split_ino: u64,
    pub num_split_inos: u32,
    pub num_split_realms: u32,
    pub trace_len: u32,
}

impl SnapHead {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SNAP_HEAD_LEN {
            return Err(SnapError::CorruptMessage("snap_head truncated"));
        }
        let op = SnapOp::from_u8(buf[0])
            .ok_or(SnapError::CorruptMessage("snap_head: unknown op"))?;
        let split_ino = u64::from_le_bytes(buf[1..9].try_into().unwrap());
        let num_split_inos = u32::from_le_bytes(buf[9..13].try_into().unwrap());
        let num_split_realms = u32::from_le_bytes(buf[13..17].try_into().unwrap());
        let trace_len = u32::from_le_bytes(buf[17..21].try_into().unwrap());
        Ok(Self { op, split_ino, num_split_inos, num_split_realms, trace_len })
    }

    pub fn encode(&self) -> [u8; SNAP_HEAD_LEN] {
        let mut out = [0u8; SNAP_HEAD_LEN];
        out[0] = self.op as u8;
        out[1..9].copy_from_slice(&self.split_ino.to_le_bytes());
        out[9..13].copy_from_slice(&self.num_split_inos.to_le_bytes());
        out[13..17].copy_from_slice(&self.num_split_realms.to_le_bytes());
        out[17..21].copy_from_slice(&self.trace_len.to_le_bytes());
        out
    }
}

/// One `snap_realm` record from a trace (§6): a realm's full state plus the
/// snapshot ids minted on it and inherited at the moment it last reparented.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedRealm {
    pub ino: u64,
    pub seq: u64,
    pub created: u64,
    pub parent_ino: u64,
    pub parent_since: u64,
    pub snaps: Vec<u64>,
    pub prior_parent_snaps: Vec<u64>,
}

const REALM_FIXED_LEN: usize = 8 + 8 + 8 + 8 + 8 + 4 + 4;

impl EncodedRealm {
    /// Decodes one realm record starting at the front of `buf`, returning the
    /// record and the number of bytes consumed so the caller can advance
    /// through a trace's back-to-back records.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < REALM_FIXED_LEN {
            return Err(SnapError::CorruptTrace("realm record truncated"));
        }
        let ino = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let seq = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let created = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let parent_ino = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let parent_since = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        let num_snaps = u32::from_le_bytes(buf[40..44].try_into().unwrap()) as usize;
        let num_prior = u32::from_le_bytes(buf[44..48].try_into().unwrap()) as usize;

        let ids_len = (num_snaps + num_prior) * 8;
        if buf.len() < REALM_FIXED_LEN + ids_len {
            return Err(SnapError::CorruptTrace("realm record snapshot ids truncated"));
        }

        let mut cursor = REALM_FIXED_LEN;
        let mut snaps = Vec::with_capacity(num_snaps);
        for _ in 0..num_snaps {
            snaps.push(u64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap()));
            cursor += 8;
        }
        let mut prior_parent_snaps = Vec::with_capacity(num_prior);
        for _ in 0..num_prior {
            prior_parent_snaps.push(u64::from_le_bytes(buf[cursor..cursor + 8].try_into().unwrap()));
            cursor += 8;
        }

        Ok((
            Self { ino, seq, created, parent_ino, parent_since, snaps, prior_parent_snaps },
            cursor,
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REALM_FIXED_LEN + (self.snaps.len() + self.prior_parent_snaps.len()) * 8);
        out.extend_from_slice(&self.ino.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.created.to_le_bytes());
        out.extend_from_slice(&self.parent_ino.to_le_bytes());
        out.extend_from_slice(&self.parent_since.to_le_bytes());
        out.extend_from_slice(&(self.snaps.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.prior_parent_snaps.len() as u32).to_le_bytes());
        for s in &self.snaps {
            out.extend_from_slice(&s.to_le_bytes());
        }
        for s in &self.prior_parent_snaps {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Decodes every `snap_realm` record packed back to back in a trace body,
/// leaf-first (the order the metadata server sends them, and the order
/// `SnapEngine::apply_trace` expects to consume them in).
pub fn decode_trace(mut buf: &[u8]) -> Result<Vec<EncodedRealm>> {
    let mut realms = Vec::new();
    while !buf.is_empty() {
        let (realm, consumed) = EncodedRealm::decode(buf)?;
        realms.push(realm);
        buf = &buf[consumed..];
    }
    Ok(realms)
}

/// Decodes the `split_ino[]` / `split_realm[]` id arrays that follow the
/// trace body on a `SPLIT` notification (§4.7).
pub fn decode_id_array(buf: &[u8], count: u32) -> Result<(Vec<u64>, usize)> {
    let count = count as usize;
    let len = count * 8;
    if buf.len() < len {
        return Err(SnapError::CorruptMessage("split id array truncated"));
    }
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        ids.push(u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap()));
    }
    Ok((ids, len))
}

/// A fully decoded snap notification body (§6, §4.7): either a plain trace
/// to apply via [`crate::SnapEngine::apply_trace`], or a split to apply via
/// [`crate::SnapEngine::apply_split`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapMessage {
    Trace { op: SnapOp, realms: Vec<EncodedRealm> },
    Split { new_realm_trace: Vec<EncodedRealm>, split_inodes: Vec<u64>, split_child_realms: Vec<u64> },
}

/// Decodes a full `CEPH_MSG_CLIENT_SNAP` body: the fixed `snap_head`, its
/// trace (leaf-first realm records), and — only on `SPLIT` — the trailing
/// `split_ino[]`/`split_realm[]` id arrays, in the order the real cluster
/// sends them (trace, then split inodes, then split child realms).
pub fn decode_snap_message(buf: &[u8]) -> Result<SnapMessage> {
    let head = SnapHead::decode(buf)?;
    let trace_start = SNAP_HEAD_LEN;
    let trace_end = trace_start + head.trace_len as usize;
    let trace_buf = buf
        .get(trace_start..trace_end)
        .ok_or(SnapError::CorruptMessage("snap message: trace truncated"))?;
    let realms = decode_trace(trace_buf)?;

    if !head.op.is_split() {
        return Ok(SnapMessage::Trace { op: head.op, realms });
    }

    let mut cursor = trace_end;
    let (split_inodes, consumed) = decode_id_array(&buf[cursor..], head.num_split_inos)?;
    cursor += consumed;
    let (split_child_realms, _) = decode_id_array(&buf[cursor..], head.num_split_realms)?;

    Ok(SnapMessage::Split { new_realm_trace: realms, split_inodes, split_child_realms })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_head_round_trips() {
        let head = SnapHead {
            op: SnapOp::Split,
            split_ino: 0x100,
            num_split_inos: 2,
            num_split_realms: 1,
            trace_len: 64,
        };
        assert_eq!(SnapHead::decode(&head.encode()).unwrap(), head);
    }

    #[test]
    fn unknown_op_is_corrupt() {
        let mut buf = [0u8; SNAP_HEAD_LEN];
        buf[0] = 0xff;
        assert!(SnapHead::decode(&buf).is_err());
    }

    #[test]
    fn realm_record_round_trips_with_both_snap_arrays() {
        let realm = EncodedRealm {
            ino: 1,
            seq: 4,
            created: 2,
            parent_ino: 0,
            parent_since: 0,
            snaps: vec![9, 7, 3],
            prior_parent_snaps: vec![1],
        };
        let encoded = realm.encode();
        let (decoded, consumed) = EncodedRealm::decode(&encoded).unwrap();
        assert_eq!(decoded, realm);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn decode_trace_consumes_back_to_back_records() {
        let a = EncodedRealm {
            ino: 1,
            seq: 1,
            created: 0,
            parent_ino: 0,
            parent_since: 0,
            snaps: vec![],
            prior_parent_snaps: vec![],
        };
        let b = EncodedRealm {
            ino: 2,
            seq: 2,
            created: 1,
            parent_ino: 1,
            parent_since: 0,
            snaps: vec![5],
            prior_parent_snaps: vec![],
        };
        let mut buf = a.encode();
        buf.extend_from_slice(&b.encode());
        let realms = decode_trace(&buf).unwrap();
        assert_eq!(realms, vec![a, b]);
    }

    #[test]
    fn truncated_realm_record_is_corrupt_trace() {
        let buf = [0u8; REALM_FIXED_LEN - 1];
        assert!(EncodedRealm::decode(&buf).is_err());
    }

    #[test]
    fn id_array_round_trips() {
        let ids = vec![10u64, 20, 30];
        let mut buf = Vec::new();
        for id in &ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        let (decoded, consumed) = decode_id_array(&buf, 3).unwrap();
        assert_eq!(decoded, ids);
        assert_eq!(consumed, 24);
    }

    #[test]
    fn decode_snap_message_plain_trace() {
        let realm = EncodedRealm {
            ino: 1,
            seq: 4,
            created: 2,
            parent_ino: 0,
            parent_since: 0,
            snaps: vec![9],
            prior_parent_snaps: vec![],
        };
        let trace = realm.encode();
        let head = SnapHead {
            op: SnapOp::Update,
            split_ino: 0,
            num_split_inos: 0,
            num_split_realms: 0,
            trace_len: trace.len() as u32,
        };
        let mut buf = head.encode().to_vec();
        buf.extend_from_slice(&trace);

        match decode_snap_message(&buf).unwrap() {
            SnapMessage::Trace { op, realms } => {
                assert_eq!(op, SnapOp::Update);
                assert_eq!(realms, vec![realm]);
            }
            SnapMessage::Split { .. } => panic!("expected a plain trace"),
        }
    }

    #[test]
    fn decode_snap_message_split_carries_id_arrays() {
        let new_realm = EncodedRealm {
            ino: 2,
            seq: 1,
            created: 5,
            parent_ino: 0,
            parent_since: 0,
            snaps: vec![],
            prior_parent_snaps: vec![],
        };
        let trace = new_realm.encode();
        let head = SnapHead {
            op: SnapOp::Split,
            split_ino: 1,
            num_split_inos: 2,
            num_split_realms: 1,
            trace_len: trace.len() as u32,
        };
        let mut buf = head.encode().to_vec();
        buf.extend_from_slice(&trace);
        for id in [100u64, 101] {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        buf.extend_from_slice(&200u64.to_le_bytes());

        match decode_snap_message(&buf).unwrap() {
            SnapMessage::Split { new_realm_trace, split_inodes, split_child_realms } => {
                assert_eq!(new_realm_trace, vec![new_realm]);
                assert_eq!(split_inodes, vec![100, 101]);
                assert_eq!(split_child_realms, vec![200]);
            }
            SnapMessage::Trace { .. } => panic!("expected a split"),
        }
    }

    #[test]
    fn decode_snap_message_truncated_trace_is_corrupt() {
        let head = SnapHead { op: SnapOp::Update, split_ino: 0, num_split_inos: 0, num_split_realms: 0, trace_len: 100 };
        assert!(decode_snap_message(&head.encode()).is_err());
    }
}
