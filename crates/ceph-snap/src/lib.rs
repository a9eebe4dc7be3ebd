//! Client-side snapshot state: the realm forest, snap-context derivation,
//! and cap-snap queuing/flushing described in §3.2 and §4.6-§4.8.
//!
//! The realm forest is an arena keyed by inode number rather than a graph of
//! owned/borrowed pointers, and realm lifetime is tracked with an explicit
//! refcount (see [`realm::Realm::nref`]) instead of relying on Rust's own
//! ownership, mirroring the source client's manual `get`/`put` discipline.

mod capsnap;
mod context;
mod engine;
mod error;
mod realm;
mod trace;

pub use capsnap::{CapSnap, InodeCaps};
pub use context::{SnapContext, SnapId};
pub use engine::{SnapEngine, SnapFlushSink};
pub use error::{Result, SnapError};
pub use realm::{Ino, Realm, RealmForest};
pub use trace::{
    CEPH_MSG_CLIENT_SNAP, EncodedRealm, SnapHead, SnapMessage, SnapOp, decode_id_array, decode_snap_message, decode_trace,
};
