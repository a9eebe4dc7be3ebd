//! Top-level snap engine (§4.6–§4.8, §5): owns the realm forest, per-inode
//! capability/cap-snap state, and the process-wide flush list, and
//! implements the trace-application and split algorithms that tie them
//! together.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use spin::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    capsnap::{CapSnap, InodeCaps},
    context::SnapContext,
    error::{Result, SnapError},
    realm::{Ino, RealmForest},
    trace::{EncodedRealm, SnapOp},
};

/// Decouples actually transmitting a flushed cap-snap to a metadata-server
/// session from the bookkeeping in [`SnapEngine::flush_snaps`], the same way
/// `ConnectionOps` decouples delivery from `ceph-messenger`'s state machine.
pub trait SnapFlushSink {
    fn send_cap_snap(&mut self, ino: Ino, mds_session: u32, capsnap: &CapSnap) -> bool;
}

/// Owns every piece of snap-related state for a client (§3.2, §5): the
/// realm forest behind `snap_rwsem`, per-inode cap-snap state behind its own
/// lock plus a per-inode spinlock, and the process-wide flush list behind
/// `snap_flush_lock`.
///
/// Lock order matches §5: forest, then the inode table, then a single
/// inode's lock; the flush list is never held alongside an inode's lock.
#[derive(Default)]
pub struct SnapEngine {
    forest: RwLock<RealmForest>,
    caps: RwLock<HashMap<Ino, Arc<Mutex<InodeCaps>>>>,
    flush_list: Mutex<VecDeque<Ino>>,
}

impl SnapEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an inode as a cap holder on `realm`, creating its
    /// capability state on first use.
    pub fn register_inode(&self, ino: Ino, realm: Ino, mds_session: u32) {
        self.caps
            .write()
            .entry(ino)
            .or_insert_with(|| Arc::new(Mutex::new(InodeCaps::new(ino, realm, mds_session))));
        self.forest.write().attach_inode(realm, ino);
    }

    /// Returns (rebuilding if stale) the snap context for `ino`. Always
    /// takes the forest lock exclusively: the cache-hit short-circuit in
    /// [`RealmForest::build_context`] still mutates `cached_context`, so
    /// unlike the upstream client this does not distinguish a read-only
    /// fast path.
    pub fn snap_context(&self, ino: Ino) -> Arc<SnapContext> {
        self.forest.write().build_context(ino)
    }

    /// Releases the caller's own reference on a realm obtained from
    /// [`Self::apply_trace`] or [`Self::apply_split`].
    pub fn release_realm(&self, ino: Ino) {
        self.forest.write().put(ino);
    }

    /// Applies a snap trace (§4.6), most-deeply-nested realm first. Returns
    /// the leaf (first) realm's inode number; the caller now owns one
    /// reference on it, to be released via [`Self::release_realm`].
    pub fn apply_trace(&self, realms: &[EncodedRealm], op: SnapOp) -> Result<Ino> {
        if realms.is_empty() {
            return Err(SnapError::CorruptTrace("empty snap trace"));
        }
        let leaf_ino = realms[0].ino;
        let mut forest = self.forest.write();
        forest.get(leaf_ino);
        self.apply_trace_locked(&mut forest, realms, op);
        Ok(leaf_ino)
    }

    /// The core of §4.6, steps 1-5, run with the forest write lock already
    /// held. Shared by [`Self::apply_trace`] and [`Self::apply_split`] so a
    /// split's embedded trace application happens under the same critical
    /// section as the detach/reparent steps around it.
    fn apply_trace_locked(&self, forest: &mut RealmForest, realms: &[EncodedRealm], op: SnapOp) {
        let mut invalidate = false;

        for (idx, encoded) in realms.iter().enumerate() {
            let is_root = idx == realms.len() - 1;

            let (parent_ino, seq, cached_ctx, live_inodes) = {
                let realm = forest.get(encoded.ino);
                (realm.parent_ino, realm.seq, realm.cached_context.clone(), realm.inodes_with_caps.clone())
            };
            let seq_increased = encoded.seq > seq;

            if seq_increased && op != SnapOp::Destroy {
                let ctx = cached_ctx.unwrap_or_else(SnapContext::empty);
                for inode in live_inodes {
                    self.queue_cap_snap_on(inode, ctx.clone());
                }
            }

            let encoded_parent = (encoded.parent_ino != 0).then_some(encoded.parent_ino);
            if encoded_parent != parent_ino {
                if let Some(new_parent) = encoded_parent {
                    forest.adjust_parent(encoded.ino, new_parent);
                }
                invalidate = true;
            }

            if seq_increased {
                let realm = forest.get_existing_mut(encoded.ino).expect("just referenced above");
                realm.seq = encoded.seq;
                realm.created = encoded.created;
                realm.parent_since = encoded.parent_since;
                realm.snaps = encoded.snaps.clone();
                realm.prior_parent_snaps = encoded.prior_parent_snaps.clone();
                invalidate = true;
            }

            debug!(ino = format_args!("{:x}", encoded.ino), seq = encoded.seq, "applied snap trace entry");
            forest.put(encoded.ino);

            if is_root && invalidate {
                forest.rebuild_downward(encoded.ino);
            }
        }
    }

    /// Applies a split notification (§4.7): detaches affected inodes from
    /// the old realm and queues their cap-snaps under its current context
    /// *before* the embedded trace runs, then reparents child realms,
    /// applies the trace, and only afterward attaches the detached inodes
    /// to the new realm. This ordering keeps the embedded trace from
    /// queuing the same cap-snaps a second time.
    pub fn apply_split(
        &self,
        new_realm_trace: &[EncodedRealm],
        split_inodes: &[Ino],
        split_child_realms: &[Ino],
    ) -> Result<Ino> {
        let (new_realm_ino, new_created) = match new_realm_trace.first() {
            Some(r) => (r.ino, r.created),
            None => return Err(SnapError::CorruptTrace("split with no new-realm trace")),
        };

        let mut forest = self.forest.write();
        let mut detached = Vec::with_capacity(split_inodes.len());

        for &inode in split_inodes {
            let Some(current_realm) = self.caps.read().get(&inode).map(|c| c.lock().realm) else {
                continue;
            };
            let Some(realm) = forest.get_realm(current_realm) else { continue };
            if realm.created > new_created {
                warn!(inode = format_args!("{inode:x}"), "stale split notification, skipping");
                continue;
            }
            let ctx = realm.cached_context.clone().unwrap_or_else(SnapContext::empty);
            forest.detach_inode(current_realm, inode);
            self.queue_cap_snap_on(inode, ctx);
            detached.push(inode);
        }

        for &child in split_child_realms {
            forest.adjust_parent(child, new_realm_ino);
        }

        forest.get(new_realm_ino);
        self.apply_trace_locked(&mut forest, new_realm_trace, SnapOp::Create);

        for inode in detached {
            forest.attach_inode(new_realm_ino, inode);
            if let Some(caps) = self.caps.read().get(&inode).cloned() {
                caps.lock().realm = new_realm_ino;
            }
        }

        Ok(new_realm_ino)
    }

    fn queue_cap_snap_on(&self, ino: Ino, context: Arc<SnapContext>) {
        let Some(caps) = self.caps.read().get(&ino).cloned() else { return };
        let flushable = {
            let mut caps = caps.lock();
            caps.queue_cap_snap(context);
            caps.cap_snaps.back().is_some_and(|c| !c.writing && c.dirty_page_count == 0)
        };
        if flushable {
            self.flush_list.lock().push_back(ino);
        }
    }

    /// `finish_cap_snap` (§4.8): stamps final metadata on the inode's
    /// pending cap-snap. Enqueues the inode on the flush list if it is now
    /// dirty-free.
    pub fn finish_cap_snap(&self, ino: Ino) -> Result<()> {
        let caps = self.caps.read().get(&ino).cloned().ok_or(SnapError::CorruptMessage("finish_cap_snap: unknown inode"))?;
        let flushable = caps.lock().finish_cap_snap().ok_or(SnapError::CorruptMessage("no pending cap-snap"))?;
        if flushable {
            self.flush_list.lock().push_back(ino);
        }
        Ok(())
    }

    /// A writeback completion freed `pages` dirty pages for the cap-snap
    /// that `follows` a given snap. Enqueues the inode on the flush list if
    /// that cap-snap is now dirty-free.
    pub fn writeback_complete(&self, ino: Ino, follows: u64, pages: u64) {
        let Some(caps) = self.caps.read().get(&ino).cloned() else { return };
        let flushable = caps.lock().writeback_complete(follows, pages);
        if flushable {
            self.flush_list.lock().push_back(ino);
        }
    }

    /// `flush_snaps` (§4.8): drains the process-wide flush list, sending
    /// every dirty-free cap-snap on each inode to its metadata-server
    /// session in `follows` order. An inode whose session rejects a send
    /// stops early for that inode (its remaining cap-snaps are requeued)
    /// rather than faulting the whole drain.
    pub fn flush_snaps(&self, sink: &mut dyn SnapFlushSink) {
        let mut pending: VecDeque<Ino> = std::mem::take(&mut *self.flush_list.lock());

        while let Some(ino) = pending.pop_front() {
            let Some(caps) = self.caps.read().get(&ino).cloned() else { continue };
            let mut caps = caps.lock();
            let ready: Vec<CapSnap> = caps.flushable().cloned().collect();
            let mut last_sent = None;
            for capsnap in &ready {
                if !sink.send_cap_snap(ino, caps.mds_session, capsnap) {
                    warn!(ino = format_args!("{ino:x}"), follows = capsnap.follows, "cap-snap send failed, will retry");
                    break;
                }
                last_sent = Some(capsnap.follows);
            }
            if let Some(follows) = last_sent {
                caps.drop_flushed_through(follows);
            }
        }
    }
}
