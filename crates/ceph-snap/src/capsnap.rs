use std::{collections::VecDeque, sync::Arc};

use ceph_utils::safe_assert;

use crate::{context::SnapContext, realm::Ino};

/// A point-in-time snapshot of the capability/metadata state of an inode,
/// frozen the instant a new snapshot becomes effective for its realm (§3.2).
/// Queued on the inode until dirty data finishes writing back, then flushed
/// to the metadata server.
#[derive(Debug, Clone)]
pub struct CapSnap {
    /// Highest snap id this cap-snap's data precedes (`context.seq - 1`).
    pub follows: u64,
    pub context: Arc<SnapContext>,
    /// Capability bits held by the inode at the moment this was queued.
    pub issued: u32,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub time_warp_seq: u64,
    /// Dirty page count moved from the inode's "head" counter at queue time;
    /// writes after this point accumulate against the new head instead.
    pub dirty_page_count: u64,
    /// `true` until the in-progress write that was racing the snapshot
    /// finishes and [`InodeCaps::finish_cap_snap`] stamps final metadata.
    pub writing: bool,
}

/// Per-inode capability and pending-cap-snap state (§3.2, §4.8). Stands in
/// for the subset of a real VFS inode the snap engine needs; everything else
/// about the inode is out of scope (§1).
#[derive(Debug)]
pub struct InodeCaps {
    pub ino: Ino,
    pub realm: Ino,
    pub issued: u32,
    /// Dirty pages attributed to writes that started after the most recent
    /// cap-snap (or, if there is none, all current dirty pages).
    pub dirty_page_count_head: u64,
    /// Count of writes in flight; `queue_cap_snap` checks this to decide
    /// whether the new cap-snap starts `writing`.
    pub writes_in_progress: u32,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub time_warp_seq: u64,
    /// Which metadata-server session owns this inode, used by
    /// [`crate::engine::SnapEngine::flush_snaps`] to batch sends (§4.8).
    pub mds_session: u32,
    pub cap_snaps: VecDeque<CapSnap>,
}

impl InodeCaps {
    pub fn new(ino: Ino, realm: Ino, mds_session: u32) -> Self {
        Self {
            ino,
            realm,
            issued: 0,
            dirty_page_count_head: 0,
            writes_in_progress: 0,
            size: 0,
            mtime: 0,
            atime: 0,
            ctime: 0,
            time_warp_seq: 0,
            mds_session,
            cap_snaps: VecDeque::new(),
        }
    }

    /// Whether a cap-snap is still waiting for its racing write to finish.
    pub fn has_pending(&self) -> bool {
        self.cap_snaps.iter().any(|c| c.writing)
    }

    /// `ceph_queue_cap_snap` (§4.8). No-op if a pending cap-snap already
    /// exists: any write in flight started before it, so one cap-snap
    /// suffices to cover them all.
    pub fn queue_cap_snap(&mut self, context: Arc<SnapContext>) {
        if self.has_pending() {
            return;
        }

        let writing = self.writes_in_progress > 0;
        let dirty = self.dirty_page_count_head;
        self.dirty_page_count_head = 0;

        // If no write races the snapshot, the stat fields captured here are
        // already final, so `writing` is false from the start.
        let capsnap = CapSnap {
            follows: context.seq.saturating_sub(1),
            context,
            issued: self.issued,
            size: self.size,
            mtime: self.mtime,
            atime: self.atime,
            ctime: self.ctime,
            time_warp_seq: self.time_warp_seq,
            dirty_page_count: dirty,
            writing,
        };
        self.cap_snaps.push_back(capsnap);
    }

    /// `__ceph_finish_cap_snap` (§4.8). Requires the most recently queued
    /// pending cap-snap; stamps final stat metadata and returns `true` if it
    /// is now eligible for the flush list (`dirty == 0`).
    pub fn finish_cap_snap(&mut self) -> Option<bool> {
        let idx = self.cap_snaps.iter().position(|c| c.writing)?;
        let capsnap = &mut self.cap_snaps[idx];
        safe_assert!(capsnap.writing, "finish_cap_snap on a non-pending cap-snap");
        capsnap.size = self.size;
        capsnap.mtime = self.mtime;
        capsnap.atime = self.atime;
        capsnap.ctime = self.ctime;
        capsnap.time_warp_seq = self.time_warp_seq;
        capsnap.writing = false;
        Some(capsnap.dirty_page_count == 0)
    }

    /// A writeback completion reduced this inode's dirty page count by
    /// `pages`; returns `true` if the oldest eligible cap-snap just became
    /// flushable (`writing == false && dirty == 0`).
    pub fn writeback_complete(&mut self, follows: u64, pages: u64) -> bool {
        let Some(capsnap) = self.cap_snaps.iter_mut().find(|c| c.follows == follows) else {
            return false;
        };
        capsnap.dirty_page_count = capsnap.dirty_page_count.saturating_sub(pages);
        !capsnap.writing && capsnap.dirty_page_count == 0
    }

    /// Cap-snaps ready to flush (`dirty == 0 && writing == false`), in
    /// `follows` order (§4.8 `flush_snaps`).
    pub fn flushable(&self) -> impl Iterator<Item = &CapSnap> {
        let mut ready: Vec<&CapSnap> =
            self.cap_snaps.iter().filter(|c| !c.writing && c.dirty_page_count == 0).collect();
        ready.sort_by_key(|c| c.follows);
        ready.into_iter()
    }

    /// Drops every cap-snap through `follows` (inclusive) once the metadata
    /// server has acknowledged them.
    pub fn drop_flushed_through(&mut self, follows: u64) {
        self.cap_snaps.retain(|c| c.writing || c.dirty_page_count != 0 || c.follows > follows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(seq: u64) -> Arc<SnapContext> {
        Arc::new(SnapContext { seq, snaps: vec![seq] })
    }

    #[test]
    fn queue_without_writes_finalizes_immediately() {
        let mut caps = InodeCaps::new(1, 10, 0);
        caps.size = 42;
        caps.queue_cap_snap(ctx(5));
        assert_eq!(caps.cap_snaps.len(), 1);
        assert!(!caps.cap_snaps[0].writing);
        assert_eq!(caps.cap_snaps[0].follows, 4);
    }

    #[test]
    fn queue_with_write_in_progress_stays_pending() {
        let mut caps = InodeCaps::new(1, 10, 0);
        caps.writes_in_progress = 1;
        caps.dirty_page_count_head = 7;
        caps.queue_cap_snap(ctx(3));
        assert!(caps.has_pending());
        assert_eq!(caps.cap_snaps[0].dirty_page_count, 7);
        assert_eq!(caps.dirty_page_count_head, 0);
    }

    #[test]
    fn second_queue_while_pending_is_a_no_op() {
        let mut caps = InodeCaps::new(1, 10, 0);
        caps.writes_in_progress = 1;
        caps.queue_cap_snap(ctx(3));
        caps.queue_cap_snap(ctx(9));
        assert_eq!(caps.cap_snaps.len(), 1);
        assert_eq!(caps.cap_snaps[0].follows, 2);
    }

    #[test]
    fn finish_with_dirty_pages_does_not_flush_yet() {
        let mut caps = InodeCaps::new(1, 10, 0);
        caps.writes_in_progress = 1;
        caps.dirty_page_count_head = 3;
        caps.queue_cap_snap(ctx(4));
        let flushable_now = caps.finish_cap_snap().unwrap();
        assert!(!flushable_now);
        assert!(caps.flushable().next().is_none());
    }

    #[test]
    fn finish_with_no_dirty_pages_is_flushable() {
        let mut caps = InodeCaps::new(1, 10, 0);
        caps.writes_in_progress = 1;
        caps.queue_cap_snap(ctx(4));
        let flushable_now = caps.finish_cap_snap().unwrap();
        assert!(flushable_now);
        assert_eq!(caps.flushable().count(), 1);
    }

    #[test]
    fn writeback_complete_reaching_zero_becomes_flushable() {
        let mut caps = InodeCaps::new(1, 10, 0);
        caps.writes_in_progress = 1;
        caps.dirty_page_count_head = 5;
        caps.queue_cap_snap(ctx(4));
        caps.finish_cap_snap();
        assert!(!caps.writeback_complete(3, 2));
        assert!(caps.writeback_complete(3, 3));
    }

    #[test]
    fn flushable_is_sorted_by_follows() {
        let mut caps = InodeCaps::new(1, 10, 0);
        caps.queue_cap_snap(ctx(9));
        caps.queue_cap_snap(ctx(3));
        let order: Vec<u64> = caps.flushable().map(|c| c.follows).collect();
        assert_eq!(order, vec![2, 8]);
    }
}
