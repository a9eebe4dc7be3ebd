use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use ceph_utils::safe_assert;
use tracing::debug;

use crate::context::{SnapContext, SnapId};

/// Inode number. Doubles as the realm identifier: a realm is rooted at the
/// inode of the directory it was created on (§3.2).
pub type Ino = u64;

/// A subtree of the namespace sharing one set of snapshots (§3.2).
///
/// Per the re-architecture note in the design notes: realms live in a single
/// arena ([`RealmForest`]) keyed by inode number, and `parent`/`children` are
/// `Ino` references resolved back through that arena rather than raw
/// pointers. `nref` is tracked explicitly rather than relying on Rust
/// ownership, mirroring the source's manual refcounting so the
/// get/put/destroy lifecycle (§3.2 "Lifecycle") stays faithful.
#[derive(Debug, Clone)]
pub struct Realm {
    pub ino: Ino,
    pub seq: u64,
    pub created: u64,
    pub parent_ino: Option<Ino>,
    pub parent_since: u64,
    pub children: Vec<Ino>,
    pub snaps: Vec<SnapId>,
    pub prior_parent_snaps: Vec<SnapId>,
    pub inodes_with_caps: HashSet<Ino>,
    pub cached_context: Option<Arc<SnapContext>>,
    pub nref: u32,
}

impl Realm {
    fn new(ino: Ino) -> Self {
        Self {
            ino,
            seq: 0,
            created: 0,
            parent_ino: None,
            parent_since: 0,
            children: Vec::new(),
            snaps: Vec::new(),
            prior_parent_snaps: Vec::new(),
            inodes_with_caps: HashSet::new(),
            cached_context: None,
            nref: 0,
        }
    }
}

/// The realm forest: every realm with at least one live reference, keyed by
/// inode number (§3.2). Mutations here are expected to happen under the
/// process-wide `snap_rwsem` (modeled one level up, in [`crate::engine`]) held
/// for write; the forest itself performs no locking.
#[derive(Debug, Default)]
pub struct RealmForest {
    realms: HashMap<Ino, Realm>,
}

impl RealmForest {
    pub fn new() -> Self {
        Self { realms: HashMap::new() }
    }

    pub fn get_realm(&self, ino: Ino) -> Option<&Realm> {
        self.realms.get(&ino)
    }

    /// Mutable access to an already-present realm, without touching `nref`.
    /// For field updates during trace application, where the refcount bump
    /// is handled separately by [`Self::get`]/[`Self::put`].
    pub fn get_existing_mut(&mut self, ino: Ino) -> Option<&mut Realm> {
        self.realms.get_mut(&ino)
    }

    pub fn contains(&self, ino: Ino) -> bool {
        self.realms.contains_key(&ino)
    }

    pub fn len(&self) -> usize {
        self.realms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.realms.is_empty()
    }

    /// Locate-or-create the realm rooted at `ino` and bump its refcount
    /// (`ceph_get_snap_realm`). Realms referenced lazily by a trace entry
    /// before their own defining entry has arrived get default fields until
    /// that entry is processed (§9, open question: "look-up-or-create the
    /// parent lazily").
    pub fn get(&mut self, ino: Ino) -> &mut Realm {
        let realm = self.realms.entry(ino).or_insert_with(|| Realm::new(ino));
        realm.nref += 1;
        realm
    }

    /// Drops one reference; destroys the realm and dereferences its parent
    /// when the count reaches zero (§3.2 "Lifecycle").
    pub fn put(&mut self, ino: Ino) {
        let Some(realm) = self.realms.get_mut(&ino) else {
            safe_assert!(false, "put() on unknown realm {ino:x}");
            return;
        };
        safe_assert!(realm.nref > 0, "realm {ino:x} put with nref already zero");
        realm.nref = realm.nref.saturating_sub(1);
        if realm.nref != 0 {
            return;
        }
        let parent_ino = realm.parent_ino;
        self.realms.remove(&ino);
        if let Some(parent_ino) = parent_ino {
            if let Some(parent) = self.realms.get_mut(&parent_ino) {
                parent.children.retain(|&c| c != ino);
            }
            self.put(parent_ino);
        }
    }

    /// Reparents `ino` to `new_parent`, fixing up both child lists and
    /// refcounts. Returns `true` if the parent actually changed (§4.6 step 3).
    pub fn adjust_parent(&mut self, ino: Ino, new_parent: Ino) -> bool {
        let current = self.realms.get(&ino).and_then(|r| r.parent_ino);
        if current == Some(new_parent) {
            return false;
        }

        self.get(new_parent);
        if let Some(old_parent) = current {
            if let Some(old) = self.realms.get_mut(&old_parent) {
                old.children.retain(|&c| c != ino);
            }
            self.put(old_parent);
        }
        if let Some(realm) = self.realms.get_mut(&ino) {
            realm.parent_ino = Some(new_parent);
        }
        if let Some(parent) = self.realms.get_mut(&new_parent) {
            if !parent.children.contains(&ino) {
                parent.children.push(ino);
            }
        }
        true
    }

    /// Removes `ino` from whatever realm's `inodes_with_caps` it is listed
    /// under (used during a split, §4.7 step 2).
    pub fn detach_inode(&mut self, realm_ino: Ino, inode: Ino) {
        if let Some(realm) = self.realms.get_mut(&realm_ino) {
            realm.inodes_with_caps.remove(&inode);
        }
    }

    /// Adds `inode` to `realm_ino`'s cap-holder set.
    pub fn attach_inode(&mut self, realm_ino: Ino, inode: Ino) {
        if let Some(realm) = self.realms.get_mut(&realm_ino) {
            realm.inodes_with_caps.insert(inode);
        }
    }

    /// Builds (or returns the still-valid cached) snap context for `ino`,
    /// recursing into the parent first since a child's context depends on it
    /// (§4.6 "Context derivation"). The short-circuit check skips rebuilding
    /// work when neither this realm nor its parent has moved since the
    /// context was last built.
    pub fn build_context(&mut self, ino: Ino) -> Arc<SnapContext> {
        let Some(realm) = self.realms.get(&ino) else { return SnapContext::empty() };
        let parent_ino = realm.parent_ino;

        let parent_ctx = parent_ino.map(|p| match self.realms.get(&p) {
            Some(pr) if pr.cached_context.is_some() => pr.cached_context.clone().unwrap(),
            _ => self.build_context(p),
        });

        let realm = self.realms.get(&ino).expect("realm present, checked above");
        if let Some(cached) = &realm.cached_context {
            let parent_unchanged = match (&parent_ctx, parent_ino) {
                (Some(pc), Some(_)) => cached.seq <= pc.seq,
                (None, None) => true,
                _ => false,
            };
            if cached.seq <= realm.seq && parent_unchanged {
                return cached.clone();
            }
        }

        let parent_since = realm.parent_since;
        let mut snaps = Vec::with_capacity(realm.snaps.len() + realm.prior_parent_snaps.len());
        let mut seq = realm.seq;

        if let Some(pc) = &parent_ctx {
            snaps.extend(pc.snaps.iter().copied().filter(|&s| s >= parent_since));
            if pc.seq > seq {
                seq = pc.seq;
            }
        }
        snaps.extend_from_slice(&realm.snaps);
        snaps.extend_from_slice(&realm.prior_parent_snaps);
        snaps.sort_unstable_by(|a, b| b.cmp(a));
        snaps.dedup();

        let ctx = Arc::new(SnapContext { seq, snaps });
        debug!(ino = format_args!("{ino:x}"), seq, nsnaps = ctx.snaps.len(), "rebuilt snap context");
        self.realms.get_mut(&ino).expect("realm present").cached_context = Some(ctx.clone());
        ctx
    }

    /// Rebuilds `ino`'s context and then recurses into every child,
    /// downward, since children were not yet valid at the moment their
    /// parent's context changed (§4.6 step 5).
    pub fn rebuild_downward(&mut self, ino: Ino) {
        self.build_context(ino);
        let children = self.realms.get(&ino).map(|r| r.children.clone()).unwrap_or_default();
        for child in children {
            self.rebuild_downward(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_creates_with_default_fields_and_bumps_nref() {
        let mut forest = RealmForest::new();
        let realm = forest.get(1);
        assert_eq!(realm.nref, 1);
        assert_eq!(realm.seq, 0);
        forest.get(1);
        assert_eq!(forest.get_realm(1).unwrap().nref, 2);
    }

    #[test]
    fn put_to_zero_removes_and_derefs_parent() {
        let mut forest = RealmForest::new();
        forest.get(1); // root, nref=1
        forest.get(2); // child, nref=1
        forest.adjust_parent(2, 1); // bumps parent nref -> 2
        assert_eq!(forest.get_realm(1).unwrap().nref, 2);

        forest.put(2);
        assert!(!forest.contains(2));
        assert_eq!(forest.get_realm(1).unwrap().nref, 1);
        assert!(!forest.get_realm(1).unwrap().children.contains(&2));
    }

    #[test]
    fn context_seq_is_max_of_self_and_parent() {
        let mut forest = RealmForest::new();
        forest.get(1);
        forest.get(2);
        forest.adjust_parent(2, 1);

        {
            let root = forest.realms.get_mut(&1).unwrap();
            root.seq = 5;
            root.snaps = vec![10, 20];
        }
        {
            let child = forest.realms.get_mut(&2).unwrap();
            child.seq = 1;
            child.parent_since = 0;
            child.snaps = vec![30];
        }

        let ctx = forest.build_context(2);
        assert_eq!(ctx.seq, 5);
        assert_eq!(ctx.snaps, vec![30, 20, 10]);
    }

    #[test]
    fn parent_since_filters_inherited_snaps() {
        let mut forest = RealmForest::new();
        forest.get(1);
        forest.get(2);
        forest.adjust_parent(2, 1);
        {
            let root = forest.realms.get_mut(&1).unwrap();
            root.seq = 8;
            root.snaps = vec![3, 9, 15];
        }
        {
            let child = forest.realms.get_mut(&2).unwrap();
            child.seq = 1;
            child.parent_since = 9;
        }
        let ctx = forest.build_context(2);
        assert_eq!(ctx.snaps, vec![15, 9]);
    }

    #[test]
    fn rebuild_downward_visits_grandchildren() {
        let mut forest = RealmForest::new();
        forest.get(1);
        forest.get(2);
        forest.get(3);
        forest.adjust_parent(2, 1);
        forest.adjust_parent(3, 2);
        {
            let root = forest.realms.get_mut(&1).unwrap();
            root.seq = 2;
            root.snaps = vec![100];
        }
        forest.rebuild_downward(1);
        assert_eq!(forest.get_realm(1).unwrap().cached_context.as_ref().unwrap().snaps, vec![100]);
        assert_eq!(forest.get_realm(2).unwrap().cached_context.as_ref().unwrap().snaps, vec![100]);
        assert_eq!(forest.get_realm(3).unwrap().cached_context.as_ref().unwrap().snaps, vec![100]);
    }

    #[test]
    fn unchanged_context_short_circuits() {
        let mut forest = RealmForest::new();
        forest.get(1);
        forest.realms.get_mut(&1).unwrap().seq = 3;
        let first = forest.build_context(1);
        let second = forest.build_context(1);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
