//! Deterministic repair of colliding directory entries.
//!
//! Two replicas creating the same name concurrently leave both inodes in the
//! slot's add-wins set. Colliding directories are merged into a fresh one;
//! colliding files are moved aside under `<name>-CONFLICT_<i>`. Members are
//! ordered by inode id so every replica numbers the files the same way.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crdtfs_store::{Op, ReplicatedStore};

use crate::codec;
use crate::inode::InodeAllocator;
use crate::reader::{read_raw, RawAttr};
use crate::types::{Attr, InodeId, MetaError, DEFAULT_DIR_MODE};

/// What one resolution did to a slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Id of the directory that replaced the colliding directories.
    pub merged_dir: Option<InodeId>,
    /// Files moved aside, with their new names.
    pub renamed: Vec<(String, InodeId)>,
    /// Members dropped because their record no longer exists.
    pub dropped: Vec<InodeId>,
    /// Whether the original name was removed from the parent.
    pub slot_removed: bool,
}

impl Resolution {
    /// True when the slot needed no change.
    pub fn is_noop(&self) -> bool {
        self.merged_dir.is_none()
            && self.renamed.is_empty()
            && self.dropped.is_empty()
            && !self.slot_removed
    }
}

/// Name a colliding file is moved to.
pub fn conflict_name(name: &str, index: usize) -> String {
    format!("{}-CONFLICT_{}", name, index)
}

/// Repairs slots holding more than one inode.
pub struct ConflictResolver {
    store: Arc<dyn ReplicatedStore>,
    inodes: Arc<InodeAllocator>,
}

impl ConflictResolver {
    /// Creates a resolver writing to `store`.
    pub fn new(store: Arc<dyn ReplicatedStore>, inodes: Arc<InodeAllocator>) -> Self {
        Self { store, inodes }
    }

    /// Repairs the `name` slot of `parent`, submitting every change as one batch.
    pub async fn resolve(&self, parent: &RawAttr, name: &str) -> Result<Resolution, MetaError> {
        let mut members = parent.children.get(name).cloned().unwrap_or_default();
        members.sort();
        members.dedup();

        let mut resolution = Resolution::default();
        let mut ops: Vec<Op> = Vec::new();
        let mut dirs = Vec::new();
        let mut files = Vec::new();

        for member in &members {
            match read_raw(self.store.as_ref(), *member).await? {
                Some(raw) if raw.is_file => files.push(raw),
                Some(raw) => dirs.push(raw),
                None => {
                    debug!("dropping dangling entry {} -> {} in {}", name, member, parent.ino);
                    ops.push(codec::encode_remove_child_member(parent.ino, name, *member)?);
                    resolution.dropped.push(*member);
                }
            }
        }
        let live = dirs.len() + files.len();

        if dirs.len() >= 2 {
            let merged = self.merge_directories(parent.ino, name, &dirs, &mut ops).await?;
            warn!(
                "merged {} directories named '{}' in {} into {}",
                dirs.len(),
                name,
                parent.ino,
                merged
            );
            resolution.merged_dir = Some(merged);
        }

        if files.len() >= 2 || (!files.is_empty() && live > 1) {
            for (index, file) in files.iter().enumerate() {
                let new_name = conflict_name(name, index);
                ops.push(codec::encode_remove_child_member(parent.ino, name, file.ino)?);
                ops.push(codec::encode_add_child(parent.ino, &new_name, file.ino)?);
                ops.push(codec::encode_hlink(file.ino, parent.ino, &new_name)?);
                warn!(
                    "moved conflicting file {} from '{}' to '{}' in {}",
                    file.ino, name, new_name, parent.ino
                );
                resolution.renamed.push((new_name, file.ino));
            }
            if dirs.is_empty() {
                ops.push(codec::encode_delete_child_slot(parent.ino, name));
                resolution.slot_removed = true;
            }
        }

        if !ops.is_empty() {
            self.store.update(ops).await?;
        }
        Ok(resolution)
    }

    /// Queues ops replacing `dirs` by one fresh directory holding the union of
    /// their entries. Nested collisions are left for the merged directory's
    /// own read to resolve.
    ///
    /// A file linked into more than one of `dirs` keeps a single entry, the
    /// first in (directory id, name) order, and loses one link count for
    /// every other entry so that `nlink` still matches its back-references.
    async fn merge_directories(
        &self,
        parent: InodeId,
        name: &str,
        dirs: &[RawAttr],
        ops: &mut Vec<Op>,
    ) -> Result<InodeId, MetaError> {
        let merged_ino = self.inodes.allocate().await?;
        let mode = dirs.iter().map(|d| d.mode).min().unwrap_or(DEFAULT_DIR_MODE);
        let mut merged = Attr::new_directory(merged_ino, mode);
        merged.add_hard_link_ref(parent, name);
        let mut placed: BTreeMap<InodeId, String> = BTreeMap::new();

        for dir in dirs {
            ops.push(codec::encode_remove_child_member(parent, name, dir.ino)?);
            ops.push(codec::encode_delete(dir.ino));
            for (child_name, children) in &dir.children {
                for child in children {
                    let live = read_raw(self.store.as_ref(), *child).await?.is_some();
                    if let Some(kept) = placed.get(child) {
                        if live {
                            debug!(
                                "dropping duplicate link '{}' of {} while merging into {} (kept '{}')",
                                child_name, child, merged_ino, kept
                            );
                            ops.push(codec::encode_remove_hlink(*child, dir.ino));
                            ops.push(codec::encode_drop_link_count(*child));
                        }
                        continue;
                    }
                    placed.insert(*child, child_name.clone());
                    ops.push(codec::encode_add_child(merged_ino, child_name, *child)?);
                    if live {
                        ops.push(codec::encode_remove_hlink(*child, dir.ino));
                        ops.push(codec::encode_hlink(*child, merged_ino, child_name)?);
                    }
                }
            }
        }

        ops.extend(codec::encode(&merged)?);
        ops.push(codec::encode_add_child(parent, name, merged_ino)?);
        Ok(merged_ino)
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("inodes", &self.inodes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DEFAULT_FILE_MODE, S_IFDIR};
    use crdtfs_store::MemoryStore;

    struct Fixture {
        store: MemoryStore,
        resolver: ConflictResolver,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new(1);
        let shared: Arc<dyn ReplicatedStore> = Arc::new(store.clone());
        let inodes = Arc::new(InodeAllocator::with_seed(shared.clone(), 5));
        Fixture {
            store,
            resolver: ConflictResolver::new(shared, inodes),
        }
    }

    async fn put(store: &MemoryStore, parent: InodeId, name: &str, attr: &Attr) {
        let mut attr = attr.clone();
        attr.add_hard_link_ref(parent, name);
        let mut ops = codec::encode(&attr).unwrap();
        ops.push(codec::encode_add_child(parent, name, attr.ino).unwrap());
        store.update(ops).await.unwrap();
    }

    async fn raw(store: &MemoryStore, ino: InodeId) -> Option<RawAttr> {
        read_raw(store, ino).await.unwrap()
    }

    #[tokio::test]
    async fn test_single_member_is_noop() {
        let f = fixture();
        let root = Attr::new_directory(InodeId::ROOT_INODE, DEFAULT_DIR_MODE);
        f.store.update(codec::encode(&root).unwrap()).await.unwrap();
        put(&f.store, root.ino, "a", &Attr::new_file(InodeId::new(2000), DEFAULT_FILE_MODE, 0)).await;

        let parent = raw(&f.store, root.ino).await.unwrap();
        let res = f.resolver.resolve(&parent, "a").await.unwrap();
        assert!(res.is_noop());
    }

    #[tokio::test]
    async fn test_files_are_renamed_in_id_order() {
        let f = fixture();
        let root = Attr::new_directory(InodeId::ROOT_INODE, DEFAULT_DIR_MODE);
        f.store.update(codec::encode(&root).unwrap()).await.unwrap();
        put(&f.store, root.ino, "x", &Attr::new_file(InodeId::new(3000), DEFAULT_FILE_MODE, 0)).await;
        put(&f.store, root.ino, "x", &Attr::new_file(InodeId::new(2000), DEFAULT_FILE_MODE, 0)).await;

        let parent = raw(&f.store, root.ino).await.unwrap();
        assert_eq!(parent.conflicted_names(), vec!["x".to_string()]);
        let res = f.resolver.resolve(&parent, "x").await.unwrap();
        assert!(res.slot_removed);
        assert_eq!(
            res.renamed,
            vec![
                ("x-CONFLICT_0".to_string(), InodeId::new(2000)),
                ("x-CONFLICT_1".to_string(), InodeId::new(3000)),
            ]
        );

        let parent = raw(&f.store, root.ino).await.unwrap();
        assert!(!parent.children.contains_key("x"));
        assert_eq!(parent.children["x-CONFLICT_0"], vec![InodeId::new(2000)]);
        assert_eq!(parent.children["x-CONFLICT_1"], vec![InodeId::new(3000)]);
        let first = raw(&f.store, InodeId::new(2000)).await.unwrap();
        assert_eq!(first.hlinks[&root.ino], "x-CONFLICT_0");
        assert_eq!(first.nlink, 1);
    }

    #[tokio::test]
    async fn test_directories_are_merged() {
        let f = fixture();
        let root = Attr::new_directory(InodeId::ROOT_INODE, DEFAULT_DIR_MODE);
        f.store.update(codec::encode(&root).unwrap()).await.unwrap();

        let d1 = Attr::new_directory(InodeId::new(2000), S_IFDIR | 0o755);
        let d2 = Attr::new_directory(InodeId::new(3000), S_IFDIR | 0o700);
        put(&f.store, root.ino, "d", &d1).await;
        put(&f.store, root.ino, "d", &d2).await;
        put(&f.store, d1.ino, "a", &Attr::new_file(InodeId::new(4000), DEFAULT_FILE_MODE, 0)).await;
        put(&f.store, d2.ino, "b", &Attr::new_file(InodeId::new(5000), DEFAULT_FILE_MODE, 0)).await;

        let parent = raw(&f.store, root.ino).await.unwrap();
        let res = f.resolver.resolve(&parent, "d").await.unwrap();
        let merged = res.merged_dir.unwrap();
        assert!(!res.slot_removed);
        assert!(res.renamed.is_empty());

        let parent = raw(&f.store, root.ino).await.unwrap();
        assert_eq!(parent.children["d"], vec![merged]);
        assert!(raw(&f.store, d1.ino).await.is_none());
        assert!(raw(&f.store, d2.ino).await.is_none());

        let dir = raw(&f.store, merged).await.unwrap();
        assert!(!dir.is_file);
        assert_eq!(dir.mode, S_IFDIR | 0o700);
        assert_eq!(dir.nlink, 2);
        assert_eq!(dir.hlinks[&root.ino], "d");
        assert_eq!(dir.children["a"], vec![InodeId::new(4000)]);
        assert_eq!(dir.children["b"], vec![InodeId::new(5000)]);

        let a = raw(&f.store, InodeId::new(4000)).await.unwrap();
        assert_eq!(a.hlinks.get(&merged).map(String::as_str), Some("a"));
        assert!(!a.hlinks.contains_key(&d1.ino));
    }

    #[tokio::test]
    async fn test_file_next_to_directory_moves_aside() {
        let f = fixture();
        let root = Attr::new_directory(InodeId::ROOT_INODE, DEFAULT_DIR_MODE);
        f.store.update(codec::encode(&root).unwrap()).await.unwrap();
        put(&f.store, root.ino, "m", &Attr::new_directory(InodeId::new(2000), DEFAULT_DIR_MODE)).await;
        put(&f.store, root.ino, "m", &Attr::new_file(InodeId::new(3000), DEFAULT_FILE_MODE, 0)).await;

        let parent = raw(&f.store, root.ino).await.unwrap();
        let res = f.resolver.resolve(&parent, "m").await.unwrap();
        assert!(res.merged_dir.is_none());
        assert!(!res.slot_removed);
        assert_eq!(res.renamed, vec![("m-CONFLICT_0".to_string(), InodeId::new(3000))]);

        let parent = raw(&f.store, root.ino).await.unwrap();
        assert_eq!(parent.children["m"], vec![InodeId::new(2000)]);
        assert_eq!(parent.children["m-CONFLICT_0"], vec![InodeId::new(3000)]);
    }

    #[tokio::test]
    async fn test_dangling_members_are_dropped() {
        let f = fixture();
        let root = Attr::new_directory(InodeId::ROOT_INODE, DEFAULT_DIR_MODE);
        f.store.update(codec::encode(&root).unwrap()).await.unwrap();
        put(&f.store, root.ino, "z", &Attr::new_file(InodeId::new(2000), DEFAULT_FILE_MODE, 0)).await;
        f.store
            .update(vec![codec::encode_add_child(root.ino, "z", InodeId::new(9999)).unwrap()])
            .await
            .unwrap();

        let parent = raw(&f.store, root.ino).await.unwrap();
        let res = f.resolver.resolve(&parent, "z").await.unwrap();
        assert_eq!(res.dropped, vec![InodeId::new(9999)]);
        assert!(res.renamed.is_empty());

        let parent = raw(&f.store, root.ino).await.unwrap();
        assert_eq!(parent.children["z"], vec![InodeId::new(2000)]);
    }

    #[tokio::test]
    async fn test_file_linked_into_both_merged_directories_keeps_one_entry() {
        let f = fixture();
        let root = Attr::new_directory(InodeId::ROOT_INODE, DEFAULT_DIR_MODE);
        f.store.update(codec::encode(&root).unwrap()).await.unwrap();

        let d1 = Attr::new_directory(InodeId::new(2000), DEFAULT_DIR_MODE);
        let d2 = Attr::new_directory(InodeId::new(3000), DEFAULT_DIR_MODE);
        put(&f.store, root.ino, "x", &d1).await;
        put(&f.store, root.ino, "x", &d2).await;
        let file = Attr::new_file(InodeId::new(4000), DEFAULT_FILE_MODE, 0);
        put(&f.store, root.ino, "f", &file).await;
        for (dir, link) in [(d1.ino, "la"), (d2.ino, "lb")] {
            let mut ops = codec::encode_link(file.ino, dir, link).unwrap();
            ops.push(codec::encode_add_child(dir, link, file.ino).unwrap());
            f.store.update(ops).await.unwrap();
        }
        assert_eq!(raw(&f.store, file.ino).await.unwrap().nlink, 3);

        let parent = raw(&f.store, root.ino).await.unwrap();
        let merged = f.resolver.resolve(&parent, "x").await.unwrap().merged_dir.unwrap();

        let dir = raw(&f.store, merged).await.unwrap();
        assert_eq!(dir.children.get("la"), Some(&vec![file.ino]));
        assert!(!dir.children.contains_key("lb"));

        let linked = raw(&f.store, file.ino).await.unwrap();
        assert_eq!(linked.nlink, 2);
        assert_eq!(linked.hlinks.len(), 2);
        assert_eq!(linked.hlinks[&root.ino], "f");
        assert_eq!(linked.hlinks[&merged], "la");
    }
}
