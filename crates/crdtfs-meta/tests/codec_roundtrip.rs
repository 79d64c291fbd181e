//! Property tests: records written through the codec read back unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use crdtfs_meta::codec;
use crdtfs_meta::types::{S_IFDIR, S_IFREG};
use crdtfs_meta::{Attr, AttrKind, InodeAllocator, InodeId, MetadataReader};
use crdtfs_store::{MemoryStore, ReplicatedStore};
use proptest::prelude::*;

fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9._-]{0,11}"
}

fn arb_ino() -> impl Strategy<Value = InodeId> {
    (1000u64..(1 << 20)).prop_map(InodeId::new)
}

fn arb_attr() -> impl Strategy<Value = Attr> {
    (
        arb_ino(),
        any::<bool>(),
        0u32..0o1000,
        (any::<i64>(), any::<i64>(), any::<i64>()),
        (any::<u32>(), any::<u64>(), 0u32..64),
        (any::<u32>(), any::<u32>()),
        proptest::collection::btree_map(arb_name(), arb_ino(), 0..8),
        proptest::collection::btree_map(arb_ino(), arb_name(), 0..4),
    )
        .prop_map(
            |(ino, is_dir, perm, (ctime, mtime, atime), (rdev, size, nlink), (uid, gid), children, hlinks)| {
                let kind = if is_dir {
                    AttrKind::Directory { children }
                } else {
                    AttrKind::File
                };
                let mode = if is_dir { S_IFDIR | perm } else { S_IFREG | perm };
                Attr {
                    ino,
                    mode,
                    ctime,
                    mtime,
                    atime,
                    rdev,
                    size,
                    nlink,
                    uid,
                    gid,
                    hlinks,
                    kind,
                }
            },
        )
}

fn write_and_read(attr: &Attr) -> Option<Attr> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    rt.block_on(async {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new(1));
        store.update(codec::encode(attr).unwrap()).await.unwrap();
        let inodes = Arc::new(InodeAllocator::with_seed(store.clone(), 1));
        MetadataReader::new(store, inodes).read(attr.ino).await.unwrap()
    })
}

proptest! {
    #[test]
    fn prop_encode_then_read_is_identity(attr in arb_attr()) {
        let read = write_and_read(&attr);
        prop_assert_eq!(read, Some(attr));
    }

    #[test]
    fn prop_delete_removes_record(attr in arb_attr()) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = MemoryStore::new(1);
            store.update(codec::encode(&attr).unwrap()).await.unwrap();
            store.update(vec![codec::encode_delete(attr.ino)]).await.unwrap();
            assert!(store.keys().unwrap().is_empty());
        });
    }
}

#[test]
fn test_children_decode_as_sorted_members() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    rt.block_on(async {
        let store = MemoryStore::new(1);
        let dir = Attr::new_directory(InodeId::new(1200), S_IFDIR | 0o755);
        store.update(codec::encode(&dir).unwrap()).await.unwrap();
        store
            .update(vec![
                codec::encode_add_child(dir.ino, "n", InodeId::new(9000)).unwrap(),
                codec::encode_add_child(dir.ino, "n", InodeId::new(1500)).unwrap(),
            ])
            .await
            .unwrap();

        let raw = crdtfs_meta::reader::read_raw(&store, dir.ino).await.unwrap().unwrap();
        let expected: BTreeMap<String, Vec<InodeId>> =
            [("n".to_string(), vec![InodeId::new(1500), InodeId::new(9000)])]
                .into_iter()
                .collect();
        assert_eq!(raw.children, expected);
        assert_eq!(raw.conflicted_names(), vec!["n".to_string()]);
    });
}
