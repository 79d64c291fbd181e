//! Property test: a file's link count always equals its back-reference count.

use std::collections::BTreeSet;
use std::sync::Arc;

use crdtfs_fuse::{CrdtFs, CrdtFsConfig, FsError};
use crdtfs_meta::types::DEFAULT_FILE_MODE;
use crdtfs_meta::InodeId;
use crdtfs_store::{MemoryStore, ReplicatedStore};
use proptest::prelude::*;

const DIRS: usize = 4;

#[derive(Clone, Debug)]
enum LinkOp {
    Link(usize),
    Unlink(usize),
}

fn arb_op() -> impl Strategy<Value = LinkOp> {
    prop_oneof![
        (0..DIRS).prop_map(LinkOp::Link),
        (0..DIRS).prop_map(LinkOp::Unlink),
    ]
}

fn run(ops: Vec<LinkOp>) -> Result<(), TestCaseError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    rt.block_on(async move {
        let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new(1));
        let config = CrdtFsConfig {
            inode_seed: Some(9),
            ..Default::default()
        };
        let fs = CrdtFs::new(store, &config);
        fs.init().await.unwrap();

        let mut dirs = Vec::new();
        for i in 0..DIRS {
            let dir = fs
                .mkdir(InodeId::ROOT_INODE, &format!("d{}", i), 0o755)
                .await
                .unwrap();
            dirs.push(dir.ino);
        }
        let file = fs.mknod(dirs[0], "f", DEFAULT_FILE_MODE, 0).await.unwrap();
        let mut linked: BTreeSet<usize> = [0].into_iter().collect();

        for op in ops {
            match op {
                LinkOp::Link(i) => {
                    let result = fs.link(file.ino, dirs[i], "f").await;
                    if linked.contains(&i) {
                        prop_assert!(matches!(result, Err(FsError::AlreadyExists { .. })), "expected AlreadyExists");
                    } else {
                        prop_assert!(result.is_ok());
                        linked.insert(i);
                    }
                }
                LinkOp::Unlink(i) => {
                    let result = fs.unlink(dirs[i], "f").await;
                    if linked.remove(&i) {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert!(matches!(result, Err(FsError::NotFound { .. })), "expected NotFound");
                    }
                }
            }

            match fs.getattr(file.ino).await {
                Ok(attr) => {
                    prop_assert_eq!(attr.nlink as usize, linked.len());
                    prop_assert_eq!(attr.hlinks.len(), linked.len());
                    let parents: BTreeSet<InodeId> = linked.iter().map(|i| dirs[*i]).collect();
                    let recorded: BTreeSet<InodeId> = attr.hlinks.keys().copied().collect();
                    prop_assert_eq!(recorded, parents);
                }
                Err(FsError::NotFound { .. }) => {
                    prop_assert!(linked.is_empty());
                    return Ok(());
                }
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            }
        }
        Ok(())
    })
}

proptest! {
    #[test]
    fn prop_nlink_matches_hlinks(ops in proptest::collection::vec(arb_op(), 1..24)) {
        run(ops)?;
    }
}
