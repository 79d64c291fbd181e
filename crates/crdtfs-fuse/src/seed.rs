//! Bootstrap records.
//!
//! The root and the demo entries use fixed ids below the allocator's range,
//! so replicas seeding concurrently write the same records.

use tracing::info;

use crdtfs_meta::codec;
use crdtfs_meta::types::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crdtfs_meta::{Attr, InodeId, MetadataReader};
use crdtfs_store::ReplicatedStore;

use crate::error::{FsError, Result};

/// Id of the demo file `file.txt`.
pub const DEMO_FILE_INODE: InodeId = InodeId::new(2);
/// Id of the demo directory `folder`.
pub const DEMO_DIR_INODE: InodeId = InodeId::new(3);
/// Name of the demo file.
pub const DEMO_FILE_NAME: &str = "file.txt";
/// Name of the demo directory.
pub const DEMO_DIR_NAME: &str = "folder";
/// Content of the demo file.
pub const DEMO_FILE_CONTENT: &[u8] = b"Hello world";

/// Writes an empty root directory unless one exists. Returns whether it wrote.
pub async fn ensure_root(store: &dyn ReplicatedStore, reader: &MetadataReader) -> Result<bool> {
    if reader.read(InodeId::ROOT_INODE).await?.is_some() {
        return Ok(false);
    }
    let root = Attr::new_directory(InodeId::ROOT_INODE, DEFAULT_DIR_MODE);
    store.update(codec::encode(&root)?).await?;
    Ok(true)
}

/// Adds `file.txt` and `folder` to the root where missing.
pub async fn seed_demo(store: &dyn ReplicatedStore, reader: &MetadataReader) -> Result<()> {
    let root = reader
        .read(InodeId::ROOT_INODE)
        .await?
        .ok_or_else(|| FsError::inode_not_found(InodeId::ROOT_INODE))?;
    let mut ops = Vec::new();

    if root.child(DEMO_FILE_NAME).is_none() {
        let mut file = Attr::new_file(
            DEMO_FILE_INODE,
            DEFAULT_FILE_MODE,
            DEMO_FILE_CONTENT.len() as u64,
        );
        file.add_hard_link_ref(root.ino, DEMO_FILE_NAME);
        ops.extend(codec::encode(&file)?);
        ops.push(codec::encode_add_child(root.ino, DEMO_FILE_NAME, file.ino)?);
        ops.push(codec::encode_data(file.ino, DEMO_FILE_CONTENT));
    }
    if root.child(DEMO_DIR_NAME).is_none() {
        let mut dir = Attr::new_directory(DEMO_DIR_INODE, DEFAULT_DIR_MODE);
        dir.add_hard_link_ref(root.ino, DEMO_DIR_NAME);
        ops.extend(codec::encode(&dir)?);
        ops.push(codec::encode_add_child(root.ino, DEMO_DIR_NAME, dir.ino)?);
    }

    if !ops.is_empty() {
        info!("seeding demo entries into the root directory");
        store.update(ops).await?;
    }
    Ok(())
}
