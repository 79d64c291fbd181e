//! Filesystem operation handlers.
//!
//! Every handler is stateless: it reads the records it needs through the
//! normalizing [`MetadataReader`], checks the operation's preconditions and
//! submits all of its changes as a single store batch. Nothing is cached
//! between calls; concurrent callers at other replicas are reconciled when
//! the records are next read.

use std::sync::Arc;

use tracing::{debug, info};

use crdtfs_meta::codec;
use crdtfs_meta::types::{unix_now, S_IFDIR, S_IFMT, S_IFREG};
use crdtfs_meta::{Attr, FileKind, InodeAllocator, InodeId, MetadataReader};
use crdtfs_store::{Op, ReplicatedStore};

use crate::config::CrdtFsConfig;
use crate::error::{FsError, Result};
use crate::seed;

/// Depth at which the ancestor walk during rename gives up.
const MAX_TREE_DEPTH: usize = 4096;

/// A time argument of setattr.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeSpec {
    /// Current time at the handler.
    Now,
    /// Explicit unix seconds.
    At(i64),
}

impl TimeSpec {
    fn resolve(self, now: i64) -> i64 {
        match self {
            TimeSpec::Now => now,
            TimeSpec::At(secs) => secs,
        }
    }
}

/// Attributes to change in setattr; `None` leaves a field alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    /// Permission bits; the type bits of the inode are kept.
    pub mode: Option<u32>,
    /// Owner.
    pub uid: Option<u32>,
    /// Group.
    pub gid: Option<u32>,
    /// New length; truncates or zero-extends the content.
    pub size: Option<u64>,
    /// Access time.
    pub atime: Option<TimeSpec>,
    /// Modification time.
    pub mtime: Option<TimeSpec>,
}

/// One directory entry as returned by readdir.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Referenced inode.
    pub ino: InodeId,
    /// Its type.
    pub kind: FileKind,
}

/// Filesystem statistics. The store has no notion of capacity, so these are
/// fixed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatFs {
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Longest name.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 1_000_000,
            bfree: 1_000_000,
            bavail: 1_000_000,
            files: 1_000_000,
            ffree: 1_000_000,
            bsize: 65536,
            namelen: 255,
            frsize: 65536,
        }
    }
}

/// The filesystem over one replicated store session.
pub struct CrdtFs {
    store: Arc<dyn ReplicatedStore>,
    reader: MetadataReader,
    inodes: Arc<InodeAllocator>,
    seed_demo: bool,
}

impl CrdtFs {
    /// Creates a filesystem over `store`.
    pub fn new(store: Arc<dyn ReplicatedStore>, config: &CrdtFsConfig) -> Self {
        let inodes = Arc::new(match config.inode_seed {
            Some(seed) => InodeAllocator::with_seed(store.clone(), seed),
            None => InodeAllocator::new(store.clone()),
        });
        let reader = MetadataReader::new(store.clone(), inodes.clone())
            .with_max_rounds(config.max_resolve_rounds);
        Self {
            store,
            reader,
            inodes,
            seed_demo: config.seed_demo,
        }
    }

    /// The normalizing reader used by every handler.
    pub fn reader(&self) -> &MetadataReader {
        &self.reader
    }

    async fn submit(&self, ops: Vec<Op>) -> Result<()> {
        self.store.update(ops).await?;
        Ok(())
    }

    async fn get(&self, ino: InodeId) -> Result<Attr> {
        self.reader
            .read(ino)
            .await?
            .ok_or_else(|| FsError::inode_not_found(ino))
    }

    /// Reads a directory; `missing` builds the error for an absent inode.
    async fn get_dir(&self, ino: InodeId, missing: impl FnOnce() -> FsError) -> Result<Attr> {
        let attr = self.reader.read(ino).await?.ok_or_else(missing)?;
        if !attr.is_dir() {
            return Err(FsError::NotADirectory { ino });
        }
        Ok(attr)
    }

    /// Writes the root directory if it does not exist yet, then the demo
    /// fixture when configured.
    pub async fn init(&self) -> Result<()> {
        if seed::ensure_root(self.store.as_ref(), &self.reader).await? {
            info!("created root directory");
        }
        if self.seed_demo {
            seed::seed_demo(self.store.as_ref(), &self.reader).await?;
        }
        Ok(())
    }

    /// Ends the store session.
    pub async fn destroy(&self) -> Result<()> {
        info!("closing store session");
        self.store.close().await?;
        Ok(())
    }

    /// Resolves `name` in `parent`.
    pub async fn lookup(&self, parent: InodeId, name: &str) -> Result<Attr> {
        debug!("lookup parent={} name={}", parent, name);
        let dir = self
            .get_dir(parent, || FsError::inode_not_found(parent))
            .await?;
        let ino = dir
            .child(name)
            .ok_or_else(|| FsError::entry_not_found(parent, name))?;
        self.reader
            .read(ino)
            .await?
            .ok_or_else(|| FsError::entry_not_found(parent, name))
    }

    /// Attributes of `ino`.
    pub async fn getattr(&self, ino: InodeId) -> Result<Attr> {
        debug!("getattr ino={}", ino);
        self.get(ino).await
    }

    /// Changes scalar attributes; a size change also resizes the content.
    pub async fn setattr(&self, ino: InodeId, req: SetAttrRequest) -> Result<Attr> {
        debug!("setattr ino={} req={:?}", ino, req);
        let mut attr = self.get(ino).await?;
        let now = unix_now();
        let mut ops = Vec::new();
        let mut changed = Vec::new();

        if let Some(mode) = req.mode {
            attr.mode = (attr.mode & S_IFMT) | (mode & !S_IFMT);
            changed.push(codec::F_MODE);
        }
        if let Some(uid) = req.uid {
            attr.uid = uid;
            changed.push(codec::F_UID);
        }
        if let Some(gid) = req.gid {
            attr.gid = gid;
            changed.push(codec::F_GID);
        }
        if let Some(atime) = req.atime {
            attr.atime = atime.resolve(now);
            changed.push(codec::F_ATIME);
        }
        if let Some(mtime) = req.mtime {
            attr.mtime = mtime.resolve(now);
            changed.push(codec::F_MTIME);
        }
        if let Some(size) = req.size {
            if attr.is_dir() {
                return Err(FsError::IsADirectory { ino });
            }
            let new_len = usize::try_from(size).map_err(|_| FsError::InvalidArgument {
                msg: format!("size {} too large", size),
            })?;
            let mut data = self.reader.read_data(ino).await?.unwrap_or_default();
            data.resize(new_len, 0);
            ops.push(codec::encode_data(ino, data));
            attr.size = size;
            changed.push(codec::F_SIZE);
            if req.mtime.is_none() {
                attr.mtime = now;
                changed.push(codec::F_MTIME);
            }
        }
        if changed.is_empty() {
            return Ok(attr);
        }
        attr.ctime = now;
        changed.push(codec::F_CTIME);

        let mut batch = codec::encode_fields(&attr, &changed)?;
        batch.extend(ops);
        self.submit(batch).await?;
        Ok(attr)
    }

    /// Adds `attr` under `parent/name` together with its optional content.
    async fn create_entry(
        &self,
        parent: &Attr,
        name: &str,
        mut attr: Attr,
        data: Option<Vec<u8>>,
    ) -> Result<Attr> {
        if parent.child(name).is_some() {
            return Err(FsError::AlreadyExists {
                name: name.to_string(),
            });
        }
        attr.add_hard_link_ref(parent.ino, name);

        let mut ops = codec::encode(&attr)?;
        ops.push(codec::encode_add_child(parent.ino, name, attr.ino)?);
        if let Some(data) = data {
            ops.push(codec::encode_data(attr.ino, data));
        }
        self.submit(ops).await?;
        Ok(attr)
    }

    /// Creates a regular file (or device node when `rdev` is set).
    pub async fn mknod(&self, parent: InodeId, name: &str, mode: u32, rdev: u32) -> Result<Attr> {
        debug!("mknod parent={} name={} mode={:o} rdev={}", parent, name, mode, rdev);
        let dir = self
            .get_dir(parent, || FsError::NoSuchDevice { ino: parent })
            .await?;
        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        let ino = self.inodes.allocate().await?;
        let mut attr = Attr::new_file(ino, mode, 0);
        attr.rdev = rdev;
        self.create_entry(&dir, name, attr, None).await
    }

    /// Creates an empty directory.
    pub async fn mkdir(&self, parent: InodeId, name: &str, mode: u32) -> Result<Attr> {
        debug!("mkdir parent={} name={} mode={:o}", parent, name, mode);
        let dir = self
            .get_dir(parent, || FsError::NoSuchDevice { ino: parent })
            .await?;
        let ino = self.inodes.allocate().await?;
        let attr = Attr::new_directory(ino, S_IFDIR | (mode & !S_IFMT));
        self.create_entry(&dir, name, attr, None).await
    }

    /// Ops dropping one link of a file; the last link deletes it with its content.
    fn unlink_ops(attr: &Attr, parent: InodeId) -> Vec<Op> {
        let mut ops = codec::encode_unlink(attr, parent);
        if attr.nlink <= 1 {
            ops.push(codec::encode_delete(attr.ino));
            ops.push(codec::encode_delete_data(attr.ino));
        }
        ops
    }

    /// Removes a file entry.
    pub async fn unlink(&self, parent: InodeId, name: &str) -> Result<()> {
        debug!("unlink parent={} name={}", parent, name);
        let dir = self
            .get_dir(parent, || FsError::inode_not_found(parent))
            .await?;
        let ino = dir
            .child(name)
            .ok_or_else(|| FsError::entry_not_found(parent, name))?;
        let attr = self
            .reader
            .read(ino)
            .await?
            .ok_or_else(|| FsError::entry_not_found(parent, name))?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory { ino });
        }

        let mut ops = Self::unlink_ops(&attr, parent);
        ops.push(codec::encode_delete_child_slot(parent, name));
        self.submit(ops).await
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, parent: InodeId, name: &str) -> Result<()> {
        debug!("rmdir parent={} name={}", parent, name);
        let dir = self
            .get_dir(parent, || FsError::NoSuchDevice { ino: parent })
            .await?;
        let ino = dir
            .child(name)
            .ok_or_else(|| FsError::entry_not_found(parent, name))?;
        let attr = self
            .reader
            .read(ino)
            .await?
            .ok_or_else(|| FsError::entry_not_found(parent, name))?;
        match attr.children() {
            None => return Err(FsError::NotADirectory { ino }),
            Some(children) if !children.is_empty() => return Err(FsError::NotEmpty { ino }),
            Some(_) => {}
        }

        self.submit(vec![
            codec::encode_delete(ino),
            codec::encode_delete_child_slot(parent, name),
        ])
        .await
    }

    /// Creates a symbolic link whose content is `target`.
    pub async fn symlink(&self, parent: InodeId, name: &str, target: &str) -> Result<Attr> {
        debug!("symlink parent={} name={} target={}", parent, name, target);
        let dir = self
            .get_dir(parent, || FsError::inode_not_found(parent))
            .await?;
        let ino = self.inodes.allocate().await?;
        let attr = Attr::new_symlink(ino, target.len() as u64);
        self.create_entry(&dir, name, attr, Some(target.as_bytes().to_vec()))
            .await
    }

    /// Target of a symbolic link.
    pub async fn readlink(&self, ino: InodeId) -> Result<Vec<u8>> {
        debug!("readlink ino={}", ino);
        self.reader
            .read_data(ino)
            .await?
            .ok_or_else(|| FsError::inode_not_found(ino))
    }

    /// Adds a hard link to a file.
    pub async fn link(&self, ino: InodeId, new_parent: InodeId, new_name: &str) -> Result<Attr> {
        debug!("link ino={} newparent={} newname={}", ino, new_parent, new_name);
        let mut attr = self.get(ino).await?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory { ino });
        }
        let dir = self
            .get_dir(new_parent, || FsError::inode_not_found(new_parent))
            .await?;
        if dir.child(new_name).is_some() || attr.hlinks.contains_key(&new_parent) {
            return Err(FsError::AlreadyExists {
                name: new_name.to_string(),
            });
        }

        let mut ops = codec::encode_link(ino, new_parent, new_name)?;
        ops.push(codec::encode_add_child(new_parent, new_name, ino)?);
        self.submit(ops).await?;

        attr.nlink += 1;
        attr.add_hard_link_ref(new_parent, new_name);
        Ok(attr)
    }

    /// True if `dir` is `ancestor` or lies below it.
    async fn is_within(&self, dir: InodeId, ancestor: InodeId) -> Result<bool> {
        let mut current = dir;
        for _ in 0..MAX_TREE_DEPTH {
            if current == ancestor {
                return Ok(true);
            }
            if current == InodeId::ROOT_INODE {
                return Ok(false);
            }
            let raw = match self.reader.read_raw(current).await? {
                Some(raw) => raw,
                None => return Ok(false),
            };
            match raw.hlinks.keys().next() {
                Some(parent) => current = *parent,
                None => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Moves `parent/name` to `new_parent/new_name`, replacing a compatible
    /// destination.
    pub async fn rename(
        &self,
        parent: InodeId,
        name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<()> {
        debug!(
            "rename parent={} name={} newparent={} newname={}",
            parent, name, new_parent, new_name
        );
        let src_dir = self
            .get_dir(parent, || FsError::inode_not_found(parent))
            .await?;
        let src_ino = src_dir
            .child(name)
            .ok_or_else(|| FsError::entry_not_found(parent, name))?;
        let src = self
            .reader
            .read(src_ino)
            .await?
            .ok_or_else(|| FsError::entry_not_found(parent, name))?;

        let dst_dir = if new_parent == parent {
            src_dir
        } else {
            self.get_dir(new_parent, || FsError::inode_not_found(new_parent))
                .await?
        };
        let dst_ino = dst_dir.child(new_name);
        if dst_ino == Some(src_ino) {
            debug!("rename of {} onto itself", src_ino);
            return Ok(());
        }
        if src.is_dir() && self.is_within(new_parent, src_ino).await? {
            return Err(FsError::InvalidArgument {
                msg: format!("cannot move directory {} below itself", src_ino),
            });
        }
        if new_parent != parent && src.is_file() && src.hlinks.contains_key(&new_parent) {
            return Err(FsError::AlreadyExists {
                name: new_name.to_string(),
            });
        }

        let mut ops = Vec::new();
        if let Some(dst_ino) = dst_ino {
            if let Some(dst) = self.reader.read(dst_ino).await? {
                match (src.is_dir(), dst.children()) {
                    (true, None) => return Err(FsError::NotADirectory { ino: dst_ino }),
                    (false, Some(_)) => return Err(FsError::IsADirectory { ino: dst_ino }),
                    (true, Some(children)) if !children.is_empty() => {
                        return Err(FsError::NotEmpty { ino: dst_ino })
                    }
                    (true, Some(_)) => ops.push(codec::encode_delete(dst_ino)),
                    (false, None) => ops.extend(Self::unlink_ops(&dst, new_parent)),
                }
            }
            ops.push(codec::encode_delete_child_slot(new_parent, new_name));
        }

        ops.push(codec::encode_delete_child_slot(parent, name));
        ops.push(codec::encode_add_child(new_parent, new_name, src_ino)?);
        if new_parent != parent {
            ops.push(codec::encode_remove_hlink(src_ino, parent));
        }
        ops.push(codec::encode_hlink(src_ino, new_parent, new_name)?);
        self.submit(ops).await
    }

    /// Stateless; always succeeds.
    pub async fn open(&self, ino: InodeId, flags: i32) -> Result<()> {
        debug!("open ino={} flags={}", ino, flags);
        Ok(())
    }

    /// Stateless; always succeeds.
    pub async fn opendir(&self, ino: InodeId, flags: i32) -> Result<()> {
        debug!("opendir ino={} flags={}", ino, flags);
        Ok(())
    }

    /// Stateless; always succeeds.
    pub async fn release(&self, ino: InodeId) -> Result<()> {
        debug!("release ino={}", ino);
        Ok(())
    }

    /// Stateless; always succeeds.
    pub async fn releasedir(&self, ino: InodeId) -> Result<()> {
        debug!("releasedir ino={}", ino);
        Ok(())
    }

    /// Writes are applied immediately; nothing to flush.
    pub async fn flush(&self, ino: InodeId) -> Result<()> {
        debug!("flush ino={}", ino);
        Ok(())
    }

    /// Writes are applied immediately; nothing to sync.
    pub async fn fsync(&self, ino: InodeId, datasync: bool) -> Result<()> {
        debug!("fsync ino={} datasync={}", ino, datasync);
        Ok(())
    }

    /// Writes are applied immediately; nothing to sync.
    pub async fn fsyncdir(&self, ino: InodeId, datasync: bool) -> Result<()> {
        debug!("fsyncdir ino={} datasync={}", ino, datasync);
        Ok(())
    }

    /// Permissions are not enforced.
    pub async fn access(&self, ino: InodeId, mask: i32) -> Result<()> {
        debug!("access ino={} mask={}", ino, mask);
        Ok(())
    }

    /// Up to `size` bytes of content starting at `offset`.
    pub async fn read(&self, ino: InodeId, offset: u64, size: u32) -> Result<Vec<u8>> {
        debug!("read ino={} offset={} size={}", ino, offset, size);
        let attr = self.get(ino).await?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory { ino });
        }
        let data = self.reader.read_data(ino).await?.unwrap_or_default();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// Splices `buf` into the content at `offset` and returns the bytes
    /// written. Writing past the end appends without zero padding.
    pub async fn write(&self, ino: InodeId, offset: u64, buf: &[u8]) -> Result<u32> {
        debug!("write ino={} offset={} size={}", ino, offset, buf.len());
        let mut attr = self.get(ino).await?;
        if attr.is_dir() {
            return Err(FsError::IsADirectory { ino });
        }
        let data = self.reader.read_data(ino).await?.unwrap_or_default();
        let spliced = splice(&data, offset, buf);

        let now = unix_now();
        attr.size = spliced.len() as u64;
        attr.mtime = now;
        attr.ctime = now;
        let mut ops =
            codec::encode_fields(&attr, &[codec::F_SIZE, codec::F_MTIME, codec::F_CTIME])?;
        ops.push(codec::encode_data(ino, spliced));
        self.submit(ops).await?;

        u32::try_from(buf.len()).map_err(|_| FsError::InvalidArgument {
            msg: format!("write of {} bytes", buf.len()),
        })
    }

    /// Entries of a directory, each read (and so normalized) before it is
    /// reported. Entries whose record is gone are skipped.
    pub async fn readdir(&self, ino: InodeId) -> Result<Vec<DirEntry>> {
        debug!("readdir ino={}", ino);
        let dir = self.get_dir(ino, || FsError::inode_not_found(ino)).await?;
        let mut entries = Vec::new();
        for (name, child) in dir.children().into_iter().flatten() {
            match self.reader.read(*child).await? {
                Some(attr) => entries.push(DirEntry {
                    name: name.clone(),
                    ino: *child,
                    kind: attr.file_kind(),
                }),
                None => debug!("readdir ino={} skipping missing child {}", ino, child),
            }
        }
        Ok(entries)
    }

    /// Not supported; the kernel falls back to mknod and open.
    pub async fn create(&self, parent: InodeId, name: &str, mode: u32) -> Result<Attr> {
        debug!("create parent={} name={} mode={:o}", parent, name, mode);
        Err(FsError::Unsupported { op: "create" })
    }

    /// Fixed filesystem statistics.
    pub async fn statfs(&self, ino: InodeId) -> Result<StatFs> {
        debug!("statfs ino={}", ino);
        Ok(StatFs::default())
    }
}

/// `data[..offset] + buf + data[offset + buf.len()..]`, clamped to `data`.
fn splice(data: &[u8], offset: u64, buf: &[u8]) -> Vec<u8> {
    let head_end = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let tail_start = head_end.saturating_add(buf.len());
    let mut out = Vec::with_capacity(head_end + buf.len() + data.len().saturating_sub(tail_start));
    out.extend_from_slice(&data[..head_end]);
    out.extend_from_slice(buf);
    if tail_start < data.len() {
        out.extend_from_slice(&data[tail_start..]);
    }
    out
}

impl std::fmt::Debug for CrdtFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtFs")
            .field("reader", &self.reader)
            .field("seed_demo", &self.seed_demo)
            .finish()
    }
}
