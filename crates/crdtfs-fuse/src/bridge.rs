//! `fuser` adapter.
//!
//! fuser invokes callbacks on its own session thread; each one blocks on the
//! matching async handler through a tokio runtime handle and converts the
//! outcome into a reply or an errno.

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crdtfs_meta::{Attr, FileKind, InodeId};

use crate::config::CrdtFsConfig;
use crate::filesystem::{CrdtFs, SetAttrRequest, TimeSpec};

const BLOCK_SIZE: u32 = 4096;

/// Kernel-facing side of a mount.
pub struct FuseBridge {
    fs: Arc<CrdtFs>,
    rt: Handle,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

impl FuseBridge {
    /// Wraps `fs`; handlers run on `rt`.
    pub fn new(fs: Arc<CrdtFs>, rt: Handle, config: &CrdtFsConfig) -> Self {
        Self {
            fs,
            rt,
            attr_ttl: config.attr_ttl(),
            entry_ttl: config.entry_ttl(),
        }
    }
}

/// Unix seconds to a `SystemTime`, including times before the epoch.
pub fn to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// `SystemTime` to unix seconds.
pub fn from_system_time(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Kernel file type of a record kind.
pub fn to_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Socket => FileType::Socket,
    }
}

/// Kernel view of a record.
pub fn to_file_attr(attr: &Attr) -> FileAttr {
    FileAttr {
        ino: attr.ino.as_u64(),
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: to_system_time(attr.atime),
        mtime: to_system_time(attr.mtime),
        ctime: to_system_time(attr.ctime),
        crtime: to_system_time(attr.ctime),
        kind: to_file_type(attr.file_kind()),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn time_spec(time: TimeOrNow) -> TimeSpec {
    match time {
        TimeOrNow::Now => TimeSpec::Now,
        TimeOrNow::SpecificTime(t) => TimeSpec::At(from_system_time(t)),
    }
}

fn name_str(name: &OsStr) -> Result<&str, c_int> {
    name.to_str().ok_or(libc::EINVAL)
}

macro_rules! name_or_reply {
    ($name:expr, $reply:expr) => {
        match name_str($name) {
            Ok(name) => name,
            Err(errno) => {
                $reply.error(errno);
                return;
            }
        }
    };
}

impl Filesystem for FuseBridge {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("crdtfs init");
        self.rt.block_on(self.fs.init()).map_err(|e| {
            warn!("init failed: {}", e);
            e.to_errno()
        })
    }

    fn destroy(&mut self) {
        if let Err(e) = self.rt.block_on(self.fs.destroy()) {
            warn!("destroy failed: {}", e);
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name_or_reply!(name, reply);
        match self.rt.block_on(self.fs.lookup(InodeId::new(parent), name)) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.rt.block_on(self.fs.getattr(InodeId::new(ino))) {
            Ok(attr) => reply.attr(&self.attr_ttl, &to_file_attr(&attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let req = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_spec),
            mtime: mtime.map(time_spec),
        };
        match self.rt.block_on(self.fs.setattr(InodeId::new(ino), req)) {
            Ok(attr) => reply.attr(&self.attr_ttl, &to_file_attr(&attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.rt.block_on(self.fs.readlink(InodeId::new(ino))) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name_or_reply!(name, reply);
        let mode = mode & !umask;
        match self.rt.block_on(self.fs.mknod(InodeId::new(parent), name, mode, rdev)) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name_or_reply!(name, reply);
        let mode = mode & !umask;
        match self.rt.block_on(self.fs.mkdir(InodeId::new(parent), name, mode)) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_or_reply!(name, reply);
        match self.rt.block_on(self.fs.unlink(InodeId::new(parent), name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name_or_reply!(name, reply);
        match self.rt.block_on(self.fs.rmdir(InodeId::new(parent), name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let name = name_or_reply!(link_name, reply);
        let target = name_or_reply!(target.as_os_str(), reply);
        match self.rt.block_on(self.fs.symlink(InodeId::new(parent), name, target)) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name_or_reply!(name, reply);
        let newname = name_or_reply!(newname, reply);
        let fut = self.fs.rename(
            InodeId::new(parent),
            name,
            InodeId::new(newparent),
            newname,
        );
        match self.rt.block_on(fut) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = name_or_reply!(newname, reply);
        let fut = self
            .fs
            .link(InodeId::new(ino), InodeId::new(newparent), newname);
        match self.rt.block_on(fut) {
            Ok(attr) => reply.entry(&self.entry_ttl, &to_file_attr(&attr), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.rt.block_on(self.fs.open(InodeId::new(ino), flags)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.rt.block_on(self.fs.read(InodeId::new(ino), offset as u64, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.rt.block_on(self.fs.write(InodeId::new(ino), offset as u64, data)) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.rt.block_on(self.fs.flush(InodeId::new(ino))) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.rt.block_on(self.fs.release(InodeId::new(ino))) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.rt.block_on(self.fs.fsync(InodeId::new(ino), datasync)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.rt.block_on(self.fs.opendir(InodeId::new(ino), flags)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = InodeId::new(ino);
        let entries = match self.rt.block_on(self.fs.readdir(dir)) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let parent = match self.rt.block_on(self.fs.reader().read_raw(dir)) {
            Ok(Some(raw)) => raw.hlinks.keys().next().copied().unwrap_or(InodeId::ROOT_INODE),
            _ => InodeId::ROOT_INODE,
        };

        let listing = [
            (dir, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ]
        .into_iter()
        .chain(
            entries
                .into_iter()
                .map(|e| (e.ino, to_file_type(e.kind), e.name)),
        );
        for (i, (child, kind, name)) in listing.enumerate().skip(offset.max(0) as usize) {
            if reply.add(child.as_u64(), (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.rt.block_on(self.fs.releasedir(InodeId::new(ino))) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.rt.block_on(self.fs.fsyncdir(InodeId::new(ino), datasync)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.rt.block_on(self.fs.statfs(InodeId::new(ino))) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.rt.block_on(self.fs.access(InodeId::new(ino), mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name_or_reply!(name, reply);
        match self.rt.block_on(self.fs.create(InodeId::new(parent), name, mode)) {
            Ok(attr) => reply.created(&self.entry_ttl, &to_file_attr(&attr), 0, 0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
