//! `fuser` callbacks. Every request maps onto one
//! [`FileSystem`](crate::fs::FileSystem) call; inode numbers are the inode's
//! metadata block plus one, which keeps them clear of
//! the root's inode number.

use std::ffi::OsStr;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use tracing::{debug, error, info, trace};

use crate::fs::inode::{InodeHandle, Metadata};
use crate::fs::storage::BlockStore;
use crate::fs::{Attr, FSError, FileKind};
use crate::PageFs;

const TTL: Duration = Duration::from_secs(1);

fn handle_of(ino: u64) -> Option<InodeHandle> {
    (ino > FUSE_ROOT_ID).then(|| InodeHandle::new((ino - 1) as usize))
}

fn ino_of(attr: &Attr) -> u64 {
    attr.handle
        .map_or(FUSE_ROOT_ID, |handle| handle.block() as u64 + 1)
}

fn to_file_attr(attr: &Attr) -> FileAttr {
    let metadata = &attr.metadata;
    FileAttr {
        ino: ino_of(attr),
        size: attr.size,
        blocks: attr.blocks,
        atime: metadata.atime,
        mtime: metadata.mtime,
        ctime: metadata.ctime,
        crtime: metadata.crtime,
        kind: match attr.kind {
            FileKind::Directory => FileType::Directory,
            FileKind::RegularFile => FileType::RegularFile,
        },
        perm: metadata.perm,
        nlink: metadata.nlink,
        uid: metadata.uid,
        gid: metadata.gid,
        rdev: 0,
        blksize: attr.block_size,
        flags: 0,
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Logs a failed request and returns the errno to reply with.
fn errno(op: &'static str, ino: u64, err: &FSError) -> c_int {
    if err.is_internal() {
        error!(op, ino, error = %err, "Filesystem invariant violated");
    } else if matches!(err, FSError::NotFound) {
        trace!(op, ino, "No such file");
    } else {
        debug!(op, ino, error = %err, "Request failed");
    }
    err.errno()
}

impl<Store: BlockStore> PageFs<Store> {
    fn create_node(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<Attr, c_int> {
        if parent != FUSE_ROOT_ID {
            return Err(libc::ENOENT);
        }
        let kind = mode & libc::S_IFMT as u32;
        if kind != 0 && kind != libc::S_IFREG as u32 {
            return Err(libc::EPERM);
        }
        let perm = (mode & !umask & 0o7777) as u16;
        let metadata = Metadata::new(perm, req.uid(), req.gid());
        self.fs
            .create_file(name.as_bytes(), metadata)
            .and_then(|handle| self.fs.attr_of(handle))
            .map_err(|err| errno("create", parent, &err))
    }

    fn file_attr(&self, ino: u64) -> Result<Attr, FSError> {
        match handle_of(ino) {
            None if ino == FUSE_ROOT_ID => Ok(self.fs.root_attr()),
            None => Err(FSError::NotFound),
            Some(handle) => self.fs.attr_of(handle),
        }
    }
}

impl<Store: BlockStore> Filesystem for PageFs<Store> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        let config = self.fs.config();
        info!(
            block_size = config.block_size,
            block_count = config.block_count,
            "pagefs ready"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            files = self.fs.registry().len(),
            "pagefs unmounted, dropping all data"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        let result = self
            .fs
            .lookup(name.as_bytes())
            .ok_or(FSError::NotFound)
            .and_then(|handle| self.fs.attr_of(handle));
        match result {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(err) => reply.error(errno("lookup", parent, &err)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.file_attr(ino) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr)),
            Err(err) => reply.error(errno("getattr", ino, &err)),
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
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(handle) = handle_of(ino) else {
            // The root directory is synthesized and cannot change.
            reply.error(libc::EPERM);
            return;
        };
        let result = (|| -> Result<Attr, FSError> {
            if let Some(size) = size {
                self.fs.truncate_at(handle, size)?;
            }
            let mut metadata = self.fs.attr_of(handle)?.metadata;
            if let Some(mode) = mode {
                metadata.perm = (mode & 0o7777) as u16;
            }
            metadata.uid = uid.unwrap_or(metadata.uid);
            metadata.gid = gid.unwrap_or(metadata.gid);
            if let Some(atime) = atime {
                metadata.atime = resolve_time(atime);
            }
            if let Some(mtime) = mtime {
                metadata.mtime = resolve_time(mtime);
            }
            metadata.ctime = ctime.unwrap_or_else(SystemTime::now);
            metadata.crtime = crtime.unwrap_or(metadata.crtime);
            self.fs.set_metadata(handle, metadata)?;
            self.fs.attr_of(handle)
        })();
        match result {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr)),
            Err(err) => reply.error(errno("setattr", ino, &err)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.create_node(req, parent, name, mode, umask) {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_node(req, parent, name, mode, umask) {
            Ok(attr) => reply.created(&TTL, &to_file_attr(&attr), 0, 0, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if parent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        match self.fs.delete(name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("unlink", parent, &err)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        // No per-open state, every request names its inode.
        match self.file_attr(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(err) => reply.error(errno("open", ino, &err)),
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
        let (Some(handle), Ok(offset)) = (handle_of(ino), u64::try_from(offset)) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.read_at(handle, offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno("read", ino, &err)),
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
        let (Some(handle), Ok(offset)) = (handle_of(ino), u64::try_from(offset)) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.write_at(handle, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(errno("write", ino, &err)),
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
        if ino != FUSE_ROOT_ID {
            reply.error(libc::ENOTDIR);
            return;
        }
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, entry) in self.fs.list().into_iter().enumerate().skip(skip) {
            let kind = match entry.attr.kind {
                FileKind::Directory => FileType::Directory,
                FileKind::RegularFile => FileType::RegularFile,
            };
            let next_offset = (i + 1) as i64;
            let name = OsStr::from_bytes(&entry.name);
            if reply.add(ino_of(&entry.attr), next_offset, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(stat) => reply.statfs(
                stat.blocks,
                stat.blocks_free,
                stat.blocks_free,
                stat.files,
                stat.blocks_free,
                stat.block_size,
                stat.max_name_len,
                stat.block_size,
            ),
            Err(err) => reply.error(errno("statfs", ino, &err)),
        }
    }
}

#[test]
fn test_inode_numbers_round_trip() {
    assert_eq!(handle_of(FUSE_ROOT_ID), None);
    assert_eq!(handle_of(0), None);
    let handle = handle_of(8).unwrap();
    assert_eq!(handle.block(), 7);
}

#[test]
fn test_file_attr_conversion() {
    use crate::fs::storage::HeapStore;
    use crate::fs::{FileSystem, MountConfig};

    let config = MountConfig {
        block_size: 512,
        block_count: 16,
        max_name_len: 255,
    };
    let mut fs = FileSystem::mount(HeapStore::new(512, 16), config).unwrap();
    let handle = fs.create_file(b"f", Metadata::new(0o640, 7, 8)).unwrap();
    fs.write_at(handle, 0, &[1; 600]).unwrap();
    let attr = to_file_attr(&fs.attr_of(handle).unwrap());
    assert_eq!(attr.ino, handle.block() as u64 + 1);
    assert_eq!(handle_of(attr.ino), Some(handle));
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.size, 600);
    assert_eq!(attr.blocks, 2);
    assert_eq!((attr.perm, attr.uid, attr.gid), (0o640, 7, 8));
    let root = to_file_attr(&fs.root_attr());
    assert_eq!(root.ino, FUSE_ROOT_ID);
    assert_eq!(root.kind, FileType::Directory);
    assert_eq!(errno("read", 2, &FSError::OutOfSpace), libc::ENOSPC);
}
