use packed_struct::PackingError;
use thiserror::Error;
use tracing::{debug, info};

pub mod alloc;
pub mod content;
pub mod inode;
pub mod storage;

use alloc::Allocator;
use content::payload_capacity;
use inode::{InodeHandle, Metadata, Registry};
use storage::{BlockStore, BlockTag, InodeRecord, Superblock};

/// Index of a block in the store.
pub type BlockIndex = usize;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FSError {
    #[error("No such file")]
    NotFound,
    #[error("File name is {len} bytes long, the limit is {max}")]
    NameTooLong { len: usize, max: usize },
    #[error("File names must be non-empty and cannot be '.', '..' or contain '/' or NUL")]
    InvalidName,
    #[error("A file with that name already exists")]
    AlreadyExists,
    #[error("Not enough space for operation")]
    OutOfSpace,
    #[error("Offset plus length overflows the file size")]
    FileTooLarge,
    #[error("The block size is not valid (must be at least 512 and a multiple of 16)")]
    InvalidBlockSize,
    #[error("The device is invalid (needs at least two blocks)")]
    InvalidDevice,
    #[error("A name limit of {0} bytes does not fit an inode block")]
    InvalidNameLimit(usize),
    #[error("The expected block size is {expected}, but the store reports {device}")]
    BlockSizeMismatch { expected: usize, device: usize },
    #[error("Block {0} is already allocated")]
    AlreadyAllocated(BlockIndex),
    #[error("Block {0} is not allocated")]
    NotAllocated(BlockIndex),
    #[error("Block {0} is not mapped")]
    Unmapped(BlockIndex),
    #[error("Block {0} was freed twice")]
    DoubleFree(BlockIndex),
    #[error("Block {0} is reserved and cannot be freed")]
    Reserved(BlockIndex),
    #[error("Block {0} has an unexpected tag value. This indicates a corrupted filesystem")]
    InvalidBlockTag(BlockIndex),
    #[error("Corrupt page chain at block {page}: {reason}")]
    CorruptChain { page: BlockIndex, reason: &'static str },
    #[error("The inode record in block {0} does not match the live inode")]
    StaleRecord(BlockIndex),
    #[error("The superblock does not match the allocator state")]
    StaleSuperblock,
    #[error("Allocator reports {allocated} blocks in use, files account for {expected}")]
    LeakedBlocks { allocated: usize, expected: usize },
    #[error("Failed to pack a block header")]
    Packing(#[from] PackingError),
}

impl FSError {
    /// Broken invariants, as opposed to outcomes a caller
    /// is expected to handle.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::AlreadyAllocated(_)
                | Self::NotAllocated(_)
                | Self::Unmapped(_)
                | Self::DoubleFree(_)
                | Self::Reserved(_)
                | Self::InvalidBlockTag(_)
                | Self::CorruptChain { .. }
                | Self::StaleRecord(_)
                | Self::StaleSuperblock
                | Self::LeakedBlocks { .. }
                | Self::Packing(_)
        )
    }

    pub fn errno(&self) -> libc::c_int {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::NameTooLong { .. } => libc::ENAMETOOLONG,
            Self::InvalidName => libc::EINVAL,
            Self::AlreadyExists => libc::EEXIST,
            Self::OutOfSpace => libc::ENOSPC,
            Self::FileTooLarge => libc::EFBIG,
            _ => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, FSError>;

/// Geometry and limits chosen at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountConfig {
    pub block_size: usize,
    pub block_count: usize,
    pub max_name_len: usize,
}

impl MountConfig {
    pub const MIN_BLOCK_SIZE: usize = 512;
    pub const DEFAULT_BLOCK_SIZE: usize = 4096;
    /// 4 GiB of address space with the default block size.
    pub const DEFAULT_BLOCK_COUNT: usize = 1024 * 1024;
    pub const DEFAULT_MAX_NAME_LEN: usize = 255;

    pub fn validate(&self) -> Result<()> {
        if self.block_size < Self::MIN_BLOCK_SIZE
            || self.block_size % 16 != 0
            || self.block_size > u32::MAX as usize
        {
            return Err(FSError::InvalidBlockSize);
        }
        if self.block_count <= 1 {
            return Err(FSError::InvalidDevice);
        }
        if self.max_name_len == 0 || InodeRecord::SIZE + self.max_name_len > self.block_size {
            return Err(FSError::InvalidNameLimit(self.max_name_len));
        }
        Ok(())
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
            block_count: Self::DEFAULT_BLOCK_COUNT,
            max_name_len: Self::DEFAULT_MAX_NAME_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
}

/// What `stat` reports for an entry. `handle` is `None`
/// for the root directory, which has no inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub handle: Option<InodeHandle>,
    pub kind: FileKind,
    pub size: u64,
    /// In 512 byte units.
    pub blocks: u64,
    pub block_size: u32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub attr: Attr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub block_size: u32,
    pub max_name_len: u32,
}

/// One mounted filesystem. All state lives here, and every
/// mutation goes through `&mut self`, so a single owner
/// serializes all access.
#[derive(Debug)]
pub struct FileSystem<Store: BlockStore> {
    store: Store,
    allocator: Allocator,
    registry: Registry,
    config: MountConfig,
    root: Metadata,
}

impl<Store: BlockStore> FileSystem<Store> {
    /// Sets up an empty filesystem on `store`: superblock,
    /// allocator with everything but the superblock free,
    /// and no files.
    pub fn mount(mut store: Store, config: MountConfig) -> Result<Self> {
        config.validate()?;
        if store.block_size() != config.block_size {
            return Err(FSError::BlockSizeMismatch {
                expected: config.block_size,
                device: store.block_size(),
            });
        }
        if store.block_count() < config.block_count {
            return Err(FSError::InvalidDevice);
        }
        let mut allocator = Allocator::new(config.block_count);
        allocator.reserve(&mut store, Superblock::INDEX)?;
        let mut root = Metadata::new(0o755, 0, 0);
        root.nlink = 2;
        let mut fs = Self {
            store,
            allocator,
            registry: Registry::new(config.max_name_len),
            config,
            root,
        };
        fs.sync_superblock()?;
        info!(
            "Mounted {} blocks of {} bytes ({} payload bytes per page)",
            config.block_count,
            config.block_size,
            payload_capacity(config.block_size)
        );
        Ok(fs)
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn next_free_block(&self) -> u64 {
        ((self.allocator.cursor() + 1) % self.config.block_count) as u64
    }

    /// Block 0 mirrors the allocator, so every path that
    /// allocates or frees ends here.
    fn sync_superblock(&mut self) -> Result<()> {
        Superblock {
            block_count: self.config.block_count as u64,
            block_size: self.config.block_size as u64,
            free_count: self.allocator.free_count() as u64,
            next_free_block: self.next_free_block(),
            max_name_len: self.config.max_name_len as u32,
            tag: BlockTag::Superblock,
        }
        .write(&mut self.store)
    }

    pub fn superblock(&self) -> Result<Superblock> {
        Superblock::read(&self.store)
    }

    pub fn statfs(&self) -> Result<StatFs> {
        let superblock = self.superblock()?;
        Ok(StatFs {
            blocks: superblock.block_count,
            blocks_free: superblock.free_count,
            files: self.registry.len() as u64,
            block_size: superblock.block_size as u32,
            max_name_len: superblock.max_name_len,
        })
    }

    pub fn lookup(&self, name: &[u8]) -> Option<InodeHandle> {
        self.registry.lookup(name)
    }

    fn resolve(&self, name: &[u8]) -> Result<InodeHandle> {
        self.lookup(name).ok_or(FSError::NotFound)
    }

    pub fn root_attr(&self) -> Attr {
        Attr {
            handle: None,
            kind: FileKind::Directory,
            size: 0,
            blocks: 0,
            block_size: self.config.block_size as u32,
            metadata: self.root,
        }
    }

    pub fn attr_of(&self, handle: InodeHandle) -> Result<Attr> {
        let inode = self.registry.get(handle)?;
        let pages = inode.content.pages().len() as u64;
        Ok(Attr {
            handle: Some(handle),
            kind: FileKind::RegularFile,
            size: inode.size(),
            blocks: pages * self.config.block_size as u64 / 512,
            block_size: self.config.block_size as u32,
            metadata: inode.metadata,
        })
    }

    /// Attributes by path. `/` is the root directory,
    /// anything else names a file with or without a
    /// leading slash.
    pub fn attr(&self, path: &[u8]) -> Result<Attr> {
        if path == b"/" {
            return Ok(self.root_attr());
        }
        let name = path.strip_prefix(b"/").unwrap_or(path);
        self.attr_of(self.resolve(name)?)
    }

    /// `.`, `..` and then every file, newest first.
    pub fn list(&self) -> Vec<DirEntry> {
        let root = self.root_attr();
        let dots = [b".".to_vec(), b"..".to_vec()]
            .into_iter()
            .map(|name| DirEntry { name, attr: root });
        let files = self.registry.iter().filter_map(|(handle, inode)| {
            Some(DirEntry {
                name: inode.name().to_vec(),
                attr: self.attr_of(handle).ok()?,
            })
        });
        dots.chain(files).collect()
    }

    pub fn create_file(&mut self, name: &[u8], metadata: Metadata) -> Result<InodeHandle> {
        let handle = self
            .registry
            .create(&mut self.allocator, &mut self.store, name, metadata)?;
        self.sync_superblock()?;
        Ok(handle)
    }

    pub fn read(&self, name: &[u8], offset: u64, len: usize) -> Result<Vec<u8>> {
        self.read_at(self.resolve(name)?, offset, len)
    }

    pub fn read_at(&self, handle: InodeHandle, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.registry
            .get(handle)?
            .content
            .read(&self.store, offset, len)
    }

    pub fn write(&mut self, name: &[u8], offset: u64, data: &[u8]) -> Result<usize> {
        let handle = self.resolve(name)?;
        self.write_at(handle, offset, data)
    }

    pub fn write_at(&mut self, handle: InodeHandle, offset: u64, data: &[u8]) -> Result<usize> {
        let inode = self.registry.get_mut(handle)?;
        let written = inode
            .content
            .write(&mut self.allocator, &mut self.store, offset, data)?;
        if written > 0 {
            inode.metadata.touch();
            inode.sync_record(&mut self.store, handle)?;
            self.sync_superblock()?;
        }
        Ok(written)
    }

    pub fn truncate(&mut self, name: &[u8], new_size: u64) -> Result<()> {
        let handle = self.resolve(name)?;
        self.truncate_at(handle, new_size)
    }

    pub fn truncate_at(&mut self, handle: InodeHandle, new_size: u64) -> Result<()> {
        let inode = self.registry.get_mut(handle)?;
        // Same size leaves the times alone, as ftruncate does.
        if inode.size() == new_size {
            return Ok(());
        }
        inode
            .content
            .truncate(&mut self.allocator, &mut self.store, new_size)?;
        inode.metadata.touch();
        inode.sync_record(&mut self.store, handle)?;
        self.sync_superblock()?;
        debug!("Truncated block {} to {new_size} bytes", handle.block());
        Ok(())
    }

    /// Replaces a file's stat fields, as `chmod`, `chown` and
    /// `utimens` do.
    pub fn set_metadata(&mut self, handle: InodeHandle, metadata: Metadata) -> Result<()> {
        self.registry.get_mut(handle)?.metadata = metadata;
        Ok(())
    }

    pub fn delete(&mut self, name: &[u8]) -> Result<()> {
        self.registry
            .delete(&mut self.allocator, &mut self.store, name)?;
        self.sync_superblock()
    }

    /// Audits the whole filesystem: every chain against its size,
    /// every inode record against its inode, and the allocator
    /// against the superblock and the blocks files actually own.
    pub fn check(&self) -> Result<()> {
        let superblock = self.superblock()?;
        if superblock.free_count != self.allocator.free_count() as u64
            || superblock.next_free_block != self.next_free_block()
        {
            return Err(FSError::StaleSuperblock);
        }
        let mut expected = 1;
        for (handle, inode) in self.registry.iter() {
            inode.content.verify(&self.store)?;
            let (record, name) = InodeRecord::read(&self.store, handle.block())?;
            if record.size != inode.size()
                || record.head != inode.content.head().unwrap_or(0) as u64
                || name != inode.name()
            {
                return Err(FSError::StaleRecord(handle.block()));
            }
            expected += 1 + inode.content.pages().len();
        }
        let allocated = self.allocator.used_count();
        if allocated != expected {
            return Err(FSError::LeakedBlocks {
                allocated,
                expected,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
fn mount_heap(block_size: usize, block_count: usize) -> FileSystem<storage::HeapStore> {
    FileSystem::mount(
        storage::HeapStore::new(block_size, block_count),
        MountConfig {
            block_size,
            block_count,
            max_name_len: MountConfig::DEFAULT_MAX_NAME_LEN,
        },
    )
    .unwrap()
}

#[test]
fn test_mount_writes_superblock() {
    let fs = mount_heap(4096, 64);
    let superblock = fs.superblock().unwrap();
    assert_eq!(superblock.block_count, 64);
    assert_eq!(superblock.block_size, 4096);
    assert_eq!(superblock.free_count, 63);
    assert!(fs.store().is_allocated(0));
    assert!(fs.registry().is_empty());
    let stat = fs.statfs().unwrap();
    assert_eq!(stat.blocks_free, 63);
    assert_eq!(stat.max_name_len, 255);
    fs.check().unwrap();
}

#[test]
fn test_mount_rejects_bad_geometry() {
    let bad = [
        (100, 64, 255),
        (4100, 64, 255),
        (4096, 1, 255),
        (512, 64, 500),
    ];
    for (block_size, block_count, max_name_len) in bad {
        let config = MountConfig {
            block_size,
            block_count,
            max_name_len,
        };
        let store = storage::HeapStore::new(block_size, block_count);
        assert!(FileSystem::mount(store, config).is_err());
    }
    let store = storage::HeapStore::new(1024, 64);
    assert!(matches!(
        FileSystem::mount(
            store,
            MountConfig {
                block_size: 4096,
                block_count: 64,
                max_name_len: 255,
            }
        ),
        Err(FSError::BlockSizeMismatch { expected: 4096, device: 1024 })
    ));
}

#[test]
fn test_small_write_then_read() {
    let mut fs = mount_heap(4096, 64);
    fs.create_file(b"a", Metadata::default()).unwrap();
    assert_eq!(fs.attr(b"/a").unwrap().size, 0);
    assert_eq!(fs.write(b"a", 0, b"0123456789").unwrap(), 10);
    assert_eq!(fs.attr(b"a").unwrap().size, 10);
    assert_eq!(fs.read(b"a", 0, 10).unwrap(), b"0123456789");
    fs.check().unwrap();
}

#[test]
fn test_large_blocks_chain_shape() {
    const BLOCK: usize = 256 * 1024;
    let mut fs = mount_heap(BLOCK, 16);
    let handle = fs.create_file(b"big", Metadata::default()).unwrap();
    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(fs.write(b"big", 0, &data).unwrap(), 300_000);
    let inode = fs.registry().get(handle).unwrap();
    assert_eq!(inode.content.pages().len(), 2);
    let payload = BLOCK - storage::PageHeader::SIZE;
    assert_eq!(inode.content.tail_fill(payload), 300_000 - payload);
    let tail = *inode.content.pages().last().unwrap();
    let header = storage::PageHeader::read(fs.store(), tail).unwrap();
    assert_eq!(header.fill as usize, 300_000 - (BLOCK - 16));
    assert_eq!(header.next_page(), None);
    assert_eq!(fs.read(b"big", 0, 300_000).unwrap(), data);

    fs.truncate(b"big", 100).unwrap();
    let inode = fs.registry().get(handle).unwrap();
    assert_eq!(inode.content.pages().len(), 1);
    assert!(fs.read(b"big", 100, 900).unwrap().is_empty());
    assert_eq!(fs.read(b"big", 0, 100).unwrap(), &data[..100]);
    fs.check().unwrap();
}

#[test]
fn test_delete_frees_whole_chain() {
    let mut fs = mount_heap(512, 64);
    let free_before = fs.allocator().free_count();
    fs.create_file(b"f", Metadata::default()).unwrap();
    let payload = payload_capacity(512);
    fs.write(b"f", 0, &vec![1; payload * 2 + 1]).unwrap();
    let handle = fs.lookup(b"f").unwrap();
    let pages = fs.registry().get(handle).unwrap().content.pages().to_vec();
    assert_eq!(pages.len(), 3);
    fs.delete(b"f").unwrap();
    for page in pages {
        assert!(!fs.allocator().is_used(page));
        assert!(!fs.store().is_allocated(page));
    }
    assert_eq!(fs.allocator().free_count(), free_before);
    assert!(matches!(fs.delete(b"f"), Err(FSError::NotFound)));
    fs.check().unwrap();
}

#[test]
fn test_missing_files_and_root() {
    let mut fs = mount_heap(512, 16);
    assert!(matches!(fs.attr(b"/nope"), Err(FSError::NotFound)));
    assert!(matches!(fs.read(b"nope", 0, 1), Err(FSError::NotFound)));
    assert!(matches!(fs.write(b"nope", 0, b"x"), Err(FSError::NotFound)));
    assert!(matches!(fs.truncate(b"nope", 3), Err(FSError::NotFound)));
    let root = fs.attr(b"/").unwrap();
    assert_eq!(root.kind, FileKind::Directory);
    assert_eq!(root.metadata.perm, 0o755);
    assert_eq!(root.handle, None);
}

#[test]
fn test_list_includes_dots_newest_first() {
    let mut fs = mount_heap(512, 16);
    fs.create_file(b"old", Metadata::default()).unwrap();
    fs.create_file(b"new", Metadata::default()).unwrap();
    fs.write(b"new", 0, b"hello").unwrap();
    let names: Vec<_> = fs.list().into_iter().map(|entry| entry.name).collect();
    assert_eq!(
        names,
        [b".".to_vec(), b"..".to_vec(), b"new".to_vec(), b"old".to_vec()]
    );
    let entries = fs.list();
    assert_eq!(entries[2].attr.size, 5);
    assert_eq!(entries[0].attr.kind, FileKind::Directory);
}

#[test]
fn test_truncate_is_idempotent() {
    let mut fs = mount_heap(512, 32);
    fs.create_file(b"t", Metadata::default()).unwrap();
    fs.write(b"t", 0, &[4; 2000]).unwrap();
    fs.truncate(b"t", 700).unwrap();
    let pages = fs.registry().get(fs.lookup(b"t").unwrap()).unwrap().content.pages().to_vec();
    let size = fs.attr(b"t").unwrap().size;
    fs.truncate(b"t", size).unwrap();
    let again = fs.registry().get(fs.lookup(b"t").unwrap()).unwrap().content.pages().to_vec();
    assert_eq!(pages, again);
    assert_eq!(fs.attr(b"t").unwrap().size, 700);
    fs.check().unwrap();
}

#[test]
fn test_set_metadata_copies_fields() {
    let mut fs = mount_heap(512, 16);
    let handle = fs.create_file(b"m", Metadata::new(0o600, 1000, 100)).unwrap();
    let mut metadata = fs.attr_of(handle).unwrap().metadata;
    assert_eq!((metadata.perm, metadata.uid, metadata.gid), (0o600, 1000, 100));
    metadata.perm = 0o640;
    metadata.atime = std::time::SystemTime::UNIX_EPOCH;
    fs.set_metadata(handle, metadata).unwrap();
    let attr = fs.attr_of(handle).unwrap();
    assert_eq!(attr.metadata.perm, 0o640);
    assert_eq!(attr.metadata.atime, std::time::SystemTime::UNIX_EPOCH);
}

#[test]
fn test_error_classification() {
    assert!(!FSError::NotFound.is_internal());
    assert!(!FSError::OutOfSpace.is_internal());
    assert!(FSError::DoubleFree(3).is_internal());
    assert_eq!(FSError::OutOfSpace.errno(), libc::ENOSPC);
    assert_eq!(FSError::NameTooLong { len: 300, max: 255 }.errno(), libc::ENAMETOOLONG);
    assert_eq!(
        FSError::CorruptChain { page: 1, reason: "test" }.errno(),
        libc::EIO
    );
}

#[test]
fn test_truncate_to_same_size_keeps_times() {
    let mut fs = mount_heap(512, 16);
    let handle = fs.create_file(b"f", Metadata::default()).unwrap();
    fs.write(b"f", 0, b"12345").unwrap();
    let mut metadata = fs.attr_of(handle).unwrap().metadata;
    metadata.mtime = std::time::SystemTime::UNIX_EPOCH;
    metadata.ctime = std::time::SystemTime::UNIX_EPOCH;
    fs.set_metadata(handle, metadata).unwrap();
    fs.truncate(b"f", 5).unwrap();
    assert_eq!(fs.attr_of(handle).unwrap().metadata, metadata);
    fs.truncate(b"f", 4).unwrap();
    assert_ne!(
        fs.attr_of(handle).unwrap().metadata.mtime,
        std::time::SystemTime::UNIX_EPOCH
    );
}

#[test]
fn test_empty_write_keeps_times() {
    let mut fs = mount_heap(512, 16);
    let handle = fs.create_file(b"f", Metadata::default()).unwrap();
    let mut metadata = fs.attr_of(handle).unwrap().metadata;
    metadata.mtime = std::time::SystemTime::UNIX_EPOCH;
    metadata.ctime = std::time::SystemTime::UNIX_EPOCH;
    fs.set_metadata(handle, metadata).unwrap();
    assert_eq!(fs.write(b"f", 0, b"").unwrap(), 0);
    assert_eq!(fs.write(b"f", 100, b"").unwrap(), 0);
    let attr = fs.attr_of(handle).unwrap();
    assert_eq!(attr.metadata, metadata);
    assert_eq!(attr.size, 0);
}

#[test]
fn test_superblock_follows_allocator() {
    let mut fs = mount_heap(512, 32);
    fs.create_file(b"s", Metadata::default()).unwrap();
    fs.write(b"s", 0, &[6; 1200]).unwrap();
    let free = fs.allocator().free_count() as u64;
    assert_eq!(free, 32 - 1 - 1 - 3);
    assert_eq!(fs.superblock().unwrap().free_count, free);
    fs.check().unwrap();
    fs.truncate(b"s", 10).unwrap();
    assert_eq!(fs.superblock().unwrap().free_count, free + 2);
    fs.check().unwrap();
    fs.delete(b"s").unwrap();
    let superblock = fs.superblock().unwrap();
    assert_eq!(superblock.free_count, 31);
    assert_eq!(fs.statfs().unwrap().blocks_free, 31);
    fs.check().unwrap();
}
