//! The flat set of live files.
//!
//! Every inode owns one metadata block, and the block index
//! doubles as the inode's handle. Names are unique and
//! resolved through a hash index; enumeration walks the
//! insertion order backwards, so the newest file comes first.

use super::alloc::Allocator;
use super::content::Chain;
use super::storage::{BlockStore, BlockTag, InodeRecord};
use super::{BlockIndex, FSError, Result};
use std::collections::HashMap;
use std::time::SystemTime;
use tracing::debug;

/// Stable reference to a live inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeHandle(BlockIndex);

impl InodeHandle {
    pub fn new(block: BlockIndex) -> Self {
        Self(block)
    }

    /// The metadata block owned by this inode.
    pub fn block(self) -> BlockIndex {
        self.0
    }
}

/// The stat fields a file carries around. Copied verbatim
/// from whoever creates the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub perm: u16,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl Metadata {
    pub fn new(perm: u16, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            perm,
            uid,
            gid,
            nlink: 1,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }

    /// Content changed.
    pub fn touch(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new(0o644, 0, 0)
    }
}

#[derive(Debug)]
pub struct Inode {
    name: Vec<u8>,
    pub metadata: Metadata,
    pub content: Chain,
}

impl Inode {
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.content.size()
    }

    /// Refreshes the record kept in the inode's metadata block.
    pub fn sync_record<S: BlockStore>(&self, store: &mut S, handle: InodeHandle) -> Result<()> {
        InodeRecord {
            size: self.size(),
            head: self.content.head().unwrap_or(0) as u64,
            name_len: self.name.len() as u32,
            tag: BlockTag::Inode,
        }
        .write(store, handle.block(), &self.name)
    }
}

#[derive(Debug)]
pub struct Registry {
    inodes: HashMap<InodeHandle, Inode>,
    names: HashMap<Vec<u8>, InodeHandle>,
    /// Oldest first.
    order: Vec<InodeHandle>,
    max_name_len: usize,
}

impl Registry {
    pub fn new(max_name_len: usize) -> Self {
        Self {
            inodes: HashMap::new(),
            names: HashMap::new(),
            order: Vec::new(),
            max_name_len,
        }
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    /// Newest live inode.
    pub fn root(&self) -> Option<InodeHandle> {
        self.order.last().copied()
    }

    fn validate_name(&self, name: &[u8]) -> Result<()> {
        if name.len() > self.max_name_len {
            return Err(FSError::NameTooLong {
                len: name.len(),
                max: self.max_name_len,
            });
        }
        if name.is_empty()
            || name == b"."
            || name == b".."
            || name.contains(&b'/')
            || name.contains(&0)
        {
            return Err(FSError::InvalidName);
        }
        Ok(())
    }

    pub fn create<S: BlockStore>(
        &mut self,
        alloc: &mut Allocator,
        store: &mut S,
        name: &[u8],
        metadata: Metadata,
    ) -> Result<InodeHandle> {
        self.validate_name(name)?;
        if self.names.contains_key(name) {
            return Err(FSError::AlreadyExists);
        }
        let handle = InodeHandle(alloc.allocate(store)?);
        let inode = Inode {
            name: name.to_vec(),
            metadata,
            content: Chain::default(),
        };
        if let Err(err) = inode.sync_record(store, handle) {
            alloc.free(store, handle.block())?;
            return Err(err);
        }
        self.names.insert(inode.name.clone(), handle);
        self.inodes.insert(handle, inode);
        self.order.push(handle);
        debug!(
            "Created inode {:?} at block {}",
            String::from_utf8_lossy(name),
            handle.block()
        );
        Ok(handle)
    }

    pub fn lookup(&self, name: &[u8]) -> Option<InodeHandle> {
        self.names.get(name).copied()
    }

    pub fn get(&self, handle: InodeHandle) -> Result<&Inode> {
        self.inodes.get(&handle).ok_or(FSError::NotFound)
    }

    pub fn get_mut(&mut self, handle: InodeHandle) -> Result<&mut Inode> {
        self.inodes.get_mut(&handle).ok_or(FSError::NotFound)
    }

    /// Live inodes, newest first. Every call starts over.
    pub fn iter(&self) -> impl Iterator<Item = (InodeHandle, &Inode)> + '_ {
        self.order
            .iter()
            .rev()
            .filter_map(|handle| self.inodes.get(handle).map(|inode| (*handle, inode)))
    }

    /// Removes a file: its pages first, then its metadata block,
    /// then its registry entry.
    pub fn delete<S: BlockStore>(
        &mut self,
        alloc: &mut Allocator,
        store: &mut S,
        name: &[u8],
    ) -> Result<()> {
        let handle = self.lookup(name).ok_or(FSError::NotFound)?;
        let inode = self.inodes.get_mut(&handle).ok_or(FSError::NotFound)?;
        inode.content.release(alloc, store)?;
        alloc.free(store, handle.block())?;
        self.inodes.remove(&handle);
        self.names.remove(name);
        self.order.retain(|h| *h != handle);
        debug!(
            "Deleted inode {:?} at block {}",
            String::from_utf8_lossy(name),
            handle.block()
        );
        Ok(())
    }
}

#[cfg(test)]
fn setup(capacity: usize) -> (Allocator, crate::fs::storage::HeapStore, Registry) {
    let mut store = crate::fs::storage::HeapStore::new(512, capacity);
    let mut alloc = Allocator::new(capacity);
    alloc.reserve(&mut store, 0).unwrap();
    (alloc, store, Registry::new(255))
}

#[test]
fn test_create_lookup_enumerate() {
    let (mut alloc, mut store, mut registry) = setup(16);
    let a = registry
        .create(&mut alloc, &mut store, b"a", Metadata::default())
        .unwrap();
    let b = registry
        .create(&mut alloc, &mut store, b"b", Metadata::default())
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(registry.lookup(b"a"), Some(a));
    assert_eq!(registry.lookup(b"c"), None);
    assert_eq!(registry.root(), Some(b));
    let names: Vec<_> = registry.iter().map(|(_, inode)| inode.name().to_vec()).collect();
    assert_eq!(names, [b"b".to_vec(), b"a".to_vec()]);
    // Restartable.
    assert_eq!(registry.iter().count(), 2);
    // An empty file owns its metadata block only.
    assert_eq!(registry.get(a).unwrap().content.head(), None);
    assert_eq!(alloc.used_count(), 3);
    let (record, name) = InodeRecord::read(&store, a.block()).unwrap();
    assert_eq!(record.size, 0);
    assert_eq!(record.head, 0);
    assert_eq!(name, b"a");
}

#[test]
fn test_create_rejects_bad_names() {
    let (mut alloc, mut store, mut registry) = setup(16);
    let long = vec![b'x'; 256];
    assert!(matches!(
        registry.create(&mut alloc, &mut store, &long, Metadata::default()),
        Err(FSError::NameTooLong { len: 256, max: 255 })
    ));
    registry
        .create(&mut alloc, &mut store, &long[..255], Metadata::default())
        .unwrap();
    for bad in [&b""[..], b".", b"..", b"a/b", b"nul\0"] {
        assert!(matches!(
            registry.create(&mut alloc, &mut store, bad, Metadata::default()),
            Err(FSError::InvalidName)
        ));
    }
    assert!(matches!(
        registry.create(&mut alloc, &mut store, &long[..255], Metadata::default()),
        Err(FSError::AlreadyExists)
    ));
    assert_eq!(registry.len(), 1);
    assert_eq!(alloc.used_count(), 2);
}

#[test]
fn test_delete_unlinks_and_frees() {
    let (mut alloc, mut store, mut registry) = setup(16);
    for name in [&b"x"[..], b"y", b"z"] {
        registry
            .create(&mut alloc, &mut store, name, Metadata::default())
            .unwrap();
    }
    let y = registry.lookup(b"y").unwrap();
    let inode = registry.get_mut(y).unwrap();
    inode
        .content
        .write(&mut alloc, &mut store, 0, &[5; 1200])
        .unwrap();
    assert_eq!(alloc.used_count(), 7);
    registry.delete(&mut alloc, &mut store, b"y").unwrap();
    assert_eq!(alloc.used_count(), 3);
    assert!(!store.is_allocated(y.block()));
    assert!(matches!(
        registry.delete(&mut alloc, &mut store, b"y"),
        Err(FSError::NotFound)
    ));
    let names: Vec<_> = registry.iter().map(|(_, inode)| inode.name().to_vec()).collect();
    assert_eq!(names, [b"z".to_vec(), b"x".to_vec()]);
    registry.delete(&mut alloc, &mut store, b"z").unwrap();
    assert_eq!(registry.root(), registry.lookup(b"x"));
}
