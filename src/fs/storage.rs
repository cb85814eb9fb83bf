//! This module implements the block store
//! the filesystem lives in. Blocks are
//! backed on demand by zeroed memory and
//! handed back on release, nothing is ever
//! written to disk.
//!
//! It also holds the packed headers that
//! sit at the start of the superblock,
//! inode blocks and content pages.

use super::{BlockIndex, FSError, Result};
use packed_struct::prelude::*;
use packed_struct::PackedStructSlice;
use std::fmt;
use std::ptr::NonNull;
use tracing::{trace, warn};

/// Trait that abstracts out the memory blocks
/// are carved from. The mounted filesystem uses
/// anonymous mappings, tests use heap buffers.
///
/// Slices returned by [`BlockStore::access`] borrow
/// the store, so no caller can keep a view of a
/// block across [`BlockStore::release_raw`].
pub trait BlockStore {
    /// The total amount of block indices
    fn block_count(&self) -> usize;
    /// The size of a single block. It is required
    /// all blocks are the same size.
    fn block_size(&self) -> usize;
    /// Whether `index` is currently backed by memory.
    fn is_allocated(&self, index: BlockIndex) -> bool;
    /// Back `index` with a zeroed block.
    fn allocate_raw(&mut self, index: BlockIndex) -> Result<()>;
    /// Drop the memory behind `index`, discarding its contents.
    fn release_raw(&mut self, index: BlockIndex) -> Result<()>;
    fn access(&self, index: BlockIndex) -> Result<&[u8]>;
    fn access_mut(&mut self, index: BlockIndex) -> Result<&mut [u8]>;
}

/// Block store over plain heap buffers.
pub struct HeapStore {
    block_size: usize,
    blocks: Vec<Option<Box<[u8]>>>,
}

impl HeapStore {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        let mut blocks = Vec::with_capacity(block_count);
        blocks.resize_with(block_count, || None);
        Self { block_size, blocks }
    }
}

impl fmt::Debug for HeapStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapStore")
            .field("block_size", &self.block_size)
            .field("block_count", &self.blocks.len())
            .finish()
    }
}

impl BlockStore for HeapStore {
    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn is_allocated(&self, index: BlockIndex) -> bool {
        matches!(self.blocks.get(index), Some(Some(_)))
    }

    fn allocate_raw(&mut self, index: BlockIndex) -> Result<()> {
        let slot = self.blocks.get_mut(index).ok_or(FSError::Unmapped(index))?;
        if slot.is_some() {
            return Err(FSError::AlreadyAllocated(index));
        }
        *slot = Some(vec![0; self.block_size].into_boxed_slice());
        Ok(())
    }

    fn release_raw(&mut self, index: BlockIndex) -> Result<()> {
        match self.blocks.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(FSError::NotAllocated(index)),
        }
    }

    fn access(&self, index: BlockIndex) -> Result<&[u8]> {
        match self.blocks.get(index) {
            Some(Some(block)) => Ok(&block[..]),
            _ => Err(FSError::Unmapped(index)),
        }
    }

    fn access_mut(&mut self, index: BlockIndex) -> Result<&mut [u8]> {
        match self.blocks.get_mut(index) {
            Some(Some(block)) => Ok(&mut block[..]),
            _ => Err(FSError::Unmapped(index)),
        }
    }
}

/// Block store where every block is its own private
/// anonymous mapping, so released blocks go straight
/// back to the kernel.
pub struct AnonymousStore {
    block_size: usize,
    blocks: Vec<Option<NonNull<u8>>>,
}

impl AnonymousStore {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            blocks: vec![None; block_count],
        }
    }

    fn mmap_block(&self) -> Result<NonNull<u8>> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.block_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            warn!(
                "mmap of a {} byte block failed: {}",
                self.block_size,
                std::io::Error::last_os_error()
            );
            return Err(FSError::OutOfSpace);
        }
        NonNull::new(addr as *mut u8).ok_or(FSError::OutOfSpace)
    }

    fn munmap_block(&self, addr: NonNull<u8>) {
        let err = unsafe { libc::munmap(addr.as_ptr() as *mut libc::c_void, self.block_size) };
        if err != 0 {
            warn!(
                "munmap of block at {:p} failed: {}",
                addr,
                std::io::Error::last_os_error()
            );
        }
    }
}

impl fmt::Debug for AnonymousStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymousStore")
            .field("block_size", &self.block_size)
            .field("block_count", &self.blocks.len())
            .finish()
    }
}

impl BlockStore for AnonymousStore {
    fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn is_allocated(&self, index: BlockIndex) -> bool {
        matches!(self.blocks.get(index), Some(Some(_)))
    }

    fn allocate_raw(&mut self, index: BlockIndex) -> Result<()> {
        match self.blocks.get(index) {
            None => return Err(FSError::Unmapped(index)),
            Some(Some(_)) => return Err(FSError::AlreadyAllocated(index)),
            Some(None) => {}
        }
        // Anonymous mappings come back zero-filled.
        let addr = self.mmap_block()?;
        self.blocks[index] = Some(addr);
        trace!("Mapped block {index} at {addr:p}");
        Ok(())
    }

    fn release_raw(&mut self, index: BlockIndex) -> Result<()> {
        let addr = self
            .blocks
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(FSError::NotAllocated(index))?;
        self.munmap_block(addr);
        Ok(())
    }

    fn access(&self, index: BlockIndex) -> Result<&[u8]> {
        match self.blocks.get(index) {
            Some(Some(addr)) => {
                Ok(unsafe { std::slice::from_raw_parts(addr.as_ptr(), self.block_size) })
            }
            _ => Err(FSError::Unmapped(index)),
        }
    }

    fn access_mut(&mut self, index: BlockIndex) -> Result<&mut [u8]> {
        match self.blocks.get(index) {
            Some(Some(addr)) => {
                Ok(unsafe { std::slice::from_raw_parts_mut(addr.as_ptr(), self.block_size) })
            }
            _ => Err(FSError::Unmapped(index)),
        }
    }
}

impl Drop for AnonymousStore {
    fn drop(&mut self) {
        let mapped: Vec<_> = self.blocks.iter_mut().filter_map(Option::take).collect();
        for addr in mapped {
            self.munmap_block(addr);
        }
    }
}

#[derive(PrimitiveEnum_u32, Clone, Copy, PartialEq, Debug)]
#[non_exhaustive]
pub enum BlockTag {
    Superblock = 0x00FF_FFFF,
    Inode = 0xFFFF_0000,
    Page = 0x0000_FFFF,
}

/// Sits at the start of every content page.
#[derive(PackedStruct, Clone, Copy, PartialEq, Debug)]
#[packed_struct(endian = "lsb")]
pub struct PageHeader {
    /// Index of the following page, 0 on the tail.
    /// Block 0 is the superblock, so it can never
    /// be a content page.
    pub next: u64,
    /// Payload bytes in use. Always the full payload
    /// on pages that are not the tail.
    pub fill: u32,
    #[packed_field(element_size_bytes = "4", ty = "enum")]
    pub tag: BlockTag,
}

impl PageHeader {
    pub const SIZE: usize = 16;

    pub fn new(next: Option<BlockIndex>, fill: usize) -> Self {
        Self {
            next: next.unwrap_or(0) as u64,
            fill: fill as u32,
            tag: BlockTag::Page,
        }
    }

    pub fn next_page(&self) -> Option<BlockIndex> {
        (self.next != 0).then_some(self.next as BlockIndex)
    }

    pub fn read(store: &impl BlockStore, page: BlockIndex) -> Result<Self> {
        let block = store.access(page)?;
        let header = unpack_tagged::<Self>(&block[..Self::SIZE], page)?;
        if header.tag != BlockTag::Page {
            return Err(FSError::InvalidBlockTag(page));
        }
        Ok(header)
    }

    pub fn write(&self, store: &mut impl BlockStore, page: BlockIndex) -> Result<()> {
        let bytes: [u8; Self::SIZE] = self.pack()?;
        store.access_mut(page)?[..Self::SIZE].copy_from_slice(&bytes);
        Ok(())
    }
}

#[derive(PackedStruct, Clone, Copy, PartialEq, Debug)]
#[packed_struct(endian = "lsb")]
pub struct Superblock {
    pub block_count: u64,
    pub block_size: u64,
    pub free_count: u64,
    pub next_free_block: u64,
    pub max_name_len: u32,
    #[packed_field(element_size_bytes = "4", ty = "enum")]
    pub tag: BlockTag,
}

impl Superblock {
    pub const SIZE: usize = 40;
    pub const INDEX: BlockIndex = 0;

    pub fn read(store: &impl BlockStore) -> Result<Self> {
        let block = store.access(Self::INDEX)?;
        let superblock = unpack_tagged::<Self>(&block[..Self::SIZE], Self::INDEX)?;
        if superblock.tag != BlockTag::Superblock {
            return Err(FSError::InvalidBlockTag(Self::INDEX));
        }
        Ok(superblock)
    }

    pub fn write(&self, store: &mut impl BlockStore) -> Result<()> {
        let bytes: [u8; Self::SIZE] = self.pack()?;
        store.access_mut(Self::INDEX)?[..Self::SIZE].copy_from_slice(&bytes);
        Ok(())
    }
}

/// Record at the start of an inode's metadata block,
/// followed by `name_len` bytes of file name.
#[derive(PackedStruct, Clone, Copy, PartialEq, Debug)]
#[packed_struct(endian = "lsb")]
pub struct InodeRecord {
    pub size: u64,
    /// First content page, 0 for an empty file.
    pub head: u64,
    pub name_len: u32,
    #[packed_field(element_size_bytes = "4", ty = "enum")]
    pub tag: BlockTag,
}

impl InodeRecord {
    pub const SIZE: usize = 24;

    pub fn read(store: &impl BlockStore, block: BlockIndex) -> Result<(Self, Vec<u8>)> {
        let data = store.access(block)?;
        let record = unpack_tagged::<Self>(&data[..Self::SIZE], block)?;
        if record.tag != BlockTag::Inode {
            return Err(FSError::InvalidBlockTag(block));
        }
        let name_end = Self::SIZE + record.name_len as usize;
        let name = data
            .get(Self::SIZE..name_end)
            .ok_or(FSError::InvalidBlockTag(block))?;
        Ok((record, name.to_vec()))
    }

    pub fn write(&self, store: &mut impl BlockStore, block: BlockIndex, name: &[u8]) -> Result<()> {
        let bytes: [u8; Self::SIZE] = self.pack()?;
        let data = store.access_mut(block)?;
        data[..Self::SIZE].copy_from_slice(&bytes);
        data[Self::SIZE..Self::SIZE + name.len()].copy_from_slice(name);
        Ok(())
    }
}

/// Unpacks a header. The only field that can fail to
/// unpack is the tag, so any error means the block is
/// zeroed or owned by something else.
fn unpack_tagged<T: PackedStructSlice>(bytes: &[u8], block: BlockIndex) -> Result<T> {
    T::unpack_from_slice(bytes).map_err(|_| FSError::InvalidBlockTag(block))
}

#[test]
fn test_heap_store_contract() {
    let mut store = HeapStore::new(512, 4);
    assert!(!store.is_allocated(1));
    assert!(matches!(store.access(1), Err(FSError::Unmapped(1))));
    store.allocate_raw(1).unwrap();
    assert!(store.access(1).unwrap().iter().all(|&b| b == 0));
    assert!(matches!(
        store.allocate_raw(1),
        Err(FSError::AlreadyAllocated(1))
    ));
    store.access_mut(1).unwrap()[7] = 42;
    store.release_raw(1).unwrap();
    assert!(matches!(store.release_raw(1), Err(FSError::NotAllocated(1))));
    assert!(matches!(store.access(1), Err(FSError::Unmapped(1))));
    // A re-backed block never shows the old contents.
    store.allocate_raw(1).unwrap();
    assert_eq!(store.access(1).unwrap()[7], 0);
    assert!(matches!(store.allocate_raw(4), Err(FSError::Unmapped(4))));
}

#[test]
fn test_anonymous_store_contract() {
    let mut store = AnonymousStore::new(4096, 3);
    store.allocate_raw(2).unwrap();
    assert!(store.is_allocated(2));
    assert_eq!(store.access(2).unwrap().len(), 4096);
    store.access_mut(2).unwrap()[4095] = 0xAB;
    assert_eq!(store.access(2).unwrap()[4095], 0xAB);
    store.release_raw(2).unwrap();
    assert!(matches!(store.release_raw(2), Err(FSError::NotAllocated(2))));
    store.allocate_raw(2).unwrap();
    assert_eq!(store.access(2).unwrap()[4095], 0);
}

#[test]
fn test_page_header_layout() {
    let mut store = HeapStore::new(512, 4);
    store.allocate_raw(3).unwrap();
    assert!(matches!(
        PageHeader::read(&store, 3),
        Err(FSError::InvalidBlockTag(3))
    ));
    let header = PageHeader::new(Some(2), 17);
    header.write(&mut store, 3).unwrap();
    let block = store.access(3).unwrap();
    assert_eq!(&block[..8], &2u64.to_le_bytes());
    assert_eq!(&block[8..12], &17u32.to_le_bytes());
    let read = PageHeader::read(&store, 3).unwrap();
    assert_eq!(read, header);
    assert_eq!(read.next_page(), Some(2));
    assert_eq!(PageHeader::new(None, 0).next_page(), None);
}
