//! File content as a chain of pages.
//!
//! Each page starts with a [`PageHeader`] linking to the next
//! page, the rest of the block is payload. The chain also keeps
//! the page indices in order, so offsets translate to a page
//! without walking, while reads still follow the header links
//! and check them against that list.
//!
//! Bytes of the tail page past its fill are always zero. Growing
//! a file therefore never has to clear anything, its new bytes
//! already read as zero.

use super::alloc::Allocator;
use super::storage::{BlockStore, PageHeader};
use super::{BlockIndex, FSError, Result};
use std::cmp::Ordering;
use tracing::{debug, trace};

/// Payload bytes a single page carries for a given block size.
pub fn payload_capacity(block_size: usize) -> usize {
    block_size - PageHeader::SIZE
}

fn pages_for(size: u64, payload: usize) -> u64 {
    size.div_ceil(payload as u64)
}

#[derive(Debug, Default)]
pub struct Chain {
    pages: Vec<BlockIndex>,
    size: u64,
}

impl Chain {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn head(&self) -> Option<BlockIndex> {
        self.pages.first().copied()
    }

    pub fn pages(&self) -> &[BlockIndex] {
        &self.pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Payload bytes in use on the tail page, 0 without pages.
    pub fn tail_fill(&self, payload: usize) -> usize {
        match (self.size % payload as u64) as usize {
            0 if self.size > 0 => payload,
            rem => rem,
        }
    }

    /// Translates a byte offset into a position in the page list
    /// and a position in that page's payload.
    pub fn resolve(&self, offset: u64, payload: usize) -> (usize, usize) {
        let payload = payload as u64;
        ((offset / payload) as usize, (offset % payload) as usize)
    }

    fn page(&self, position: usize) -> Result<BlockIndex> {
        self.pages.get(position).copied().ok_or(FSError::CorruptChain {
            page: self.pages.last().copied().unwrap_or(0),
            reason: "page list shorter than file size",
        })
    }

    /// Reads up to `len` bytes at `offset`. Reading at or past the
    /// end of the file yields nothing.
    pub fn read<S: BlockStore>(&self, store: &S, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= self.size || len == 0 {
            return Ok(Vec::new());
        }
        let len = (len as u64).min(self.size - offset) as usize;
        let payload = payload_capacity(store.block_size());
        let (mut position, mut pos) = self.resolve(offset, payload);
        let mut page = self.page(position)?;
        let mut out = Vec::with_capacity(len);
        loop {
            let block = store.access(page)?;
            let n = (payload - pos).min(len - out.len());
            let start = PageHeader::SIZE + pos;
            out.extend_from_slice(&block[start..start + n]);
            if out.len() == len {
                break;
            }
            let next = PageHeader::read(store, page)?.next_page();
            position += 1;
            match next {
                Some(next) if self.pages.get(position) == Some(&next) => page = next,
                Some(_) => {
                    return Err(FSError::CorruptChain {
                        page,
                        reason: "next link disagrees with page list",
                    })
                }
                None => {
                    return Err(FSError::CorruptChain {
                        page,
                        reason: "chain ends before file size",
                    })
                }
            }
            pos = 0;
        }
        Ok(out)
    }

    /// Writes `data` at `offset`, extending the chain when the write
    /// ends past the current size. Either every byte is written or,
    /// when pages run out, nothing changes and `OutOfSpace` is returned.
    pub fn write<S: BlockStore>(
        &mut self,
        alloc: &mut Allocator,
        store: &mut S,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FSError::FileTooLarge)?;
        if end > self.size {
            self.grow(alloc, store, end)?;
        }
        let payload = payload_capacity(store.block_size());
        let (mut position, mut pos) = self.resolve(offset, payload);
        let mut written = 0;
        while written < data.len() {
            let page = self.page(position)?;
            let n = (payload - pos).min(data.len() - written);
            let start = PageHeader::SIZE + pos;
            store.access_mut(page)?[start..start + n]
                .copy_from_slice(&data[written..written + n]);
            written += n;
            position += 1;
            pos = 0;
        }
        trace!("Wrote {written} bytes at offset {offset}");
        Ok(written)
    }

    /// Sets the file size, zero-filling on growth and freeing
    /// every page past the new end on shrink.
    pub fn truncate<S: BlockStore>(
        &mut self,
        alloc: &mut Allocator,
        store: &mut S,
        new_size: u64,
    ) -> Result<()> {
        match new_size.cmp(&self.size) {
            Ordering::Equal => Ok(()),
            Ordering::Greater => self.grow(alloc, store, new_size),
            Ordering::Less => self.shrink(alloc, store, new_size),
        }
    }

    /// Frees every page and leaves an empty file.
    pub fn release<S: BlockStore>(&mut self, alloc: &mut Allocator, store: &mut S) -> Result<()> {
        let freed = free_chain(alloc, store, self.head())?;
        if freed != self.pages.len() {
            return Err(FSError::CorruptChain {
                page: self.head().unwrap_or(0),
                reason: "chain length disagrees with page list",
            });
        }
        self.pages.clear();
        self.size = 0;
        Ok(())
    }

    fn grow<S: BlockStore>(
        &mut self,
        alloc: &mut Allocator,
        store: &mut S,
        new_size: u64,
    ) -> Result<()> {
        let payload = payload_capacity(store.block_size());
        let needed = pages_for(new_size, payload);
        let missing = needed.saturating_sub(self.pages.len() as u64);
        if missing > alloc.free_count() as u64 {
            debug!(
                "Growing to {new_size} bytes needs {missing} pages, {} free",
                alloc.free_count()
            );
            return Err(FSError::OutOfSpace);
        }
        let mut fresh = Vec::with_capacity(missing as usize);
        while (fresh.len() as u64) < missing {
            match alloc.allocate(store) {
                Ok(page) => fresh.push(page),
                Err(err) => {
                    for page in fresh.into_iter().rev() {
                        alloc.free(store, page)?;
                    }
                    return Err(err);
                }
            }
        }
        if let (Some(&tail), Some(&first)) = (self.pages.last(), fresh.first()) {
            PageHeader::new(Some(first), payload).write(store, tail)?;
        }
        for (i, &page) in fresh.iter().enumerate() {
            PageHeader::new(fresh.get(i + 1).copied(), payload).write(store, page)?;
        }
        if !fresh.is_empty() {
            trace!("Linked {} new pages", fresh.len());
        }
        self.pages.extend(fresh);
        self.size = new_size;
        self.seal_tail(store, payload)
    }

    fn shrink<S: BlockStore>(
        &mut self,
        alloc: &mut Allocator,
        store: &mut S,
        new_size: u64,
    ) -> Result<()> {
        let payload = payload_capacity(store.block_size());
        let keep = pages_for(new_size, payload) as usize;
        if keep == 0 {
            return self.release(alloc, store);
        }
        let retained = self.page(keep - 1)?;
        let cut = PageHeader::read(&*store, retained)?.next_page();
        let freed = free_chain(alloc, store, cut)?;
        if freed != self.pages.len() - keep {
            return Err(FSError::CorruptChain {
                page: retained,
                reason: "released tail disagrees with page list",
            });
        }
        self.pages.truncate(keep);
        self.size = new_size;
        self.seal_tail(store, payload)?;
        // Stale bytes past the new end must not come back on growth.
        let fill = self.tail_fill(payload);
        store.access_mut(retained)?[PageHeader::SIZE + fill..].fill(0);
        Ok(())
    }

    /// Rewrites the tail header from the current size.
    fn seal_tail<S: BlockStore>(&self, store: &mut S, payload: usize) -> Result<()> {
        match self.pages.last() {
            Some(&tail) => PageHeader::new(None, self.tail_fill(payload)).write(store, tail),
            None => Ok(()),
        }
    }

    /// Walks the chain from its head and checks it against the
    /// page list and the size.
    pub fn verify<S: BlockStore>(&self, store: &S) -> Result<()> {
        let payload = payload_capacity(store.block_size());
        if self.pages.len() as u64 != pages_for(self.size, payload) {
            return Err(FSError::CorruptChain {
                page: self.head().unwrap_or(0),
                reason: "page count disagrees with file size",
            });
        }
        let mut cursor = self.head();
        for (position, &expected) in self.pages.iter().enumerate() {
            let page = cursor.ok_or(FSError::CorruptChain {
                page: expected,
                reason: "chain ends before file size",
            })?;
            if page != expected {
                return Err(FSError::CorruptChain {
                    page,
                    reason: "next link disagrees with page list",
                });
            }
            let header = PageHeader::read(store, page)?;
            let is_tail = position + 1 == self.pages.len();
            let fill = if is_tail { self.tail_fill(payload) } else { payload };
            if header.fill as usize != fill {
                return Err(FSError::CorruptChain {
                    page,
                    reason: "page fill disagrees with file size",
                });
            }
            cursor = header.next_page();
        }
        match cursor {
            Some(page) => Err(FSError::CorruptChain {
                page,
                reason: "chain continues past its tail",
            }),
            None => Ok(()),
        }
    }
}

/// Frees every page reachable from `head`, reading each page's
/// link before the page goes away. Returns the number freed.
pub fn free_chain<S: BlockStore>(
    alloc: &mut Allocator,
    store: &mut S,
    head: Option<BlockIndex>,
) -> Result<usize> {
    let mut cursor = head;
    let mut freed = 0;
    while let Some(page) = cursor {
        cursor = PageHeader::read(&*store, page)?.next_page();
        alloc.free(store, page)?;
        freed += 1;
    }
    Ok(freed)
}

#[cfg(test)]
fn setup(block_size: usize, capacity: usize) -> (Allocator, crate::fs::storage::HeapStore) {
    let mut store = crate::fs::storage::HeapStore::new(block_size, capacity);
    let mut alloc = Allocator::new(capacity);
    alloc.reserve(&mut store, 0).unwrap();
    (alloc, store)
}

#[test]
fn test_write_spans_pages() {
    let (mut alloc, mut store) = setup(512, 16);
    let payload = payload_capacity(512);
    let mut chain = Chain::default();
    let data: Vec<u8> = (0..1200u32).map(|i| i as u8).collect();
    assert_eq!(chain.write(&mut alloc, &mut store, 0, &data).unwrap(), 1200);
    assert_eq!(chain.size(), 1200);
    assert_eq!(chain.pages().len(), 3);
    assert_eq!(chain.tail_fill(payload), 1200 - 2 * payload);
    chain.verify(&store).unwrap();
    assert_eq!(chain.read(&store, 0, 5000).unwrap(), data);
    assert_eq!(chain.read(&store, 490, 20).unwrap(), &data[490..510]);
    assert!(chain.read(&store, 1200, 10).unwrap().is_empty());
}

#[test]
fn test_write_past_end_zero_fills_gap() {
    let (mut alloc, mut store) = setup(512, 16);
    let mut chain = Chain::default();
    chain.write(&mut alloc, &mut store, 1000, b"tail").unwrap();
    assert_eq!(chain.size(), 1004);
    let read = chain.read(&store, 0, 1004).unwrap();
    assert!(read[..1000].iter().all(|&b| b == 0));
    assert_eq!(&read[1000..], b"tail");
    chain.verify(&store).unwrap();
}

#[test]
fn test_out_of_space_leaves_chain_untouched() {
    let (mut alloc, mut store) = setup(512, 4);
    let payload = payload_capacity(512);
    let mut chain = Chain::default();
    chain.write(&mut alloc, &mut store, 0, &[7; 10]).unwrap();
    let free_before = alloc.free_count();
    let result = chain.write(&mut alloc, &mut store, 0, &vec![1; payload * 5]);
    assert!(matches!(result, Err(FSError::OutOfSpace)));
    assert_eq!(chain.size(), 10);
    assert_eq!(chain.pages().len(), 1);
    assert_eq!(alloc.free_count(), free_before);
    assert_eq!(chain.read(&store, 0, 100).unwrap(), [7; 10]);
    chain.verify(&store).unwrap();
}

#[test]
fn test_shrink_zeroes_slack() {
    let (mut alloc, mut store) = setup(512, 16);
    let mut chain = Chain::default();
    chain.write(&mut alloc, &mut store, 0, &[0xAA; 1000]).unwrap();
    chain.truncate(&mut alloc, &mut store, 100).unwrap();
    assert_eq!(chain.pages().len(), 1);
    assert_eq!(alloc.used_count(), 2);
    assert!(chain.read(&store, 100, 900).unwrap().is_empty());
    chain.truncate(&mut alloc, &mut store, 300).unwrap();
    let read = chain.read(&store, 0, 300).unwrap();
    assert!(read[..100].iter().all(|&b| b == 0xAA));
    assert!(read[100..].iter().all(|&b| b == 0));
    chain.verify(&store).unwrap();
}

#[test]
fn test_truncate_on_page_boundary() {
    let (mut alloc, mut store) = setup(512, 16);
    let payload = payload_capacity(512);
    let mut chain = Chain::default();
    chain
        .write(&mut alloc, &mut store, 0, &vec![3; payload * 3])
        .unwrap();
    chain
        .truncate(&mut alloc, &mut store, payload as u64 * 2)
        .unwrap();
    assert_eq!(chain.pages().len(), 2);
    assert_eq!(chain.tail_fill(payload), payload);
    chain.verify(&store).unwrap();
    chain.truncate(&mut alloc, &mut store, 0).unwrap();
    assert!(chain.is_empty());
    assert_eq!(chain.head(), None);
    assert_eq!(alloc.used_count(), 1);
}

#[test]
fn test_read_detects_broken_link() {
    let (mut alloc, mut store) = setup(512, 16);
    let payload = payload_capacity(512);
    let mut chain = Chain::default();
    chain
        .write(&mut alloc, &mut store, 0, &vec![1; payload * 2])
        .unwrap();
    let head = chain.head().unwrap();
    PageHeader::new(None, payload).write(&mut store, head).unwrap();
    assert!(matches!(
        chain.read(&store, 0, payload * 2),
        Err(FSError::CorruptChain { page, .. }) if page == head
    ));
    assert!(chain.verify(&store).is_err());
}

#[cfg(test)]
struct RationedStore {
    inner: crate::fs::storage::HeapStore,
    budget: usize,
}

#[cfg(test)]
impl BlockStore for RationedStore {
    fn block_count(&self) -> usize {
        self.inner.block_count()
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn is_allocated(&self, index: BlockIndex) -> bool {
        self.inner.is_allocated(index)
    }

    fn allocate_raw(&mut self, index: BlockIndex) -> Result<()> {
        if self.budget == 0 {
            return Err(FSError::OutOfSpace);
        }
        self.budget -= 1;
        self.inner.allocate_raw(index)
    }

    fn release_raw(&mut self, index: BlockIndex) -> Result<()> {
        self.inner.release_raw(index)
    }

    fn access(&self, index: BlockIndex) -> Result<&[u8]> {
        self.inner.access(index)
    }

    fn access_mut(&mut self, index: BlockIndex) -> Result<&mut [u8]> {
        self.inner.access_mut(index)
    }
}

#[test]
fn test_backing_failure_mid_extension_unwinds() {
    let (mut alloc, inner) = setup(512, 32);
    let payload = payload_capacity(512);
    let mut store = RationedStore { inner, budget: 3 };
    let mut chain = Chain::default();
    chain.write(&mut alloc, &mut store, 0, b"keep").unwrap();
    let used_before = alloc.used_count();
    // Two more pages can be backed, the write needs four.
    let result = chain.write(&mut alloc, &mut store, 4, &vec![9; payload * 4]);
    assert!(matches!(result, Err(FSError::OutOfSpace)));
    assert_eq!(alloc.used_count(), used_before);
    assert_eq!(chain.size(), 4);
    assert_eq!(chain.pages().len(), 1);
    for index in 0..32 {
        assert_eq!(alloc.is_used(index), store.is_allocated(index));
    }
    assert_eq!(chain.read(&store, 0, 10).unwrap(), b"keep");
    chain.verify(&store).unwrap();
}
