//! Free-space tracking over the block store.
//!
//! One bit per block index, set while the index is
//! in use. Searches are next-fit: they start just
//! after the last index handed out and wrap around,
//! so appending to a file does not rescan the
//! beginning of the table every time.

use super::storage::BlockStore;
use super::{BlockIndex, FSError, Result};
use tracing::trace;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug)]
pub struct Allocator {
    words: Vec<u64>,
    capacity: usize,
    used: usize,
    /// Most recently allocated index.
    cursor: BlockIndex,
    reserved: Vec<BlockIndex>,
}

fn decompose(index: BlockIndex) -> (usize, usize) {
    (index / WORD_BITS, index % WORD_BITS)
}

impl Allocator {
    /// An allocator with every index in `0..capacity` free.
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(WORD_BITS)],
            capacity,
            used: 0,
            cursor: capacity.saturating_sub(1),
            reserved: Vec::new(),
        }
    }

    pub fn free_count(&self) -> usize {
        self.capacity - self.used
    }

    pub fn used_count(&self) -> usize {
        self.used
    }

    /// The index the next search starts after.
    pub fn cursor(&self) -> BlockIndex {
        self.cursor
    }

    pub fn is_used(&self, index: BlockIndex) -> bool {
        let (word, bit) = decompose(index);
        self.words.get(word).is_some_and(|&w| w >> bit & 1 == 1)
    }

    fn mark(&mut self, index: BlockIndex) {
        let (word, bit) = decompose(index);
        self.words[word] |= 1 << bit;
        self.used += 1;
    }

    fn unmark(&mut self, index: BlockIndex) {
        let (word, bit) = decompose(index);
        self.words[word] &= !(1 << bit);
        self.used -= 1;
    }

    /// First free index in `from..to`, skipping full words.
    fn scan(&self, from: usize, to: usize) -> Option<BlockIndex> {
        let mut index = from;
        while index < to {
            let (word, bit) = decompose(index);
            let run = (self.words[word] >> bit).trailing_ones() as usize;
            if bit + run < WORD_BITS {
                let candidate = index + run;
                return (candidate < to).then_some(candidate);
            }
            index = (word + 1) * WORD_BITS;
        }
        None
    }

    fn find_free(&self) -> Option<BlockIndex> {
        if self.free_count() == 0 {
            return None;
        }
        let start = (self.cursor + 1) % self.capacity;
        self.scan(start, self.capacity)
            .or_else(|| self.scan(0, start))
    }

    /// Claims an index outside of the next-fit policy.
    /// Used at bootstrap for blocks that live forever.
    pub fn reserve<S: BlockStore>(&mut self, store: &mut S, index: BlockIndex) -> Result<()> {
        if index >= self.capacity {
            return Err(FSError::Unmapped(index));
        }
        if self.is_used(index) {
            return Err(FSError::AlreadyAllocated(index));
        }
        store.allocate_raw(index)?;
        self.mark(index);
        self.reserved.push(index);
        trace!("Reserved block {index}");
        Ok(())
    }

    /// Returns a free index, backed by a fresh zeroed block.
    pub fn allocate<S: BlockStore>(&mut self, store: &mut S) -> Result<BlockIndex> {
        let index = self.find_free().ok_or(FSError::OutOfSpace)?;
        store.allocate_raw(index)?;
        self.mark(index);
        self.cursor = index;
        debug_assert!(store.is_allocated(index));
        trace!("Allocated block {index}");
        Ok(index)
    }

    /// Marks `index` free and drops its backing block.
    pub fn free<S: BlockStore>(&mut self, store: &mut S, index: BlockIndex) -> Result<()> {
        if self.reserved.contains(&index) {
            return Err(FSError::Reserved(index));
        }
        if !self.is_used(index) {
            return Err(FSError::DoubleFree(index));
        }
        store.release_raw(index)?;
        self.unmark(index);
        trace!("Freed block {index}");
        Ok(())
    }
}

#[cfg(test)]
fn setup(capacity: usize) -> (Allocator, crate::fs::storage::HeapStore) {
    let mut store = crate::fs::storage::HeapStore::new(512, capacity);
    let mut alloc = Allocator::new(capacity);
    alloc.reserve(&mut store, 0).unwrap();
    (alloc, store)
}

#[test]
fn test_next_fit_wraps_around() {
    let (mut alloc, mut store) = setup(8);
    let first: Vec<_> = (0..4).map(|_| alloc.allocate(&mut store).unwrap()).collect();
    assert_eq!(first, [1, 2, 3, 4]);
    alloc.free(&mut store, 2).unwrap();
    // The cursor keeps moving forward before reusing 2.
    assert_eq!(alloc.allocate(&mut store).unwrap(), 5);
    assert_eq!(alloc.allocate(&mut store).unwrap(), 6);
    assert_eq!(alloc.allocate(&mut store).unwrap(), 7);
    assert_eq!(alloc.allocate(&mut store).unwrap(), 2);
    assert!(matches!(alloc.allocate(&mut store), Err(FSError::OutOfSpace)));
    assert_eq!(alloc.free_count(), 0);
}

#[test]
fn test_exhaustion_and_reuse() {
    let (mut alloc, mut store) = setup(130);
    let mut seen = std::collections::HashSet::new();
    while let Ok(index) = alloc.allocate(&mut store) {
        assert!(seen.insert(index), "index {index} handed out twice");
        assert!(store.is_allocated(index));
    }
    assert_eq!(seen.len(), 129);
    assert!(!seen.contains(&0));
    alloc.free(&mut store, 77).unwrap();
    assert!(!store.is_allocated(77));
    assert_eq!(alloc.allocate(&mut store).unwrap(), 77);
}

#[test]
fn test_free_guards() {
    let (mut alloc, mut store) = setup(16);
    let index = alloc.allocate(&mut store).unwrap();
    alloc.free(&mut store, index).unwrap();
    assert!(matches!(
        alloc.free(&mut store, index),
        Err(FSError::DoubleFree(i)) if i == index
    ));
    assert!(matches!(alloc.free(&mut store, 0), Err(FSError::Reserved(0))));
    assert!(matches!(
        alloc.reserve(&mut store, 0),
        Err(FSError::AlreadyAllocated(0))
    ));
    assert_eq!(alloc.used_count(), 1);
}

#[test]
fn test_scan_skips_full_words() {
    let (mut alloc, mut store) = setup(200);
    for _ in 0..150 {
        alloc.allocate(&mut store).unwrap();
    }
    alloc.free(&mut store, 65).unwrap();
    alloc.free(&mut store, 140).unwrap();
    assert_eq!(alloc.allocate(&mut store).unwrap(), 151);
    for index in 0..200 {
        assert_eq!(alloc.is_used(index), store.is_allocated(index));
    }
}
