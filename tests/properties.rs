use std::collections::{HashMap, HashSet};

use pagefs::fs::alloc::Allocator;
use pagefs::fs::inode::Metadata;
use pagefs::fs::storage::{BlockStore, HeapStore};
use pagefs::fs::{FSError, FileSystem, MountConfig};
use proptest::prelude::*;

const BLOCK_SIZE: usize = 512;
const BLOCK_COUNT: usize = 48;
const NAMES: [&[u8]; 3] = [b"a", b"b", b"c"];

#[derive(Debug, Clone)]
enum Op {
    Create(usize),
    Write(usize, u64, Vec<u8>),
    Truncate(usize, u64),
    Delete(usize),
    Read(usize, u64, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..NAMES.len()).prop_map(Op::Create),
        (
            0..NAMES.len(),
            0u64..3000,
            proptest::collection::vec(any::<u8>(), 0..1500)
        )
            .prop_map(|(f, offset, data)| Op::Write(f, offset, data)),
        (0..NAMES.len(), 0u64..4000).prop_map(|(f, size)| Op::Truncate(f, size)),
        (0..NAMES.len()).prop_map(Op::Delete),
        (0..NAMES.len(), 0u64..4000, 0usize..2000).prop_map(|(f, o, l)| Op::Read(f, o, l)),
    ]
}

fn mount() -> FileSystem<HeapStore> {
    FileSystem::mount(
        HeapStore::new(BLOCK_SIZE, BLOCK_COUNT),
        MountConfig {
            block_size: BLOCK_SIZE,
            block_count: BLOCK_COUNT,
            max_name_len: 255,
        },
    )
    .unwrap()
}

fn model_read(model: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let start = (offset as usize).min(model.len());
    let end = start.saturating_add(len).min(model.len());
    model[start..end].to_vec()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn operation_sequences_match_model(ops in proptest::collection::vec(op(), 1..60)) {
        let mut fs = mount();
        let mut model: HashMap<&[u8], Vec<u8>> = HashMap::new();

        for op in ops {
            match op {
                Op::Create(f) => {
                    let result = fs.create_file(NAMES[f], Metadata::default());
                    match (result, model.contains_key(NAMES[f])) {
                        (Ok(_), false) => {
                            model.insert(NAMES[f], Vec::new());
                        }
                        (Err(FSError::AlreadyExists), true) => {}
                        (Err(FSError::OutOfSpace), false) => {}
                        (other, exists) => panic!("create returned {other:?}, exists: {exists}"),
                    }
                }
                Op::Write(f, offset, data) => {
                    let result = fs.write(NAMES[f], offset, &data);
                    match (result, model.get_mut(NAMES[f])) {
                        (Ok(written), Some(content)) => {
                            prop_assert_eq!(written, data.len());
                            if !data.is_empty() {
                                let end = offset as usize + data.len();
                                if content.len() < end {
                                    content.resize(end, 0);
                                }
                                content[offset as usize..end].copy_from_slice(&data);
                            }
                        }
                        (Err(FSError::OutOfSpace), Some(_)) => {}
                        (Err(FSError::NotFound), None) => {}
                        (other, _) => panic!("write returned {other:?}"),
                    }
                }
                Op::Truncate(f, size) => {
                    let result = fs.truncate(NAMES[f], size);
                    match (result, model.get_mut(NAMES[f])) {
                        (Ok(()), Some(content)) => content.resize(size as usize, 0),
                        (Err(FSError::OutOfSpace), Some(_)) => {}
                        (Err(FSError::NotFound), None) => {}
                        (other, _) => panic!("truncate returned {other:?}"),
                    }
                }
                Op::Delete(f) => {
                    let result = fs.delete(NAMES[f]);
                    match (result, model.remove(NAMES[f])) {
                        (Ok(()), Some(_)) => {}
                        (Err(FSError::NotFound), None) => {}
                        (other, _) => panic!("delete returned {other:?}"),
                    }
                }
                Op::Read(f, offset, len) => {
                    let result = fs.read(NAMES[f], offset, len);
                    match (result, model.get(NAMES[f])) {
                        (Ok(data), Some(content)) => {
                            prop_assert_eq!(data, model_read(content, offset, len));
                        }
                        (Err(FSError::NotFound), None) => {}
                        (other, _) => panic!("read returned {other:?}"),
                    }
                }
            }

            fs.check().unwrap();
            for (name, content) in &model {
                prop_assert_eq!(fs.attr(name).unwrap().size, content.len() as u64);
                prop_assert_eq!(&fs.read(name, 0, usize::MAX).unwrap(), content);
            }
        }
    }

    #[test]
    fn write_then_read_round_trips(
        prior in 0u64..3000,
        offset in 0u64..3000,
        data in proptest::collection::vec(any::<u8>(), 0..3000),
    ) {
        let mut fs = mount();
        fs.create_file(b"f", Metadata::default()).unwrap();
        fs.truncate(b"f", prior).unwrap();
        fs.write(b"f", offset, &data).unwrap();
        prop_assert_eq!(fs.read(b"f", offset, data.len()).unwrap(), data);
        fs.check().unwrap();
    }

    #[test]
    fn grown_region_reads_zero(initial in 1usize..2000, grow in 1u64..3000, shrink in 0u64..2000) {
        let mut fs = mount();
        fs.create_file(b"f", Metadata::default()).unwrap();
        fs.write(b"f", 0, &vec![0xEE; initial]).unwrap();
        let shrink = shrink.min(initial as u64);
        fs.truncate(b"f", shrink).unwrap();
        prop_assert!(fs.read(b"f", shrink, initial).unwrap().is_empty());
        fs.truncate(b"f", shrink + grow).unwrap();
        let grown = fs.read(b"f", shrink, grow as usize).unwrap();
        prop_assert_eq!(grown.len() as u64, grow);
        prop_assert!(grown.iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_twice_changes_nothing(writes in 1usize..3000, size in 0u64..4000) {
        let mut fs = mount();
        let handle = fs.create_file(b"f", Metadata::default()).unwrap();
        fs.write(b"f", 0, &vec![1; writes]).unwrap();
        fs.truncate(b"f", size).unwrap();
        let pages = fs.registry().get(handle).unwrap().content.pages().to_vec();
        let used = fs.allocator().used_count();
        let before = fs.attr(b"f").unwrap();
        fs.truncate(b"f", before.size).unwrap();
        prop_assert_eq!(fs.registry().get(handle).unwrap().content.pages(), &pages[..]);
        prop_assert_eq!(fs.allocator().used_count(), used);
        prop_assert_eq!(fs.attr(b"f").unwrap(), before);
    }

    #[test]
    fn delete_returns_every_block(len in 0usize..6000) {
        let mut fs = mount();
        let free = fs.allocator().free_count();
        fs.create_file(b"f", Metadata::default()).unwrap();
        fs.write(b"f", 0, &vec![2; len]).unwrap();
        fs.delete(b"f").unwrap();
        prop_assert_eq!(fs.allocator().free_count(), free);
        fs.check().unwrap();
    }

    #[test]
    fn allocator_never_hands_out_live_indices(frees in proptest::collection::vec(any::<bool>(), 1..200)) {
        let mut store = HeapStore::new(BLOCK_SIZE, 64);
        let mut alloc = Allocator::new(64);
        alloc.reserve(&mut store, 0).unwrap();
        let mut live = HashSet::new();
        for free in frees {
            if free && !live.is_empty() {
                let index = *live.iter().next().unwrap();
                live.remove(&index);
                alloc.free(&mut store, index).unwrap();
            } else {
                match alloc.allocate(&mut store) {
                    Ok(index) => prop_assert!(live.insert(index)),
                    Err(FSError::OutOfSpace) => prop_assert_eq!(live.len(), 63),
                    Err(err) => panic!("allocate returned {err:?}"),
                }
            }
            prop_assert_eq!(alloc.used_count(), live.len() + 1);
            for index in 0..64 {
                prop_assert_eq!(alloc.is_used(index), store.is_allocated(index));
            }
        }
    }
}
