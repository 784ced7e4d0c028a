use std::ptr::NonNull;

use tagheap::{Heap, HeapError};

/// Smallest capacity the heap can have, one page.
fn one_page() -> Heap {
    Heap::with_capacity(1).unwrap()
}

/// Size of the block that `allocate(size)` carves out.
fn block_size(size: usize) -> usize {
    (size + 4 + 7) & !7
}

/// Tiny deterministic generator so the stress test is reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as usize
    }
}

#[test]
fn boundary_scenario() {
    let mut heap = one_page();
    let capacity = heap.capacity();

    let ptr = heap.allocate(100).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 8, 0);

    let remaining = capacity - block_size(100);
    assert_eq!(
        heap.allocate(remaining),
        Err(HeapError::OutOfMemory { size: remaining })
    );
    heap.check().unwrap();

    heap.release(ptr.as_ptr()).unwrap();
    heap.check().unwrap();

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert!(!blocks[0].allocated);
    assert_eq!(blocks[0].size, capacity);

    let mut out = Vec::new();
    heap.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Total used size = 0"));
    assert!(text.contains(&format!("Total free size = {capacity}")));
}

fn assert_not_allocated(heap: &mut Heap, ptr: NonNull<u8>) {
    assert_eq!(
        heap.release(ptr.as_ptr()),
        Err(HeapError::NotAllocated {
            address: ptr.as_ptr() as usize
        })
    );
}

#[test]
fn double_free_is_rejected() {
    let mut heap = one_page();
    let ptr = heap.allocate(32).unwrap();

    assert_eq!(heap.release(ptr.as_ptr()), Ok(()));
    assert_not_allocated(&mut heap, ptr);
    heap.check().unwrap();
}

#[test]
fn double_free_is_rejected_after_every_merge() {
    let mut heap = one_page();
    let ptrs: Vec<_> = (0..6).map(|_| heap.allocate(8).unwrap()).collect();

    // No free neighbour, then previous free, then next free, then both.
    for i in [1, 2, 0, 4, 3] {
        heap.release(ptrs[i].as_ptr()).unwrap();

        for &ptr in &ptrs {
            let live = heap
                .blocks()
                .any(|block| block.allocated && block.payload_address() == ptr.as_ptr() as usize);

            if !live {
                assert_not_allocated(&mut heap, ptr);
            }
        }

        heap.check().unwrap();
    }

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 3);
    assert!(blocks[1].allocated);
}

#[test]
fn stale_release_does_not_free_reused_block() {
    let mut heap = one_page();
    let a = heap.allocate(8).unwrap();
    let b = heap.allocate(8).unwrap();
    let _c = heap.allocate(8).unwrap();

    heap.release(a.as_ptr()).unwrap();
    heap.release(b.as_ptr()).unwrap();

    // The merged block is handed out again, starting where `a` was.
    let d = heap.allocate(4).unwrap();
    assert_eq!(d, a);

    assert_not_allocated(&mut heap, b);
    heap.check().unwrap();

    let first = heap.blocks().next().unwrap();
    assert_eq!(first.payload_address(), d.as_ptr() as usize);
    assert!(first.allocated);
    assert_eq!(first.size, 8);
}

#[test]
fn corrupted_footer_is_reported() {
    let mut heap = one_page();
    let a = heap.allocate(8).unwrap();
    let b = heap.allocate(8).unwrap();

    heap.release(a.as_ptr()).unwrap();
    let before: Vec<_> = heap.blocks().collect();

    // Last word of the freed block is its footer.
    unsafe { a.as_ptr().add(8).cast::<u32>().write(0) };

    assert!(matches!(
        heap.release(b.as_ptr()),
        Err(HeapError::Corrupted { .. })
    ));
    assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
}

#[test]
fn allocate_then_release_restores_free_space() {
    let mut heap = one_page();
    let _keep = heap.allocate(64).unwrap();
    let before = heap.stats();

    for size in [1, 7, 8, 9, 100, 1000] {
        let ptr = heap.allocate(size).unwrap();
        assert_eq!(heap.stats().free, before.free - block_size(size));

        heap.release(ptr.as_ptr()).unwrap();
        assert_eq!(heap.stats().free, before.free);
        heap.check().unwrap();
    }
}

#[test]
fn split_leaves_correct_free_block() {
    let mut heap = one_page();
    let capacity = heap.capacity();

    heap.allocate(20).unwrap();

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].allocated);
    assert_eq!(blocks[0].size, 24);
    assert!(!blocks[1].allocated);
    assert!(blocks[1].prev_allocated);
    assert_eq!(blocks[0].size + blocks[1].size, capacity);

    // Footer checked here.
    heap.check().unwrap();
}

#[test]
fn coalesces_all_four_cases() {
    let mut heap = one_page();
    let capacity = heap.capacity();

    let ptrs: Vec<_> = (0..6).map(|_| heap.allocate(16).unwrap()).collect();
    let tail = capacity - 6 * 24;

    // Neither neighbour free.
    heap.release(ptrs[1].as_ptr()).unwrap();
    heap.check().unwrap();
    assert_eq!(heap.stats().free_blocks, 2);

    // Previous neighbour free.
    heap.release(ptrs[2].as_ptr()).unwrap();
    heap.check().unwrap();
    let merged = heap.blocks().nth(1).unwrap();
    assert!(!merged.allocated);
    assert_eq!(merged.size, 48);

    // Next neighbour free.
    heap.release(ptrs[0].as_ptr()).unwrap();
    heap.check().unwrap();
    let merged = heap.blocks().next().unwrap();
    assert_eq!(merged.size, 72);
    assert_eq!(heap.stats().free_blocks, 2);

    // Both neighbours free: [3] sits between the merged front and [4].
    heap.release(ptrs[4].as_ptr()).unwrap();
    heap.check().unwrap();
    heap.release(ptrs[3].as_ptr()).unwrap();
    heap.check().unwrap();

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].size, 5 * 24);
    assert!(blocks[1].allocated);
    assert_eq!(blocks[2].size, tail);

    heap.release(ptrs[5].as_ptr()).unwrap();
    heap.check().unwrap();

    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].size, capacity);
}

#[test]
fn next_fit_moves_forward_and_wraps() {
    let mut heap = one_page();

    // Fill the heap with 16 byte blocks until nothing else fits.
    let mut ptrs = Vec::new();
    loop {
        match heap.allocate(8) {
            Ok(ptr) => ptrs.push(ptr),
            Err(HeapError::OutOfMemory { .. }) => break,
            Err(err) => panic!("unexpected error {err}"),
        }
    }
    assert!(ptrs.len() > 6);
    heap.check().unwrap();

    for i in [1, 3, 5] {
        heap.release(ptrs[i].as_ptr()).unwrap();
    }

    // Scan wraps around the end marker and takes the holes in address order.
    assert_eq!(heap.allocate(8).unwrap(), ptrs[1]);
    assert_eq!(heap.allocate(8).unwrap(), ptrs[3]);

    // A hole behind the cursor is only reused after wrapping again.
    heap.release(ptrs[0].as_ptr()).unwrap();
    assert_eq!(heap.allocate(8).unwrap(), ptrs[5]);
    assert_eq!(heap.allocate(8).unwrap(), ptrs[0]);

    heap.check().unwrap();
}

#[test]
fn exhausted_heap_stays_consistent() {
    let mut heap = one_page();
    let mut ptrs = Vec::new();

    while let Ok(ptr) = heap.allocate(40) {
        ptrs.push(ptr);
    }

    let before: Vec<_> = heap.blocks().collect();
    assert!(matches!(
        heap.allocate(40),
        Err(HeapError::OutOfMemory { size: 40 })
    ));
    assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
    heap.check().unwrap();

    for ptr in ptrs {
        heap.release(ptr.as_ptr()).unwrap();
    }
    assert_eq!(heap.stats().free_blocks, 1);
    heap.check().unwrap();
}

#[test]
fn payloads_do_not_overlap() {
    let mut heap = Heap::with_capacity(64 * 1024).unwrap();
    let mut rng = Lcg(0x5eed);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for round in 0..4000 {
        let release = !live.is_empty() && rng.next() % 3 == 0;

        if release {
            let (ptr, size, fill) = live.swap_remove(rng.next() % live.len());

            // Nobody else wrote into this payload while it was ours.
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
            assert!(bytes.iter().all(|byte| *byte == fill), "round {round}");

            heap.release(ptr.as_ptr()).unwrap();
        } else {
            let size = 1 + rng.next() % 300;

            match heap.allocate(size) {
                Ok(ptr) => {
                    assert_eq!(ptr.as_ptr() as usize % 8, 0);
                    let fill = (round % 251) as u8;
                    unsafe { ptr.as_ptr().write_bytes(fill, size) };
                    live.push((ptr, size, fill));
                }
                Err(HeapError::OutOfMemory { .. }) => {}
                Err(err) => panic!("round {round}: {err}"),
            }
        }

        heap.check().unwrap();

        let stats = heap.stats();
        let used: usize = live.iter().map(|(_, size, _)| block_size(*size)).sum();
        assert_eq!(stats.used, used);
        assert_eq!(stats.total(), heap.capacity());
    }

    for (ptr, _, _) in live {
        heap.release(ptr.as_ptr()).unwrap();
    }

    assert_eq!(heap.stats().free_blocks, 1);
    heap.check().unwrap();
}

#[test]
fn foreign_pointers_are_rejected() {
    let mut heap = one_page();
    let mut other = one_page();

    let ptr = other.allocate(8).unwrap();

    // Mapped regions never overlap, so this is outside `heap`.
    assert!(!heap.contains(ptr.as_ptr()));
    assert!(matches!(
        heap.release(ptr.as_ptr()),
        Err(HeapError::OutOfRange { .. })
    ));

    assert!(other.contains(ptr.as_ptr()));
    other.release(ptr.as_ptr()).unwrap();
}
