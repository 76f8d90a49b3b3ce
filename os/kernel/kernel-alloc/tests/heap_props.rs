use core::ptr::NonNull;
use kernel_alloc::free_list::{FreeListHeap, HEADER_SIZE};
use kernel_alloc::static_heap::{self, StaticHeap};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    /// Free the live allocation at this position (modulo the live count).
    Free(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (1..300_usize).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
        ],
        1..64,
    )
}

fn assert_tiles(nodes: impl Iterator<Item = (usize, usize)>, size: usize, header: usize) -> Result<(), TestCaseError> {
    let mut cursor = 0;
    for (offset, net_size) in nodes {
        prop_assert_eq!(offset, cursor);
        prop_assert!(net_size >= header);
        cursor += net_size;
    }
    prop_assert_eq!(cursor, size);
    Ok(())
}

proptest! {
    #[test]
    fn free_list_nodes_always_tile_the_region(ops in ops()) {
        const SIZE: usize = 4096;
        let mut backing = vec![0u8; SIZE];
        let mut heap = FreeListHeap::new();
        unsafe { heap.init(NonNull::new(backing.as_mut_ptr()).unwrap(), SIZE) }.unwrap();

        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Alloc(bytes) => {
                    if let Ok(p) = heap.alloc(bytes) {
                        let tag = step as u8;
                        unsafe { p.as_ptr().write_bytes(tag, bytes) };
                        live.push((p, bytes, tag));
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let (p, _, _) = live.swap_remove(i % live.len());
                    heap.free(p);
                }
                Op::Free(_) => {}
            }

            heap.check_integrity();
            assert_tiles(heap.nodes().map(|n| (n.offset, n.net_size)), SIZE, HEADER_SIZE)?;
            prop_assert_eq!(heap.used_memory() + heap.free_memory(), SIZE);
            let expected: usize = live.iter().map(|&(_, bytes, _)| bytes + HEADER_SIZE).sum();
            prop_assert_eq!(heap.used_memory(), expected);

            // Neighbouring free nodes are always merged.
            let states: Vec<bool> = heap.nodes().map(|n| n.allocated).collect();
            prop_assert!(states.windows(2).all(|w| w[0] || w[1]));
        }

        for &(p, bytes, tag) in &live {
            let payload = unsafe { core::slice::from_raw_parts(p.as_ptr(), bytes) };
            prop_assert!(payload.iter().all(|&b| b == tag));
        }
        for (p, _, _) in live {
            heap.free(p);
        }
        prop_assert_eq!(heap.nodes().count(), 1);
    }

    #[test]
    fn static_heap_frees_back_to_one_node(ops in ops()) {
        let mut heap = Box::new(StaticHeap::<2048>::new());
        let first = heap.alloc(1).unwrap();
        heap.free(first);
        let mut live = Vec::new();
        for op in ops {
            match op {
                Op::Alloc(bytes) => {
                    if let Ok(p) = heap.alloc(bytes) {
                        live.push(p);
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let p = live.swap_remove(i % live.len());
                    heap.free(p);
                }
                Op::Free(_) => {}
            }
            assert_tiles(heap.nodes().map(|(offset, size, _)| (offset, size)), 2048, static_heap::HEADER_SIZE)?;
            prop_assert_eq!(heap.used_memory() + heap.free_memory(), 2048);
        }
        for p in live {
            heap.free(p);
        }
        prop_assert_eq!(heap.nodes().collect::<Vec<_>>(), vec![(0, 2048, false)]);
    }
}
