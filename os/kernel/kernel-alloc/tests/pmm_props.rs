use kernel_alloc::frame_alloc::{BitmapFrameAlloc, FREE, RegionConfig, RegionKind, USED, pab_size};
use kernel_error::MemError;
use kernel_info::boot::{BootInfo, LoadedFile, MemoryKind, MemoryMapEntry};
use kernel_memory_addresses::PhysicalAddress;
use proptest::prelude::*;

const FRAMES: usize = 64;
const FRAME: u64 = 4096;

const MAP: [MemoryMapEntry; 3] = [
    MemoryMapEntry::new(0, 20 * FRAME, MemoryKind::Available),
    MemoryMapEntry::new(20 * FRAME, 4 * FRAME, MemoryKind::Reserved),
    MemoryMapEntry::new(24 * FRAME, 40 * FRAME, MemoryKind::Available),
];

const FILES: [LoadedFile; 1] = [LoadedFile::new(40 * 4096, 100)];

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    AllocAt(usize, usize),
    /// Free the live run at this position (modulo the live count).
    Free(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (1..6_usize).prop_map(Op::Alloc),
            (1..FRAMES, 1..4_usize).prop_map(|(frame, count)| Op::AllocAt(frame, count)),
            any::<usize>().prop_map(Op::Free),
        ],
        1..80,
    )
}

fn address(frame: usize) -> PhysicalAddress {
    PhysicalAddress::new((frame as u32) * 4096)
}

fn frame_of(pa: PhysicalAddress) -> usize {
    (pa.as_u64() / FRAME) as usize
}

proptest! {
    #[test]
    fn live_runs_stay_disjoint_and_accounted(bits in prop_oneof![Just(1_usize), Just(2)], ops in ops()) {
        let info = BootInfo {
            memory_map: &MAP,
            files: &FILES,
            kernel_image: LoadedFile::new(4 * 4096, 2 * 4096),
        };
        let mut pab = vec![0u8; pab_size(FRAMES as u64 * FRAME, bits)];
        let mut pmm = BitmapFrameAlloc::new();
        pmm.init(
            &info,
            [RegionConfig {
                kind: RegionKind::Any,
                start: PhysicalAddress::zero(),
                length: FRAMES as u64 * FRAME,
                pab: &mut pab,
                bits_per_state: bits,
            }],
        )
        .unwrap();

        let reserved: Vec<bool> = {
            let region = pmm.regions().next().unwrap();
            (0..FRAMES).map(|i| region.is_reserved(i)).collect()
        };
        let expected: Vec<usize> = (0..FRAMES).filter(|&i| reserved[i]).collect();
        prop_assert_eq!(expected, [4_usize, 5, 20, 21, 22, 23, 40]);

        let mut taken = [false; FRAMES];
        let mut live: Vec<(usize, usize)> = Vec::new();
        let blocked = |taken: &[bool; FRAMES], frame: usize| frame == 0 || reserved[frame] || taken[frame];

        for op in ops {
            match op {
                Op::Alloc(count) => match pmm.alloc(count, RegionKind::Any) {
                    Ok(pa) => {
                        let start = frame_of(pa);
                        prop_assert!(start + count <= FRAMES);
                        for frame in start..start + count {
                            prop_assert!(!blocked(&taken, frame), "frame {} handed out twice", frame);
                            taken[frame] = true;
                        }
                        live.push((start, count));
                    }
                    Err(e) => {
                        prop_assert_eq!(e, MemError::OutOfMemory);
                        let fits = (0..=FRAMES - count)
                            .any(|s| (s..s + count).all(|f| !blocked(&taken, f)));
                        prop_assert!(!fits, "a run of {} frames was available", count);
                    }
                },
                Op::AllocAt(start, count) => {
                    let result = pmm.alloc_at(address(start), count, RegionKind::Any);
                    if start + count > FRAMES {
                        prop_assert_eq!(result, Err(MemError::OutsideAddressableRange));
                    } else if (start..start + count).any(|f| blocked(&taken, f)) {
                        prop_assert_eq!(result, Err(MemError::DoubleAlloc));
                    } else {
                        prop_assert_eq!(result, Ok(()));
                        taken[start..start + count].fill(true);
                        live.push((start, count));
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let (start, count) = live.swap_remove(i % live.len());
                    prop_assert_eq!(pmm.free(address(start), count), Ok(()));
                    taken[start..start + count].fill(false);
                }
                Op::Free(_) => {}
            }

            let region = pmm.regions().next().unwrap();
            for (a, &(start_a, count_a)) in live.iter().enumerate() {
                for &(start_b, count_b) in &live[a + 1..] {
                    prop_assert!(start_a + count_a <= start_b || start_b + count_b <= start_a);
                }
                for frame in start_a..start_a + count_a {
                    prop_assert_eq!(region.frame_state(frame), USED);
                }
            }
            let free = (1..FRAMES).filter(|&f| region.frame_state(f) == FREE).count();
            let modelled = (1..FRAMES).filter(|&f| !blocked(&taken, f)).count();
            prop_assert_eq!(free, modelled);
            prop_assert_eq!(pmm.free_memory_size(RegionKind::Any), free as u64 * FRAME);
        }
    }
}
