use kernel_bitmap::{AllowAll, Bitmap};
use proptest::prelude::*;

fn width() -> impl Strategy<Value = usize> {
    prop_oneof![Just(1_usize), Just(2), Just(4), Just(8)]
}

proptest! {
    #[test]
    fn set_then_get(bits in width(), bytes in prop::collection::vec(any::<u8>(), 1..16), index in 0..128_usize, raw_state in any::<u8>()) {
        let mut bytes = bytes;
        let mut map = Bitmap::new(&mut bytes, bits, AllowAll);
        let index = index % map.capacity();
        let state = raw_state & (((1_u16 << bits) - 1) as u8);

        prop_assert!(map.set_continuous(index, 1, state));
        prop_assert_eq!(map.get(index), state);
    }

    #[test]
    fn setting_one_item_leaves_the_others(bits in width(), bytes in prop::collection::vec(any::<u8>(), 1..16), index in 0..128_usize) {
        let before = bytes.clone();
        let mut bytes = bytes;
        let mut map = Bitmap::new(&mut bytes, bits, AllowAll);
        let index = index % map.capacity();
        let others: Vec<(usize, u8)> = (0..map.capacity())
            .filter(|&i| i != index)
            .map(|i| (i, map.get(i)))
            .collect();

        map.set_continuous(index, 1, 0);
        for (i, state) in others {
            prop_assert_eq!(map.get(i), state, "item {} changed, bytes were {:?}", i, before);
        }
    }

    #[test]
    fn found_runs_are_leftmost(bytes in prop::collection::vec(any::<u8>(), 1..8), state in 0..4_u8, len in 1..12_usize) {
        let mut bytes = bytes;
        let map = Bitmap::new(&mut bytes, 2, AllowAll);

        match map.find_continuous(state, len) {
            Some(found) => {
                prop_assert!(map.find_continuous_at(state, len, found));
                for earlier in 0..found {
                    prop_assert!(!map.find_continuous_at(state, len, earlier));
                }
            }
            None => {
                for at in 0..map.capacity() {
                    prop_assert!(!map.find_continuous_at(state, len, at));
                }
            }
        }
    }
}
