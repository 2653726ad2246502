#![cfg(test)]

// Property tests for the hash engine kept inside the crate so they can
// inspect capacity and base size directly.

use crate::error::ErrorCode;
use crate::hash_map::HashMap;
use crate::hash_table::{bytes_eq, next_usable_size, TableBuilder};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::collections::{BTreeMap, HashMap as StdHashMap};

// Pool-indexed operations so shrinking moves toward earlier keys and
// shorter op lists.
#[derive(Clone, Debug)]
enum Op {
    Insert(usize, u32),
    Remove(usize),
    Get(usize),
    Bump(usize, u32),
    Resize(usize),
    Clear,
    Iterate,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<u32>, Vec<Op>)> {
    proptest::collection::vec(any::<u32>(), 1..=96).prop_flat_map(|pool| {
        let idx = 0..pool.len();
        let op = prop_oneof![
            6 => (idx.clone(), any::<u32>()).prop_map(|(i, v)| Op::Insert(i, v)),
            3 => idx.clone().prop_map(Op::Remove),
            2 => idx.clone().prop_map(Op::Get),
            1 => (idx.clone(), any::<u32>()).prop_map(|(i, d)| Op::Bump(i, d)),
            1 => (0usize..400).prop_map(Op::Resize),
            1 => Just(Op::Clear),
            1 => Just(Op::Iterate),
        ];
        proptest::collection::vec(op, 1..160).prop_map(move |ops| (pool.clone(), ops))
    })
}

fn value_of(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_ne_bytes(word)
}

// Drives the same random operations against the engine and std's HashMap.
// Checked after every op:
// - `len` parity and `get` parity for the touched key;
// - `len <= capacity` and `capacity >= base_size`;
// - capacity is always a usable size.
fn run(sut: &mut HashMap<'_>, pool: &[u32], ops: Vec<Op>) -> Result<(), TestCaseError> {
    let mut model: StdHashMap<u32, u32> = StdHashMap::new();
    let base = sut.base_size();

    for op in ops {
        match op {
            Op::Insert(i, v) => {
                let k = pool[i];
                let fresh = sut.insert(&k.to_ne_bytes(), &v.to_ne_bytes());
                prop_assert_eq!(fresh, model.insert(k, v).is_none());
            }
            Op::Remove(i) => {
                let k = pool[i];
                prop_assert_eq!(sut.remove(&k.to_ne_bytes()), model.remove(&k).is_some());
            }
            Op::Get(i) => {
                let k = pool[i];
                let got = sut.get(&k.to_ne_bytes()).map(value_of);
                prop_assert_eq!(got, model.get(&k).copied());
                prop_assert_eq!(sut.contains_key(&k.to_ne_bytes()), model.contains_key(&k));
            }
            Op::Bump(i, d) => {
                let k = pool[i];
                if let Some(v) = sut.get_mut(&k.to_ne_bytes()) {
                    let next = value_of(v).wrapping_add(d);
                    v.copy_from_slice(&next.to_ne_bytes());
                    let mv = model.get_mut(&k);
                    prop_assert!(mv.is_some(), "engine has a key the model lacks");
                    if let Some(mv) = mv {
                        *mv = mv.wrapping_add(d);
                    }
                } else {
                    prop_assert!(!model.contains_key(&k));
                }
            }
            Op::Resize(n) => {
                let before = sut.capacity();
                match sut.try_resize(n) {
                    Ok(()) => {
                        prop_assert!(n >= model.len());
                        let target = next_usable_size(n);
                        let expected = if target <= base { before } else { target };
                        prop_assert_eq!(sut.capacity(), expected);
                    }
                    Err(e) => {
                        prop_assert_eq!(e.code(), ErrorCode::InvalidArgument);
                        prop_assert!(n < model.len());
                        prop_assert_eq!(sut.capacity(), before);
                    }
                }
            }
            Op::Clear => {
                let before = sut.capacity();
                sut.clear();
                model.clear();
                prop_assert_eq!(sut.capacity(), before);
            }
            Op::Iterate => {
                let s: BTreeMap<u32, u32> = sut
                    .iter()
                    .map(|(k, v)| (value_of(k), value_of(v)))
                    .collect();
                let m: BTreeMap<u32, u32> = model.iter().map(|(&k, &v)| (k, v)).collect();
                prop_assert_eq!(s, m);
            }
        }

        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
        prop_assert!(sut.len() <= sut.capacity());
        prop_assert!(sut.capacity() >= base);
        prop_assert_eq!(next_usable_size(sut.capacity()), sut.capacity());
    }

    // Every model entry is still reachable at the end.
    for (k, v) in &model {
        let mut out = [0u8; 4];
        prop_assert!(sut.get_copy(&k.to_ne_bytes(), &mut out));
        prop_assert_eq!(u32::from_ne_bytes(out), *v);
    }
    Ok(())
}

// Property: state-machine equivalence against std::collections::HashMap
// under the default SipHash double hashing.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        let mut sut = HashMap::new(4, 4, bytes_eq);
        run(&mut sut, &pool, ops)?;
    }
}

// Property: same invariants under worst-case collisions. A constant hash
// sends every key down one probe chain, stressing tombstones and the
// bounded fallback sweep.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        let mut sut = TableBuilder::new(4)
            .value_size(4)
            .equality(bytes_eq)
            .hash_fn(|_key, _attempt| 0)
            .build_map();
        run(&mut sut, &pool, ops)?;
    }
}
