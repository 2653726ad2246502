// HashMap integration suite.
//
// Invariants exercised:
// - Round-trip: the latest value written for a key is the one read back,
//   across automatic grow and shrink.
// - Overwrite keeps the count and the stored key.
// - Borrowed values (`get`, `get_mut`) and copies (`get_copy`) agree.
// - Every allocation is returned on drop.
use simkit::exception::catch;
use simkit::{bytes_eq, ErrorCode, HashMap, LoadPolicy, TrackingAllocator};
use std::ops::ControlFlow;

fn key(i: u64) -> [u8; 8] {
    i.to_le_bytes()
}

fn val(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

fn read(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

// Test: bulk round-trip with a tracking allocator.
// Verifies: values survive every resize; half the keys removed; drop
// returns every block.
#[test]
fn bulk_round_trip_survives_resizes() {
    let a = TrackingAllocator::new();
    {
        let mut m = HashMap::builder(8, 8)
            .equality(bytes_eq)
            .allocator(&a)
            .build_map();
        for i in 0..2000 {
            assert!(m.insert(&key(i), &val(i * 3)));
        }
        for i in 0..2000 {
            assert_eq!(m.get(&key(i)).map(read), Some(i * 3));
        }
        for i in (0..2000).step_by(2) {
            assert!(m.remove(&key(i)));
        }
        assert_eq!(m.len(), 1000);
        for i in 0..2000 {
            let expected = (i % 2 == 1).then_some(i * 3);
            assert_eq!(m.get(&key(i)).map(read), expected);
        }
        assert_eq!(a.outstanding(), 1001);
    }
    assert_eq!(a.outstanding(), 0);
}

// Test: overwrite semantics.
// Verifies: a second insert of a key returns false, keeps the count, and
// replaces only the value.
#[test]
fn overwrite_replaces_value_only() {
    let mut m = HashMap::new(8, 8, bytes_eq);
    assert!(m.insert(&key(5), &val(1)));
    assert!(!m.insert(&key(5), &val(2)));
    assert_eq!(m.len(), 1);
    let (k, v) = m.iter().next().expect("one entry");
    assert_eq!(read(k), 5);
    assert_eq!(read(v), 2);
}

// Test: in-place mutation and copies.
// Verifies: `get_mut` writes are visible to `get` and `get_copy`.
#[test]
fn get_mut_and_get_copy_agree() {
    let mut m = HashMap::new(8, 8, bytes_eq);
    for i in 0..50 {
        m.insert(&key(i), &val(0));
    }
    for i in 0..50 {
        let slot = m.get_mut(&key(i)).expect("present");
        slot.copy_from_slice(&val(i + 100));
    }
    let mut out = [0u8; 8];
    for i in 0..50 {
        assert!(m.get_copy(&key(i), &mut out));
        assert_eq!(read(&out), i + 100);
        assert_eq!(m.get(&key(i)).map(read), Some(i + 100));
    }
    assert!(!m.get_copy(&key(999), &mut out));
}

// Test: map-specific argument errors.
// Verifies: wrong value length and wrong output buffer both raise
// InvalidArgument and change nothing.
#[test]
fn value_length_is_checked() {
    let mut m = HashMap::new(8, 8, bytes_eq);
    m.insert(&key(1), &val(1));
    assert_eq!(
        catch(|| m.insert(&key(2), &[0u8; 4])),
        Err(ErrorCode::InvalidArgument)
    );
    let mut short = [0u8; 2];
    assert_eq!(
        m.try_get_copy(&key(1), &mut short).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
    assert_eq!(m.len(), 1);
    assert!(!m.contains_key(&key(2)));
}

// Test: explicit resize.
// Verifies: resizing below the live count is rejected, below the base
// size is ignored, and upward resizes keep every entry.
#[test]
fn explicit_resize_rules() {
    let mut m = HashMap::builder(8, 8)
        .equality(bytes_eq)
        .initial_size(120)
        .build_map();
    assert_eq!(m.capacity(), 127);
    for i in 0..60 {
        m.insert(&key(i), &val(i));
    }
    assert_eq!(
        m.try_resize(59).unwrap_err().code(),
        ErrorCode::InvalidArgument
    );
    m.resize(60);
    assert_eq!(m.capacity(), 127);
    m.resize(1000);
    assert_eq!(m.capacity(), 1009);
    for i in 0..60 {
        assert_eq!(m.get(&key(i)).map(read), Some(i));
    }
}

// Test: custom load policy.
// Verifies: a tighter grow threshold grows earlier than the default.
#[test]
fn custom_policy_changes_growth_point() {
    let policy = LoadPolicy::new(0.5, 0.1).expect("valid band");
    let mut m = HashMap::builder(8, 8)
        .equality(bytes_eq)
        .policy(policy)
        .build_map();
    assert_eq!(m.policy(), policy);
    for i in 0..26 {
        m.insert(&key(i), &val(i));
    }
    assert_eq!(m.capacity(), 53);
    m.insert(&key(26), &val(26));
    assert_eq!(m.capacity(), 107);
    assert!(LoadPolicy::new(0.4, 0.3).is_err());
}

// Test: traversal.
// Verifies: `for_each` sees every pair once and the sum matches.
#[test]
fn for_each_visits_every_pair() {
    let mut m = HashMap::new(8, 8, bytes_eq);
    for i in 1..=100 {
        m.insert(&key(i), &val(i * i));
    }
    let mut sum = 0;
    let mut visits = 0;
    assert!(m.for_each(|k, v, _| {
        assert_eq!(read(v), read(k) * read(k));
        sum += read(k);
        visits += 1;
        ControlFlow::Continue(())
    }));
    assert_eq!(visits, 100);
    assert_eq!(sum, 5050);
}
