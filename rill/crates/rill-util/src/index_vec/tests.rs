use crate::define_idx;
use crate::index_vec::{Idx, IndexVec};

define_idx! {
    /// A test index type.
    struct TestId;
}

#[test]
fn push_returns_sequential_indices() {
    let mut v: IndexVec<TestId, &str> = IndexVec::new();
    let a = v.push("a");
    let b = v.push("b");
    let c = v.push("c");

    assert_eq!(a, TestId(0));
    assert_eq!(b, TestId(1));
    assert_eq!(c, TestId(2));
    assert_eq!(v.len(), 3);
}

#[test]
fn index_round_trip() {
    for i in [0usize, 1, 7, 255, u16::MAX as usize] {
        assert_eq!(TestId::from_usize(i).index(), i);
    }
}

#[test]
#[should_panic]
fn from_usize_rejects_overflow() {
    let _ = TestId::from_usize(u16::MAX as usize + 1);
}

#[test]
fn typed_indexing() {
    let mut v: IndexVec<TestId, i32> = IndexVec::new();
    let a = v.push(10);
    let b = v.push(20);

    assert_eq!(v[a], 10);
    assert_eq!(v[b], 20);

    v[a] = 11;
    assert_eq!(v[a], 11);
}

#[test]
fn iter_enumerated_pairs() {
    let v: IndexVec<TestId, char> = "xyz".chars().collect();
    let pairs: Vec<_> = v.iter_enumerated().collect();

    assert_eq!(pairs.len(), 3);
    assert_eq!(pairs[0], (TestId(0), &'x'));
    assert_eq!(pairs[2], (TestId(2), &'z'));
}

#[test]
fn next_index_tracks_len() {
    let mut v: IndexVec<TestId, u8> = IndexVec::new();
    assert_eq!(v.next_index(), TestId(0));
    v.push(1);
    assert_eq!(v.next_index(), TestId(1));
}

#[test]
fn get_out_of_range_is_none() {
    let v: IndexVec<TestId, u8> = IndexVec::new();
    assert!(v.get(TestId(0)).is_none());
    assert!(v.is_empty());
}
