//! HashSet: fixed-size byte keys with no associated value.

use crate::error::Error;
use crate::exception::raise;
use crate::hash_table::{LoadPolicy, RawTable, TableBuilder};
use core::ops::ControlFlow;

pub struct HashSet<'a> {
    pub(crate) table: RawTable<'a>,
}

impl<'a> HashSet<'a> {
    /// Builder for a set of `item_size`-byte items.
    pub fn builder(item_size: usize) -> TableBuilder<'a> {
        TableBuilder::new(item_size)
    }

    /// Set with the default hash, capacity and allocator. Raises on failure.
    pub fn new(item_size: usize, eq: impl Fn(&[u8], &[u8]) -> bool + 'a) -> Self {
        Self::builder(item_size).equality(eq).build_set()
    }

    pub(crate) fn from_table(table: RawTable<'a>) -> Self {
        Self { table }
    }

    #[cfg(test)]
    pub(crate) fn into_table(self) -> RawTable<'a> {
        self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Capacity chosen at construction; the set never shrinks below it.
    pub fn base_size(&self) -> usize {
        self.table.base_size()
    }

    pub fn item_size(&self) -> usize {
        self.table.key_size()
    }

    pub fn policy(&self) -> LoadPolicy {
        self.table.policy()
    }

    /// `true` when `item` was not already present.
    pub fn try_insert(&mut self, item: &[u8]) -> Result<bool, Error> {
        self.table.insert(item, &[])
    }

    pub fn insert(&mut self, item: &[u8]) -> bool {
        raise(self.try_insert(item))
    }

    /// `false` when `item` was not present.
    pub fn try_remove(&mut self, item: &[u8]) -> Result<bool, Error> {
        self.table.remove(item)
    }

    pub fn remove(&mut self, item: &[u8]) -> bool {
        raise(self.try_remove(item))
    }

    pub fn try_contains(&self, item: &[u8]) -> Result<bool, Error> {
        self.table.contains(item)
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        raise(self.try_contains(item))
    }

    pub fn try_resize(&mut self, new_capacity: usize) -> Result<(), Error> {
        self.table.resize(new_capacity)
    }

    pub fn resize(&mut self, new_capacity: usize) {
        raise(self.try_resize(new_capacity))
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Visit every item with its zero-based position in the walk. Returns
    /// `false` if `f` broke out early.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], usize) -> ControlFlow<()>) -> bool {
        self.table.for_each(|item, _, index| f(item, index))
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &[u8]> + '_ {
        self.table.iter().map(|(item, _)| item)
    }
}

impl core::fmt::Debug for HashSet<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::exception::catch;
    use crate::hash_table::bytes_eq;

    #[test]
    fn insert_reports_novelty() {
        let mut s = HashSet::new(2, bytes_eq);
        assert!(s.insert(b"ab"));
        assert!(!s.insert(b"ab"));
        assert!(s.insert(b"ba"));
        assert_eq!(s.len(), 2);
        assert!(s.remove(b"ab"));
        assert!(!s.remove(b"ab"));
        assert!(!s.contains(b"ab"));
        assert!(s.contains(b"ba"));
    }

    #[test]
    fn throwing_forms_raise_through_enclosing_frame() {
        let mut s = HashSet::new(4, bytes_eq);
        let res = catch(|| s.insert(b"abc"));
        assert_eq!(res, Err(ErrorCode::InvalidArgument));
        assert!(s.is_empty());
        assert_eq!(
            s.try_contains(b"abcde").unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn custom_equality_groups_items() {
        // Case-insensitive ASCII equality needs a matching hash.
        let mut s = HashSet::builder(3)
            .equality(|a, b| a.eq_ignore_ascii_case(b))
            .hash_fn(|key, attempt| {
                let folded: u64 = key
                    .iter()
                    .fold(0, |h, b| h * 31 + u64::from(b.to_ascii_lowercase()));
                folded.wrapping_add(u64::from(attempt))
            })
            .build_set();
        assert!(s.insert(b"abc"));
        assert!(!s.insert(b"ABC"));
        assert!(s.contains(b"aBc"));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn iter_and_for_each_agree() {
        let mut s = HashSet::new(1, bytes_eq);
        for b in 0u8..20 {
            s.insert(&[b]);
        }
        let mut walked = Vec::new();
        assert!(s.for_each(|item, index| {
            assert_eq!(index, walked.len());
            walked.push(item[0]);
            ControlFlow::Continue(())
        }));
        let iterated: Vec<u8> = s.iter().map(|item| item[0]).collect();
        assert_eq!(walked, iterated);
        walked.sort_unstable();
        assert_eq!(walked, (0u8..20).collect::<Vec<_>>());
    }
}
