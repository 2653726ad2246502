//! HashMap: fixed-size byte keys mapped to fixed-size byte values.
//!
//! Values live inline after the key in each node. `get` hands out the value
//! region itself, so it stays valid only while the map is borrowed; use
//! `get_copy` to take a snapshot into caller storage.

use crate::error::Error;
use crate::exception::raise;
use crate::hash_table::{Iter, LoadPolicy, RawTable, TableBuilder};
use core::ops::ControlFlow;

pub struct HashMap<'a> {
    pub(crate) table: RawTable<'a>,
}

impl<'a> HashMap<'a> {
    pub fn builder(key_size: usize, value_size: usize) -> TableBuilder<'a> {
        TableBuilder::new(key_size).value_size(value_size)
    }

    /// Map with the default hash, capacity and allocator. Raises on failure.
    pub fn new(
        key_size: usize,
        value_size: usize,
        eq: impl Fn(&[u8], &[u8]) -> bool + 'a,
    ) -> Self {
        Self::builder(key_size, value_size)
            .equality(eq)
            .build_map()
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

    pub fn base_size(&self) -> usize {
        self.table.base_size()
    }

    pub fn key_size(&self) -> usize {
        self.table.key_size()
    }

    pub fn value_size(&self) -> usize {
        self.table.value_size()
    }

    pub fn policy(&self) -> LoadPolicy {
        self.table.policy()
    }

    /// Insert or overwrite. `true` when the key was new; on overwrite the
    /// stored key is kept and only the value bytes change.
    pub fn try_insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        self.table.insert(key, value)
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> bool {
        raise(self.try_insert(key, value))
    }

    pub fn try_remove(&mut self, key: &[u8]) -> Result<bool, Error> {
        self.table.remove(key)
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        raise(self.try_remove(key))
    }

    pub fn try_contains_key(&self, key: &[u8]) -> Result<bool, Error> {
        self.table.contains(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        raise(self.try_contains_key(key))
    }

    pub fn try_get(&self, key: &[u8]) -> Result<Option<&[u8]>, Error> {
        self.table.get(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        raise(self.try_get(key))
    }

    pub fn try_get_mut(&mut self, key: &[u8]) -> Result<Option<&mut [u8]>, Error> {
        self.table.get_mut(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut [u8]> {
        raise(self.try_get_mut(key))
    }

    /// Copy the value into `out`, which must be exactly `value_size` bytes.
    pub fn try_get_copy(&self, key: &[u8], out: &mut [u8]) -> Result<bool, Error> {
        self.table.get_copy(key, out)
    }

    pub fn get_copy(&self, key: &[u8], out: &mut [u8]) -> bool {
        raise(self.try_get_copy(key, out))
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

    pub fn for_each(&self, f: impl FnMut(&[u8], &[u8], usize) -> ControlFlow<()>) -> bool {
        self.table.for_each(f)
    }

    pub fn iter(&self) -> Iter<'_> {
        self.table.iter()
    }
}

impl core::fmt::Debug for HashMap<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
