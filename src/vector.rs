//! Growable array of fixed-size byte items.
//!
//! Storage is one allocator-owned `Block`; growth doubles the capacity
//! through `Allocator::resize`. A failed growth leaves the vector as it was.

use crate::alloc::{default_allocator, Allocator, Block};
use crate::error::{Error, ErrorCode};
use crate::exception::raise;
use core::fmt;

const MIN_GROWTH: usize = 4;

pub struct Vector<'a> {
    buf: Block,
    len: usize,
    item_size: usize,
    alloc: &'a dyn Allocator,
}

impl<'a> Vector<'a> {
    pub fn try_with_capacity_in(
        item_size: usize,
        capacity: usize,
        alloc: &'a dyn Allocator,
    ) -> Result<Self, Error> {
        if item_size == 0 {
            return Err(Error::invalid_argument("item size must be non-zero"));
        }
        let mut v = Vector {
            buf: Block::empty(),
            len: 0,
            item_size,
            alloc,
        };
        if capacity > 0 {
            v.grow_to(capacity)?;
        }
        Ok(v)
    }

    pub fn new_in(item_size: usize, alloc: &'a dyn Allocator) -> Self {
        raise(Self::try_with_capacity_in(item_size, 0, alloc))
    }

    pub fn try_new(item_size: usize) -> Result<Self, Error> {
        Self::try_with_capacity_in(item_size, 0, default_allocator())
    }

    /// Empty vector on the thread's default allocator. Raises for a zero
    /// item size.
    pub fn new(item_size: usize) -> Self {
        raise(Self::try_new(item_size))
    }

    pub fn with_capacity(item_size: usize, capacity: usize) -> Self {
        raise(Self::try_with_capacity_in(
            item_size,
            capacity,
            default_allocator(),
        ))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len() / self.item_size
    }

    #[inline]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// The live items, packed.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf.as_slice()[..self.len * self.item_size]
    }

    pub fn iter(&self) -> core::slice::ChunksExact<'_, u8> {
        self.as_bytes().chunks_exact(self.item_size)
    }

    fn check_item(&self, item: &[u8]) -> Result<(), Error> {
        if item.len() != self.item_size {
            return Err(Error::invalid_argument(format!(
                "item is {} bytes, vector holds {}-byte items",
                item.len(),
                self.item_size
            )));
        }
        Ok(())
    }

    fn check_index(&self, index: usize, limit: usize) -> Result<(), Error> {
        if index >= limit {
            return Err(Error::with_message(
                ErrorCode::OutOfBounds,
                format!("index {index} out of bounds for length {}", self.len),
            ));
        }
        Ok(())
    }

    #[inline]
    fn range(&self, index: usize) -> core::ops::Range<usize> {
        index * self.item_size..(index + 1) * self.item_size
    }

    fn grow_to(&mut self, capacity: usize) -> Result<(), Error> {
        let bytes = capacity
            .checked_mul(self.item_size)
            .ok_or_else(|| Error::out_of_memory(usize::MAX))?;
        if !self.buf.resize(self.alloc, bytes) {
            return Err(Error::out_of_memory(bytes));
        }
        tracing::trace!(capacity, item_size = self.item_size, "vector grown");
        Ok(())
    }

    /// Make room for at least `additional` more items.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), Error> {
        let needed = self
            .len
            .checked_add(additional)
            .ok_or_else(|| Error::out_of_memory(usize::MAX))?;
        let capacity = self.capacity();
        if needed <= capacity {
            return Ok(());
        }
        let target = needed.max(capacity.saturating_mul(2)).max(MIN_GROWTH);
        self.grow_to(target)
    }

    pub fn reserve(&mut self, additional: usize) {
        raise(self.try_reserve(additional))
    }

    pub fn try_push(&mut self, item: &[u8]) -> Result<(), Error> {
        self.check_item(item)?;
        self.try_reserve(1)?;
        let range = self.range(self.len);
        self.buf.as_mut_slice()[range].copy_from_slice(item);
        self.len += 1;
        Ok(())
    }

    pub fn push(&mut self, item: &[u8]) {
        raise(self.try_push(item))
    }

    /// Move the last item into `out`; `false` when empty.
    pub fn try_pop_into(&mut self, out: &mut [u8]) -> Result<bool, Error> {
        self.check_item(out)?;
        if self.len == 0 {
            return Ok(false);
        }
        self.len -= 1;
        out.copy_from_slice(&self.buf.as_slice()[self.range(self.len)]);
        Ok(true)
    }

    pub fn pop_into(&mut self, out: &mut [u8]) -> bool {
        raise(self.try_pop_into(out))
    }

    pub fn try_get(&self, index: usize) -> Result<&[u8], Error> {
        self.check_index(index, self.len)?;
        Ok(&self.buf.as_slice()[self.range(index)])
    }

    pub fn get(&self, index: usize) -> &[u8] {
        raise(self.try_get(index))
    }

    pub fn try_get_mut(&mut self, index: usize) -> Result<&mut [u8], Error> {
        self.check_index(index, self.len)?;
        let range = self.range(index);
        Ok(&mut self.buf.as_mut_slice()[range])
    }

    pub fn get_mut(&mut self, index: usize) -> &mut [u8] {
        raise(self.try_get_mut(index))
    }

    pub fn try_set(&mut self, index: usize, item: &[u8]) -> Result<(), Error> {
        self.check_item(item)?;
        self.try_get_mut(index)?.copy_from_slice(item);
        Ok(())
    }

    pub fn set(&mut self, index: usize, item: &[u8]) {
        raise(self.try_set(index, item))
    }

    /// Insert before `index`; `index == len` appends.
    pub fn try_insert(&mut self, index: usize, item: &[u8]) -> Result<(), Error> {
        self.check_item(item)?;
        self.check_index(index, self.len + 1)?;
        self.try_reserve(1)?;
        let size = self.item_size;
        let end = self.len * size;
        let bytes = self.buf.as_mut_slice();
        bytes.copy_within(index * size..end, (index + 1) * size);
        bytes[index * size..(index + 1) * size].copy_from_slice(item);
        self.len += 1;
        Ok(())
    }

    pub fn insert(&mut self, index: usize, item: &[u8]) {
        raise(self.try_insert(index, item))
    }

    /// Remove the item at `index`, shifting the tail down.
    pub fn try_remove(&mut self, index: usize) -> Result<(), Error> {
        self.check_index(index, self.len)?;
        let size = self.item_size;
        let end = self.len * size;
        self.buf
            .as_mut_slice()
            .copy_within((index + 1) * size..end, index * size);
        self.len -= 1;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) {
        raise(self.try_remove(index))
    }

    /// Keep the first `len` items; a larger `len` is a no-op.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for Vector<'_> {
    fn drop(&mut self) {
        core::mem::replace(&mut self.buf, Block::empty()).free(self.alloc);
    }
}

impl fmt::Debug for Vector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
