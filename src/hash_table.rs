//! Open-addressing hash engine shared by `HashSet` and `HashMap`.
//!
//! Entries are byte blobs allocated through the table's `Allocator`: the
//! key bytes followed by the value bytes (none for a set). The bucket array
//! is an allocator-owned array of `Slot`s; removal leaves a `Tombstone` so
//! probe chains that ran through the slot stay intact.
//!
//! Probing uses double hashing. Without a caller hash, attempt `i` lands on
//! `(h0 + i * step) mod capacity`, where `h0` and `step` come from SipHash
//! under two disjoint keys. Capacities are prime, so any non-zero step
//! reaches every slot. A caller hash is asked for each attempt in turn.
//! Every probe sequence ends with a linear sweep, which bounds lookups even
//! for hash functions that cycle.

use crate::alloc::{default_allocator, Allocator, Block};
use crate::error::{Error, ErrorCode};
use crate::exception::raise;
use crate::hash_map::HashMap;
use crate::hash_set::HashSet;
use crate::reentrancy::{OpTracker, TableOp};
use crate::siphash::{siphash24, PRIMARY_KEY, SECONDARY_KEY};
use core::ops::ControlFlow;
use core::ptr::{self, NonNull};
use core::{fmt, mem, slice};

/// Smallest capacity a table is ever built with.
pub const DEFAULT_MIN_SIZE: usize = 53;

/// Caller-supplied hash: `(key, attempt) -> hash`.
pub type HashFn<'a> = Box<dyn Fn(&[u8], u32) -> u64 + 'a>;
/// Caller-supplied key equality.
pub type EqFn<'a> = Box<dyn Fn(&[u8], &[u8]) -> bool + 'a>;

/// Byte-wise key equality, the usual choice for plain-data keys.
pub fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    a == b
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d <= n / d {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Capacity actually used for a request: the smallest prime that is at
/// least `max(requested, DEFAULT_MIN_SIZE)`.
pub fn next_usable_size(requested: usize) -> usize {
    let mut n = requested.max(DEFAULT_MIN_SIZE);
    while !is_prime(n) && n < usize::MAX {
        n += 1;
    }
    n
}

/// Load-factor band that drives automatic resizing.
///
/// The table grows (to roughly twice its capacity) when an insert would
/// push `len / capacity` above `grow_above`, and shrinks (to roughly half,
/// never under its initial capacity) when a removal drops it below
/// `shrink_below`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LoadPolicy {
    grow_above: f64,
    shrink_below: f64,
}

impl LoadPolicy {
    /// Requires `0 <= shrink_below`, `2 * shrink_below < grow_above` and
    /// `grow_above < 1`, so a resize never lands outside the band.
    pub fn new(grow_above: f64, shrink_below: f64) -> Result<Self, Error> {
        let valid = shrink_below >= 0.0 && shrink_below * 2.0 < grow_above && grow_above < 1.0;
        if !valid {
            return Err(Error::invalid_argument(format!(
                "load policy grow_above={grow_above} shrink_below={shrink_below} is not a usable band"
            )));
        }
        Ok(Self {
            grow_above,
            shrink_below,
        })
    }

    pub fn grow_above(&self) -> f64 {
        self.grow_above
    }

    pub fn shrink_below(&self) -> f64 {
        self.shrink_below
    }

    fn exceeds_grow(&self, used: usize, capacity: usize) -> bool {
        used as f64 > self.grow_above * capacity as f64
    }

    fn below_shrink(&self, live: usize, capacity: usize) -> bool {
        (live as f64) < self.shrink_below * capacity as f64
    }
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self {
            grow_above: 0.70,
            shrink_below: 0.10,
        }
    }
}

/// Which façade a table is built for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Shape {
    Set,
    Map,
}

/// Collects the construction parameters of a `HashSet` or `HashMap`.
pub struct TableBuilder<'a> {
    key_size: usize,
    value_size: usize,
    initial_size: usize,
    hash: Option<HashFn<'a>>,
    eq: Option<EqFn<'a>>,
    allocator: Option<&'a dyn Allocator>,
    policy: LoadPolicy,
}

impl<'a> TableBuilder<'a> {
    pub fn new(key_size: usize) -> Self {
        Self {
            key_size,
            value_size: 0,
            initial_size: DEFAULT_MIN_SIZE,
            hash: None,
            eq: None,
            allocator: None,
            policy: LoadPolicy::default(),
        }
    }

    pub fn value_size(mut self, value_size: usize) -> Self {
        self.value_size = value_size;
        self
    }

    /// Requested initial capacity; rounded by `next_usable_size`. The table
    /// never shrinks below the rounded value.
    pub fn initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    /// Replace the default SipHash double hashing. The function is called
    /// with increasing `attempt` values until a probe succeeds.
    pub fn hash_fn(mut self, hash: impl Fn(&[u8], u32) -> u64 + 'a) -> Self {
        self.hash = Some(Box::new(hash));
        self
    }

    /// Key equality; required.
    pub fn equality(mut self, eq: impl Fn(&[u8], &[u8]) -> bool + 'a) -> Self {
        self.eq = Some(Box::new(eq));
        self
    }

    /// Allocator for nodes and the bucket array; defaults to the thread's
    /// default allocator.
    pub fn allocator(mut self, allocator: &'a dyn Allocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn policy(mut self, policy: LoadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn try_build_set(self) -> Result<HashSet<'a>, Error> {
        RawTable::new(self, Shape::Set).map(HashSet::from_table)
    }

    pub fn build_set(self) -> HashSet<'a> {
        raise(self.try_build_set())
    }

    pub fn try_build_map(self) -> Result<HashMap<'a>, Error> {
        RawTable::new(self, Shape::Map).map(HashMap::from_table)
    }

    pub fn build_map(self) -> HashMap<'a> {
        raise(self.try_build_map())
    }
}

impl fmt::Debug for TableBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableBuilder")
            .field("key_size", &self.key_size)
            .field("value_size", &self.value_size)
            .field("initial_size", &self.initial_size)
            .field("custom_hash", &self.hash.is_some())
            .field("has_equality", &self.eq.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}

#[derive(Copy, Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(NonNull<u8>),
}

/// Allocator-owned `[Slot]`.
struct Buckets {
    block: Block,
    len: usize,
}

impl Buckets {
    fn new(alloc: &dyn Allocator, len: usize) -> Result<Self, Error> {
        let slot_size = mem::size_of::<Slot>();
        let bytes = len.saturating_mul(slot_size);
        let block =
            Block::zeroed(alloc, len, slot_size).ok_or_else(|| Error::out_of_memory(bytes))?;
        if !block.is_aligned_for::<Slot>() {
            block.free(alloc);
            return Err(Error::with_message(
                ErrorCode::OutOfMemory,
                "allocator returned a misaligned bucket array",
            ));
        }
        let base = block.as_ptr().cast::<Slot>();
        for i in 0..len {
            unsafe { base.add(i).write(Slot::Empty) };
        }
        Ok(Buckets { block, len })
    }

    #[inline]
    fn slots(&self) -> &[Slot] {
        unsafe { slice::from_raw_parts(self.block.as_ptr().cast::<Slot>(), self.len) }
    }

    #[inline]
    fn slots_mut(&mut self) -> &mut [Slot] {
        unsafe { slice::from_raw_parts_mut(self.block.as_ptr().cast::<Slot>(), self.len) }
    }

    fn release(&mut self, alloc: &dyn Allocator) {
        mem::replace(&mut self.block, Block::empty()).free(alloc);
        self.len = 0;
    }
}

/// A bucket array under construction. Freed on drop unless committed, so
/// a hash function that unwinds mid-rehash leaks nothing.
struct PendingBuckets<'x> {
    buckets: Buckets,
    alloc: &'x dyn Allocator,
}

impl PendingBuckets<'_> {
    fn commit(mut self) -> Buckets {
        mem::replace(
            &mut self.buckets,
            Buckets {
                block: Block::empty(),
                len: 0,
            },
        )
    }
}

impl Drop for PendingBuckets<'_> {
    fn drop(&mut self) {
        self.buckets.release(self.alloc);
    }
}

#[derive(Copy, Clone, Debug)]
struct NodeLayout {
    key: usize,
    value: usize,
}

impl NodeLayout {
    fn size(&self) -> usize {
        self.key + self.value
    }

    fn key<'t>(&self, node: NonNull<u8>) -> &'t [u8] {
        unsafe { slice::from_raw_parts(node.as_ptr(), self.key) }
    }

    fn value<'t>(&self, node: NonNull<u8>) -> &'t [u8] {
        unsafe { slice::from_raw_parts(node.as_ptr().add(self.key), self.value) }
    }
}

enum ProbeKind<'t, 'a> {
    Double { start: usize, step: usize },
    Custom(&'t HashFn<'a>),
}

/// Slot indices to visit for one key: `capacity` hashed attempts, then a
/// linear sweep.
struct ProbeSeq<'t, 'a> {
    kind: ProbeKind<'t, 'a>,
    key: &'t [u8],
    capacity: usize,
    attempt: usize,
}

impl Iterator for ProbeSeq<'_, '_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let attempt = self.attempt;
        if attempt >= self.capacity.saturating_mul(2) {
            return None;
        }
        self.attempt += 1;
        if attempt >= self.capacity {
            return Some(attempt - self.capacity);
        }
        let index = match self.kind {
            ProbeKind::Double { start, step } => {
                (start as u128 + attempt as u128 * step as u128) % self.capacity as u128
            }
            ProbeKind::Custom(hash) => {
                u128::from(hash(self.key, attempt as u32)) % self.capacity as u128
            }
        };
        Some(index as usize)
    }
}

/// Outcome of a probe: the slot holding the key, and the first slot a new
/// entry for it could take.
struct Located {
    hit: Option<usize>,
    vacant: Option<usize>,
}

struct Core<'a> {
    layout: NodeLayout,
    buckets: Buckets,
    count: usize,
    tombstones: usize,
    base_size: usize,
    hash: Option<HashFn<'a>>,
    eq: EqFn<'a>,
    alloc: &'a dyn Allocator,
    policy: LoadPolicy,
}

impl<'a> Core<'a> {
    fn new(builder: TableBuilder<'a>, shape: Shape) -> Result<Self, Error> {
        let TableBuilder {
            key_size,
            value_size,
            initial_size,
            hash,
            eq,
            allocator,
            policy,
        } = builder;
        let eq = eq.ok_or_else(|| {
            Error::with_message(ErrorCode::NullPointer, "an equality predicate is required")
        })?;
        if key_size == 0 {
            return Err(Error::invalid_argument("key size must be non-zero"));
        }
        match shape {
            Shape::Set if value_size != 0 => {
                return Err(Error::invalid_argument("a set stores no value bytes"));
            }
            Shape::Map if value_size == 0 => {
                return Err(Error::invalid_argument("a map needs a non-zero value size"));
            }
            _ => {}
        }
        let alloc: &'a dyn Allocator = match allocator {
            Some(a) => a,
            None => default_allocator(),
        };
        let capacity = next_usable_size(initial_size);
        let buckets = Buckets::new(alloc, capacity)?;
        tracing::trace!(key_size, value_size, capacity, "hash table created");
        Ok(Self {
            layout: NodeLayout {
                key: key_size,
                value: value_size,
            },
            buckets,
            count: 0,
            tombstones: 0,
            base_size: capacity,
            hash,
            eq,
            alloc,
            policy,
        })
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.buckets.len
    }

    fn check_key(&self, key: &[u8]) -> Result<(), Error> {
        if key.len() != self.layout.key {
            return Err(Error::invalid_argument(format!(
                "key is {} bytes, table expects {}",
                key.len(),
                self.layout.key
            )));
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<(), Error> {
        if value.len() != self.layout.value {
            return Err(Error::invalid_argument(format!(
                "value is {} bytes, table expects {}",
                value.len(),
                self.layout.value
            )));
        }
        Ok(())
    }

    fn probe<'t>(&'t self, key: &'t [u8], capacity: usize) -> ProbeSeq<'t, 'a> {
        let kind = match &self.hash {
            Some(hash) => ProbeKind::Custom(hash),
            None => {
                let cap = capacity as u64;
                let start = (siphash24(key, PRIMARY_KEY) % cap) as usize;
                let step = (siphash24(key, SECONDARY_KEY) % cap) as usize;
                ProbeKind::Double {
                    start,
                    step: step.max(1),
                }
            }
        };
        ProbeSeq {
            kind,
            key,
            capacity,
            attempt: 0,
        }
    }

    fn locate(&self, key: &[u8]) -> Located {
        let slots = self.buckets.slots();
        let mut vacant = None;
        for index in self.probe(key, slots.len()) {
            match slots[index] {
                Slot::Empty => {
                    return Located {
                        hit: None,
                        vacant: vacant.or(Some(index)),
                    }
                }
                Slot::Tombstone => {
                    vacant.get_or_insert(index);
                }
                Slot::Occupied(node) => {
                    if (self.eq)(self.layout.key(node), key) {
                        return Located {
                            hit: Some(index),
                            vacant,
                        };
                    }
                }
            }
        }
        Located { hit: None, vacant }
    }

    fn find(&self, key: &[u8]) -> Option<NonNull<u8>> {
        let index = self.locate(key).hit?;
        match self.buckets.slots()[index] {
            Slot::Occupied(node) => Some(node),
            _ => None,
        }
    }

    fn free_node(&self, node: NonNull<u8>) {
        unsafe { Block::from_raw(node, self.layout.size()) }.free(self.alloc);
    }

    /// Move every live node into a fresh array of `capacity` slots. On
    /// failure the current array is untouched.
    fn rehash(&mut self, capacity: usize) -> Result<(), Error> {
        let alloc = self.alloc;
        let mut fresh = PendingBuckets {
            buckets: Buckets::new(alloc, capacity)?,
            alloc,
        };
        let mut placed = 0;
        {
            let dst = fresh.buckets.slots_mut();
            for slot in self.buckets.slots() {
                if let Slot::Occupied(node) = *slot {
                    let key = self.layout.key(node);
                    let free = self
                        .probe(key, capacity)
                        .find(|&i| matches!(dst[i], Slot::Empty));
                    if let Some(index) = free {
                        dst[index] = *slot;
                        placed += 1;
                    }
                }
            }
        }
        debug_assert_eq!(placed, self.count, "rehash lost entries");
        let mut old = mem::replace(&mut self.buckets, fresh.commit());
        let from = old.len;
        old.release(self.alloc);
        tracing::trace!(from, capacity, count = self.count, "bucket array rehashed");
        self.tombstones = 0;
        Ok(())
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        self.check_key(key)?;
        self.check_value(value)?;
        let mut located = self.locate(key);
        if let Some(index) = located.hit {
            if let Slot::Occupied(node) = self.buckets.slots()[index] {
                unsafe {
                    ptr::copy_nonoverlapping(
                        value.as_ptr(),
                        node.as_ptr().add(self.layout.key),
                        value.len(),
                    );
                }
            }
            return Ok(false);
        }

        let capacity = self.capacity();
        if self.policy.exceeds_grow(self.count + 1, capacity) {
            let target = capacity
                .checked_mul(2)
                .ok_or_else(|| Error::out_of_memory(usize::MAX))?;
            self.rehash(next_usable_size(target))?;
            located = self.locate(key);
        } else if self
            .policy
            .exceeds_grow(self.count + self.tombstones + 1, capacity)
        {
            match self.rehash(capacity) {
                Ok(()) => located = self.locate(key),
                Err(error) => tracing::warn!(capacity, %error, "tombstone purge skipped"),
            }
        }

        let index = located.vacant.ok_or_else(|| {
            Error::with_message(ErrorCode::OutOfMemory, "no free slot in bucket array")
        })?;
        let node = Block::copy_from(self.alloc, &[key, value])
            .ok_or_else(|| Error::out_of_memory(self.layout.size()))?;
        let slot = &mut self.buckets.slots_mut()[index];
        if matches!(slot, Slot::Tombstone) {
            self.tombstones -= 1;
        }
        *slot = Slot::Occupied(node.into_raw());
        self.count += 1;
        Ok(true)
    }

    fn remove(&mut self, key: &[u8]) -> Result<bool, Error> {
        self.check_key(key)?;
        let Some(index) = self.locate(key).hit else {
            return Ok(false);
        };
        let slot = mem::replace(&mut self.buckets.slots_mut()[index], Slot::Tombstone);
        if let Slot::Occupied(node) = slot {
            self.free_node(node);
        }
        self.count -= 1;
        self.tombstones += 1;
        self.maybe_shrink();
        Ok(true)
    }

    fn maybe_shrink(&mut self) {
        let capacity = self.capacity();
        if capacity <= self.base_size || !self.policy.below_shrink(self.count, capacity) {
            return;
        }
        let target = next_usable_size(capacity / 2).max(self.base_size);
        if target >= capacity {
            return;
        }
        if let Err(error) = self.rehash(target) {
            tracing::warn!(capacity, target, %error, "shrink skipped");
        }
    }

    fn resize(&mut self, new_capacity: usize) -> Result<(), Error> {
        if new_capacity < self.count {
            return Err(Error::invalid_argument(format!(
                "capacity {new_capacity} is below the {} live entries",
                self.count
            )));
        }
        let target = next_usable_size(new_capacity);
        if target <= self.base_size {
            tracing::trace!(target, base = self.base_size, "resize not above base size ignored");
            return Ok(());
        }
        self.rehash(target)
    }

    fn clear(&mut self) {
        let (alloc, size) = (self.alloc, self.layout.size());
        for slot in self.buckets.slots_mut() {
            if let Slot::Occupied(node) = mem::replace(slot, Slot::Empty) {
                unsafe { Block::from_raw(node, size) }.free(alloc);
            }
        }
        self.count = 0;
        self.tombstones = 0;
    }
}

impl Drop for Core<'_> {
    fn drop(&mut self) {
        self.clear();
        self.buckets.release(self.alloc);
    }
}

/// Engine behind both façades. Public entry points that run caller hash or
/// equality code are wrapped in the debug reentrancy guard.
pub(crate) struct RawTable<'a> {
    core: Core<'a>,
    running: OpTracker,
}

impl<'a> RawTable<'a> {
    pub(crate) fn new(builder: TableBuilder<'a>, shape: Shape) -> Result<Self, Error> {
        Ok(Self {
            core: Core::new(builder, shape)?,
            running: OpTracker::new(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.core.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.core.count == 0
    }

    pub(crate) fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub(crate) fn base_size(&self) -> usize {
        self.core.base_size
    }

    pub(crate) fn key_size(&self) -> usize {
        self.core.layout.key
    }

    pub(crate) fn value_size(&self) -> usize {
        self.core.layout.value
    }

    pub(crate) fn policy(&self) -> LoadPolicy {
        self.core.policy
    }

    #[cfg(test)]
    pub(crate) fn tombstones(&self) -> usize {
        self.core.tombstones
    }

    pub(crate) fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        let _g = self.running.enter(TableOp::Insert);
        self.core.insert(key, value)
    }

    pub(crate) fn remove(&mut self, key: &[u8]) -> Result<bool, Error> {
        let _g = self.running.enter(TableOp::Remove);
        self.core.remove(key)
    }

    pub(crate) fn contains(&self, key: &[u8]) -> Result<bool, Error> {
        let _g = self.running.enter(TableOp::Contains);
        self.core.check_key(key)?;
        Ok(self.core.locate(key).hit.is_some())
    }

    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, Error> {
        let _g = self.running.enter(TableOp::Get);
        self.core.check_key(key)?;
        Ok(self.core.find(key).map(|node| self.core.layout.value(node)))
    }

    pub(crate) fn get_mut(&mut self, key: &[u8]) -> Result<Option<&mut [u8]>, Error> {
        let _g = self.running.enter(TableOp::GetMut);
        self.core.check_key(key)?;
        let layout = self.core.layout;
        Ok(self.core.find(key).map(|node| unsafe {
            slice::from_raw_parts_mut(node.as_ptr().add(layout.key), layout.value)
        }))
    }

    /// Copy the value for `key` into `out`; `false` on a miss.
    pub(crate) fn get_copy(&self, key: &[u8], out: &mut [u8]) -> Result<bool, Error> {
        if out.len() != self.core.layout.value {
            return Err(Error::invalid_argument(format!(
                "output buffer is {} bytes, values are {}",
                out.len(),
                self.core.layout.value
            )));
        }
        match self.get(key)? {
            Some(value) => {
                out.copy_from_slice(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn resize(&mut self, new_capacity: usize) -> Result<(), Error> {
        let _g = self.running.enter(TableOp::Resize);
        self.core.resize(new_capacity)
    }

    pub(crate) fn clear(&mut self) {
        let _g = self.running.enter(TableOp::Clear);
        self.core.clear();
    }

    /// Visit live entries in bucket order with their live-item index.
    /// Returns `false` when `f` breaks early.
    pub(crate) fn for_each(
        &self,
        mut f: impl FnMut(&[u8], &[u8], usize) -> ControlFlow<()>,
    ) -> bool {
        for (index, (key, value)) in self.iter().enumerate() {
            if f(key, value, index).is_break() {
                return false;
            }
        }
        true
    }

    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            slots: self.core.buckets.slots().iter(),
            layout: self.core.layout,
            remaining: self.core.count,
        }
    }
}

/// Live `(key, value)` pairs in bucket order. Values are empty for sets.
pub struct Iter<'t> {
    slots: slice::Iter<'t, Slot>,
    layout: NodeLayout,
    remaining: usize,
}

impl<'t> Iterator for Iter<'t> {
    type Item = (&'t [u8], &'t [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        for slot in self.slots.by_ref() {
            if let Slot::Occupied(node) = *slot {
                self.remaining -= 1;
                return Some((self.layout.key(node), self.layout.value(node)));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}
