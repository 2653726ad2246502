//! Debug-only detection of table reentry.
//!
//! A table calls the caller's hash and equality functions in the middle of
//! its own operations. One of those reaching back into the same table would
//! observe a half-updated bucket array. Debug builds record which operation
//! is running and panic with both names on reentry; release builds keep no
//! state at all.

#[cfg(debug_assertions)]
use core::cell::Cell;
use core::fmt;
#[cfg(not(debug_assertions))]
use core::marker::PhantomData;

/// Table operations that run caller code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum TableOp {
    Insert,
    Remove,
    Contains,
    Get,
    GetMut,
    Resize,
    Clear,
}

impl TableOp {
    fn name(self) -> &'static str {
        match self {
            TableOp::Insert => "insert",
            TableOp::Remove => "remove",
            TableOp::Contains => "contains",
            TableOp::Get => "get",
            TableOp::GetMut => "get_mut",
            TableOp::Resize => "resize",
            TableOp::Clear => "clear",
        }
    }
}

impl fmt::Display for TableOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The operation a table is currently running, if any.
#[derive(Debug, Default)]
pub(crate) struct OpTracker {
    #[cfg(debug_assertions)]
    running: Cell<Option<TableOp>>,
}

impl OpTracker {
    pub(crate) const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            running: Cell::new(None),
        }
    }

    /// Mark `op` as running until the returned token drops.
    ///
    /// Debug builds panic when another operation on the same table is still
    /// running, which only happens from inside a hash or equality function.
    #[inline]
    pub(crate) fn enter(&self, op: TableOp) -> Running<'_> {
        #[cfg(debug_assertions)]
        {
            if let Some(outer) = self.running.replace(Some(op)) {
                self.running.set(Some(outer));
                panic!(
                    "reentrancy detected: `{op}` called from a hash or equality function \
                     while `{outer}` is running on the same table"
                );
            }
            Running { tracker: self }
        }

        #[cfg(not(debug_assertions))]
        {
            let _ = op;
            Running {
                _tracker: PhantomData,
            }
        }
    }

    #[cfg(all(test, debug_assertions))]
    pub(crate) fn running(&self) -> Option<TableOp> {
        self.running.get()
    }
}

/// Clears the running operation on drop, unwinding included.
#[must_use]
pub(crate) struct Running<'t> {
    #[cfg(debug_assertions)]
    tracker: &'t OpTracker,
    #[cfg(not(debug_assertions))]
    _tracker: PhantomData<&'t OpTracker>,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.tracker.running.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::{OpTracker, TableOp};

    #[test]
    fn sequential_operations_are_fine() {
        let t = OpTracker::new();
        drop(t.enter(TableOp::Insert));
        let _g = t.enter(TableOp::Get);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn reentry_panic_names_both_operations() {
        let t = OpTracker::new();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _outer = t.enter(TableOp::Resize);
            assert_eq!(t.running(), Some(TableOp::Resize));
            let _inner = t.enter(TableOp::Contains);
        }));
        let payload = res.expect_err("reentry must panic in debug builds");
        let message = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .unwrap_or_default();
        assert!(message.contains("`contains` called"), "{message}");
        assert!(message.contains("while `resize` is running"), "{message}");

        // The outer token cleared the tracker while unwinding.
        assert_eq!(t.running(), None);
        let _g = t.enter(TableOp::Remove);
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn reentry_is_unchecked_in_release() {
        let t = OpTracker::new();
        let _outer = t.enter(TableOp::Insert);
        let _inner = t.enter(TableOp::GetMut);
    }
}
