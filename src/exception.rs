//! Thread-local exception engine.
//!
//! Each thread owns a stack of recovery frames. A frame holds the error code
//! last thrown at it and the throw observers registered while it was
//! current. `throw` records the code on the innermost frame, notifies
//! observers, and unwinds to that frame's recovery point; with no frame it
//! terminates the process with the code as exit status.
//!
//! Recovery points are `guard` calls. `push` returns a `RecoveryToken`, and
//! `guard(token, f)` runs `f` so that a throw inside it comes back as
//! `Err(code)`, the way a restore point returns a second time with a
//! non-zero value. `catch` bundles push, guard and pop.
//!
//! The unwind is a Rust unwind carrying a payload that names its target
//! frame; guards catch only payloads aimed at their own frame (or at frames
//! pushed inside them) and re-raise everything else, including ordinary
//! panics. Builds with `panic = "abort"` therefore abort on the first throw.
//!
//! Reset and no-catch observers are per-thread and outlive frames; throw
//! observers belong to the frame that was current when they were registered
//! and are dropped with it. Observers run most recently registered first and
//! may call back into this module.

use crate::error::{Error, ErrorCode};
use core::cell::RefCell;
use core::mem;
use slotmap::{new_key_type, SlotMap};
use std::panic::{self, AssertUnwindSafe};

new_key_type! {
    struct FrameKey;
}

/// Identifies a recovery frame created by `push`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RecoveryToken(FrameKey);

type ThrowObserver = Box<dyn FnMut(ErrorCode)>;
type ResetObserver = Box<dyn FnMut()>;

struct Frame {
    code: ErrorCode,
    observers: Vec<ThrowObserver>,
    prev: Option<FrameKey>,
}

/// Unwind payload; only the guard of `frame` (or an enclosing one that
/// owns it) stops it.
struct Unwind {
    code: ErrorCode,
    frame: FrameKey,
}

#[derive(Copy, Clone)]
enum ThrowList {
    Frame(FrameKey),
    NoCatch,
}

struct Context {
    frames: SlotMap<FrameKey, Frame>,
    current: Option<FrameKey>,
    message: Option<String>,
    reset_observers: Vec<ResetObserver>,
    no_catch_observers: Vec<ThrowObserver>,
}

impl Context {
    fn new() -> Self {
        Self {
            frames: SlotMap::with_key(),
            current: None,
            message: None,
            reset_observers: Vec::new(),
            no_catch_observers: Vec::new(),
        }
    }

    fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        let key = self.current?;
        self.frames.get_mut(key)
    }

    fn push(&mut self) -> Result<FrameKey, Error> {
        self.frames
            .try_reserve(1)
            .map_err(|_| Error::out_of_memory(mem::size_of::<Frame>()))?;
        let prev = self.current;
        let key = self.frames.insert(Frame {
            code: ErrorCode::Success,
            observers: Vec::new(),
            prev,
        });
        self.current = Some(key);
        Ok(key)
    }

    fn pop(&mut self) -> Option<Frame> {
        let key = self.current?;
        let frame = self.frames.remove(key)?;
        self.current = frame.prev;
        Some(frame)
    }

    /// Whether `inner` is `outer` or was pushed while `outer` was live.
    fn encloses(&self, outer: FrameKey, mut inner: FrameKey) -> bool {
        loop {
            if inner == outer {
                return true;
            }
            match self.frames.get(inner).and_then(|f| f.prev) {
                Some(prev) => inner = prev,
                None => return false,
            }
        }
    }

    /// Pop every frame above `target`. Returned frames must be dropped
    /// after the context borrow ends, since they own user closures.
    fn unwind_to(&mut self, target: FrameKey) -> Vec<Frame> {
        let mut released = Vec::new();
        if !self.frames.contains_key(target) {
            return released;
        }
        while self.current != Some(target) {
            match self.pop() {
                Some(frame) => released.push(frame),
                None => break,
            }
        }
        released
    }

    /// Pop `target` and everything above it.
    fn release(&mut self, target: FrameKey) -> Vec<Frame> {
        let mut released = self.unwind_to(target);
        if self.current == Some(target) {
            released.extend(self.pop());
        }
        released
    }

    fn throw_list(&mut self, list: ThrowList) -> Option<&mut Vec<ThrowObserver>> {
        match list {
            ThrowList::Frame(key) => self.frames.get_mut(key).map(|f| &mut f.observers),
            ThrowList::NoCatch => Some(&mut self.no_catch_observers),
        }
    }
}

thread_local! {
    static CONTEXT: RefCell<Context> = RefCell::new(Context::new());
}

fn with_context<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    CONTEXT.with(|ctx| f(&mut ctx.borrow_mut()))
}

fn reserve_one<O>(list: &mut Vec<O>) -> Result<(), Error> {
    list.try_reserve(1)
        .map_err(|_| Error::out_of_memory(mem::size_of::<O>()))
}

/// Put `taken` back ahead of the observers registered while it was out.
fn put_back<O>(current: &mut Vec<O>, mut taken: Vec<O>) {
    taken.append(current);
    *current = taken;
}

/// Reset observers taken out of the context while they run. Dropping it
/// returns them, on normal exit and on unwind alike.
struct RunningResetObservers(Vec<ResetObserver>);

impl Drop for RunningResetObservers {
    fn drop(&mut self) {
        let taken = mem::take(&mut self.0);
        with_context(|ctx| put_back(&mut ctx.reset_observers, taken));
    }
}

/// Throw observers taken out of `list` while they run.
struct RunningThrowObservers {
    list: ThrowList,
    observers: Vec<ThrowObserver>,
}

impl Drop for RunningThrowObservers {
    fn drop(&mut self) {
        let (list, taken) = (self.list, mem::take(&mut self.observers));
        // The frame may be gone already; its observers then drop here,
        // outside the context borrow.
        let orphaned = with_context(move |ctx| match ctx.throw_list(list) {
            Some(current) => {
                put_back(current, taken);
                None
            }
            None => Some(taken),
        });
        drop(orphaned);
    }
}

/// Push a new recovery frame and make it current.
///
/// Throws `OutOfMemory` when the frame cannot be allocated.
pub fn push() -> RecoveryToken {
    let (key, depth) = raise(with_context(|ctx| {
        ctx.push().map(|key| (key, ctx.frames.len()))
    }));
    tracing::debug!(depth, "recovery frame pushed");
    RecoveryToken(key)
}

/// Pop the current frame and return the code it holds.
pub fn try_pop() -> Result<ErrorCode, Error> {
    let frame = with_context(Context::pop).ok_or_else(|| {
        Error::with_message(
            ErrorCode::ExceptionStackEmpty,
            "pop without a recovery frame",
        )
    })?;
    tracing::debug!(code = frame.code.raw(), "recovery frame popped");
    Ok(frame.code)
}

/// Like `try_pop`, but throws `ExceptionStackEmpty` when no frame exists.
pub fn pop() -> ErrorCode {
    raise(try_pop())
}

/// Code held by the current frame; `Success` when there is none.
pub fn peek() -> ErrorCode {
    with_context(|ctx| {
        ctx.current_frame_mut()
            .map_or(ErrorCode::Success, |frame| frame.code)
    })
}

/// Number of live recovery frames on this thread.
pub fn depth() -> usize {
    with_context(|ctx| ctx.frames.len())
}

/// Last message passed to `throw`, if any.
pub fn message() -> Option<String> {
    with_context(|ctx| ctx.message.clone())
}

/// Clear the current frame's code and notify reset observers.
pub fn reset() {
    let mut running = RunningResetObservers(with_context(|ctx| {
        if let Some(frame) = ctx.current_frame_mut() {
            frame.code = ErrorCode::Success;
        }
        mem::take(&mut ctx.reset_observers)
    }));
    for observer in running.0.iter_mut().rev() {
        observer();
    }
}

fn notify(list: ThrowList, code: ErrorCode) {
    let mut running = RunningThrowObservers {
        list,
        observers: with_context(|ctx| ctx.throw_list(list).map(mem::take).unwrap_or_default()),
    };
    for observer in running.observers.iter_mut().rev() {
        observer(code);
    }
}

/// Throw `code` at the current frame.
///
/// A `Some` message replaces the thread's message buffer; `None` keeps the
/// previous one. Never returns: control resumes at the frame's guard, or
/// the process exits when there is no frame.
pub fn throw(code: ErrorCode, message: Option<&str>) -> ! {
    let target = with_context(|ctx| {
        if let Some(m) = message {
            ctx.message = Some(m.to_owned());
        }
        let key = ctx.current?;
        let frame = ctx.frames.get_mut(key)?;
        frame.code = code;
        Some(key)
    });
    tracing::debug!(
        code = code.raw(),
        description = code.description(),
        caught = target.is_some(),
        "exception thrown"
    );
    match target {
        Some(frame) => {
            notify(ThrowList::Frame(frame), code);
            panic::resume_unwind(Box::new(Unwind { code, frame }))
        }
        None => {
            notify(ThrowList::NoCatch, code);
            terminate(code)
        }
    }
}

fn terminate(code: ErrorCode) -> ! {
    let message = message();
    tracing::error!(
        code = code.raw(),
        description = code.description(),
        message = message.as_deref().unwrap_or(""),
        "uncaught exception"
    );
    match &message {
        Some(m) => eprintln!(
            "uncaught exception {} ({}): {}",
            code.raw(),
            code.description(),
            m
        ),
        None => eprintln!("uncaught exception {} ({})", code.raw(), code.description()),
    }
    std::process::exit(code.raw())
}

/// Throw an `Error` produced by a `try_` operation.
pub fn throw_error(error: Error) -> ! {
    throw(error.code(), error.message())
}

/// Unwrap a `try_` result, throwing its error.
#[inline]
pub fn raise<T>(result: Result<T, Error>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => throw_error(error),
    }
}

/// Register a per-thread observer called on every `reset`.
///
/// Throws `OutOfMemory` when the list cannot grow.
pub fn on_reset(observer: impl FnMut() + 'static) {
    let observer: ResetObserver = Box::new(observer);
    let result = with_context(move |ctx| match reserve_one(&mut ctx.reset_observers) {
        Ok(()) => {
            ctx.reset_observers.push(observer);
            Ok(())
        }
        Err(error) => Err((error, observer)),
    });
    raise(result.map_err(|(error, _observer)| error))
}

/// Register a per-thread observer called when a throw finds no frame,
/// just before the process exits.
///
/// Throws `OutOfMemory` when the list cannot grow.
pub fn on_no_catch(observer: impl FnMut(ErrorCode) + 'static) {
    let observer: ThrowObserver = Box::new(observer);
    let result = with_context(move |ctx| match reserve_one(&mut ctx.no_catch_observers) {
        Ok(()) => {
            ctx.no_catch_observers.push(observer);
            Ok(())
        }
        Err(error) => Err((error, observer)),
    });
    raise(result.map_err(|(error, _observer)| error))
}

/// Register a throw observer on the current frame; it is dropped when the
/// frame is popped.
pub fn try_on_throw(observer: impl FnMut(ErrorCode) + 'static) -> Result<(), Error> {
    let observer: ThrowObserver = Box::new(observer);
    let result = with_context(move |ctx| {
        let Some(frame) = ctx.current_frame_mut() else {
            let error = Error::with_message(
                ErrorCode::ExceptionStackEmpty,
                "on_throw without a recovery frame",
            );
            return Err((error, observer));
        };
        match reserve_one(&mut frame.observers) {
            Ok(()) => {
                frame.observers.push(observer);
                Ok(())
            }
            Err(error) => Err((error, observer)),
        }
    });
    // A rejected observer is dropped here, outside the context borrow.
    result.map_err(|(error, _observer)| error)
}

/// Like `try_on_throw`, but throws `ExceptionStackEmpty` without a frame.
pub fn on_throw(observer: impl FnMut(ErrorCode) + 'static) {
    raise(try_on_throw(observer))
}

/// Run `f` with `token`'s frame as recovery point.
///
/// Returns `Err(code)` when `f` throws. The frame stays pushed: the caller
/// can `peek`, `reset`, guard again, and must eventually `pop`. Frames
/// pushed inside `f` and abandoned by the throw are released.
pub fn guard<T>(token: RecoveryToken, f: impl FnOnce() -> T) -> Result<T, ErrorCode> {
    let payload = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => return Ok(value),
        Err(payload) => payload,
    };
    let unwind = match payload.downcast::<Unwind>() {
        Ok(unwind) => unwind,
        Err(foreign) => panic::resume_unwind(foreign),
    };
    let (code, target) = (unwind.code, unwind.frame);
    let (ours, released) = with_context(|ctx| {
        if !ctx.encloses(token.0, target) {
            return (false, Vec::new());
        }
        let released = ctx.unwind_to(token.0);
        if let Some(frame) = ctx.frames.get_mut(token.0) {
            frame.code = code;
        }
        (true, released)
    });
    drop(released);
    if ours {
        Err(code)
    } else {
        panic::resume_unwind(unwind)
    }
}

/// Pops its frame on every exit path, including foreign panics.
struct Scope(RecoveryToken);

impl Drop for Scope {
    fn drop(&mut self) {
        let released = with_context(|ctx| ctx.release(self.0 .0));
        drop(released);
    }
}

/// Run `f` inside a fresh frame that is popped afterwards.
pub fn catch<T>(f: impl FnOnce() -> T) -> Result<T, ErrorCode> {
    let token = push();
    let _scope = Scope(token);
    guard(token, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn nested_push_pop_returns_innermost_code() {
        let outer = push();
        let inner = push();
        assert_eq!(depth(), 2);
        let r: Result<(), _> = guard(inner, || throw(ErrorCode::InvalidArgument, None));
        assert_eq!(r, Err(ErrorCode::InvalidArgument));
        assert_eq!(pop(), ErrorCode::InvalidArgument);
        assert_eq!(depth(), 1);
        assert_eq!(peek(), ErrorCode::Success);
        assert_eq!(guard(outer, || 5), Ok(5));
        assert_eq!(pop(), ErrorCode::Success);
        assert_eq!(depth(), 0);
    }

    #[test]
    fn pop_on_empty_stack_reports_exception_stack_empty() {
        let err = try_pop().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExceptionStackEmpty);
        assert_eq!(peek(), ErrorCode::Success);
    }

    #[test]
    fn catch_returns_value_and_leaves_no_frame() {
        assert_eq!(catch(|| 7), Ok(7));
        assert_eq!(depth(), 0);
        assert_eq!(
            catch(|| -> u8 { throw(ErrorCode::OutOfBounds, None) }),
            Err(ErrorCode::OutOfBounds)
        );
        assert_eq!(depth(), 0);
    }

    #[test]
    fn inner_catch_does_not_disturb_outer_frame() {
        let r = catch(|| {
            let inner = catch(|| -> () { throw(ErrorCode::ZeroDivision, None) });
            assert_eq!(inner, Err(ErrorCode::ZeroDivision));
            assert_eq!(depth(), 1);
            peek()
        });
        assert_eq!(r, Ok(ErrorCode::Success));
    }

    #[test]
    fn absent_message_does_not_clobber_previous_one() {
        let _ = catch(|| -> () { throw(ErrorCode::OutOfMemory, Some("msg")) });
        let _ = catch(|| -> () { throw(ErrorCode::InvalidArgument, None) });
        assert_eq!(message().as_deref(), Some("msg"));
        let _ = catch(|| -> () { throw(ErrorCode::Failure, Some("newer")) });
        assert_eq!(message().as_deref(), Some("newer"));
    }

    #[test]
    fn stale_code_is_visible_until_reset() {
        let token = push();
        let r: Result<(), _> = guard(token, || throw(ErrorCode::NullPointer, None));
        assert_eq!(r, Err(ErrorCode::NullPointer));
        assert_eq!(peek(), ErrorCode::NullPointer);
        reset();
        assert_eq!(peek(), ErrorCode::Success);

        // The same frame serves as recovery point again.
        let r: Result<(), _> = guard(token, || throw(ErrorCode::OutOfBounds, None));
        assert_eq!(r, Err(ErrorCode::OutOfBounds));
        assert_eq!(pop(), ErrorCode::OutOfBounds);
    }

    #[test]
    fn reset_observers_run_newest_first_and_outlive_frames() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let token = push();
        for id in 0..3 {
            let log = log.clone();
            on_reset(move || log.borrow_mut().push(id));
        }
        let _ = guard(token, || -> () { throw(ErrorCode::Failure, None) });
        reset();
        assert_eq!(*log.borrow(), vec![2, 1, 0]);
        pop();

        // No frame at all: observers still fire.
        reset();
        assert_eq!(log.borrow().len(), 6);
    }

    #[test]
    fn throw_observers_are_frame_scoped() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let outer_hits = Rc::new(Cell::new(0));

        let outer = push();
        {
            let outer_hits = outer_hits.clone();
            on_throw(move |_| outer_hits.set(outer_hits.get() + 1));
        }
        let r = guard(outer, || {
            let inner = catch(|| -> () {
                for id in 0..2 {
                    let seen = seen.clone();
                    on_throw(move |code| seen.borrow_mut().push((id, code)));
                }
                throw(ErrorCode::OutOfMemory, None)
            });
            assert_eq!(inner, Err(ErrorCode::OutOfMemory));
        });
        assert!(r.is_ok());
        assert_eq!(
            *seen.borrow(),
            vec![(1, ErrorCode::OutOfMemory), (0, ErrorCode::OutOfMemory)]
        );
        assert_eq!(outer_hits.get(), 0, "outer observer must not see inner throw");
        // Inner frame is gone, so its observers were dropped with it.
        assert_eq!(Rc::strong_count(&seen), 1);

        let _ = guard(outer, || -> () { throw(ErrorCode::Failure, None) });
        assert_eq!(outer_hits.get(), 1);
        pop();
        assert_eq!(Rc::strong_count(&outer_hits), 1);
    }

    #[test]
    fn observer_may_call_back_into_the_engine() {
        let peeked = Rc::new(Cell::new(ErrorCode::Success));
        let r = catch(|| -> () {
            let peeked = peeked.clone();
            on_throw(move |_| peeked.set(peek()));
            throw(ErrorCode::BadFilePointer, None)
        });
        assert_eq!(r, Err(ErrorCode::BadFilePointer));
        assert_eq!(peeked.get(), ErrorCode::BadFilePointer);
    }

    #[test]
    fn throwing_observer_keeps_its_frame_list() {
        let hits = Rc::new(Cell::new(0));
        let token = push();
        {
            let hits = hits.clone();
            on_throw(move |_| hits.set(hits.get() + 1));
        }
        let mut armed = true;
        on_throw(move |_| {
            if mem::replace(&mut armed, false) {
                throw(ErrorCode::OutOfBounds, None)
            }
        });

        // The newest observer throws first; the older one never runs.
        let r: Result<(), _> = guard(token, || throw(ErrorCode::Failure, None));
        assert_eq!(r, Err(ErrorCode::OutOfBounds));
        assert_eq!(hits.get(), 0);

        let r: Result<(), _> = guard(token, || throw(ErrorCode::Failure, None));
        assert_eq!(r, Err(ErrorCode::Failure));
        assert_eq!(hits.get(), 1);
        assert_eq!(Rc::strong_count(&hits), 2);
        pop();
        assert_eq!(Rc::strong_count(&hits), 1);
    }

    #[test]
    fn throwing_reset_observer_keeps_the_thread_list() {
        let hits = Rc::new(Cell::new(0));
        {
            let hits = hits.clone();
            on_reset(move || hits.set(hits.get() + 1));
        }
        let mut armed = true;
        on_reset(move || {
            if mem::replace(&mut armed, false) {
                throw(ErrorCode::Failure, None)
            }
        });
        assert_eq!(catch(reset), Err(ErrorCode::Failure));
        assert_eq!(hits.get(), 0);

        // Registered after the failed reset; runs ahead of the older two.
        let order = Rc::new(RefCell::new(Vec::new()));
        {
            let order = order.clone();
            on_reset(move || order.borrow_mut().push("newest"));
        }
        reset();
        assert_eq!(hits.get(), 1);
        assert_eq!(*order.borrow(), vec!["newest"]);
        assert_eq!(Rc::strong_count(&hits), 2);
    }

    #[test]
    fn exhausted_observer_list_reports_out_of_memory() {
        let mut full: Vec<()> = Vec::new();
        // Zero-sized elements: the length can sit at the capacity ceiling.
        unsafe { full.set_len(usize::MAX) };
        let err = reserve_one(&mut full).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
        unsafe { full.set_len(0) };
        assert!(reserve_one(&mut full).is_ok());
    }

    #[test]
    fn on_throw_requires_a_frame() {
        let err = try_on_throw(|_| {}).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExceptionStackEmpty);
    }

    #[test]
    fn foreign_panics_pass_through_and_release_the_frame() {
        let r = panic::catch_unwind(|| catch(|| -> () { panic!("not an exception") }));
        assert!(r.is_err());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn frames_abandoned_by_a_throw_are_released() {
        let r = catch(|| -> () {
            let _orphan = push();
            let _another = push();
            throw(ErrorCode::UnsupportedOperation, None)
        });
        assert_eq!(r, Err(ErrorCode::UnsupportedOperation));
        assert_eq!(depth(), 0);
    }

    #[test]
    fn raise_passes_values_and_throws_errors() {
        assert_eq!(raise::<u8>(Ok(3)), 3);
        let r = catch(|| raise::<u8>(Err(Error::with_message(ErrorCode::OutOfBounds, "index 9"))));
        assert_eq!(r, Err(ErrorCode::OutOfBounds));
        assert_eq!(message().as_deref(), Some("index 9"));
    }
}
