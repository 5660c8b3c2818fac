//! Handle-indirected callback registry.
//!
//! Callback targets are usually owned by the component that registers them,
//! so holding them through counted references would create cycles that never
//! release. The registry instead stores a non-owning pointer behind an
//! opaque [`Handle`]. Whoever fires the callback only ever holds the handle,
//! and a handle whose registration was closed simply finds nothing.
//!
//! # Example
//!
//! ```
//! use ix_core::{CallbackRegistry, Fired};
//!
//! let registry: CallbackRegistry<u32, u32> = CallbackRegistry::new();
//! let double = |x: u32| x * 2;
//!
//! let handle = registry.scoped(&double, |handle| {
//!     assert_eq!(registry.fire(handle, 21), Fired::Delivered(42));
//!     handle
//! });
//!
//! // The scope closed the handle.
//! assert_eq!(registry.fire(handle, 21), Fired::NotFound);
//! ```

use crate::object::Interface;
use log::{debug, error, trace};
use parking_lot::lock_api::{Mutex, RawMutex};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;

/// Opaque identifier of a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(i32);

impl Handle {
    /// Returned for a null target. Never allocated, never found.
    pub const INVALID: Handle = Handle(-1);

    #[inline]
    pub const fn from_raw(value: i32) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    /// Returns true for any value the registry could have allocated.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A callback target with a single dispatch entry.
///
/// Targets are invoked from whichever thread fires them, hence `Sync`.
pub trait Callback<P, R>: Sync {
    fn on_callback(&self, payload: P) -> R;
}

impl<P, R, F> Callback<P, R> for F
where
    F: Fn(P) -> R + Sync,
{
    #[inline]
    fn on_callback(&self, payload: P) -> R {
        self(payload)
    }
}

/// Outcome of [`CallbackRegistry::fire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fired<R> {
    /// The target ran and returned this.
    Delivered(R),
    /// No open registration for the handle. Expected, not an error.
    NotFound,
}

impl<R> Fired<R> {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Fired::Delivered(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Fired::NotFound)
    }

    pub fn delivered(self) -> Option<R> {
        match self {
            Fired::Delivered(r) => Some(r),
            Fired::NotFound => None,
        }
    }
}

struct Target<P, R>(NonNull<dyn Callback<P, R>>);

// SAFETY: the target is only ever used through a shared reference, and
// `Callback` requires `Sync`.
unsafe impl<P, R> Send for Target<P, R> {}

struct Table<P, R> {
    seed: i32,
    targets: BTreeMap<Handle, Target<P, R>>,
}

impl<P, R> Table<P, R> {
    fn next_handle(&mut self) -> Handle {
        loop {
            self.seed = self.seed.wrapping_add(1);
            if self.seed <= 0 {
                // Wrapped: restart the sequence, the invalid value is never handed out.
                self.seed = 1;
            }
            let handle = Handle(self.seed);
            if !self.targets.contains_key(&handle) {
                return handle;
            }
        }
    }
}

thread_local! {
    /// Registries whose lock this thread holds while running a callback.
    static FIRING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct FiringGuard(usize);

impl FiringGuard {
    fn enter(key: usize) -> Self {
        FIRING.with(|firing| firing.borrow_mut().push(key));
        FiringGuard(key)
    }
}

impl Drop for FiringGuard {
    fn drop(&mut self) {
        FIRING.with(|firing| {
            let mut firing = firing.borrow_mut();
            if let Some(pos) = firing.iter().rposition(|&k| k == self.0) {
                firing.remove(pos);
            }
        });
    }
}

/// Maps handles to callback targets.
///
/// `assign`, `close` and `fire` are linearised by one lock of type `M`,
/// which is held for the whole of a callback invocation. Once `close`
/// returns, no `fire` can reach the target any more, even one that was
/// already waiting on another thread.
///
/// A target must not call back into the registry that is firing it: the
/// lock is not reentrant. Debug builds assert on this; release builds
/// deadlock.
pub struct CallbackRegistry<P = u32, R = i32, M: RawMutex = parking_lot::RawMutex> {
    table: Mutex<M, Table<P, R>>,
}

impl<P, R, M: RawMutex> CallbackRegistry<P, R, M> {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    pub(crate) fn with_seed(seed: i32) -> Self {
        Self {
            table: Mutex::new(Table {
                seed,
                targets: BTreeMap::new(),
            }),
        }
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    fn check_reentry(&self, op: &str) {
        let key = self.key();
        let reentrant = FIRING.with(|firing| firing.borrow().contains(&key));
        if reentrant {
            error!("callback registry {op} called from inside a fired callback");
        }
        debug_assert!(
            !reentrant,
            "reentrant CallbackRegistry::{op} from a callback would deadlock"
        );
    }

    /// Register a raw target and return its handle.
    ///
    /// A null target yields [`Handle::INVALID`].
    ///
    /// # Safety
    ///
    /// The target must stay alive until [`close`](Self::close) has been
    /// called on the returned handle.
    pub unsafe fn assign(&self, target: *const dyn Callback<P, R>) -> Handle {
        let Some(target) = NonNull::new(target.cast_mut()) else {
            return Handle::INVALID;
        };
        self.check_reentry("assign");
        let mut table = self.table.lock();
        let handle = table.next_handle();
        table.targets.insert(handle, Target(target));
        debug!("callback {handle} assigned ({} open)", table.targets.len());
        handle
    }

    /// Register a borrowed target for the duration of `body`.
    ///
    /// The handle is closed when `body` returns or unwinds, so the target
    /// cannot be reached after the borrow ends.
    pub fn scoped<C, T>(&self, target: &C, body: impl FnOnce(Handle) -> T) -> T
    where
        C: Callback<P, R>,
    {
        let target: &dyn Callback<P, R> = target;
        // SAFETY: only the trait object lifetime is erased. The guard below
        // closes the handle before `target`'s borrow ends, and it is private,
        // so nothing can forget it.
        let handle = unsafe {
            let raw: *const (dyn Callback<P, R> + 'static) = std::mem::transmute(target);
            self.assign(raw)
        };
        let _close = CloseOnDrop {
            registry: self,
            handle,
        };
        body(handle)
    }

    /// Remove a registration. Unknown or already closed handles are ignored.
    pub fn close(&self, handle: Handle) {
        if !handle.is_valid() {
            return;
        }
        self.check_reentry("close");
        let mut table = self.table.lock();
        if table.targets.remove(&handle).is_some() {
            debug!("callback {handle} closed ({} open)", table.targets.len());
        }
    }

    /// Invoke the target registered under `handle`.
    pub fn fire(&self, handle: Handle, payload: P) -> Fired<R> {
        if !handle.is_valid() {
            return Fired::NotFound;
        }
        self.check_reentry("fire");
        let table = self.table.lock();
        let Some(target) = table.targets.get(&handle) else {
            trace!("callback {handle} not found");
            return Fired::NotFound;
        };
        trace!("firing callback {handle}");
        let _firing = FiringGuard::enter(self.key());
        // SAFETY: registered targets outlive their registration, and the
        // registration cannot be closed while we hold the lock.
        let result = unsafe { target.0.as_ref() }.on_callback(payload);
        Fired::Delivered(result)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.check_reentry("contains");
        self.table.lock().targets.contains_key(&handle)
    }

    /// Number of open registrations.
    pub fn len(&self) -> usize {
        self.check_reentry("len");
        self.table.lock().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.check_reentry("is_empty");
        self.table.lock().targets.is_empty()
    }
}

impl<P, R, M: RawMutex> Default for CallbackRegistry<P, R, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, R, M: RawMutex> fmt::Debug for CallbackRegistry<P, R, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never blocks, so a callback may log its own registry.
        let mut d = f.debug_struct("CallbackRegistry");
        match self.table.try_lock() {
            Some(table) => d.field("open", &table.targets.len()),
            None => d.field("open", &format_args!("<locked>")),
        };
        d.finish()
    }
}

impl<P, R, M> Interface for CallbackRegistry<P, R, M>
where
    P: 'static,
    R: 'static,
    M: RawMutex + Send + Sync + 'static,
{
}

struct CloseOnDrop<'a, P, R, M: RawMutex> {
    registry: &'a CallbackRegistry<P, R, M>,
    handle: Handle,
}

impl<P, R, M: RawMutex> Drop for CloseOnDrop<'_, P, R, M> {
    fn drop(&mut self) {
        self.registry.close(self.handle);
    }
}
