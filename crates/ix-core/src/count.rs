//! Reference counter policies.
//!
//! This module provides the `Counter` trait for abstracting over the two
//! lifetimes an [`Object`](crate::Object) can have: counted objects that
//! destroy themselves when the last reference goes away, and unmanaged
//! singletons whose lifetime is owned by something else.

use std::sync::atomic::{fence, AtomicIsize, Ordering};

/// Value reported by `add_ref` on an unmanaged object.
pub const UNMANAGED_ADD_REF: isize = 1;

/// Value reported by `release` on an unmanaged object.
///
/// Never zero, so a release can never be mistaken for the last one.
pub const UNMANAGED_RELEASE: isize = 2;

/// Trait for counter operations, abstracting atomic vs fixed counts.
pub trait Counter {
    fn get(&self) -> isize;
    fn increment(&self) -> isize;
    fn decrement(&self) -> isize;
}

// ============================================================================
// Counted
// ============================================================================

impl Counter for AtomicIsize {
    #[inline]
    fn get(&self) -> isize {
        self.load(Ordering::Acquire)
    }

    #[inline]
    fn increment(&self) -> isize {
        // A new reference can only be made from an existing one, so no
        // ordering is needed on the way up.
        self.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    fn decrement(&self) -> isize {
        let prev = self.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "Decrementing zero reference count");
        if prev == 1 {
            // Pairs with the Release above on every other thread's last use.
            fence(Ordering::Acquire);
        }
        prev - 1
    }
}

// ============================================================================
// Unmanaged
// ============================================================================

/// Fixed counter for objects that are never destroyed through their references.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmanaged;

impl Counter for Unmanaged {
    #[inline]
    fn get(&self) -> isize {
        UNMANAGED_ADD_REF
    }

    #[inline]
    fn increment(&self) -> isize {
        UNMANAGED_ADD_REF
    }

    #[inline]
    fn decrement(&self) -> isize {
        UNMANAGED_RELEASE
    }
}

/// The counter embedded in every object header.
#[derive(Debug)]
pub enum RefCount {
    Counted(AtomicIsize),
    Unmanaged(Unmanaged),
}

impl RefCount {
    /// A fresh count for a new object: zero, raised by its first owner.
    pub const fn counted() -> Self {
        RefCount::Counted(AtomicIsize::new(0))
    }

    pub const fn unmanaged() -> Self {
        RefCount::Unmanaged(Unmanaged)
    }

    /// Returns true if reaching zero destroys the owner.
    #[inline]
    pub fn is_managed(&self) -> bool {
        matches!(self, RefCount::Counted(_))
    }
}

impl Counter for RefCount {
    #[inline]
    fn get(&self) -> isize {
        match self {
            RefCount::Counted(c) => c.get(),
            RefCount::Unmanaged(u) => u.get(),
        }
    }

    #[inline]
    fn increment(&self) -> isize {
        match self {
            RefCount::Counted(c) => c.increment(),
            RefCount::Unmanaged(u) => u.increment(),
        }
    }

    #[inline]
    fn decrement(&self) -> isize {
        match self {
            RefCount::Counted(c) => c.decrement(),
            RefCount::Unmanaged(u) => u.decrement(),
        }
    }
}
