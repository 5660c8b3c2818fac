//! Ownership-aware references to counted objects.

use crate::leak::LeakTracker;
use crate::object::{Interface, Object, Query};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::Arc;

/// A counted reference to an [`Object`], possibly null.
///
/// `ObjRef<T>` owns exactly one reference on its object: cloning issues one
/// `add_ref`, dropping or resetting issues one `release`, and moving changes
/// nothing. [`detach`](Self::detach) hands the owned reference to the caller
/// without releasing it.
///
/// # Example
///
/// ```
/// use ix_core::ObjRef;
///
/// let data = ObjRef::new(vec![1, 2, 3]);
/// let shared = data.clone();
///
/// assert_eq!(data.ref_count(), Some(2));
/// assert_eq!(data, shared); // same object
/// assert_eq!(shared.get(), Some(&vec![1, 2, 3]));
/// ```
pub struct ObjRef<T: ?Sized> {
    ptr: Option<NonNull<Object<T>>>,
    _marker: PhantomData<Object<T>>,
}

// SAFETY: the count is atomic and the value is only shared immutably, like Arc.
unsafe impl<T: ?Sized + Send + Sync> Send for ObjRef<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for ObjRef<T> {}

impl<T: Send + Sync + 'static> ObjRef<T> {
    /// Allocate a new object, tracked by the global leak tracker when the
    /// `leak-check` feature is on.
    #[track_caller]
    pub fn new(value: T) -> Self {
        let site = Location::caller();
        Self::adopt(Object::alloc(
            value,
            crate::leak::default_tracker().map(|tracker| (tracker, site)),
        ))
    }

    /// Allocate a new object tracked by `tracker`.
    #[track_caller]
    pub fn new_tracked(value: T, tracker: &Arc<LeakTracker>) -> Self {
        Self::adopt(Object::alloc(value, Some((tracker, Location::caller()))))
    }

    /// Allocate a new object that no tracker knows about.
    pub fn untracked(value: T) -> Self {
        Self::adopt(Object::alloc(value, None))
    }

    /// Allocate an object that lives for the rest of the process.
    ///
    /// Its count is fixed, so this reference and all its clones never free it.
    pub fn unmanaged(value: T) -> Self {
        Self::adopt(Object::unmanaged_raw(value))
    }

    fn adopt(ptr: NonNull<Object<T>>) -> Self {
        // SAFETY: a fresh allocation, this is its first owner.
        unsafe { Self::from_raw(Some(ptr), true) }
    }
}

impl<T: ?Sized> ObjRef<T> {
    #[inline]
    pub const fn null() -> Self {
        Self {
            ptr: None,
            _marker: PhantomData,
        }
    }

    /// Wrap a raw pointer.
    ///
    /// With `addref` the object gains a reference for this wrapper; the
    /// caller keeps its own. Without it the caller transfers a reference it
    /// already holds, as with the output of a factory.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must point to a live object from this crate, and with
    /// `addref == false` the caller must own the reference being transferred.
    pub unsafe fn from_raw(ptr: Option<NonNull<Object<T>>>, addref: bool) -> Self {
        if let (Some(p), true) = (ptr, addref) {
            p.as_ref().add_ref();
        }
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// Share a `static` object, such as an unmanaged singleton.
    pub fn from_static(object: &'static Object<T>) -> Self {
        // SAFETY: a 'static object is live for every future release.
        unsafe { Self::from_raw(Some(NonNull::from(object)), true) }
    }

    /// Give up ownership without releasing, leaving this reference null.
    ///
    /// The caller now owns the reference and must eventually pass it back to
    /// [`ObjRef::from_raw`] with `addref == false` or to [`Object::release`].
    #[inline]
    #[must_use = "the detached reference leaks unless it is released"]
    pub fn detach(&mut self) -> Option<NonNull<Object<T>>> {
        self.ptr.take()
    }

    /// Consuming form of [`detach`](Self::detach).
    #[inline]
    #[must_use = "the detached reference leaks unless it is released"]
    pub fn into_raw(mut self) -> Option<NonNull<Object<T>>> {
        self.detach()
    }

    /// Release the current object, if any, and become null.
    pub fn reset(&mut self) {
        if let Some(p) = self.ptr.take() {
            // SAFETY: this wrapper owned one reference on `p`.
            unsafe { Object::release(p) };
        }
    }

    /// Replace the referent with a raw pointer, see [`ObjRef::from_raw`].
    ///
    /// # Safety
    ///
    /// Same contract as [`ObjRef::from_raw`].
    pub unsafe fn reset_raw(&mut self, ptr: Option<NonNull<Object<T>>>, addref: bool) {
        Self::from_raw(ptr, addref).swap(self);
    }

    /// Reset, then expose the empty slot for a factory to fill.
    ///
    /// # Safety
    ///
    /// Whatever is written into the slot is owned by this reference and
    /// will be released by it.
    pub unsafe fn out_ptr(&mut self) -> &mut Option<NonNull<Object<T>>> {
        self.reset();
        &mut self.ptr
    }

    #[inline]
    pub fn swap(&mut self, other: &mut ObjRef<T>) {
        std::mem::swap(&mut self.ptr, &mut other.ptr);
    }

    /// Put `other` in place, returning the previous reference.
    #[inline]
    pub fn replace(&mut self, other: ObjRef<T>) -> ObjRef<T> {
        std::mem::replace(self, other)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    #[inline]
    pub fn object(&self) -> Option<&Object<T>> {
        // SAFETY: the reference we own keeps the object alive for &self.
        self.ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.object().map(Object::get)
    }

    /// Peek at the raw pointer without affecting ownership.
    #[inline]
    pub fn as_raw(&self) -> Option<NonNull<Object<T>>> {
        self.ptr
    }

    /// Address of the object, or zero for null.
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.map_or(0, |p| p.cast::<u8>().as_ptr() as usize)
    }

    #[inline]
    pub fn ptr_eq<U: ?Sized>(&self, other: &ObjRef<U>) -> bool {
        self.addr() == other.addr()
    }

    pub fn ref_count(&self) -> Option<isize> {
        self.object().map(Object::ref_count)
    }

    /// Returns true if this is the only reference to a managed object.
    #[inline]
    pub fn is_unique(&self) -> bool {
        self.object()
            .is_some_and(|obj| obj.is_managed() && obj.ref_count() == 1)
    }

    /// Mutable access, only while this is the sole reference.
    pub fn try_get_mut(&mut self) -> Option<&mut T> {
        if !self.is_unique() {
            return None;
        }
        // SAFETY: no other reference exists and &mut self excludes borrows of this one.
        self.ptr.map(|p| unsafe { (*p.as_ptr()).value_mut() })
    }
}

impl<T: Clone + Send + Sync + 'static> ObjRef<T> {
    /// Copy the value into a new object with its own count.
    ///
    /// The copy is a distinct object (count one, held by the returned
    /// reference) and is tracked by the same tracker as the original.
    #[track_caller]
    pub fn duplicate(&self) -> ObjRef<T> {
        let site = Location::caller();
        match self.object() {
            Some(obj) => ObjRef::adopt(Object::alloc(
                obj.get().clone(),
                obj.tracker().map(|tracker| (tracker, site)),
            )),
            None => ObjRef::null(),
        }
    }

    /// Mutable access, duplicating the object first if it is shared.
    #[track_caller]
    pub fn make_mut(&mut self) -> Option<&mut T> {
        if !self.is_null() && !self.is_unique() {
            *self = self.duplicate();
        }
        self.try_get_mut()
    }

    /// Copy the value of `source` into this object without touching its count.
    ///
    /// Returns false, changing nothing, unless this is the sole reference.
    pub fn assign_from(&mut self, source: &ObjRef<T>) -> bool {
        let Some(value) = source.get() else {
            return false;
        };
        if self.ptr_eq(source) {
            return false;
        }
        match self.try_get_mut() {
            Some(target) => {
                target.clone_from(value);
                true
            }
            None => false,
        }
    }
}

impl<C: Interface> ObjRef<C> {
    /// Widen to the base capability without touching the count.
    pub fn into_interface(self) -> ObjRef<dyn Interface> {
        let raw = self
            .into_raw()
            .map(|p| -> NonNull<Object<dyn Interface>> { p });
        // SAFETY: the same allocation, carrying the reference we owned.
        unsafe { ObjRef::from_raw(raw, false) }
    }
}

impl<T: ?Sized + Interface> ObjRef<T> {
    /// Checked downcast to a concrete type.
    ///
    /// On success the result holds its own reference. On mismatch, or if
    /// this reference is null, the result is null and no count changes.
    pub fn cast<C: Interface>(&self) -> ObjRef<C> {
        match (self.ptr, self.object()) {
            (Some(p), Some(obj)) if obj.is_type::<C>() => {
                // SAFETY: the concrete type matches, and Object is repr(C).
                unsafe { ObjRef::from_raw(Some(p.cast::<Object<C>>()), true) }
            }
            _ => ObjRef::null(),
        }
    }

    /// Checked narrowing to a capability, such as `dyn Trait`, that the
    /// concrete type declared through [`interfaces!`](crate::interfaces).
    ///
    /// The caller does not need to know the concrete type. On success the
    /// result holds its own reference; otherwise it is null and no count
    /// changes.
    pub fn query<I: ?Sized + 'static>(&self) -> ObjRef<I> {
        let Some(obj) = self.object() else {
            return ObjRef::null();
        };
        let mut found: Option<NonNull<Object<I>>> = None;
        obj.get().query_interface(&mut Query::new(obj, &mut found));
        match found {
            // SAFETY: `Query::offer` only answers with this same allocation.
            Some(p) => unsafe { ObjRef::from_raw(Some(p), true) },
            None => ObjRef::null(),
        }
    }

    /// Diagnostic name of the concrete type behind this reference.
    pub fn type_name(&self) -> Option<&'static str> {
        self.get().map(Interface::type_name)
    }
}

/// Widen an [`ObjRef`] to any trait object its type implements.
///
/// ```
/// use ix_core::{upcast, Interface, ObjRef};
///
/// trait Greeter: Interface {
///     fn greet(&self) -> String;
/// }
///
/// struct English;
/// impl Interface for English {}
/// impl Greeter for English {
///     fn greet(&self) -> String {
///         "hello".into()
///     }
/// }
///
/// let greeter = upcast!(ObjRef::new(English) => dyn Greeter);
/// assert_eq!(greeter.get().map(|g| g.greet()).as_deref(), Some("hello"));
/// ```
#[macro_export]
macro_rules! upcast {
    ($r:expr => $target:ty) => {{
        let raw = $crate::ObjRef::into_raw($r)
            .map(|p| -> ::std::ptr::NonNull<$crate::Object<$target>> { p });
        // SAFETY: an unsizing coercion of the pointer we owned.
        unsafe { $crate::ObjRef::<$target>::from_raw(raw, false) }
    }};
}

impl<T: ?Sized> Clone for ObjRef<T> {
    #[inline]
    fn clone(&self) -> Self {
        // SAFETY: our own reference keeps the object alive during add_ref.
        unsafe { Self::from_raw(self.ptr, true) }
    }
}

impl<T: ?Sized> Drop for ObjRef<T> {
    #[inline]
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized> Default for ObjRef<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized, U: ?Sized> PartialEq<ObjRef<U>> for ObjRef<T> {
    #[inline]
    fn eq(&self, other: &ObjRef<U>) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: ?Sized> Eq for ObjRef<T> {}

impl<T: ?Sized> PartialOrd for ObjRef<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized> Ord for ObjRef<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl<T: ?Sized> Hash for ObjRef<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl<T: ?Sized> std::fmt::Debug for ObjRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjRef")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
