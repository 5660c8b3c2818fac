//! Intrusively counted heap objects.
//!
//! An [`Object<T>`] is a header (reference count plus leak-tracker
//! registration) followed by the value. Objects are only ever reached
//! through [`ObjRef`](crate::ObjRef), which pairs every copy with an
//! `add_ref` and every drop with a `release`.

use crate::count::{Counter, RefCount};
use crate::leak::LeakTracker;
use std::any::{Any, TypeId};
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::Arc;

mod sealed {
    /// Only this crate can name it, so only the default `concrete_type` exists.
    pub struct Seal;
}

pub(crate) use sealed::Seal;

/// Base capability of every object that can be narrowed at run time.
///
/// Implementing it is a one-liner:
///
/// ```
/// use ix_core::{Interface, ObjRef};
///
/// struct Logic;
/// impl Interface for Logic {}
///
/// let any = ObjRef::new(Logic).into_interface();
/// assert!(!any.cast::<Logic>().is_null());
/// ```
pub trait Interface: Send + Sync + 'static {
    /// Name of the concrete type, used in diagnostics.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    #[doc(hidden)]
    fn concrete_type(&self, _seal: Seal) -> TypeId {
        TypeId::of::<Self>()
    }

    /// Offer every capability this type can be queried as.
    ///
    /// Usually written by [`interfaces!`](crate::interfaces). The default
    /// offers nothing, so [`ObjRef::query`](crate::ObjRef::query) only
    /// ever yields null.
    fn query_interface(&self, _query: &mut Query<'_>) {}
}

/// An in-flight capability lookup, see [`Interface::query_interface`].
pub struct Query<'a> {
    object: NonNull<u8>,
    concrete: TypeId,
    slot: &'a mut (dyn Any + 'static),
}

impl<'a> Query<'a> {
    pub(crate) fn new<T: ?Sized + Interface>(
        object: &'a Object<T>,
        slot: &'a mut (dyn Any + 'static),
    ) -> Self {
        Self {
            object: NonNull::from(object).cast::<u8>(),
            concrete: object.value.concrete_type(Seal),
            slot,
        }
    }

    /// Answer the query with `cast` if it asks for capability `I` of an
    /// object whose concrete type is `S`.
    ///
    /// `cast` is expected to be the unsizing coercion; any other answer is
    /// refused. Returns true once the query is answered.
    pub fn offer<S: Interface, I: ?Sized + 'static>(
        &mut self,
        cast: fn(&Object<S>) -> &Object<I>,
    ) -> bool {
        if self.concrete != TypeId::of::<S>() {
            return false;
        }
        let Some(slot) = self.slot.downcast_mut::<Option<NonNull<Object<I>>>>() else {
            return false;
        };
        // SAFETY: the sealed concrete type says this object is an Object<S>,
        // and it stays borrowed for 'a.
        let object = unsafe { self.object.cast::<Object<S>>().as_ref() };
        let answer = cast(object);
        if !std::ptr::addr_eq(answer, object) {
            return false;
        }
        *slot = Some(NonNull::from(answer));
        true
    }
}

impl std::fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("object", &self.object)
            .finish_non_exhaustive()
    }
}

/// Implement [`Interface`] for a type, declaring the capabilities
/// [`ObjRef::query`](crate::ObjRef::query) can narrow it to.
///
/// `dyn Interface` itself is always offered.
///
/// ```
/// use ix_core::{interfaces, Interface, ObjRef};
///
/// trait Greeter: Interface {
///     fn greet(&self) -> &'static str;
/// }
///
/// struct English;
/// impl Greeter for English {
///     fn greet(&self) -> &'static str {
///         "hello"
///     }
/// }
/// interfaces!(English: dyn Greeter);
///
/// let any = ObjRef::new(English).into_interface();
/// let greeter = any.query::<dyn Greeter>();
/// assert_eq!(greeter.get().map(|g| g.greet()), Some("hello"));
/// ```
#[macro_export]
macro_rules! interfaces {
    ($ty:ty $(: $($cap:ty),+ $(,)?)?) => {
        impl $crate::Interface for $ty {
            fn query_interface(&self, query: &mut $crate::Query<'_>) {
                $($(
                    {
                        fn cast(object: &$crate::Object<$ty>) -> &$crate::Object<$cap> {
                            object
                        }
                        if query.offer::<$ty, $cap>(cast) {
                            return;
                        }
                    }
                )+)?
                fn cast_base(
                    object: &$crate::Object<$ty>,
                ) -> &$crate::Object<dyn $crate::Interface> {
                    object
                }
                query.offer::<$ty, dyn $crate::Interface>(cast_base);
            }
        }
    };
}

#[derive(Debug)]
struct Header {
    count: RefCount,
    tracker: Option<Arc<LeakTracker>>,
}

impl Drop for Header {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            // Object is repr(C): the header address is the object address.
            tracker.unregister(self as *const Header as usize);
        }
    }
}

/// A reference-counted heap block.
#[repr(C)]
pub struct Object<T: ?Sized> {
    header: Header,
    value: T,
}

impl<T> Object<T> {
    /// Create an unmanaged object, typically to back a `static` singleton.
    ///
    /// `add_ref` and `release` on it are no-ops returning fixed values.
    pub const fn new_unmanaged(value: T) -> Self {
        Self {
            header: Header {
                count: RefCount::unmanaged(),
                tracker: None,
            },
            value,
        }
    }

    /// Allocate a counted object whose count starts at zero.
    ///
    /// The caller becomes responsible for the first `add_ref`, usually by
    /// handing the pointer to `ObjRef::from_raw(ptr, true)`.
    #[track_caller]
    pub fn into_raw(value: T) -> NonNull<Object<T>>
    where
        T: Send + Sync + 'static,
    {
        let site = Location::caller();
        Self::alloc(value, crate::leak::default_tracker().map(|t| (t, site)))
    }

    /// Allocate with a zero count, registering with a tracker if given.
    pub(crate) fn alloc(
        value: T,
        tracking: Option<(&Arc<LeakTracker>, &'static Location<'static>)>,
    ) -> NonNull<Object<T>> {
        let boxed = Box::new(Object {
            header: Header {
                count: RefCount::counted(),
                tracker: None,
            },
            value,
        });
        let ptr = NonNull::from(Box::leak(boxed));
        if let Some((tracker, site)) = tracking {
            tracker.register(ptr.as_ptr() as usize, std::any::type_name::<T>(), site);
            // SAFETY: freshly allocated and not yet shared.
            unsafe { (*ptr.as_ptr()).header.tracker = Some(Arc::clone(tracker)) };
        }
        ptr
    }

    pub(crate) fn unmanaged_raw(value: T) -> NonNull<Object<T>> {
        NonNull::from(Box::leak(Box::new(Self::new_unmanaged(value))))
    }

    /// Copy the value into this object; the count is left as it is.
    pub fn assign_from(&mut self, other: &Object<T>)
    where
        T: Clone,
    {
        self.value.clone_from(&other.value);
    }
}

impl<T: ?Sized> Object<T> {
    /// Increment the count, returning the new value.
    #[inline]
    pub fn add_ref(&self) -> isize {
        self.header.count.increment()
    }

    /// Decrement the count, destroying the object when it reaches zero.
    ///
    /// Returns the new count; zero means the object is gone.
    ///
    /// # Safety
    ///
    /// `this` must point to a live object allocated by this crate, and the
    /// caller must own one of its references, which this call consumes.
    pub unsafe fn release(this: NonNull<Self>) -> isize {
        let remaining = this.as_ref().header.count.decrement();
        if remaining == 0 {
            drop(Box::from_raw(this.as_ptr()));
        }
        remaining
    }

    /// Current count. Only meaningful as a diagnostic under concurrency.
    #[inline]
    pub fn ref_count(&self) -> isize {
        self.header.count.get()
    }

    /// Returns false for unmanaged singletons.
    #[inline]
    pub fn is_managed(&self) -> bool {
        self.header.count.is_managed()
    }

    #[inline]
    pub fn get(&self) -> &T {
        &self.value
    }

    #[inline]
    pub(crate) fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub(crate) fn tracker(&self) -> Option<&Arc<LeakTracker>> {
        self.header.tracker.as_ref()
    }
}

impl<T: ?Sized + Interface> Object<T> {
    pub(crate) fn is_type<C: Interface>(&self) -> bool {
        self.value.concrete_type(Seal) == TypeId::of::<C>()
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for Object<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("value", &&self.value)
            .field("ref_count", &self.ref_count())
            .field("managed", &self.is_managed())
            .finish()
    }
}
