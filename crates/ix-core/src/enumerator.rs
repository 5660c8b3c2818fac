//! Restartable forward cursors over owned containers.
//!
//! An enumerator owns its container and walks it with a small state
//! machine:
//!
//! ```text
//! NotStarted --move_next--> At(first) --move_next--> At(next) ... --> Exhausted
//!      ^                                                                  |
//!      +------------------------- move_next restarts --------------------+
//! ```
//!
//! `current()` is only valid while positioned. Consumers see the cursor as
//! an `ObjRef<dyn Enumerator<Item = T>>` and never learn the container type.
//!
//! ```
//! use ix_core::enumerator;
//!
//! let names = enumerator::sequence(vec!["a", "b"]);
//! let cursor = names.get().unwrap();
//! assert_eq!(cursor.count(), 2);
//! assert!(cursor.move_next());
//! assert_eq!(cursor.current(), Ok("a"));
//! ```

use crate::error::{Error, Result};
use crate::object::{Interface, Object};
use crate::{upcast, ObjRef};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::marker::PhantomData;
use std::ops::Bound::{Excluded, Unbounded};
use std::ptr::NonNull;

/// The cursor protocol.
///
/// All methods take `&self`; the cursor position lives behind a lock so an
/// enumerator can be shared like any other object.
pub trait Enumerator: Interface {
    type Item;

    /// Number of elements, independent of the cursor position.
    fn count(&self) -> usize;

    /// Re-arm the cursor to before the first element.
    fn reset(&self);

    /// Advance, returning whether an element is now positioned.
    fn move_next(&self) -> bool;

    /// The positioned element, passed through the projection.
    fn current(&self) -> Result<Self::Item>;

    /// Run a fresh pass and collect every element.
    fn collect_all(&self) -> Vec<Self::Item> {
        self.reset();
        let mut items = Vec::with_capacity(self.count());
        while self.move_next() {
            if let Ok(item) = self.current() {
                items.push(item);
            }
        }
        items
    }
}

// ============================================================================
// Containers
// ============================================================================

/// A container that can be walked by position.
pub trait Container: Send + Sync + 'static {
    type Position: Send + Sync + 'static;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn first(&self) -> Option<Self::Position>;

    fn after(&self, position: &Self::Position) -> Option<Self::Position>;
}

/// A container of single elements (lists, sets).
pub trait Sequence: Container {
    type Element;

    fn element(&self, position: &Self::Position) -> Option<&Self::Element>;
}

/// A container of key/value entries.
pub trait Mapping: Container {
    type Key;
    type Value;

    fn entry(&self, position: &Self::Position) -> Option<(&Self::Key, &Self::Value)>;
}

impl<T: Send + Sync + 'static> Container for Vec<T> {
    type Position = usize;

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn first(&self) -> Option<usize> {
        (!Vec::is_empty(self)).then_some(0)
    }

    fn after(&self, position: &usize) -> Option<usize> {
        let next = position + 1;
        (next < Vec::len(self)).then_some(next)
    }
}

impl<T: Send + Sync + 'static> Sequence for Vec<T> {
    type Element = T;

    fn element(&self, position: &usize) -> Option<&T> {
        self.as_slice().get(*position)
    }
}

impl<T: Send + Sync + 'static> Container for VecDeque<T> {
    type Position = usize;

    fn len(&self) -> usize {
        VecDeque::len(self)
    }

    fn first(&self) -> Option<usize> {
        (!VecDeque::is_empty(self)).then_some(0)
    }

    fn after(&self, position: &usize) -> Option<usize> {
        let next = position + 1;
        (next < VecDeque::len(self)).then_some(next)
    }
}

impl<T: Send + Sync + 'static> Sequence for VecDeque<T> {
    type Element = T;

    fn element(&self, position: &usize) -> Option<&T> {
        VecDeque::get(self, *position)
    }
}

// Ordered containers are positioned by key, so the cursor owns a clone of it.
impl<T> Container for BTreeSet<T>
where
    T: Ord + Clone + Send + Sync + 'static,
{
    type Position = T;

    fn len(&self) -> usize {
        BTreeSet::len(self)
    }

    fn first(&self) -> Option<T> {
        BTreeSet::first(self).cloned()
    }

    fn after(&self, position: &T) -> Option<T> {
        self.range::<T, _>((Excluded(position), Unbounded))
            .next()
            .cloned()
    }
}

impl<T> Sequence for BTreeSet<T>
where
    T: Ord + Clone + Send + Sync + 'static,
{
    type Element = T;

    fn element(&self, position: &T) -> Option<&T> {
        BTreeSet::get(self, position)
    }
}

impl<K, V> Container for BTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Position = K;

    fn len(&self) -> usize {
        BTreeMap::len(self)
    }

    fn first(&self) -> Option<K> {
        self.first_key_value().map(|(k, _)| k.clone())
    }

    fn after(&self, position: &K) -> Option<K> {
        self.range::<K, _>((Excluded(position), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }
}

impl<K, V> Mapping for BTreeMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Key = K;
    type Value = V;

    fn entry(&self, position: &K) -> Option<(&K, &V)> {
        self.get_key_value(position)
    }
}

// ============================================================================
// Projections
// ============================================================================

/// Turns a borrowed element into the value handed out by `current()`.
///
/// Any `Fn(&In) -> Out` closure is a projection.
pub trait Projection<In: ?Sized>: Send + Sync + 'static {
    type Output;

    fn project(&self, input: &In) -> Self::Output;
}

impl<In: ?Sized, Out, F> Projection<In> for F
where
    F: Fn(&In) -> Out + Send + Sync + 'static,
{
    type Output = Out;

    #[inline]
    fn project(&self, input: &In) -> Out {
        self(input)
    }
}

/// Hands out a clone of the element.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cloned;

impl<T: Clone> Projection<T> for Cloned {
    type Output = T;

    #[inline]
    fn project(&self, input: &T) -> T {
        input.clone()
    }
}

/// Clones the element and converts it with `Into`.
pub struct Converted<O>(PhantomData<fn() -> O>);

impl<O> Converted<O> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<O> Default for Converted<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Clone for Converted<O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for Converted<O> {}

impl<O> std::fmt::Debug for Converted<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Converted<{}>", std::any::type_name::<O>())
    }
}

impl<T, O> Projection<T> for Converted<O>
where
    T: Clone + Into<O>,
    O: 'static,
{
    type Output = O;

    #[inline]
    fn project(&self, input: &T) -> O {
        input.clone().into()
    }
}

/// Unwraps a smart reference to its raw pointer without touching the count.
///
/// The pointer stays valid for as long as the container holds the reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unwrapped;

impl<T: ?Sized + 'static> Projection<ObjRef<T>> for Unwrapped {
    type Output = Option<NonNull<Object<T>>>;

    #[inline]
    fn project(&self, input: &ObjRef<T>) -> Self::Output {
        input.as_raw()
    }
}

// ============================================================================
// Cursor
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor<P> {
    /// Freshly created; no pass has begun.
    NotStarted,
    /// Explicitly reset; the next advance starts from the first element.
    Rewound,
    At(P),
    /// The last advance ran off the end. The next one restarts.
    Exhausted,
}

struct Walk<C: Container> {
    container: C,
    cursor: Mutex<Cursor<C::Position>>,
}

impl<C: Container> Walk<C> {
    fn new(container: C) -> Self {
        Self {
            container,
            cursor: Mutex::new(Cursor::NotStarted),
        }
    }

    fn reset(&self) {
        *self.cursor.lock() = Cursor::Rewound;
    }

    fn advance(&self) -> bool {
        let mut cursor = self.cursor.lock();
        let next = match &*cursor {
            Cursor::At(position) => self.container.after(position),
            Cursor::NotStarted | Cursor::Rewound | Cursor::Exhausted => self.container.first(),
        };
        match next {
            Some(position) => {
                *cursor = Cursor::At(position);
                true
            }
            None => {
                *cursor = Cursor::Exhausted;
                false
            }
        }
    }

    fn with_position<T>(&self, read: impl FnOnce(&C, &C::Position) -> Option<T>) -> Result<T> {
        let cursor = self.cursor.lock();
        match &*cursor {
            Cursor::At(position) => read(&self.container, position).ok_or(Error::Exhausted),
            Cursor::NotStarted | Cursor::Rewound => Err(Error::NotStarted),
            Cursor::Exhausted => Err(Error::Exhausted),
        }
    }
}

// ============================================================================
// Adaptors
// ============================================================================

/// Enumerates a [`Sequence`], projecting each element through `F`.
pub struct SequenceEnumerator<C: Sequence, F = Cloned> {
    walk: Walk<C>,
    project: F,
}

impl<C> SequenceEnumerator<C, Cloned>
where
    C: Sequence,
    C::Element: Clone,
{
    pub fn new(container: C) -> Self {
        Self::with_projection(container, Cloned)
    }
}

impl<C: Sequence, O> SequenceEnumerator<C, Converted<O>>
where
    C::Element: Clone + Into<O>,
    O: 'static,
{
    pub fn converting(container: C) -> Self {
        Self::with_projection(container, Converted::new())
    }
}

impl<C: Sequence, F: Projection<C::Element>> SequenceEnumerator<C, F> {
    pub fn with_projection(container: C, project: F) -> Self {
        Self {
            walk: Walk::new(container),
            project,
        }
    }

    pub fn container(&self) -> &C {
        &self.walk.container
    }
}

impl<C: Sequence, F: Projection<C::Element>> Interface for SequenceEnumerator<C, F> {}

impl<C: Sequence, F: Projection<C::Element>> Enumerator for SequenceEnumerator<C, F> {
    type Item = F::Output;

    fn count(&self) -> usize {
        self.walk.container.len()
    }

    fn reset(&self) {
        self.walk.reset();
    }

    fn move_next(&self) -> bool {
        self.walk.advance()
    }

    fn current(&self) -> Result<F::Output> {
        self.walk.with_position(|container, position| {
            container
                .element(position)
                .map(|element| self.project.project(element))
        })
    }
}

/// Enumerates a [`Mapping`] as `(key, value)` pairs, each side projected
/// independently.
pub struct MapEnumerator<M: Mapping, KF = Cloned, VF = Cloned> {
    walk: Walk<M>,
    key: KF,
    value: VF,
}

impl<M> MapEnumerator<M, Cloned, Cloned>
where
    M: Mapping,
    M::Key: Clone,
    M::Value: Clone,
{
    pub fn new(map: M) -> Self {
        Self::with_projections(map, Cloned, Cloned)
    }
}

impl<M, KF, VF> MapEnumerator<M, KF, VF>
where
    M: Mapping,
    KF: Projection<M::Key>,
    VF: Projection<M::Value>,
{
    pub fn with_projections(map: M, key: KF, value: VF) -> Self {
        Self {
            walk: Walk::new(map),
            key,
            value,
        }
    }

    pub fn container(&self) -> &M {
        &self.walk.container
    }
}

impl<M, KF, VF> Interface for MapEnumerator<M, KF, VF>
where
    M: Mapping,
    KF: Projection<M::Key>,
    VF: Projection<M::Value>,
{
}

impl<M, KF, VF> Enumerator for MapEnumerator<M, KF, VF>
where
    M: Mapping,
    KF: Projection<M::Key>,
    VF: Projection<M::Value>,
{
    type Item = (KF::Output, VF::Output);

    fn count(&self) -> usize {
        self.walk.container.len()
    }

    fn reset(&self) {
        self.walk.reset();
    }

    fn move_next(&self) -> bool {
        self.walk.advance()
    }

    fn current(&self) -> Result<Self::Item> {
        self.walk.with_position(|map, position| {
            map.entry(position)
                .map(|(k, v)| (self.key.project(k), self.value.project(v)))
        })
    }
}

/// Wrap a sequence as an opaque shared cursor.
#[track_caller]
pub fn sequence<C>(container: C) -> ObjRef<dyn Enumerator<Item = C::Element>>
where
    C: Sequence,
    C::Element: Clone + 'static,
{
    upcast!(ObjRef::new(SequenceEnumerator::new(container)) => dyn Enumerator<Item = C::Element>)
}

/// Wrap a mapping as an opaque shared cursor over `(key, value)` pairs.
#[track_caller]
pub fn mapping<M>(map: M) -> ObjRef<dyn Enumerator<Item = (M::Key, M::Value)>>
where
    M: Mapping,
    M::Key: Clone + 'static,
    M::Value: Clone + 'static,
{
    upcast!(ObjRef::new(MapEnumerator::new(map)) => dyn Enumerator<Item = (M::Key, M::Value)>)
}
