//! # ix-core
//!
//! Intrusive reference counting for component object models, with a
//! handle-indirected callback registry and restartable enumerators.
//!
//! ## Features
//!
//! - **Intrusive counts**: the count lives in the object header; `ObjRef`
//!   pairs every copy with `add_ref` and every drop with `release`
//! - **Checked downcasts**: `ObjRef::cast` narrows to a concrete type or
//!   yields null, never panics
//! - **Capability queries**: `ObjRef::query` narrows to any `dyn Trait` a
//!   type declared with `interfaces!`, without knowing the concrete type
//! - **Unmanaged singletons**: `Object::new_unmanaged` backs `static` objects
//!   that are never destroyed
//! - **Leak tracking**: every allocation is fingerprinted by call site and
//!   reported at teardown (`leak-check` feature)
//! - **Anti-cycle callbacks**: targets are reached through opaque handles,
//!   not owning pointers
//! - **Uniform cursors**: one `Enumerator` protocol over vectors, sets and
//!   maps, with value projections
//!
//! ## Quick Start
//!
//! ```rust
//! use ix_core::{enumerator, Interface, ObjRef};
//!
//! struct Codec;
//! impl Interface for Codec {}
//!
//! let codec = ObjRef::new(Codec);
//! let any = codec.clone().into_interface();
//! assert_eq!(any.cast::<Codec>(), codec);
//!
//! let cursor = enumerator::sequence(vec![1, 2, 3]);
//! assert_eq!(cursor.get().map(|e| e.collect_all()), Some(vec![1, 2, 3]));
//! ```
//!
//! ## Leak Checking
//!
//! `ObjRef::new` registers with [`LeakTracker::global`]. Hold its scope for
//! the life of the program to get the teardown report:
//!
//! ```rust
//! use ix_core::{LeakTracker, ObjRef};
//!
//! fn main() {
//!     let _leaks = LeakTracker::global().scope();
//!
//!     let config = ObjRef::new(String::from("settings"));
//!     drop(config);
//! } // `_leaks` drops here and logs whatever is still alive
//! ```

mod buffer;
mod callback;
mod count;
pub mod enumerator;
mod error;
mod leak;
mod object;
mod objref;

pub use buffer::{MemBuf, XString};
pub use callback::{Callback, CallbackRegistry, Fired, Handle};
pub use count::{Counter, RefCount, Unmanaged, UNMANAGED_ADD_REF, UNMANAGED_RELEASE};
pub use enumerator::{Enumerator, MapEnumerator, SequenceEnumerator};
pub use error::{Error, Result};
pub use leak::{
    AbortPolicy, Capture, Fingerprint, Leak, LeakReport, LeakScope, LeakTracker, TrackerConfig,
    CAPTURE_ENV, DEBUG_MARKER, DEFAULT_MAX_FRAMES,
};
pub use object::{Interface, Object, Query};
pub use objref::ObjRef;
