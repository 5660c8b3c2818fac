//! Cross-module tests for the object model
//!
//! These tests are modeled after usage patterns of:
//! - COM-style factories: out-parameters, detach/attach ownership handoff
//! - std::sync::Arc: counts under concurrent clone/drop
//! - Event sources: callbacks closed while another thread is firing
//! - Allocation debuggers: per-call-site leak reports at teardown

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use ix_core::enumerator::{self, Unwrapped};
use ix_core::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// ARC-INSPIRED TESTS: Counts Under Concurrency
// =============================================================================

mod concurrent_counts {
    use super::*;

    /// Random add_ref/release interleavings balance out exactly
    #[test]
    fn randomised_add_release_balances() {
        let obj = ObjRef::untracked(0u64);
        let threads = 8;

        let net: isize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|seed| {
                    let obj = &obj;
                    s.spawn(move || {
                        let mut rng = SmallRng::seed_from_u64(seed);
                        let object = obj.object().unwrap();
                        let raw = NonNull::from(object);
                        let mut held = 0isize;
                        for _ in 0..2_000 {
                            if held == 0 || rng.gen_bool(0.6) {
                                object.add_ref();
                                held += 1;
                            } else {
                                // Only releases references this thread added.
                                unsafe { Object::release(raw) };
                                held -= 1;
                            }
                        }
                        held
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(obj.ref_count(), Some(1 + net));
        let raw = obj.as_raw().unwrap();
        for _ in 0..net {
            unsafe { Object::release(raw) };
        }
        assert_eq!(obj.ref_count(), Some(1));
    }

    /// Clones dropped on many threads destroy the object exactly once
    #[test]
    fn destroyed_once_across_threads() {
        let drops = Arc::new(AtomicUsize::new(0));
        let obj = ObjRef::untracked(DropCounter(drops.clone()));

        std::thread::scope(|s| {
            for _ in 0..8 {
                let local = obj.clone();
                s.spawn(move || {
                    let copies: Vec<_> = (0..100).map(|_| local.clone()).collect();
                    drop(copies);
                });
            }
        });

        assert_eq!(obj.ref_count(), Some(1));
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(obj);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

// =============================================================================
// COM-INSPIRED TESTS: Factories and Ownership Handoff
// =============================================================================

mod factory_patterns {
    use super::*;

    struct Decoder {
        name: &'static str,
    }

    impl Interface for Decoder {}

    /// Factory that deposits an owned reference into an out-parameter
    fn create_decoder(out: &mut Option<NonNull<Object<Decoder>>>) -> bool {
        *out = ObjRef::new(Decoder { name: "h264" }).into_raw();
        out.is_some()
    }

    #[test]
    fn out_parameter_factory() {
        let mut decoder = ObjRef::<Decoder>::null();
        assert!(create_decoder(unsafe { decoder.out_ptr() }));
        assert_eq!(decoder.ref_count(), Some(1));
        assert_eq!(decoder.get().unwrap().name, "h264");

        // Reusing the slot releases the previous object first.
        let previous = decoder.clone();
        assert!(create_decoder(unsafe { decoder.out_ptr() }));
        assert_eq!(previous.ref_count(), Some(1));
        assert_ne!(previous, decoder);
    }

    #[test]
    fn detach_and_reattach() {
        let mut owner = ObjRef::new(Decoder { name: "vp9" });
        let raw = owner.detach();
        assert!(owner.is_null());

        // The detached reference is still counted.
        let adopted = unsafe { ObjRef::from_raw(raw, false) };
        assert_eq!(adopted.ref_count(), Some(1));

        let shared = unsafe { ObjRef::from_raw(adopted.as_raw(), true) };
        assert_eq!(adopted.ref_count(), Some(2));
        assert_eq!(shared, adopted);
    }

    #[test]
    fn capability_narrowing() {
        let decoder = ObjRef::new(Decoder { name: "av1" });
        let any = decoder.clone().into_interface();
        assert_eq!(any.type_name().map(|n| n.ends_with("Decoder")), Some(true));

        let text = any.cast::<XString>();
        assert!(text.is_null());
        assert_eq!(decoder.ref_count(), Some(2));

        let back = any.cast::<Decoder>();
        assert_eq!(back, decoder);
        assert_eq!(decoder.ref_count(), Some(3));
    }

    trait Playback: Interface {
        fn codec(&self) -> &'static str;
    }

    trait Seekable: Interface {
        fn seek(&self, to: u64) -> u64;
    }

    struct Player;

    impl Playback for Player {
        fn codec(&self) -> &'static str {
            "opus"
        }
    }

    impl Seekable for Player {
        fn seek(&self, to: u64) -> u64 {
            to.min(100)
        }
    }

    interfaces!(Player: dyn Playback, dyn Seekable);

    struct Stream;

    impl Playback for Stream {
        fn codec(&self) -> &'static str {
            "aac"
        }
    }

    interfaces!(Stream: dyn Playback);

    /// Consumers narrow between capabilities without the concrete type
    fn try_seek(media: &ObjRef<dyn Playback>, to: u64) -> Option<u64> {
        let seekable = media.query::<dyn Seekable>();
        seekable.get().map(|s| s.seek(to))
    }

    #[test]
    fn capability_to_capability() {
        let player = upcast!(ObjRef::new(Player) => dyn Playback);
        let stream = upcast!(ObjRef::new(Stream) => dyn Playback);

        assert_eq!(try_seek(&player, 250), Some(100));
        assert_eq!(try_seek(&stream, 250), None);
        assert_eq!(player.ref_count(), Some(1));
        assert_eq!(stream.ref_count(), Some(1));

        let held = player.query::<dyn Seekable>();
        assert_eq!(player.ref_count(), Some(2));
        let any = held.query::<dyn Interface>();
        assert_eq!(any.query::<dyn Playback>(), player);
        assert_eq!(player.ref_count(), Some(3));
    }

    #[test]
    fn static_singleton_never_counted() {
        static DEFAULT: Object<Decoder> = Object::new_unmanaged(Decoder { name: "null" });

        let a = ObjRef::from_static(&DEFAULT);
        let b = a.clone();
        assert_eq!(a.ref_count(), Some(UNMANAGED_ADD_REF));
        assert!(!a.is_unique());
        drop(a);
        drop(b);
        assert_eq!(DEFAULT.get().name, "null");
    }
}

// =============================================================================
// EVENT-SOURCE-INSPIRED TESTS: Callbacks Across Threads
// =============================================================================

mod callback_patterns {
    use super::*;

    /// Once close returns, no fire reaches the target, even from another thread
    #[test]
    fn close_wins_over_concurrent_fire() {
        init_logging();
        let registry: CallbackRegistry<u32, ()> = CallbackRegistry::new();
        let registry = &registry;
        let calls = AtomicUsize::new(0);
        let target = |_: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
        };

        let after_close = std::thread::scope(|s| {
            registry.scoped(&target, |handle| {
                let firer = s.spawn(move || {
                    let mut delivered = 0;
                    while registry.fire(handle, 1).is_delivered() {
                        delivered += 1;
                    }
                    delivered
                });

                while calls.load(Ordering::SeqCst) < 10 {
                    std::thread::yield_now();
                }
                registry.close(handle);
                let snapshot = calls.load(Ordering::SeqCst);

                let delivered = firer.join().unwrap();
                assert_eq!(delivered, snapshot);
                snapshot
            })
        });

        assert_eq!(calls.load(Ordering::SeqCst), after_close);
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_assign_yields_unique_handles() {
        let registry: CallbackRegistry<u32, u32> = CallbackRegistry::new();
        let echo = |x: u32| x;

        let handles: Vec<Handle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..50)
                            .map(|_| {
                                registry.scoped(&echo, |h| {
                                    assert_eq!(registry.fire(h, 9), Fired::Delivered(9));
                                    h
                                })
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = handles.iter().copied().collect();
        assert_eq!(unique.len(), handles.len());
        assert!(handles.iter().all(|h| h.is_valid()));
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_shared_as_object() {
        let registry = ObjRef::untracked(CallbackRegistry::<u32, u32>::new());
        let double = |x: u32| x * 2;

        let remote = registry.clone();
        let reg = registry.get().unwrap();
        reg.scoped(&double, |handle| {
            std::thread::scope(|s| {
                s.spawn(move || {
                    let fired = remote.get().unwrap().fire(handle, 4);
                    assert_eq!(fired.delivered(), Some(8));
                });
            });
        });
        assert!(reg.is_empty());
    }
}

// =============================================================================
// ALLOCATION-DEBUGGER-INSPIRED TESTS: Leak Reports
// =============================================================================

mod leak_patterns {
    use super::*;

    fn tracker() -> Arc<LeakTracker> {
        LeakTracker::new(TrackerConfig::new().with_abort(AbortPolicy::Never))
    }

    #[test]
    fn all_released_reports_nothing() {
        init_logging();
        let tracker = tracker();
        let objects: Vec<_> = (0..16)
            .map(|i| ObjRef::new_tracked(i, &tracker))
            .collect();
        assert_eq!(tracker.live_count(), 16);

        drop(objects);
        assert!(tracker.finish().is_empty());
    }

    #[test]
    fn one_survivor_is_reported() {
        init_logging();
        let tracker = tracker();
        let mut objects: Vec<_> = (0..8)
            .map(|i| ObjRef::new_tracked(format!("item {i}"), &tracker))
            .collect();
        let survivor = objects.pop().unwrap();
        drop(objects);

        let report = tracker.finish();
        assert_eq!(report.len(), 1);

        let leak = &report.leaks()[0];
        assert_eq!(leak.address, survivor.addr());
        assert!(leak.type_name.contains("String"));
        assert_ne!(leak.fingerprint.value(), 0);

        let frames = leak.frames.as_ref().unwrap();
        assert!(frames[0].contains("object_model.rs"));
        assert!(report.to_string().contains("obj_addr"));

        drop(survivor);
        assert!(tracker.report().is_empty());
    }

    #[test]
    fn call_sites_share_fingerprints() {
        let tracker = tracker();
        let same: Vec<_> = (0..3).map(|_| ObjRef::new_tracked((), &tracker)).collect();
        let other = ObjRef::new_tracked((), &tracker);

        let report = tracker.report();
        let prints: HashSet<_> = report.iter().map(|l| l.fingerprint).collect();
        assert_eq!(prints.len(), 2);
        drop((same, other));
    }

    #[test]
    fn backtrace_frames_are_bounded() {
        let tracker = LeakTracker::new(
            TrackerConfig::new()
                .with_capture(Capture::Backtrace)
                .with_max_frames(4)
                .with_abort(AbortPolicy::Never),
        );
        let obj = ObjRef::new_tracked(1u8, &tracker);

        let report = tracker.report();
        let frames = report.leaks()[0].frames.clone().unwrap();
        assert!(!frames.is_empty() && frames.len() <= 4);
        assert!(frames[0].contains("object_model.rs"));
        drop(obj);
    }

    #[test]
    fn duplicate_registers_with_same_tracker() {
        let tracker = tracker();
        let original = ObjRef::new_tracked(vec![1, 2], &tracker);
        let copy = original.duplicate();
        assert_eq!(tracker.live_count(), 2);
        assert!(copy.is_unique());
        drop(original);
        assert!(tracker.is_live(copy.addr()));
    }

    #[test]
    fn marker_file_arms_abort() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join(DEBUG_MARKER);
        let policy = AbortPolicy::WhenMarkerPresent(marker.clone());
        assert!(!policy.should_abort());

        std::fs::write(&marker, b"").unwrap();
        // Release builds never abort, marker or not.
        assert_eq!(policy.should_abort(), cfg!(debug_assertions));
    }

    #[test]
    fn global_scope_wraps_the_default_tracker() {
        let scope = LeakTracker::global().scope();
        assert!(Arc::ptr_eq(scope.tracker(), LeakTracker::global()));
        let obj = ObjRef::new(7u32);
        if cfg!(feature = "leak-check") {
            assert!(scope.tracker().is_live(obj.addr()));
        }
        drop(obj);
    }

    #[test]
    fn scope_reports_on_drop() {
        init_logging();
        let tracker = tracker();
        {
            let scope = tracker.scope();
            let _buf = ObjRef::new_tracked(MemBuf::default(), scope.tracker());
        }
        assert_eq!(tracker.live_count(), 0);
    }
}

// =============================================================================
// ENUMERATOR TESTS: Opaque Cursors
// =============================================================================

mod enumerator_patterns {
    use super::*;

    fn total(cursor: &ObjRef<dyn Enumerator<Item = i32>>) -> i32 {
        let e = cursor.get().unwrap();
        e.reset();
        let mut sum = 0;
        while e.move_next() {
            sum += e.current().unwrap();
        }
        sum
    }

    #[test]
    fn consumer_sees_only_the_protocol() {
        let from_vec = enumerator::sequence(vec![1, 2, 3]);
        let from_set = enumerator::sequence(BTreeSet::from([4, 5]));
        assert_eq!(total(&from_vec), 6);
        assert_eq!(total(&from_set), 9);
        // Restartable: a second pass gives the same answer.
        assert_eq!(total(&from_vec), 6);
    }

    #[test]
    fn cursor_shared_between_threads() {
        let cursor = enumerator::mapping(BTreeMap::from([(1, "one"), (2, "two")]));
        let remote = cursor.clone();
        let count = std::thread::spawn(move || remote.get().unwrap().count())
            .join()
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(cursor.ref_count(), Some(1));
    }

    #[test]
    fn unwrapped_objects_stay_alive() {
        let strings = vec![XString::new("a"), XString::new("bc")];
        let cursor = ObjRef::new(SequenceEnumerator::with_projection(strings, Unwrapped));
        let e = cursor.get().unwrap();

        let mut lengths = Vec::new();
        while e.move_next() {
            let raw = e.current().unwrap().unwrap();
            // The container still holds the reference.
            lengths.push(unsafe { raw.as_ref() }.get().len());
        }
        assert_eq!(lengths, vec![1, 2]);
    }

    #[test]
    fn out_of_protocol_is_invalid_state() {
        let cursor = enumerator::sequence(Vec::<i32>::new());
        let e = cursor.get().unwrap();
        assert!(!e.move_next());
        assert!(e.current().unwrap_err().is_invalid_state());
    }
}
