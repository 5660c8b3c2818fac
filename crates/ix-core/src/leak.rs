//! Leak tracking for counted objects.
//!
//! Every tracked [`Object`](crate::Object) registers its address with a
//! [`LeakTracker`] when it is allocated and unregisters when it is destroyed.
//! Whatever is still registered at teardown is a leak. Allocations are
//! grouped by a [`Fingerprint`] of the call site that made them, so a leak
//! report points back at the code that allocated the object.
//!
//! # Design
//!
//! - `LeakTracker` - Shared (`Arc`) registry, injectable per test or app context
//! - `TrackerConfig` - Capture depth, capture mode and abort policy
//! - `LeakReport` - Snapshot of live objects, formatted one line per leak
//! - `LeakScope` - Guard that runs the teardown report when dropped
//!
//! The tracker is purely diagnostic. Objects built without one behave
//! exactly like tracked ones.

use log::{debug, error, warn};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::path::PathBuf;
use std::sync::Arc;

/// Frames kept per call site, as deep as the allocating code usually needs.
pub const DEFAULT_MAX_FRAMES: usize = 10;

/// Marker file whose presence makes the default tracker abort on leaks.
pub const DEBUG_MARKER: &str = "debug_mode";

/// Environment variable selecting the global tracker's capture mode.
pub const CAPTURE_ENV: &str = "IX_LEAK_CAPTURE";

/// How much of the allocating call stack to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capture {
    /// Only the caller location, which is free.
    #[default]
    Caller,
    /// The caller location followed by backtrace frames.
    Backtrace,
}

/// What `finish` does after reporting leaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortPolicy {
    Never,
    Always,
    /// Abort only in builds with debug assertions, and only if this path
    /// exists when the report is produced.
    WhenMarkerPresent(PathBuf),
}

impl AbortPolicy {
    pub fn should_abort(&self) -> bool {
        match self {
            AbortPolicy::Never => false,
            AbortPolicy::Always => true,
            AbortPolicy::WhenMarkerPresent(path) => cfg!(debug_assertions) && path.exists(),
        }
    }
}

impl Default for AbortPolicy {
    fn default() -> Self {
        AbortPolicy::WhenMarkerPresent(PathBuf::from(DEBUG_MARKER))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub max_frames: usize,
    pub capture: Capture,
    pub abort: AbortPolicy,
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            capture: Capture::default(),
            abort: AbortPolicy::default(),
        }
    }

    /// Defaults, with the capture mode taken from `IX_LEAK_CAPTURE`.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Ok(mode) = std::env::var(CAPTURE_ENV) {
            if mode.eq_ignore_ascii_case("backtrace") {
                config.capture = Capture::Backtrace;
            }
        }
        config
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames.max(1);
        self
    }

    pub fn with_capture(mut self, capture: Capture) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_abort(mut self, abort: AbortPolicy) -> Self {
        self.abort = abort;
        self
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash of an allocation call stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    fn of(frames: &[String]) -> Self {
        let mut hasher = FxHasher::default();
        frames.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveObject {
    fingerprint: Fingerprint,
    type_name: &'static str,
}

#[derive(Default)]
struct TrackerState {
    addresses: FxHashMap<usize, LiveObject>,
    call_sites: FxHashMap<Fingerprint, Vec<String>>,
}

/// Registry of live tracked objects.
pub struct LeakTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl LeakTracker {
    pub fn new(config: TrackerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(TrackerState::default()),
        })
    }

    /// The process-wide tracker used by `ObjRef::new`.
    pub fn global() -> &'static Arc<LeakTracker> {
        &GLOBAL
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub(crate) fn register(
        &self,
        address: usize,
        type_name: &'static str,
        site: &'static Location<'static>,
    ) {
        // Capture outside the lock, it is the expensive part.
        let frames = self.capture_frames(site);
        let fingerprint = Fingerprint::of(&frames);

        let mut state = self.state.lock();
        state.addresses.insert(
            address,
            LiveObject {
                fingerprint,
                type_name,
            },
        );
        state.call_sites.entry(fingerprint).or_insert(frames);
    }

    pub(crate) fn unregister(&self, address: usize) {
        self.state.lock().addresses.remove(&address);
    }

    fn capture_frames(&self, site: &'static Location<'static>) -> Vec<String> {
        let mut frames = vec![format!("{}:{}:{}", site.file(), site.line(), site.column())];
        if self.config.capture == Capture::Backtrace {
            let trace = Backtrace::force_capture();
            if trace.status() == BacktraceStatus::Captured {
                frames.extend(backtrace_symbols(&trace.to_string()));
            }
        }
        frames.truncate(self.config.max_frames);
        frames
    }

    /// Number of tracked objects still alive.
    pub fn live_count(&self) -> usize {
        self.state.lock().addresses.len()
    }

    /// Returns true if the object at `address` is registered.
    pub fn is_live(&self, address: usize) -> bool {
        self.state.lock().addresses.contains_key(&address)
    }

    /// Snapshot of every object still alive, ordered by address.
    pub fn report(&self) -> LeakReport {
        let state = self.state.lock();
        let mut leaks: Vec<Leak> = state
            .addresses
            .iter()
            .map(|(&address, live)| Leak {
                address,
                type_name: live.type_name,
                fingerprint: live.fingerprint,
                frames: state.call_sites.get(&live.fingerprint).cloned(),
            })
            .collect();
        leaks.sort_by_key(|leak| leak.address);
        LeakReport { leaks }
    }

    /// Teardown: log every leak, then apply the abort policy.
    pub fn finish(&self) -> LeakReport {
        let report = self.report();
        if report.is_empty() {
            debug!("leak check passed");
            return report;
        }

        warn!("memory leak detected: {} object(s)", report.len());
        for leak in report.iter() {
            warn!("{leak}");
        }
        warn!("memory leak output finished");

        if self.config.abort.should_abort() {
            error!("aborting on memory leak ({:?})", self.config.abort);
            std::process::abort();
        }
        report
    }

    /// Guard that calls `finish` when dropped.
    pub fn scope(self: &Arc<Self>) -> LeakScope {
        LeakScope {
            tracker: Arc::clone(self),
        }
    }
}

impl fmt::Debug for LeakTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakTracker")
            .field("config", &self.config)
            .field("live", &self.live_count())
            .finish()
    }
}

/// Pull frame symbols out of a rendered backtrace, skipping capture machinery.
fn backtrace_symbols(rendered: &str) -> impl Iterator<Item = String> + '_ {
    rendered
        .lines()
        .filter_map(|line| {
            let (index, symbol) = line.trim_start().split_once(": ")?;
            index
                .chars()
                .all(|c| c.is_ascii_digit())
                .then(|| symbol.trim().to_string())
        })
        .filter(|symbol| {
            !(symbol.contains("backtrace")
                || symbol.starts_with("ix_core::leak::")
                || symbol.starts_with("ix_core::object::"))
        })
}

lazy_static::lazy_static! {
    static ref GLOBAL: Arc<LeakTracker> = LeakTracker::new(TrackerConfig::from_env());
}

#[cfg(feature = "leak-check")]
pub(crate) fn default_tracker() -> Option<&'static Arc<LeakTracker>> {
    Some(LeakTracker::global())
}

#[cfg(not(feature = "leak-check"))]
pub(crate) fn default_tracker() -> Option<&'static Arc<LeakTracker>> {
    None
}

/// One object alive at report time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leak {
    pub address: usize,
    pub type_name: &'static str,
    pub fingerprint: Fingerprint,
    /// Frames recorded for the fingerprint, if still known.
    pub frames: Option<Vec<String>>,
}

impl fmt::Display for Leak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory leak address: obj_addr = {:#x}, type = {}, fingerprint = {}",
            self.address, self.type_name, self.fingerprint
        )?;
        if let Some(frames) = &self.frames {
            for frame in frames {
                write!(f, "\n    at {frame}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakReport {
    leaks: Vec<Leak>,
}

impl LeakReport {
    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Leak> {
        self.leaks.iter()
    }

    pub fn leaks(&self) -> &[Leak] {
        &self.leaks
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for leak in &self.leaks {
            writeln!(f, "{leak}")?;
        }
        Ok(())
    }
}

/// Runs the tracker's teardown report when dropped.
#[must_use = "the report runs when the scope is dropped"]
pub struct LeakScope {
    tracker: Arc<LeakTracker>,
}

impl LeakScope {
    pub fn tracker(&self) -> &Arc<LeakTracker> {
        &self.tracker
    }
}

impl Drop for LeakScope {
    fn drop(&mut self) {
        self.tracker.finish();
    }
}
