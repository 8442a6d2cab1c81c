use std::{
    alloc::{GlobalAlloc, Layout},
    cell::Cell,
    collections::HashMap,
    ffi::c_void,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use rustc_demangle::try_demangle;
use tracing::warn;

use crate::{
    Error, Frame, Result, Snapshot, Trace, Traceback, Tracer,
    slot::{EventKind, LogSlot},
    snapshot::UNKNOWN_FILE,
};

/// Sources of the allocation hooks, kept out of tracebacks and inclusive reports.
pub const TRACER_SOURCE_FILES: &[&str] = &[
    concat!(env!("CARGO_MANIFEST_DIR"), "/src/alloc.rs"),
    concat!(env!("CARGO_MANIFEST_DIR"), "/src/slot.rs"),
];

/// Source paths of the standard library and of the stack walker.
const PLUMBING_PATHS: &[&str] = &[
    "/rustc/",
    "/rustlib/",
    "/library/alloc/src/",
    "/library/core/src/",
    "/library/std/src/",
    "/backtrace-",
];

/// Allocator shims generated by the compiler and the tracer's own functions.
const PLUMBING_SYMBOLS: &[&str] = &[
    "__rust_",
    "__rustc::",
    "__rg_",
    "__rdl_",
    "memhogs::alloc::",
    "<memhogs::alloc::",
    "memhogs::slot::",
    "<memhogs::slot::",
    "backtrace::",
];

thread_local! {
    static LOGGING: Cell<bool> = const { Cell::new(false) };
}

struct Event<const MAX_FRAME_LENGTH: usize> {
    address: usize,
    size: usize,
    depth: usize,
    ips: [usize; MAX_FRAME_LENGTH],
}

impl<const MAX_FRAME_LENGTH: usize> Event<MAX_FRAME_LENGTH> {
    const fn new() -> Self {
        Event {
            address: 0,
            size: 0,
            depth: 0,
            ips: [0; MAX_FRAME_LENGTH],
        }
    }
}

/// A global allocator that records live allocations and their call stacks.
///
/// Every allocation made while the tracer is started is logged together with up to
/// `MAX_FRAME_LENGTH` return addresses; deallocations are logged by address. A
/// [`Snapshot`] replays the log, keeps what is still live and resolves the call stacks.
/// At most `MAX_LOG_COUNT` events are kept per run: further events are counted in
/// [`Snapshot::dropped_events`] and otherwise ignored.
///
/// ```rust,no_run
/// use memhogs::{ProfileReport, RunSettings, TrackingAllocator};
///
/// const MAX_FRAME_LENGTH: usize = 64;
/// const MAX_LOG_COUNT: usize = 1_024 * 10;
/// #[global_allocator]
/// static ALLOCATOR: TrackingAllocator<MAX_FRAME_LENGTH, MAX_LOG_COUNT> = TrackingAllocator::new();
///
/// fn build_index() -> Vec<u64> {
///     (0..1_000).collect()
/// }
///
/// fn main() {
///     let settings = RunSettings::builder("build_index")
///         .target_file(file!())
///         .run_count(2)
///         .build()
///         .unwrap();
///     let report = ProfileReport::run(&ALLOCATOR, settings, build_index).unwrap();
///     println!("{report}");
/// }
/// ```
pub struct TrackingAllocator<const MAX_FRAME_LENGTH: usize, const MAX_LOG_COUNT: usize> {
    is_tracking: AtomicBool,
    alloc: std::alloc::System,
    logs: [LogSlot<Event<MAX_FRAME_LENGTH>>; MAX_LOG_COUNT],
    logs_pointer: AtomicUsize,
    dropped_events: AtomicUsize,
    /// Threads currently between the tracking check and the end of their log write.
    in_flight: AtomicUsize,
    symbols: Mutex<Option<HashMap<usize, Vec<Frame>>>>,
}

impl<const MAX_FRAME_LENGTH: usize, const MAX_LOG_COUNT: usize> Default
    for TrackingAllocator<MAX_FRAME_LENGTH, MAX_LOG_COUNT>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const MAX_FRAME_LENGTH: usize, const MAX_LOG_COUNT: usize>
    TrackingAllocator<MAX_FRAME_LENGTH, MAX_LOG_COUNT>
{
    pub const fn new() -> Self {
        TrackingAllocator {
            is_tracking: AtomicBool::new(false),
            alloc: std::alloc::System,
            logs: [const { LogSlot::new(Event::new()) }; MAX_LOG_COUNT],
            logs_pointer: AtomicUsize::new(0),
            dropped_events: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            symbols: Mutex::new(None),
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.is_tracking.load(Ordering::SeqCst)
    }

    fn reserve(&self) -> Option<&LogSlot<Event<MAX_FRAME_LENGTH>>> {
        let index = self.logs_pointer.fetch_add(1, Ordering::SeqCst);
        if index >= MAX_LOG_COUNT {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(&self.logs[index])
    }

    fn log_allocation(&self, ptr: *mut u8, layout: &Layout) {
        let Some(slot) = self.reserve() else {
            return;
        };

        // Safety: the index was reserved above, and `start` waits for in-flight writers
        // before handing indices out again.
        unsafe {
            slot.commit(EventKind::Allocation, |event| {
                event.address = ptr as usize;
                event.size = layout.size();

                let mut depth: usize = 0;
                backtrace::trace(|frame| {
                    if depth >= MAX_FRAME_LENGTH {
                        return false;
                    }
                    event.ips[depth] = frame.ip() as usize;
                    depth += 1;
                    true
                });
                event.depth = depth;
            })
        };
    }

    fn log_deallocation(&self, ptr: *mut u8) {
        let Some(slot) = self.reserve() else {
            return;
        };

        // Safety: see `log_allocation`.
        unsafe {
            slot.commit(EventKind::Deallocation, |event| {
                event.address = ptr as usize;
                event.size = 0;
                event.depth = 0;
            })
        };
    }

    /// Run `log` if tracking is enabled, announcing the write so that `start` cannot
    /// reset the log underneath it.
    fn while_tracking(&self, log: impl FnOnce()) {
        // Don't track allocations if not enabled
        if !self.is_tracking.load(Ordering::SeqCst) {
            return;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.is_tracking.load(Ordering::SeqCst) {
            outside_tracer(log);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn live_allocations(&self) -> Vec<&Event<MAX_FRAME_LENGTH>> {
        let used = self.logs_pointer.load(Ordering::SeqCst).min(MAX_LOG_COUNT);

        let mut live: HashMap<usize, usize> = HashMap::new();
        for (index, slot) in self.logs[..used].iter().enumerate() {
            match slot.read() {
                Some((EventKind::Allocation, event)) => {
                    live.insert(event.address, index);
                }
                Some((EventKind::Deallocation, event)) => {
                    live.remove(&event.address);
                }
                None => {}
            }
        }

        let mut indices: Vec<usize> = live.into_values().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .filter_map(|index| self.logs[index].read())
            .map(|(_, event)| event)
            .collect()
    }
}

impl<const MAX_FRAME_LENGTH: usize, const MAX_LOG_COUNT: usize> Tracer
    for TrackingAllocator<MAX_FRAME_LENGTH, MAX_LOG_COUNT>
{
    fn start(&self) -> Result<()> {
        if self.is_tracking.load(Ordering::SeqCst) {
            return Err(Error::TracerAlreadyStarted);
        }

        // A writer of the previous run may still hold a reserved slot.
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }

        let used = self.logs_pointer.swap(0, Ordering::SeqCst).min(MAX_LOG_COUNT);
        for slot in &self.logs[..used] {
            slot.clear();
        }
        self.dropped_events.store(0, Ordering::SeqCst);

        self.is_tracking.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.is_tracking.store(false, Ordering::SeqCst);
    }

    /// Tracking is paused while the snapshot is built, so resolving the call stacks
    /// does not show up in the log.
    fn snapshot(&self) -> Snapshot {
        let was_tracking = self.is_tracking.swap(false, Ordering::SeqCst);

        let mut symbols = self
            .symbols
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let cache = symbols.get_or_insert_with(HashMap::new);

        let traces = self
            .live_allocations()
            .into_iter()
            .map(|event| Trace {
                size: event.size as u64,
                traceback: resolve_traceback(&event.ips[..event.depth], cache),
            })
            .collect();
        drop(symbols);

        let dropped_events = self.dropped_events.load(Ordering::SeqCst);
        if dropped_events > 0 {
            warn!(
                dropped_events,
                capacity = MAX_LOG_COUNT,
                "allocation log is full, the snapshot misses events"
            );
        }

        self.is_tracking.store(was_tracking, Ordering::SeqCst);
        Snapshot {
            traces,
            dropped_events,
        }
    }
}

unsafe impl<const MAX_FRAME_LENGTH: usize, const MAX_LOG_COUNT: usize> GlobalAlloc
    for TrackingAllocator<MAX_FRAME_LENGTH, MAX_LOG_COUNT>
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc.alloc(layout) };

        if !ptr.is_null() {
            self.while_tracking(|| self.log_allocation(ptr, &layout));
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Logged first: once freed, the address can be handed out to another thread.
        self.while_tracking(|| self.log_deallocation(ptr));
        unsafe { self.alloc.dealloc(ptr, layout) }
    }
}

/// Run `f` unless this thread is already inside the tracer, so that allocations made
/// by the stack walker are not logged.
fn outside_tracer(f: impl FnOnce()) {
    let entered = LOGGING.try_with(|busy| !busy.replace(true)).unwrap_or(false);
    if !entered {
        return;
    }
    f();
    let _ = LOGGING.try_with(|busy| busy.set(false));
}

fn resolve_traceback(ips: &[usize], cache: &mut HashMap<usize, Vec<Frame>>) -> Traceback {
    let mut frames: Vec<Frame> = Vec::with_capacity(ips.len());
    for &ip in ips {
        let resolved = cache.entry(ip).or_insert_with(|| resolve_ip(ip));
        frames.extend(resolved.iter().cloned());
    }

    let first_caller = frames
        .iter()
        .position(|frame| !is_plumbing(frame))
        .unwrap_or(frames.len());
    frames.drain(..first_caller);

    Traceback {
        frames,
        total_nframe: ips.len(),
    }
}

/// Resolve a return address, inlined frames first.
fn resolve_ip(ip: usize) -> Vec<Frame> {
    let mut frames = Vec::new();
    backtrace::resolve(ip as *mut c_void, |symbol| {
        frames.push(Frame {
            filename: symbol
                .filename()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| UNKNOWN_FILE.to_string()),
            lineno: symbol.lineno().unwrap_or(0),
            function: symbol
                .name()
                .and_then(|name| name.as_str())
                .map(demangle_name),
        });
    });

    if frames.is_empty() {
        frames.push(Frame::unknown());
    }
    frames
}

fn is_plumbing(frame: &Frame) -> bool {
    let path = frame.filename.replace('\\', "/");
    if frame.filename == UNKNOWN_FILE || TRACER_SOURCE_FILES.contains(&path.as_str()) {
        return true;
    }

    if PLUMBING_PATHS.iter().any(|marker| path.contains(marker)) {
        return true;
    }

    frame.function.as_deref().is_some_and(|name| {
        PLUMBING_SYMBOLS
            .iter()
            .any(|marker| name.starts_with(marker) || name.contains(&format!("::{marker}")))
    })
}

fn demangle_name(name: &str) -> String {
    let demangled = try_demangle(name)
        .map(|demangled| demangled.to_string())
        .unwrap_or_else(|_| name.to_string());

    strip_rust_hash_suffix(&demangled).to_string()
}

fn strip_rust_hash_suffix(name: &str) -> &str {
    const HASH_PREFIX: &str = "::h";

    match name.rfind(HASH_PREFIX) {
        Some(index) => {
            let hash = &name[index + HASH_PREFIX.len()..];
            let is_hex = !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit());
            if is_hex { &name[..index] } else { name }
        }
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn strips_hash_suffix() {
        assert_eq!(
            strip_rust_hash_suffix("my_crate::run::h3777baf656cd0c35"),
            "my_crate::run"
        );
        assert_eq!(strip_rust_hash_suffix("my_crate::hello"), "my_crate::hello");
        assert_eq!(strip_rust_hash_suffix("plain"), "plain");
    }

    #[test]
    fn demangles_legacy_symbols() {
        assert_eq!(
            demangle_name("_ZN8my_crate3run17h3777baf656cd0c35E"),
            "my_crate::run"
        );
        assert_eq!(demangle_name("not_mangled"), "not_mangled");
    }

    #[test]
    fn plumbing_frames_are_recognized() {
        assert!(is_plumbing(&Frame::unknown()));
        for &file in TRACER_SOURCE_FILES {
            assert!(is_plumbing(&Frame::new(file, 170)));
        }
        assert!(is_plumbing(
            &Frame::new("/elsewhere/slot.rs", 38)
                .with_function("memhogs::slot::LogSlot<T>::commit")
        ));
        assert!(is_plumbing(&Frame::new(
            "/rustc/90b35a6239c3d8bdabc530a6a0816f7ff89a0aaf/library/alloc/src/raw_vec.rs",
            12
        )));
        assert!(is_plumbing(&Frame::new(
            "/home/dev/.cargo/registry/src/index.crates.io-6f17d22bba15001f/backtrace-0.3.74/src/backtrace/mod.rs",
            66
        )));
        assert!(is_plumbing(
            &Frame::new("/p/tests/profile.rs", 9).with_function("__rustc::__rg_alloc")
        ));
        assert!(!is_plumbing(
            &Frame::new("/p/tests/profile.rs", 20).with_function("profile::workload")
        ));
    }

    #[test]
    fn snapshot_keeps_only_live_allocations() {
        let tracer = TrackingAllocator::<16, 64>::new();
        let layout = Layout::from_size_align(48, 8).unwrap();

        tracer.start().unwrap();
        let kept = unsafe { tracer.alloc(layout) };
        let freed = unsafe { tracer.alloc(layout) };
        unsafe { tracer.dealloc(freed, layout) };
        let snapshot = tracer.snapshot();
        tracer.stop();
        unsafe { tracer.dealloc(kept, layout) };

        assert_eq!(snapshot.traces.len(), 1);
        assert_eq!(snapshot.total_size(), 48);
        assert_eq!(snapshot.dropped_events, 0);
    }

    #[test]
    fn full_log_counts_dropped_events() {
        let tracer = TrackingAllocator::<4, 2>::new();
        let layout = Layout::from_size_align(16, 8).unwrap();

        tracer.start().unwrap();
        let blocks: Vec<*mut u8> = (0..3).map(|_| unsafe { tracer.alloc(layout) }).collect();
        let snapshot = tracer.snapshot();
        tracer.stop();
        for block in blocks {
            unsafe { tracer.dealloc(block, layout) };
        }

        assert_eq!(snapshot.traces.len(), 2);
        assert_eq!(snapshot.dropped_events, 1);
    }

    #[test]
    fn start_waits_for_writers_of_the_previous_run() {
        let tracer = Arc::new(TrackingAllocator::<4, 8>::new());
        tracer.in_flight.fetch_add(1, Ordering::SeqCst);

        let starter = {
            let tracer = Arc::clone(&tracer);
            std::thread::spawn(move || tracer.start())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!tracer.is_tracking());

        tracer.in_flight.fetch_sub(1, Ordering::SeqCst);
        starter.join().unwrap().unwrap();
        assert!(tracer.is_tracking());
        tracer.stop();
    }

    #[test]
    fn leading_plumbing_is_stripped_from_tracebacks() {
        let mut cache = HashMap::from([
            (
                1,
                vec![
                    Frame::new(TRACER_SOURCE_FILES[1], 38)
                        .with_function("memhogs::slot::LogSlot<T>::commit"),
                    Frame::new(TRACER_SOURCE_FILES[0], 150),
                ],
            ),
            (
                2,
                vec![Frame::new("/rustc/abc/library/alloc/src/alloc.rs", 98)],
            ),
            (3, vec![Frame::new("/p/src/main.rs", 4)]),
            (4, vec![Frame::new("/rustc/abc/library/std/src/rt.rs", 20)]),
        ]);

        let traceback = resolve_traceback(&[1, 2, 3, 4], &mut cache);
        assert_eq!(traceback.total_nframe, 4);
        assert_eq!(traceback.frames.len(), 2);
        assert_eq!(traceback.top_frame(), Frame::new("/p/src/main.rs", 4));

        let traceback = resolve_traceback(&[1, 2], &mut cache);
        assert!(traceback.frames.is_empty());
        assert_eq!(traceback.top_frame(), Frame::unknown());
    }
}
