use std::{
    collections::HashMap,
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use fxprof_processed_profile::{
    CategoryColor, CategoryHandle, CategoryPairHandle, Frame as FxFrame,
    FrameFlags as FxFrameFlags, FrameInfo as FxFrameInfo, LibraryHandle, LibraryInfo,
    ProcessHandle, Profile, ReferenceTimestamp, SamplingInterval, StackHandle, Symbol,
    SymbolTable, ThreadHandle, Timestamp, debugid::DebugId,
};

use crate::{Frame, ProfileReport, Result, Snapshot, snapshot::UNKNOWN_FILE};

/// Wrapper around `fxprof_processed_profile::Profile` built from a [`ProfileReport`].
///
/// Every snapshot becomes a thread named after the snapshot, holding one allocation
/// sample per live allocation that passed the report's filter. Load the JSON into
/// <https://profiler.firefox.com> to browse the call trees of each snapshot.
#[derive(Debug)]
pub struct FirefoxProfile {
    inner: Profile,
}

impl FirefoxProfile {
    pub fn from_report(report: &ProfileReport) -> Self {
        let mut builder = FirefoxProfileBuilder::new(report.target_label());
        for view in report.snapshot_views() {
            builder.add_snapshot(&view.title(), &view.filtered_snapshot());
        }
        Self {
            inner: builder.finish(),
        }
    }

    /// Serialize the profile into a JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.inner)?)
    }

    /// Access the underlying `fxprof_processed_profile::Profile`.
    pub fn as_profile(&self) -> &Profile {
        &self.inner
    }

    /// Consume the wrapper and return the `Profile`.
    pub fn into_profile(self) -> Profile {
        self.inner
    }
}

/// Gap between two snapshots on the profile's time axis.
const SNAPSHOT_SPACING_NS: u64 = 1_000_000_000;
/// Gap between two samples of the same snapshot.
const SAMPLE_SPACING_NS: u64 = 1_000;

struct FirefoxProfileBuilder {
    profile: Profile,
    process: ProcessHandle,
    threads: Vec<ThreadHandle>,
    categories: CategoryHandles,
    cwd: PathBuf,
    symbol_registry: SymbolRegistry,
    last_timestamp: Timestamp,
}

impl FirefoxProfileBuilder {
    fn new(label: &str) -> Self {
        let mut profile = Profile::new(
            &format!("memhogs profile of {label}"),
            ReferenceTimestamp::from(SystemTime::now()),
            SamplingInterval::from_millis(1),
        );
        profile.set_symbolicated(true);

        let process = profile.add_process(label, 1, Timestamp::from_millis_since_reference(0.0));
        let categories = CategoryHandles::new(&mut profile);
        let cwd = std::env::current_dir().unwrap_or_default();

        Self {
            profile,
            process,
            threads: Vec::new(),
            categories,
            cwd,
            symbol_registry: SymbolRegistry::new(),
            last_timestamp: Timestamp::from_nanos_since_reference(0),
        }
    }

    fn add_snapshot(&mut self, name: &str, snapshot: &Snapshot) {
        let index = self.threads.len() as u64;
        let start_ns = index * SNAPSHOT_SPACING_NS;
        let thread = self.profile.add_thread(
            self.process,
            (index + 1) as u32,
            Timestamp::from_nanos_since_reference(start_ns),
            false,
        );
        self.profile.set_thread_name(thread, name);
        self.profile.add_initial_visible_thread(thread);
        if index == 0 {
            self.profile.add_initial_selected_thread(thread);
        }

        for (i, trace) in snapshot.traces.iter().enumerate() {
            let timestamp =
                Timestamp::from_nanos_since_reference(start_ns + (i as u64) * SAMPLE_SPACING_NS);
            let stack = self.build_stack(thread, &trace.traceback.frames);
            self.profile.add_allocation_sample(
                thread,
                timestamp,
                stack,
                i as u64,
                u64_to_i64(trace.size),
            );
            self.last_timestamp = timestamp;
        }

        self.profile.set_thread_end_time(thread, self.last_timestamp);
        self.threads.push(thread);
    }

    fn finish(mut self) -> Profile {
        self.profile
            .set_process_end_time(self.process, self.last_timestamp);
        self.symbol_registry.finalize(&mut self.profile);
        self.profile
    }

    /// Frames are most recent first; the profile wants the root first.
    fn build_stack(&mut self, thread: ThreadHandle, frames: &[Frame]) -> Option<StackHandle> {
        let frames: Vec<FxFrameInfo> = frames
            .iter()
            .rev()
            .map(|frame| self.convert_frame(frame))
            .collect();

        if frames.is_empty() {
            None
        } else {
            self.profile.intern_stack_frames(thread, frames.into_iter())
        }
    }

    fn convert_frame(&mut self, frame: &Frame) -> FxFrameInfo {
        let category = determine_category(&self.cwd, &frame.filename);
        let name = frame
            .function
            .clone()
            .unwrap_or_else(|| format!("{}:{}", frame.filename, frame.lineno));

        let fx_frame = self.symbol_registry.resolve_frame(
            &mut self.profile,
            Path::new(&frame.filename),
            &name,
            frame.lineno,
        );

        FxFrameInfo {
            frame: fx_frame,
            category_pair: self.categories.get(category),
            flags: FxFrameFlags::empty(),
        }
    }
}

struct SymbolRegistry {
    libraries: HashMap<PathBuf, LibraryEntry>,
}

impl SymbolRegistry {
    fn new() -> Self {
        Self {
            libraries: HashMap::new(),
        }
    }

    fn resolve_frame(
        &mut self,
        profile: &mut Profile,
        path: &Path,
        function: &str,
        lineno: u32,
    ) -> FxFrame {
        let entry = self.ensure_library(profile, path);
        let key = SymbolKey {
            name: function.to_string(),
            lineno,
        };

        let address = match entry.symbol_map.get(&key) {
            Some(address) => *address,
            None => {
                let address = next_symbol_address(&mut entry.next_address);
                entry.symbol_map.insert(key, address);
                entry.symbols.push(Symbol {
                    address,
                    size: None,
                    name: function.to_string(),
                });
                SymbolRegistry::refresh_symbol_table(profile, entry);
                address
            }
        };

        FxFrame::RelativeAddressFromInstructionPointer(entry.handle, address)
    }

    fn ensure_library(&mut self, profile: &mut Profile, path: &Path) -> &mut LibraryEntry {
        self.libraries.entry(path.to_path_buf()).or_insert_with(|| {
            let display_path = path.to_string_lossy().to_string();
            let info = LibraryInfo {
                name: display_path.clone(),
                debug_name: display_path.clone(),
                path: display_path.clone(),
                debug_path: display_path,
                debug_id: DebugId::nil(),
                code_id: None,
                arch: None,
                symbol_table: None,
            };
            let handle = profile.add_lib(info);
            LibraryEntry {
                handle,
                symbols: Vec::new(),
                symbol_map: HashMap::new(),
                next_address: 1,
            }
        })
    }

    fn finalize(&mut self, profile: &mut Profile) {
        for entry in self.libraries.values_mut() {
            SymbolRegistry::refresh_symbol_table(profile, entry);
        }
    }

    fn refresh_symbol_table(profile: &mut Profile, entry: &mut LibraryEntry) {
        if entry.symbols.is_empty() {
            return;
        }
        let table = Arc::new(SymbolTable::new(entry.symbols.clone()));
        profile.set_lib_symbol_table(entry.handle, table);
    }
}

struct LibraryEntry {
    handle: LibraryHandle,
    symbols: Vec<Symbol>,
    symbol_map: HashMap<SymbolKey, u32>,
    next_address: u32,
}

#[derive(Hash, Eq, PartialEq)]
struct SymbolKey {
    name: String,
    lineno: u32,
}

/// Every distinct symbol of a library gets its own address.
fn next_symbol_address(next: &mut u32) -> u32 {
    let address = *next;
    *next = (*next).saturating_add(1);
    address
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CategoryKind {
    Application,
    RustStdLib,
    RustC,
    Dependencies,
    Unknown,
}

struct CategoryHandles {
    application: CategoryPairHandle,
    rust_std_lib: CategoryPairHandle,
    rustc: CategoryPairHandle,
    dependencies: CategoryPairHandle,
    unknown: CategoryPairHandle,
}

impl CategoryHandles {
    fn new(profile: &mut Profile) -> Self {
        let application = profile
            .add_category("Application", CategoryColor::Green)
            .into();
        let rust_std_lib = profile
            .add_category("Rust stdlib", CategoryColor::Blue)
            .into();
        let rustc = profile
            .add_category("Rust compiler", CategoryColor::Orange)
            .into();
        let dependencies = profile
            .add_category("Dependencies", CategoryColor::Purple)
            .into();
        let unknown = CategoryHandle::OTHER.into();

        Self {
            application,
            rust_std_lib,
            rustc,
            dependencies,
            unknown,
        }
    }

    fn get(&self, kind: CategoryKind) -> CategoryPairHandle {
        match kind {
            CategoryKind::Application => self.application,
            CategoryKind::RustStdLib => self.rust_std_lib,
            CategoryKind::RustC => self.rustc,
            CategoryKind::Dependencies => self.dependencies,
            CategoryKind::Unknown => self.unknown,
        }
    }
}

fn determine_category(cwd: &Path, filename: &str) -> CategoryKind {
    let normalized = filename.replace('\\', "/");

    if filename == UNKNOWN_FILE {
        CategoryKind::Unknown
    } else if normalized.contains("/rustc/") {
        CategoryKind::RustC
    } else if normalized.contains("/rustlib/") {
        CategoryKind::RustStdLib
    } else if normalized.contains("cargo/registry/src") {
        CategoryKind::Dependencies
    } else if Path::new(filename).is_relative() || Path::new(filename).starts_with(cwd) {
        CategoryKind::Application
    } else {
        CategoryKind::Unknown
    }
}
