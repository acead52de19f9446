//! The detector instance: hook entry points, queries and the control surface.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::callstack::{CallStack, Frame, ResolvedFrame, StackWalker, SymbolResolver};
use crate::capture::CaptureGuard;
use crate::classify::Classifier;
use crate::crt::MemoryInspector;
use crate::error::Error;
use crate::handle::{Address, HeapId, ThreadFilter, ThreadId};
use crate::modules::{
    Interceptor, LoadedModule, ModuleEnumerator, ModuleInfo, ModuleList, ModuleListMode,
    ModuleTable,
};
use crate::options::{
    Options, ReportEncoding, ReportOptions, DEFAULT_MAX_TRACE_FRAMES, DEFAULT_REPORT_FILE,
};
use crate::output::{entry_lines, hex_dump, plural, summary_lines, ReportSink};
use crate::registry::{AllocStats, FreeOutcome, HeapMismatch, Registry};
use crate::report::{self, Collect, LeakEntry, LeakReport};
use crate::thread_context::{
    holds_registry, BusyGuard, InFlight, RegistryHeld, ThreadContext, ThreadTable, DEBUG_CRT,
    UCRT,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) const DEFAULT_SHUTDOWN_WAIT: Duration = Duration::from_secs(10);
const MAX_SHUTDOWN_WAITS: u32 = 9;
const SELF_TEST_DATA: &[u8] = b"Memory Leak Self-Test";

static NEXT_DETECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle bits of a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u32);

impl Status {
    pub const INSTALLED: Status = Status(0x1);
    /// Started disabled and never enabled since.
    pub const NEVER_ENABLED: Status = Status(0x2);
    pub const OFF: Status = Status(0x4);
    /// Initialization failed; every operation passes through.
    pub const FAILED: Status = Status(0x8);
    /// Unicode output forced the report into a file.
    pub const FORCE_REPORT_TO_FILE: Status = Status(0x10);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Callback run once per leak entry before it is written out. Returning `true` marks the
/// entry as handled and keeps it out of the text report.
pub type ReportHook = Arc<dyn Fn(&LeakEntry) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Collaborators a detector is built with.
pub(crate) struct Collaborators {
    pub walker: Box<dyn StackWalker>,
    pub resolver: Box<dyn SymbolResolver>,
    pub inspector: Box<dyn MemoryInspector>,
    pub interceptor: Box<dyn Interceptor>,
    pub enumerator: Option<Box<dyn ModuleEnumerator>>,
    pub shutdown_wait: Duration,
}

/// A block the detector itself still owns at detach.
#[derive(Debug, Clone)]
struct InternalLeak {
    serial: u64,
    address: Address,
    size: usize,
    file: &'static str,
    line: u32,
    data: Option<Vec<u8>>,
}

/// Restores a thread's enable bits when dropped.
///
/// Returned by [`LeakDetector::suppress`].
#[must_use = "detection is restored as soon as the guard is dropped"]
pub struct SuppressGuard {
    context: Option<Arc<ThreadContext>>,
    snapshot: u32,
}

impl SuppressGuard {
    fn new(context: Option<Arc<ThreadContext>>) -> Self {
        let snapshot = match &context {
            Some(context) => {
                let snapshot = context.state_snapshot();
                context.mute();
                snapshot
            }
            None => 0,
        };
        Self { context, snapshot }
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        if let Some(context) = &self.context {
            context.restore_snapshot(self.snapshot);
        }
    }
}

/// Registry lock that also marks the calling thread as its holder, so frees made while
/// it is held do not try to take it again.
struct RegistryGuard<'a> {
    registry: MutexGuard<'a, Registry>,
    _held: RegistryHeld,
}

impl Deref for RegistryGuard<'_> {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        &self.registry
    }
}

impl DerefMut for RegistryGuard<'_> {
    fn deref_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }
}

/// Held while the detector walks the registry on behalf of the calling thread.
struct Reporting {
    _suppress: SuppressGuard,
    _busy: BusyGuard,
}

/// A leak detector instance.
///
/// Hooks call [`enter_capture`](Self::enter_capture), [`on_free`](Self::on_free),
/// [`on_heap_create`](Self::on_heap_create) and [`on_heap_destroy`](Self::on_heap_destroy);
/// everything else queries or controls detection. Independent instances can coexist.
/// Use [`DetectorBuilder`](crate::DetectorBuilder) to create one.
pub struct LeakDetector {
    id: u64,
    status: AtomicU32,
    start_disabled: AtomicBool,
    detaching: AtomicBool,
    detached: AtomicBool,
    options: RwLock<Options>,
    registry: Mutex<Registry>,
    threads: ThreadTable,
    modules: RwLock<ModuleTable>,
    hooks: Mutex<Vec<(HookId, ReportHook)>>,
    next_hook: AtomicU64,
    sink: Mutex<ReportSink>,
    internal: Mutex<Vec<InternalLeak>>,
    walker: Box<dyn StackWalker>,
    resolver: Box<dyn SymbolResolver>,
    inspector: Box<dyn MemoryInspector>,
    interceptor: Box<dyn Interceptor>,
    enumerator: Option<Box<dyn ModuleEnumerator>>,
    shutdown_wait: Duration,
}

impl LeakDetector {
    pub(crate) fn attach(options: Options, parts: Collaborators) -> Self {
        let _busy = BusyGuard::enter();
        let mut options = options.normalized();
        let forced_to_file = force_unicode_to_file(&mut options.report);
        let id = NEXT_DETECTOR_ID.fetch_add(1, Ordering::Relaxed);

        let detector = Self {
            id,
            status: AtomicU32::new(0),
            start_disabled: AtomicBool::new(options.start_disabled),
            detaching: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            options: RwLock::new(options.clone()),
            registry: Mutex::new(Registry::new()),
            threads: ThreadTable::new(id),
            modules: RwLock::new(ModuleTable::new()),
            hooks: Mutex::new(Vec::new()),
            next_hook: AtomicU64::new(1),
            sink: Mutex::new(ReportSink::discard()),
            internal: Mutex::new(Vec::new()),
            walker: parts.walker,
            resolver: parts.resolver,
            inspector: parts.inspector,
            interceptor: parts.interceptor,
            enumerator: parts.enumerator,
            shutdown_wait: parts.shutdown_wait,
        };

        detector.open_sink(&options.report, options.slow_debugger_dump);
        if options.off {
            detector.set_status(Status::OFF);
            info!("leak detection is turned off");
            detector.write_line("leakpath is turned off.");
            return detector;
        }
        if forced_to_file {
            detector.set_status(Status::FORCE_REPORT_TO_FILE);
        }
        if options.self_test {
            detector.plant_self_test_leak();
        }

        match detector.threads.current() {
            Ok(Some(_)) => {}
            Ok(None) => {
                detector.fail(Error::ThreadSlotExhausted);
                return detector;
            }
            Err(err) => {
                detector.fail(err);
                return detector;
            }
        }

        if options.start_disabled {
            detector.set_status(Status::NEVER_ENABLED);
        }
        detector.set_status(Status::INSTALLED);
        detector.refresh_modules();

        info!(version = VERSION, "leak detection installed");
        detector.write_line(&format!("leakpath Version {VERSION} installed."));
        let report_file = detector.report_filename();
        detector.write_lines(config_lines(&options, report_file.as_deref()));
        detector
    }

    fn plant_self_test_leak(&self) {
        let data = SELF_TEST_DATA.to_vec();
        let leak = InternalLeak {
            serial: 1,
            address: Address::from_ptr(data.as_ptr()),
            size: data.len(),
            file: file!(),
            line: line!(),
            data: Some(data),
        };
        lock(&self.internal).push(leak);
    }

    pub fn status(&self) -> Status {
        Status(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: Status) {
        self.status.fetch_or(status.0, Ordering::AcqRel);
    }

    fn clear_status(&self, status: Status) {
        self.status.fetch_and(!status.0, Ordering::AcqRel);
    }

    fn is_off(&self) -> bool {
        self.status().contains(Status::OFF)
    }

    /// Whether hooks record anything.
    pub fn is_active(&self) -> bool {
        let status = self.status();
        status.contains(Status::INSTALLED)
            && !status.contains(Status::FAILED)
            && !status.contains(Status::OFF)
            && !self.detached.load(Ordering::Acquire)
    }

    fn fail(&self, err: Error) {
        self.set_status(Status::FAILED);
        error!(%err, "leak detection disabled");
        self.write_line(&format!("ERROR: leakpath: {err}. Leak detection is disabled."));
    }

    fn read_options(&self) -> RwLockReadGuard<'_, Options> {
        self.options.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_options(&self) -> RwLockWriteGuard<'_, Options> {
        self.options.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registry(&self) -> RegistryGuard<'_> {
        let held = RegistryHeld::enter();
        RegistryGuard {
            registry: lock(&self.registry),
            _held: held,
        }
    }

    fn read_modules(&self) -> RwLockReadGuard<'_, ModuleTable> {
        self.modules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_modules(&self) -> RwLockWriteGuard<'_, ModuleTable> {
        self.modules.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_line(&self, line: &str) {
        self.write_lines([line]);
    }

    fn write_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sink = lock(&self.sink);
        sink.write_lines(lines);
        sink.flush();
    }

    #[track_caller]
    fn current_context(&self) -> Option<Arc<ThreadContext>> {
        match self.threads.current() {
            Ok(context) => context,
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    fn classifier(&self, skip_startup: bool) -> Classifier<'_> {
        Classifier {
            inspector: self.inspector.as_ref(),
            resolver: self.resolver.as_ref(),
            skip_startup,
        }
    }

    fn reporting(&self) -> Reporting {
        let busy = BusyGuard::enter();
        let context = if self.is_off() {
            None
        } else {
            self.threads.current().ok().flatten()
        };
        Reporting {
            _suppress: SuppressGuard::new(context),
            _busy: busy,
        }
    }

    // Hook entry points

    /// Opens a capture for an intercepted allocation call.
    ///
    /// `frame` is the hook's own frame; the stack walk starts there. The guard is inert
    /// when the detector is inactive or detection is disabled on the calling thread.
    #[track_caller]
    pub fn enter_capture(&self, frame: Frame, debug_crt: bool, ucrt: bool) -> CaptureGuard<'_> {
        if !self.is_active() {
            return CaptureGuard::inert(self, frame);
        }
        let Some(context) = self.current_context() else {
            return CaptureGuard::inert(self, frame);
        };
        if !context.is_enabled(self.start_disabled.load(Ordering::Acquire)) {
            return CaptureGuard::inert(self, frame);
        }
        CaptureGuard::new(self, context, frame, debug_crt, ucrt)
    }

    pub(crate) fn traces_internal_frames(&self) -> bool {
        self.read_options().trace_internal_frames
    }

    fn is_caller_excluded(&self, return_address: usize) -> bool {
        self.read_modules().is_caller_excluded(return_address)
    }

    /// Records the in-flight allocation of the outermost capture on `context`'s thread.
    pub(crate) fn record_capture(
        &self,
        context: &ThreadContext,
        frame: Frame,
        caller: Frame,
        heap: HeapId,
        in_flight: &InFlight,
    ) {
        let _busy = BusyGuard::enter();
        let (max_frames, validate) = {
            let options = self.read_options();
            (options.max_trace_frames, options.validate_heap_frees)
        };
        let moved = !in_flight.new_block.is_null() && in_flight.new_block != in_flight.block;

        let frames = self.walker.walk(&frame, max_frames);
        // hooks that cannot read their return address leave it to the walked stack
        let return_address = match caller.return_address {
            0 => frames.first().copied().unwrap_or(0),
            address => address,
        };
        if self.is_caller_excluded(return_address) {
            if moved {
                self.lock_registry().record_free(heap, in_flight.block, false);
            }
            return;
        }

        let stack = Arc::new(CallStack::new(frames));
        let flags = context.flags();
        let debug_crt = flags & DEBUG_CRT != 0;
        let ucrt = flags & UCRT != 0;
        let thread_id = context.thread_id();

        let mismatch = {
            let mut registry = self.lock_registry();
            if in_flight.new_block.is_null() {
                let block = registry.record_allocation(
                    heap,
                    in_flight.block,
                    in_flight.size,
                    thread_id,
                    debug_crt,
                    ucrt,
                );
                block.call_stack = Some(stack);
                None
            } else {
                let (block, freed) = registry.record_reallocation(
                    heap,
                    in_flight.block,
                    in_flight.new_block,
                    in_flight.size,
                    thread_id,
                    debug_crt,
                    ucrt,
                    validate,
                );
                block.call_stack = Some(stack);
                match freed {
                    Some(FreeOutcome::HeapMismatch(mismatch)) => Some(mismatch),
                    _ => None,
                }
            }
        };
        if let Some(mismatch) = mismatch {
            self.report_heap_mismatch(mismatch, frame);
        }
    }

    /// Notifies the detector that `address` is being freed from `heap`. Call it before the
    /// real free so the address cannot be reused in between.
    pub fn on_free(&self, heap: HeapId, address: Address, frame: Frame) {
        if address.is_null() || !self.is_active() {
            return;
        }
        let _busy = BusyGuard::enter();
        let validate = self.read_options().validate_heap_frees;
        let outcome = self.lock_registry().record_free(heap, address, validate);
        if let FreeOutcome::HeapMismatch(mismatch) = outcome {
            self.report_heap_mismatch(mismatch, frame);
        }
    }

    /// Drops `address` from the registry without validation or reporting. Used for frees
    /// made while the thread is inside the detector; does nothing if this thread already
    /// holds the registry.
    pub(crate) fn forget(&self, heap: HeapId, address: Address) {
        if address.is_null() || !self.is_active() || holds_registry() {
            return;
        }
        self.lock_registry().record_free(heap, address, false);
    }

    pub fn on_heap_create(&self, heap: HeapId) {
        if !self.is_active() {
            return;
        }
        let _busy = BusyGuard::enter();
        self.lock_registry().create_heap(heap);
    }

    pub fn on_heap_destroy(&self, heap: HeapId) {
        if !self.is_active() {
            return;
        }
        let _busy = BusyGuard::enter();
        let released = self.lock_registry().destroy_heap(heap);
        debug!(%heap, released, "heap destroyed");
    }

    fn report_heap_mismatch(&self, mismatch: HeapMismatch, frame: Frame) {
        error!(
            address = %mismatch.address,
            freed_heap = %mismatch.freed_heap,
            owner_heap = %mismatch.owner_heap,
            serial = mismatch.serial,
            "memory allocated in one heap was freed in another"
        );
        let _reporting = self.reporting();
        let (max_frames, show_internal) = {
            let options = self.read_options();
            (options.max_trace_frames, options.trace_internal_frames)
        };
        let here = CallStack::new(self.walker.walk(&frame, max_frames));
        here.resolve(self.resolver.as_ref());
        mismatch.call_stack.resolve(self.resolver.as_ref());

        let block_line = format!(
            "---------- Block {} at {}: {} bytes ----------",
            mismatch.serial, mismatch.address, mismatch.size
        );
        let mut lines = vec![
            "CRITICAL ERROR!: leakpath reports that memory was allocated in one heap and freed in another.".to_string(),
            "This will result in a corrupted heap.".to_string(),
            "Allocation Call stack.".to_string(),
            block_line.clone(),
            format!("  TID: {}", mismatch.thread_id),
            "  Call Stack:".to_string(),
        ];
        lines.extend(
            mismatch
                .call_stack
                .display_frames(show_internal)
                .iter()
                .map(|frame| format!("    {frame}")),
        );
        lines.push("Deallocation Call stack.".to_string());
        lines.push(block_line);
        lines.push("  Call Stack:".to_string());
        lines.extend(
            here.display_frames(false)
                .iter()
                .map(|frame| format!("    {frame}")),
        );
        self.write_lines(lines);
        break_into_debugger();
    }

    // Counts and reports

    /// Number of leaks across all heaps. Each leaked block counts once.
    pub fn leaks_count(&self) -> usize {
        self.count_leaks(ThreadFilter::All)
    }

    pub fn thread_leaks_count(&self, thread: ThreadId) -> usize {
        self.count_leaks(ThreadFilter::Only(thread))
    }

    fn count_leaks(&self, filter: ThreadFilter) -> usize {
        if self.is_off() {
            return 0;
        }
        let _reporting = self.reporting();
        let classifier = self.classifier(self.read_options().skip_crt_startup_leaks);
        let mut registry = self.lock_registry();
        let heaps = registry.heap_ids();
        report::count(&mut registry, &heaps, filter, &classifier)
    }

    /// Writes a report of every leak to the report sink. Returns the number of leaks.
    pub fn report_leaks(&self) -> usize {
        self.report(None, ThreadFilter::All).leaks
    }

    pub fn report_thread_leaks(&self, thread: ThreadId) -> usize {
        self.report(None, ThreadFilter::Only(thread)).leaks
    }

    /// Reports the leaks of a single heap, followed by a per-heap summary line.
    pub fn report_heap_leaks(&self, heap: HeapId) -> usize {
        self.report(Some(heap), ThreadFilter::All).leaks
    }

    /// Builds a report, runs the report hooks on each entry and writes the entries no hook
    /// handled to the report sink.
    pub fn report(&self, heap: Option<HeapId>, filter: ThreadFilter) -> LeakReport {
        if self.is_off() {
            return LeakReport::default();
        }
        let _reporting = self.reporting();
        let report = self.collect_report(heap, filter);
        self.emit(&report);
        report
    }

    /// Builds a report without running hooks or writing anything.
    pub fn leak_report(&self, filter: ThreadFilter) -> LeakReport {
        if self.is_off() {
            return LeakReport::default();
        }
        let _reporting = self.reporting();
        self.collect_report(None, filter)
    }

    fn collect_report(&self, heap: Option<HeapId>, filter: ThreadFilter) -> LeakReport {
        let (request, skip_startup) = {
            let options = self.read_options();
            let request = Collect {
                filter,
                aggregate: options.aggregate_duplicates,
                max_data_dump: options.max_data_dump,
                show_internal: options.trace_internal_frames,
            };
            (request, options.skip_crt_startup_leaks)
        };
        let classifier = self.classifier(skip_startup);

        let mut registry = self.lock_registry();
        let heaps = match heap {
            Some(heap) if registry.heap(heap).is_some() => vec![heap],
            Some(_) => Vec::new(),
            None => registry.heap_ids(),
        };
        let entries = report::collect(&mut registry, &heaps, &request, &classifier);
        let stats = registry.stats();
        drop(registry);

        LeakReport {
            leaks: entries.iter().map(|e| e.count).sum(),
            entries,
            stats,
            heap,
            thread: match filter {
                ThreadFilter::All => None,
                ThreadFilter::Only(thread) => Some(thread),
            },
        }
    }

    fn emit(&self, report: &LeakReport) {
        let hooks: Vec<ReportHook> = lock(&self.hooks)
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        // every hook sees every entry, even once another hook handled it
        let unhandled: Vec<&LeakEntry> = report
            .entries
            .iter()
            .filter(|entry| !hooks.iter().fold(false, |handled, hook| hook(entry) | handled))
            .collect();

        let mut sink = lock(&self.sink);
        if !unhandled.is_empty() {
            sink.write_line("WARNING: leakpath detected memory leaks!");
        }
        for entry in unhandled {
            sink.write_lines(entry_lines(entry));
        }
        if let Some(heap) = report.heap {
            if report.leaks > 0 {
                sink.write_line(&format!(
                    "leakpath detected {} memory leak{} in heap {heap}",
                    report.leaks,
                    plural(report.leaks)
                ));
            }
        }
        sink.flush();
    }

    /// Flags every current leak as reported so later counts and reports skip it.
    pub fn mark_all_leaks_as_reported(&self) {
        self.mark_reported(ThreadFilter::All);
    }

    pub fn mark_thread_leaks_as_reported(&self, thread: ThreadId) {
        self.mark_reported(ThreadFilter::Only(thread));
    }

    fn mark_reported(&self, filter: ThreadFilter) {
        if self.is_off() {
            return;
        }
        let _busy = BusyGuard::enter();
        report::mark_reported(&mut self.lock_registry(), filter);
    }

    /// Resolves every unreported call stack now instead of at report time. Returns the
    /// number of frames that could not be resolved.
    pub fn resolve_callstacks(&self) -> usize {
        if self.is_off() {
            return 0;
        }
        let _reporting = self.reporting();
        let classifier = self.classifier(self.read_options().skip_crt_startup_leaks);
        report::resolve_stacks(&mut self.lock_registry(), &classifier)
    }

    /// Resolved call stack of the block at `address`, which may also be the user address
    /// of a debug runtime block.
    pub fn allocation_resolve_results(&self, address: Address) -> Option<Vec<ResolvedFrame>> {
        if self.is_off() {
            return None;
        }
        let _reporting = self.reporting();
        let classifier = self.classifier(false);
        let stack = report::find_stack(&mut self.lock_registry(), address, &classifier)?;
        stack.resolve(self.resolver.as_ref());
        Some(stack.display_frames(true))
    }

    pub fn stats(&self) -> AllocStats {
        let _busy = BusyGuard::enter();
        self.lock_registry().stats()
    }

    // Modules

    /// Enumerates loaded modules, attaching the interceptor to newly seen modules that are
    /// not excluded. Returns how many modules were attached.
    pub fn refresh_modules(&self) -> usize {
        if !self.is_active() {
            return 0;
        }
        let Some(enumerator) = &self.enumerator else {
            return 0;
        };
        let _busy = BusyGuard::enter();
        let loaded = enumerator.loaded_modules();
        let forced = self.read_options().modules.clone();
        let outcome = self
            .write_modules()
            .refresh(loaded, &forced, self.resolver.as_ref());

        for module in &outcome.detached {
            debug!(module = %module.name, "module unloaded");
        }
        let mut attached = 0;
        for module in &outcome.attached {
            match self.interceptor.attach(module) {
                Ok(()) => {
                    debug!(module = %module.name(), "attached");
                    attached += 1;
                }
                Err(err) => {
                    warn!(%err, "failed to attach to module");
                    self.write_modules().set_attached(module.base, false);
                    self.write_line(&format!("WARNING: leakpath: {err}"));
                }
            }
        }
        attached
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        let _busy = BusyGuard::enter();
        self.read_modules().iter().cloned().collect()
    }

    /// Includes the module whose base address is `base` in leak detection.
    pub fn enable_module(&self, base: usize) -> bool {
        self.set_module_excluded(base, false)
    }

    pub fn disable_module(&self, base: usize) -> bool {
        self.set_module_excluded(base, true)
    }

    fn set_module_excluded(&self, base: usize, excluded: bool) -> bool {
        if self.is_off() {
            return false;
        }
        let _busy = BusyGuard::enter();
        self.write_modules().set_excluded(base, excluded)
    }

    // Per-thread and global state

    pub fn enable_leak_detection(&self) {
        if self.is_off() {
            return;
        }
        if let Some(context) = self.current_context() {
            context.enable();
            self.clear_status(Status::NEVER_ENABLED);
        }
    }

    pub fn disable_leak_detection(&self) {
        if self.is_off() {
            return;
        }
        if let Some(context) = self.current_context() {
            context.disable();
        }
    }

    /// Restores the state saved by the last enable or disable on this thread.
    pub fn restore_leak_detection_state(&self) {
        if self.is_off() {
            return;
        }
        if let Some(context) = self.current_context() {
            context.restore();
        }
    }

    pub fn is_leak_detection_enabled(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.current_context()
            .is_some_and(|c| c.is_enabled(self.start_disabled.load(Ordering::Acquire)))
    }

    /// Disables detection on the calling thread until the guard is dropped.
    pub fn suppress(&self) -> SuppressGuard {
        if self.is_off() {
            return SuppressGuard::new(None);
        }
        SuppressGuard::new(self.current_context())
    }

    pub fn global_enable_leak_detection(&self) {
        if self.is_off() {
            return;
        }
        let _busy = BusyGuard::enter();
        self.start_disabled.store(false, Ordering::Release);
        self.write_options().start_disabled = false;
        self.threads.for_each(|context| context.force(true));
        self.clear_status(Status::NEVER_ENABLED);
    }

    pub fn global_disable_leak_detection(&self) {
        if self.is_off() {
            return;
        }
        let _busy = BusyGuard::enter();
        self.start_disabled.store(true, Ordering::Release);
        self.write_options().start_disabled = true;
        self.threads.for_each(|context| context.force(false));
    }

    // Options

    pub fn options(&self) -> Options {
        let _busy = BusyGuard::enter();
        self.read_options().clone()
    }

    /// Replaces the options. Changes apply to the next tracked operation.
    pub fn set_options(&self, options: Options) {
        if self.is_off() {
            return;
        }
        let _busy = BusyGuard::enter();
        let mut options = options.normalized();
        let report_changed = {
            let mut current = self.write_options();
            options.off = current.off;
            let changed = current.report != options.report;
            *current = options.clone();
            changed
        };
        if report_changed {
            self.set_report_options(options.report);
        }
        self.start_disabled
            .store(options.start_disabled, Ordering::Release);
        if options.start_disabled {
            self.global_disable_leak_detection();
        }
    }

    /// Sets the modules forced in or out of detection. Names are matched case-insensitively.
    pub fn set_modules_list(&self, modules: &str, include: bool) {
        if self.is_off() {
            return;
        }
        let _busy = BusyGuard::enter();
        let mode = if include {
            ModuleListMode::Include
        } else {
            ModuleListMode::Exclude
        };
        self.write_options().modules = ModuleList::parse(modules, mode);
    }

    /// The forced module list and whether it is an include list.
    pub fn modules_list(&self) -> (Vec<String>, bool) {
        let _busy = BusyGuard::enter();
        let options = self.read_options();
        (options.modules.modules.clone(), options.modules.is_include())
    }

    /// Redirects report output. Unicode output is always written to a file.
    pub fn set_report_options(&self, report: ReportOptions) {
        if self.is_off() {
            return;
        }
        let _busy = BusyGuard::enter();
        let mut report = report;
        if force_unicode_to_file(&mut report) {
            self.set_status(Status::FORCE_REPORT_TO_FILE);
        }
        let slow = {
            let mut options = self.write_options();
            options.report = report.clone();
            options.slow_debugger_dump
        };
        self.open_sink(&report, slow);
    }

    fn open_sink(&self, report: &ReportOptions, slow: bool) {
        let sink = match ReportSink::open(report, slow) {
            Ok(sink) => sink,
            Err(err) => {
                warn!(%err, "report file unavailable, reporting to the debugger");
                let mut sink = ReportSink::fallback(report, slow);
                sink.write_line(&format!(
                    "WARNING: leakpath: {err}. The report will be sent to the debugger instead."
                ));
                sink
            }
        };
        *lock(&self.sink) = sink;
    }

    /// Path of the report file currently written, if any.
    pub fn report_filename(&self) -> Option<PathBuf> {
        lock(&self.sink).file_path().map(Path::to_path_buf)
    }

    /// Installs a hook run on every leak entry before it is written out.
    pub fn set_report_hook<F>(&self, hook: F) -> Option<HookId>
    where
        F: Fn(&LeakEntry) -> bool + Send + Sync + 'static,
    {
        if self.is_off() {
            return None;
        }
        let _busy = BusyGuard::enter();
        let id = HookId(self.next_hook.fetch_add(1, Ordering::Relaxed));
        lock(&self.hooks).push((id, Arc::new(hook)));
        Some(id)
    }

    pub fn remove_report_hook(&self, id: HookId) -> bool {
        let _busy = BusyGuard::enter();
        let mut hooks = lock(&self.hooks);
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    // Shutdown

    /// Detaches the detector and writes the final report.
    ///
    /// Waits for other threads that used the detector to exit, then reports every
    /// remaining leak with the allocation totals, checks the detector's own resources and
    /// stops tracking. Later calls return an empty report.
    pub fn detach(&self) -> LeakReport {
        let status = self.status();
        if status.contains(Status::OFF) || !status.contains(Status::INSTALLED) {
            return LeakReport::default();
        }
        if self.detaching.swap(true, Ordering::AcqRel) {
            return LeakReport::default();
        }
        let _busy = BusyGuard::enter();

        let attached: Vec<LoadedModule> =
            self.read_modules().attached().map(loaded_module).collect();
        for module in &attached {
            self.interceptor.detach(module);
        }

        let threads_active =
            self.threads
                .wait_for_threads(self.shutdown_wait, MAX_SHUTDOWN_WAITS, |active| {
                    info!(active, "waiting for threads to terminate");
                    self.write_line("leakpath: Waiting for threads to terminate...");
                });

        let report = if self.status().contains(Status::NEVER_ENABLED) {
            warn!("leak detection was never enabled");
            self.write_line("WARNING: leakpath: Memory leak detection was never enabled.");
            LeakReport::default()
        } else {
            let report = self.report(None, ThreadFilter::All);
            self.write_lines(summary_lines(report.leaks, &report.stats));
            report
        };

        if threads_active {
            warn!("threads still running at detach");
            self.write_lines([
                "WARNING: leakpath: Some threads appear to have not terminated normally.",
                "  This could cause inaccurate leak detection results, including false positives.",
            ]);
        }
        self.write_line("leakpath is now exiting.");
        self.check_internal_leaks();
        lock(&self.sink).flush();
        self.detached.store(true, Ordering::Release);
        report
    }

    fn check_internal_leaks(&self) {
        let (self_test, max_data_dump) = {
            let options = self.read_options();
            (options.self_test, options.max_data_dump)
        };
        let planted = lock(&self.internal).first().cloned();
        let mut internal: Vec<InternalLeak> = planted.iter().cloned().collect();
        for context in self.threads.live_except(ThreadId::current()) {
            let at = context.created_at();
            internal.push(InternalLeak {
                serial: internal.len() as u64 + 1,
                address: Address::from_ptr(Arc::as_ptr(&context)),
                size: mem::size_of::<ThreadContext>(),
                file: at.file(),
                line: at.line(),
                data: None,
            });
        }

        let mut lines = Vec::new();
        for leak in &internal {
            error!(file = leak.file, line = leak.line, "leak internal to the detector");
            lines.push("ERROR: leakpath: Detected a memory leak internal to leakpath!!".to_string());
            lines.push(format!(
                "---------- Block {} at {}: {} bytes ----------",
                leak.serial, leak.address, leak.size
            ));
            lines.push("  Call Stack:".to_string());
            lines.push(format!(
                "    {} ({}): Full call stack not available.",
                leak.file, leak.line
            ));
            if let Some(data) = &leak.data {
                let len = max_data_dump.map_or(data.len(), |max| max.min(data.len()));
                if len > 0 {
                    lines.push("  Data:".to_string());
                    lines.extend(hex_dump(&data[..len]));
                }
            }
            lines.push(String::new());
        }

        if self_test {
            let passed = match (&planted, internal.as_slice()) {
                (Some(planted), [only]) => only.file == planted.file && only.line == planted.line,
                _ => false,
            };
            if passed {
                info!("self-test passed");
                lines.push("leakpath passed the memory leak self-test.".to_string());
            } else {
                error!("self-test failed");
                lines.push("ERROR: leakpath: Failed the memory leak self-test.".to_string());
            }
        }
        self.write_lines(lines);
    }
}

impl std::fmt::Debug for LeakDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakDetector")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unicode reports only go to a file. Returns whether a file had to be forced.
fn force_unicode_to_file(report: &mut ReportOptions) -> bool {
    if report.encoding != ReportEncoding::Unicode {
        return false;
    }
    if report.file.is_none() {
        report.file = Some(PathBuf::from(DEFAULT_REPORT_FILE));
    }
    true
}

fn loaded_module(info: &ModuleInfo) -> LoadedModule {
    LoadedModule {
        base: info.low,
        size: info.high - info.low + 1,
        path: info.path.clone(),
        imports_detector: false,
    }
}

/// One line per option that differs from its default.
fn config_lines(options: &Options, report_file: Option<&Path>) -> Vec<String> {
    let mut lines = Vec::new();
    if options.aggregate_duplicates {
        lines.push("    Aggregating duplicate leaks.".to_string());
    }
    if !options.modules.modules.is_empty() {
        lines.push(format!(
            "    Forcing {} of these modules in leak detection: {}",
            if options.modules.is_include() {
                "inclusion"
            } else {
                "exclusion"
            },
            options.modules.modules.join(", ")
        ));
    }
    match options.max_data_dump {
        Some(0) => lines.push("    Suppressing data dumps.".to_string()),
        Some(max) => lines.push(format!("    Limiting data dumps to {max} bytes.")),
        None => {}
    }
    if options.max_trace_frames != DEFAULT_MAX_TRACE_FRAMES {
        lines.push(format!(
            "    Limiting stack traces to {} frames.",
            options.max_trace_frames
        ));
    }
    if options.report.encoding == ReportEncoding::Unicode {
        lines.push("    Generating a Unicode (UTF-16) encoded report.".to_string());
    }
    if let Some(path) = report_file {
        if options.report.debugger {
            lines.push(format!(
                "    Outputting the report to the debugger and to {}",
                path.display()
            ));
        } else {
            lines.push(format!("    Outputting the report to {}", path.display()));
        }
    }
    if options.slow_debugger_dump {
        lines.push("    Outputting the report to the debugger at a slower rate.".to_string());
    }
    if options.self_test {
        lines.push("    Performing a memory leak self-test.".to_string());
    }
    if options.start_disabled {
        lines.push("    Starting with memory leak detection disabled.".to_string());
    }
    if options.trace_internal_frames {
        lines.push("    Including heap and leakpath internal frames in stack traces.".to_string());
    }
    lines
}

/// Stops in the debugger when one is attached.
fn break_into_debugger() {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            let traced = std::fs::read_to_string("/proc/self/status")
                .ok()
                .and_then(|status| {
                    status
                        .lines()
                        .find_map(|line| line.strip_prefix("TracerPid:"))
                        .map(|pid| pid.trim() != "0")
                })
                .unwrap_or(false);
            if traced {
                // SAFETY: raising SIGTRAP only hands control to the attached tracer.
                unsafe {
                    libc::raise(libc::SIGTRAP);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bits_combine() {
        let status = Status(Status::INSTALLED.bits() | Status::NEVER_ENABLED.bits());
        assert!(status.contains(Status::INSTALLED));
        assert!(status.contains(Status::NEVER_ENABLED));
        assert!(!status.contains(Status::FAILED));
    }

    #[test]
    fn unicode_output_forces_a_file() {
        let mut report = ReportOptions {
            encoding: ReportEncoding::Unicode,
            ..ReportOptions::default()
        };
        assert!(force_unicode_to_file(&mut report));
        assert_eq!(report.file, Some(PathBuf::from(DEFAULT_REPORT_FILE)));

        let mut ascii = ReportOptions::default();
        assert!(!force_unicode_to_file(&mut ascii));
        assert!(ascii.file.is_none());
    }

    #[test]
    fn default_options_print_no_configuration() {
        assert!(config_lines(&Options::default(), None).is_empty());
    }

    #[test]
    fn configuration_lists_changed_knobs() {
        let options = Options {
            aggregate_duplicates: true,
            max_data_dump: Some(0),
            max_trace_frames: 8,
            self_test: true,
            ..Options::default()
        };
        let lines = config_lines(&options, Some(Path::new("leaks.txt")));
        assert_eq!(
            lines,
            vec![
                "    Aggregating duplicate leaks.",
                "    Suppressing data dumps.",
                "    Limiting stack traces to 8 frames.",
                "    Outputting the report to the debugger and to leaks.txt",
                "    Performing a memory leak self-test.",
            ]
        );
    }
}
