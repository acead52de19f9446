//! Construction of detectors and the process-wide installed instance.

use arc_swap::{ArcSwapOption, Guard};
use colored::*;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::callstack::{StackWalker, SymbolResolver};
use crate::crt::{MemoryInspector, NoInspection, RawMemory};
use crate::detector::{Collaborators, LeakDetector, DEFAULT_SHUTDOWN_WAIT};
use crate::handle::{ThreadFilter, ThreadId};
use crate::modules::{Interceptor, ModuleEnumerator, ModuleList, ModuleListMode, NoopInterceptor};
use crate::options::{format_from_env, Options, ReportOptions};
use crate::output::{report_lines, Format, Reporter};

pub(crate) static INSTALLED: OnceLock<ArcSwapOption<LeakDetector>> = OnceLock::new();

/// The detector installed with [`DetectorBuilder::build_global`], if any.
pub fn installed() -> Option<Arc<LeakDetector>> {
    INSTALLED.get().and_then(|slot| slot.load_full())
}

/// Borrow of the installed detector without touching its reference count.
pub(crate) fn installed_ref() -> Option<Guard<Option<Arc<LeakDetector>>>> {
    INSTALLED.get().map(|slot| slot.load())
}

/// Runs `f` and panics if blocks it allocated on the calling thread are still live when
/// it returns. Leaks the thread had before are ignored. Backs the
/// [`leak_check`](crate::leak_check) attribute.
pub fn check_thread_leaks<R>(f: impl FnOnce() -> R) -> R {
    let Some(detector) = installed() else {
        return f();
    };
    let thread = ThreadId::current();
    detector.mark_thread_leaks_as_reported(thread);

    let result = f();

    let report = detector.leak_report(ThreadFilter::Only(thread));
    if !report.is_empty() {
        detector.mark_thread_leaks_as_reported(thread);
        panic!(
            "{} memory leak(s) on thread {thread}:\n{}",
            report.leaks,
            report_lines(&report).join("\n")
        );
    }
    result
}

enum ReporterConfig {
    Format(Format),
    Custom(Box<dyn Reporter>),
    None,
}

/// Builder for [`LeakDetector`] instances.
///
/// [`build`](Self::build) returns a standalone detector that a host drives through its own
/// hooks. [`build_global`](Self::build_global) installs the detector for
/// [`LeakTrackingAllocator`](crate::LeakTrackingAllocator) and returns a guard that writes
/// the final report when dropped.
///
/// # Examples
///
/// ```rust
/// use leakpath::{DetectorBuilder, Format};
///
/// let detector = DetectorBuilder::new()
///     .aggregate_duplicates(true)
///     .max_data_dump(32)
///     .format(Format::Table)
///     .build();
/// assert_eq!(detector.leaks_count(), 0);
/// ```
///
/// # Limitations
///
/// Only one global detector can be installed at a time. Calling `build_global` (either
/// directly or via the [`main`](crate::main) macro) while a guard is alive panics.
pub struct DetectorBuilder {
    options: Options,
    walker: Option<Box<dyn StackWalker>>,
    resolver: Option<Box<dyn SymbolResolver>>,
    inspector: Option<Box<dyn MemoryInspector>>,
    interceptor: Option<Box<dyn Interceptor>>,
    enumerator: Option<Box<dyn ModuleEnumerator>>,
    shutdown_wait: Duration,
    reporter: ReporterConfig,
}

impl Default for DetectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBuilder {
    /// Creates a builder with default options.
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    /// Creates a builder from the `LEAKPATH_*` environment variables.
    ///
    /// `LEAKPATH_FORMAT` selects the final report format of a global guard.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use leakpath::DetectorBuilder;
    ///
    /// // LEAKPATH=off turns detection off entirely
    /// let detector = DetectorBuilder::from_env().build();
    /// # drop(detector);
    /// ```
    pub fn from_env() -> Self {
        let mut builder = Self::with_options(Options::from_env());
        if let Some(format) = format_from_env() {
            builder.reporter = ReporterConfig::Format(format);
        }
        builder
    }

    pub fn with_options(options: Options) -> Self {
        Self {
            options,
            walker: None,
            resolver: None,
            inspector: None,
            interceptor: None,
            enumerator: None,
            shutdown_wait: DEFAULT_SHUTDOWN_WAIT,
            reporter: ReporterConfig::None,
        }
    }

    /// Turns detection off. The detector is inert and reports nothing.
    pub fn off(mut self, off: bool) -> Self {
        self.options.off = off;
        self
    }

    /// Collapses leaks with the same size and call stack into one report entry.
    ///
    /// Default: `false`
    pub fn aggregate_duplicates(mut self, aggregate: bool) -> Self {
        self.options.aggregate_duplicates = aggregate;
        self
    }

    /// Plants a known leak and checks at detach that it is the only internal leak found.
    pub fn self_test(mut self, self_test: bool) -> Self {
        self.options.self_test = self_test;
        self
    }

    pub fn slow_debugger_dump(mut self, slow: bool) -> Self {
        self.options.slow_debugger_dump = slow;
        self
    }

    /// Starts with detection disabled on every thread until it is enabled explicitly.
    pub fn start_disabled(mut self, start_disabled: bool) -> Self {
        self.options.start_disabled = start_disabled;
        self
    }

    /// Keeps allocator and detector frames in reported call stacks.
    pub fn trace_internal_frames(mut self, trace: bool) -> Self {
        self.options.trace_internal_frames = trace;
        self
    }

    /// Skips blocks whose call stack starts in runtime startup code.
    ///
    /// Default: `true`
    pub fn skip_crt_startup_leaks(mut self, skip: bool) -> Self {
        self.options.skip_crt_startup_leaks = skip;
        self
    }

    /// Reports frees of blocks through a heap other than the one that allocated them.
    pub fn validate_heap_frees(mut self, validate: bool) -> Self {
        self.options.validate_heap_frees = validate;
        self
    }

    /// Caps the hex dump of each leaked block. `0` suppresses data dumps.
    pub fn max_data_dump(mut self, bytes: usize) -> Self {
        self.options.max_data_dump = Some(bytes);
        self
    }

    /// Caps the number of frames captured per allocation.
    ///
    /// Default: `64`
    pub fn max_trace_frames(mut self, frames: u32) -> Self {
        self.options.max_trace_frames = frames;
        self
    }

    /// Forces the named modules in or out of detection.
    pub fn modules(mut self, modules: &str, include: bool) -> Self {
        let mode = if include {
            ModuleListMode::Include
        } else {
            ModuleListMode::Exclude
        };
        self.options.modules = ModuleList::parse(modules, mode);
        self
    }

    pub fn report_options(mut self, report: ReportOptions) -> Self {
        self.options.report = report;
        self
    }

    pub fn walker(mut self, walker: Box<dyn StackWalker>) -> Self {
        self.walker = Some(walker);
        self
    }

    pub fn resolver(mut self, resolver: Box<dyn SymbolResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets how block memory is read for runtime headers and data dumps.
    ///
    /// Standalone detectors default to not reading memory at all; the global detector
    /// reads live process memory.
    pub fn inspector(mut self, inspector: Box<dyn MemoryInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn interceptor(mut self, interceptor: Box<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn module_enumerator(mut self, enumerator: Box<dyn ModuleEnumerator>) -> Self {
        self.enumerator = Some(enumerator);
        self
    }

    /// How long detach waits per round for other threads to exit.
    ///
    /// Default: 10 seconds, for up to nine rounds.
    pub fn shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    /// Sets the format of the report a [`GlobalGuard`] produces on drop.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use leakpath::{DetectorBuilder, Format};
    ///
    /// let builder = DetectorBuilder::new().format(Format::Json);
    /// # drop(builder);
    /// ```
    pub fn format(mut self, format: Format) -> Self {
        self.reporter = ReporterConfig::Format(format);
        self
    }

    /// Sets a custom reporter for the report a [`GlobalGuard`] produces on drop.
    ///
    /// When a custom reporter is set, it overrides any format setting.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use leakpath::{DetectorBuilder, LeakReport, Reporter};
    ///
    /// struct CountOnly;
    /// impl Reporter for CountOnly {
    ///     fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
    ///         println!("{} leaks", report.leaks);
    ///         Ok(())
    ///     }
    /// }
    ///
    /// let builder = DetectorBuilder::new().reporter(Box::new(CountOnly));
    /// # drop(builder);
    /// ```
    pub fn reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = ReporterConfig::Custom(reporter);
        self
    }

    fn parts(
        walker: Option<Box<dyn StackWalker>>,
        resolver: Option<Box<dyn SymbolResolver>>,
        inspector: Box<dyn MemoryInspector>,
        interceptor: Option<Box<dyn Interceptor>>,
        enumerator: Option<Box<dyn ModuleEnumerator>>,
        shutdown_wait: Duration,
    ) -> Collaborators {
        Collaborators {
            walker: walker.unwrap_or_else(default_walker),
            resolver: resolver.unwrap_or_else(default_resolver),
            inspector,
            interceptor: interceptor.unwrap_or_else(|| Box::new(NoopInterceptor)),
            enumerator,
            shutdown_wait,
        }
    }

    /// Builds a standalone detector.
    pub fn build(self) -> LeakDetector {
        let inspector = self.inspector.unwrap_or_else(|| Box::new(NoInspection));
        let parts = Self::parts(
            self.walker,
            self.resolver,
            inspector,
            self.interceptor,
            self.enumerator,
            self.shutdown_wait,
        );
        LeakDetector::attach(self.options, parts)
    }

    /// Builds the detector and installs it for [`LeakTrackingAllocator`](crate::LeakTrackingAllocator).
    ///
    /// # Panics
    ///
    /// Panics if another global detector is already installed.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use leakpath::{DetectorBuilder, LeakTrackingAllocator};
    ///
    /// #[global_allocator]
    /// static GLOBAL: LeakTrackingAllocator = LeakTrackingAllocator;
    ///
    /// fn main() {
    ///     let _guard = DetectorBuilder::from_env().build_global();
    ///     std::mem::forget(vec![0u8; 64]);
    /// }
    /// ```
    pub fn build_global(self) -> GlobalGuard {
        let slot = INSTALLED.get_or_init(|| ArcSwapOption::from(None));
        if slot.load().is_some() {
            panic!("More than one leakpath global detector cannot be installed at the same time.");
        }

        let reporter = match self.reporter {
            ReporterConfig::Format(format) => Some(format.reporter()),
            ReporterConfig::Custom(reporter) => Some(reporter),
            ReporterConfig::None => None,
        };
        let inspector = self.inspector.unwrap_or_else(|| Box::new(RawMemory));
        let parts = Self::parts(
            self.walker,
            self.resolver,
            inspector,
            self.interceptor,
            self.enumerator,
            self.shutdown_wait,
        );
        let detector = Arc::new(LeakDetector::attach(self.options, parts));
        slot.store(Some(Arc::clone(&detector)));

        GlobalGuard { detector, reporter }
    }
}

fn default_walker() -> Box<dyn StackWalker> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "backtrace")] {
            Box::new(crate::callstack::BacktraceWalker)
        } else {
            Box::new(crate::callstack::NullWalker)
        }
    }
}

fn default_resolver() -> Box<dyn SymbolResolver> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "backtrace")] {
            Box::new(crate::callstack::BacktraceResolver)
        } else {
            Box::new(crate::callstack::NullResolver)
        }
    }
}

/// Keeps the global detector installed. Dropping it detaches the detector, writes the
/// final report and hands the report to the configured [`Reporter`].
pub struct GlobalGuard {
    detector: Arc<LeakDetector>,
    reporter: Option<Box<dyn Reporter>>,
}

impl GlobalGuard {
    pub fn detector(&self) -> &LeakDetector {
        &self.detector
    }
}

impl Drop for GlobalGuard {
    fn drop(&mut self) {
        let report = self.detector.detach();

        if let Some(slot) = INSTALLED.get() {
            slot.store(None);
        }

        if let Some(reporter) = &self.reporter {
            if let Err(e) = reporter.report(&report) {
                eprintln!("{} Failed to report leaks: {}", "[leakpath]".blue().bold(), e);
            }
        }
    }
}
