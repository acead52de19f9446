//! An in-process memory leak detector. Every tracked allocation is recorded with the call
//! stack that made it; whatever is still allocated when the detector detaches is reported,
//! with duplicates of the same leak site collapsed on request.
//!
//! ## Setup & Usage
//!
//! Install [`LeakTrackingAllocator`] as the global allocator and keep a [`GlobalGuard`]
//! alive for the part of the program to check, usually all of `main`:
//!
//! ```rust,no_run
//! #[global_allocator]
//! static GLOBAL: leakpath::LeakTrackingAllocator = leakpath::LeakTrackingAllocator;
//!
//! #[leakpath::main(format = "table")]
//! fn main() {
//!     std::mem::forget(String::from("leaked"));
//! }
//! ```
//!
//! Hosts with their own allocation hooks build a standalone [`LeakDetector`] with
//! [`DetectorBuilder::build`] and drive it through [`LeakDetector::enter_capture`] and
//! [`LeakDetector::on_free`].
//!
//! Configuration is read from `LEAKPATH_*` environment variables by
//! [`DetectorBuilder::from_env`]; `LEAKPATH=off` turns detection off.

pub use leakpath_macros::{leak_check, main};

mod allocator;
mod callstack;
mod capture;
mod classify;
mod crt;
mod detector;
mod error;
mod guard;
mod handle;
mod modules;
mod options;
mod output;
mod registry;
mod report;
mod thread_context;
pub(crate) mod tid;

pub use allocator::LeakTrackingAllocator;
#[cfg(feature = "backtrace")]
pub use callstack::{BacktraceResolver, BacktraceWalker};
pub use callstack::{
    CallStack, Frame, NullResolver, NullWalker, ResolvedFrame, StackWalker, SymbolResolver,
};
pub use capture::CaptureGuard;
pub use crt::{CrtHeader, CrtLayout, MemoryInspector, NoInspection, RawMemory};
pub use detector::{HookId, LeakDetector, ReportHook, Status, SuppressGuard, VERSION};
pub use error::Error;
pub use guard::{check_thread_leaks, installed, DetectorBuilder, GlobalGuard};
pub use handle::{Address, HeapId, ThreadFilter, ThreadId};
pub use modules::{
    Interceptor, LoadedModule, ModuleEnumerator, ModuleInfo, ModuleList, ModuleListMode,
    NoopInterceptor,
};
pub use options::{Options, ReportEncoding, ReportOptions, ReportTo};
pub use output::{
    entry_lines, format_bytes, hex_dump, report_lines, shorten_function_name, Format, Reporter,
};
pub use registry::{AllocStats, Block};
pub use report::{leak_hash, LeakEntry, LeakReport};
