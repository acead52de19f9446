//! Call stack capture and lazy symbol resolution.
//!
//! Stacks are captured eagerly as raw return addresses when a block is recorded and are
//! resolved to symbols only when a report asks for them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::modules::LoadedModule;

/// Functions that only run while the runtime initializes globals. A block whose resolved
/// stack passes through one of them is treated as a startup allocation.
const STARTUP_FUNCTIONS: &[&str] = &[
    "_initterm",
    "_initterm_e",
    "_CRT_INIT",
    "__scrt_common_main",
    "_GLOBAL__sub_I_",
    "__libc_csu_init",
    "_dl_init",
    "call_init",
];

/// Frames belonging to the detector or the allocator plumbing beneath the hooked call.
const INTERNAL_PREFIXES: &[&str] = &[
    "leakpath::",
    "<leakpath::",
    "backtrace::",
    "alloc::alloc::",
    "std::alloc::",
    "__rust_alloc",
    "__rust_realloc",
    "__rdl_alloc",
    "__rdl_realloc",
    "__rg_alloc",
    "__rg_realloc",
];

/// Register state captured when a hooked call enters the detector.
///
/// `frame_pointer` is the stack address at the hook entry; walking starts at the first
/// frame at or above it. `return_address` identifies the calling module; when it is 0 the
/// first walked frame is used instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    pub return_address: usize,
    pub frame_pointer: usize,
}

impl Frame {
    pub fn new(return_address: usize, frame_pointer: usize) -> Self {
        Self {
            return_address,
            frame_pointer,
        }
    }

    /// Captures the current stack position. Must be inlined into the hook so the stack
    /// address belongs to the hook's own frame. The return address is left for the walk to
    /// supply.
    #[inline(always)]
    pub fn here() -> Self {
        let marker = 0u8;
        Self {
            return_address: 0,
            frame_pointer: std::ptr::addr_of!(marker) as usize,
        }
    }
}

/// Produces raw return addresses for a captured frame.
pub trait StackWalker: Send + Sync {
    fn walk(&self, frame: &Frame, max_frames: u32) -> Vec<usize>;
}

/// Best-effort symbolication of a single return address.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, address: usize) -> Option<ResolvedFrame>;

    /// Loads symbols for a newly attached module. Returns `false` when none are available.
    fn load_module_symbols(&self, _module: &LoadedModule) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFrame {
    pub address: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl ResolvedFrame {
    pub fn unresolved(address: usize) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.function.is_some()
    }

    pub fn is_internal(&self) -> bool {
        self.function
            .as_deref()
            .is_some_and(|name| INTERNAL_PREFIXES.iter().any(|p| name.starts_with(p)))
    }

    fn is_startup(&self) -> bool {
        self.function
            .as_deref()
            .is_some_and(|name| STARTUP_FUNCTIONS.iter().any(|f| name.contains(f)))
    }
}

impl fmt::Display for ResolvedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{file} ({line}): ")?,
            _ => write!(f, "0x{:X} (File and line number not available): ", self.address)?,
        }
        if let Some(module) = &self.module {
            write!(f, "{module}!")?;
        }
        match &self.function {
            Some(function) => write!(f, "{function}"),
            None => write!(f, "(Function name unavailable)"),
        }
    }
}

#[derive(Debug)]
struct Resolution {
    frames: Vec<ResolvedFrame>,
    unresolved: usize,
    startup: bool,
}

/// An ordered sequence of return addresses, innermost first.
#[derive(Debug)]
pub struct CallStack {
    frames: Vec<usize>,
    hash: u32,
    resolution: OnceLock<Resolution>,
}

impl CallStack {
    pub fn new(frames: Vec<usize>) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        for frame in &frames {
            hasher.update(&frame.to_le_bytes());
        }
        Self {
            hash: hasher.finalize(),
            frames,
            resolution: OnceLock::new(),
        }
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// CRC32 over the frame addresses.
    pub fn hash_value(&self) -> u32 {
        self.hash
    }

    /// Resolves every frame once and caches the result. Returns the number of frames that
    /// could not be resolved to a function name.
    pub fn resolve(&self, resolver: &dyn SymbolResolver) -> usize {
        self.resolution
            .get_or_init(|| {
                let frames: Vec<ResolvedFrame> = self
                    .frames
                    .iter()
                    .map(|&address| {
                        resolver
                            .resolve(address)
                            .unwrap_or_else(|| ResolvedFrame::unresolved(address))
                    })
                    .collect();
                let unresolved = frames.iter().filter(|f| !f.is_resolved()).count();
                let startup = frames.iter().any(ResolvedFrame::is_startup);
                Resolution {
                    frames,
                    unresolved,
                    startup,
                }
            })
            .unresolved
    }

    pub fn resolved(&self) -> Option<&[ResolvedFrame]> {
        self.resolution.get().map(|r| r.frames.as_slice())
    }

    /// Whether the stack passes through runtime startup code. Always `false` until resolved.
    pub fn is_startup_alloc(&self) -> bool {
        self.resolution.get().is_some_and(|r| r.startup)
    }

    /// Resolved frames, or raw ones when resolution has not happened, optionally without
    /// detector and allocator internals.
    pub fn display_frames(&self, show_internal: bool) -> Vec<ResolvedFrame> {
        match self.resolved() {
            Some(frames) => frames
                .iter()
                .filter(|f| show_internal || !f.is_internal())
                .cloned()
                .collect(),
            None => self
                .frames
                .iter()
                .map(|&a| ResolvedFrame::unresolved(a))
                .collect(),
        }
    }
}

impl PartialEq for CallStack {
    fn eq(&self, other: &Self) -> bool {
        self.frames == other.frames
    }
}

impl Eq for CallStack {}

/// Walker that captures nothing. Used when the `backtrace` feature is disabled.
pub struct NullWalker;

impl StackWalker for NullWalker {
    fn walk(&self, _frame: &Frame, _max_frames: u32) -> Vec<usize> {
        Vec::new()
    }
}

/// Resolver that never resolves anything; reports show raw addresses.
pub struct NullResolver;

impl SymbolResolver for NullResolver {
    fn resolve(&self, _address: usize) -> Option<ResolvedFrame> {
        None
    }
}

#[cfg(feature = "backtrace")]
pub use walker::{BacktraceResolver, BacktraceWalker};

#[cfg(feature = "backtrace")]
mod walker {
    use super::{Frame, ResolvedFrame, StackWalker, SymbolResolver};
    use std::ffi::c_void;

    /// Walks the calling thread's stack with the `backtrace` crate.
    ///
    /// Frames below `Frame::frame_pointer` belong to the detector and are skipped.
    pub struct BacktraceWalker;

    impl StackWalker for BacktraceWalker {
        fn walk(&self, frame: &Frame, max_frames: u32) -> Vec<usize> {
            let limit = max_frames as usize;
            let mut frames = Vec::with_capacity(limit.min(64));
            backtrace::trace(|f| {
                let sp = f.sp() as usize;
                if frame.frame_pointer != 0 && sp != 0 && sp < frame.frame_pointer {
                    return true;
                }
                frames.push(f.ip() as usize);
                frames.len() < limit
            });
            frames
        }
    }

    pub struct BacktraceResolver;

    impl SymbolResolver for BacktraceResolver {
        fn resolve(&self, address: usize) -> Option<ResolvedFrame> {
            let mut resolved = None;
            backtrace::resolve(address as *mut c_void, |symbol| {
                if resolved.is_some() {
                    return;
                }
                resolved = Some(ResolvedFrame {
                    address,
                    module: None,
                    function: symbol.name().map(|n| n.to_string()),
                    file: symbol.filename().map(|p| p.display().to_string()),
                    line: symbol.lineno(),
                });
            });
            resolved.filter(ResolvedFrame::is_resolved)
        }
    }
}
