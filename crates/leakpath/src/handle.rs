use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque address of a tracked block.
///
/// The detector never dereferences an `Address`; it is only used as a map key and for
/// display. Raw memory reads go through [`MemoryInspector`](crate::MemoryInspector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub usize);

impl Address {
    pub const NULL: Address = Address(0);

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: usize) -> Self {
        Address(self.0.wrapping_add(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:0width$X}", self.0, width = 2 * std::mem::size_of::<usize>())
    }
}

/// Opaque identity of an allocation arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeapId(pub usize);

impl HeapId {
    /// The process default heap, used by [`LeakTrackingAllocator`](crate::LeakTrackingAllocator).
    pub const PROCESS: HeapId = HeapId(1);
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:0width$X}", self.0, width = 2 * std::mem::size_of::<usize>())
    }
}

/// OS thread identifier of the thread that performed an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u64);

impl ThreadId {
    pub fn current() -> Self {
        ThreadId(crate::tid::current_tid())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Selects which blocks a count, report or mark operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFilter {
    All,
    Only(ThreadId),
}

impl ThreadFilter {
    pub fn matches(self, thread: ThreadId) -> bool {
        match self {
            ThreadFilter::All => true,
            ThreadFilter::Only(id) => id == thread,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_is_padded_hex() {
        let width = 2 * std::mem::size_of::<usize>();
        let shown = Address(0xBEEF).to_string();
        assert!(shown.starts_with("0x"));
        assert_eq!(shown.len(), width + 2);
        assert!(shown.ends_with("BEEF"));
    }

    #[test]
    fn thread_filter_matching() {
        let t = ThreadId(7);
        assert!(ThreadFilter::All.matches(t));
        assert!(ThreadFilter::Only(t).matches(t));
        assert!(!ThreadFilter::Only(ThreadId(8)).matches(t));
    }
}
