//! Decides whether a live block is a leak worth reporting.

use crate::callstack::SymbolResolver;
use crate::crt::{self, CrtHeader, CrtLayout, MemoryInspector};
use crate::handle::Address;
use crate::registry::Block;

/// Why a live block is left out of counts and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotALeak {
    /// Free or internal runtime block; the runtime releases it after the detector is gone.
    RuntimeInternal,
    /// Allocated by runtime startup code.
    Startup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A leak at the effective (user-visible) address and size.
    Leak {
        address: Address,
        size: usize,
        header: Option<CrtHeader>,
    },
    NotALeak(NotALeak),
    AlreadyReported,
}

impl Classification {
    pub fn is_leak(&self) -> bool {
        matches!(self, Classification::Leak { .. })
    }
}

/// Collaborators and switches a classification pass needs.
pub struct Classifier<'a> {
    pub inspector: &'a dyn MemoryInspector,
    pub resolver: &'a dyn SymbolResolver,
    pub skip_startup: bool,
}

/// Looks for a debug runtime header at the start of `block`, remembering the layout on
/// the block once found.
pub fn detect_header(
    block: &mut Block,
    address: Address,
    inspector: &dyn MemoryInspector,
) -> Option<CrtHeader> {
    let known = block.debug_crt.then(|| {
        if block.ucrt {
            CrtLayout::Ucrt
        } else {
            CrtLayout::Legacy
        }
    });
    let header = crt::read_header(inspector, address, block.size, known)?;
    block.debug_crt = true;
    block.ucrt = header.is_ucrt();
    Some(header)
}

/// Classifies the block stored at `address`.
///
/// A startup allocation is marked reported so later passes skip it cheaply.
pub fn classify(block: &mut Block, address: Address, classifier: &Classifier<'_>) -> Classification {
    if block.reported {
        return Classification::AlreadyReported;
    }

    let header = detect_header(block, address, classifier.inspector);
    if header.is_some_and(|h| h.is_runtime_owned()) {
        return Classification::NotALeak(NotALeak::RuntimeInternal);
    }

    if classifier.skip_startup {
        if let Some(stack) = &block.call_stack {
            stack.resolve(classifier.resolver);
            if stack.is_startup_alloc() {
                block.reported = true;
                return Classification::NotALeak(NotALeak::Startup);
            }
        }
    }

    match header {
        Some(header) => Classification::Leak {
            address: CrtHeader::user_address(address),
            size: header.size,
            header: Some(header),
        },
        None => Classification::Leak {
            address,
            size: block.size,
            header: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callstack::tests::TableResolver;
    use crate::callstack::{CallStack, NullResolver};
    use crate::crt::tests::{debug_block, FakeMemory};
    use crate::crt::{block_use, NoInspection, HEADER_LEN};
    use crate::handle::ThreadId;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn block(size: usize) -> Block {
        Block {
            serial: 1,
            size,
            thread_id: ThreadId(7),
            call_stack: Some(Arc::new(CallStack::new(vec![0x10, 0x20]))),
            reported: false,
            debug_crt: false,
            ucrt: false,
        }
    }

    fn classifier<'a>(
        inspector: &'a dyn MemoryInspector,
        resolver: &'a dyn SymbolResolver,
        skip_startup: bool,
    ) -> Classifier<'a> {
        Classifier {
            inspector,
            resolver,
            skip_startup,
        }
    }

    #[test]
    fn plain_block_is_a_leak() {
        let mut b = block(64);
        let result = classify(&mut b, Address(0x1000), &classifier(&NoInspection, &NullResolver, true));
        assert_eq!(
            result,
            Classification::Leak {
                address: Address(0x1000),
                size: 64,
                header: None
            }
        );
        assert!(!b.debug_crt);
    }

    #[test]
    fn reported_block_is_skipped() {
        let mut b = block(64);
        b.reported = true;
        let result = classify(&mut b, Address(0x1000), &classifier(&NoInspection, &NullResolver, true));
        assert_eq!(result, Classification::AlreadyReported);
    }

    #[test]
    fn debug_header_exposes_the_user_region() {
        let memory = FakeMemory::default();
        let raw = debug_block(CrtLayout::Ucrt, block_use::NORMAL, 40);
        let mut b = block(raw.len());
        memory.insert(0x2000, raw);

        let result = classify(&mut b, Address(0x2000), &classifier(&memory, &NullResolver, true));
        match result {
            Classification::Leak { address, size, header } => {
                assert_eq!(address, Address(0x2000 + HEADER_LEN));
                assert_eq!(size, 40);
                assert!(header.is_some());
            }
            other => panic!("expected a leak, got {other:?}"),
        }
        assert!(b.debug_crt);
    }

    #[test]
    fn runtime_blocks_are_not_leaks() {
        let memory = FakeMemory::default();
        let raw = debug_block(CrtLayout::Legacy, block_use::INTERNAL, 16);
        let mut b = block(raw.len());
        memory.insert(0x3000, raw);

        let result = classify(&mut b, Address(0x3000), &classifier(&memory, &NullResolver, true));
        assert_eq!(result, Classification::NotALeak(NotALeak::RuntimeInternal));
        assert!(!b.reported);
    }

    #[test]
    fn startup_allocations_are_marked_reported() {
        let resolver = TableResolver(HashMap::from([(0x20, "__libc_csu_init")]));
        let mut b = block(8);

        let result = classify(&mut b, Address(0x4000), &classifier(&NoInspection, &resolver, true));
        assert_eq!(result, Classification::NotALeak(NotALeak::Startup));
        assert!(b.reported);
    }

    #[test]
    fn startup_allocations_count_when_not_skipped() {
        let resolver = TableResolver(HashMap::from([(0x20, "__libc_csu_init")]));
        let mut b = block(8);

        let result = classify(&mut b, Address(0x4000), &classifier(&NoInspection, &resolver, false));
        assert!(result.is_leak());
        assert!(!b.reported);
    }
}
