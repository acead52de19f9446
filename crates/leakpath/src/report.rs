//! Turns a snapshot of live blocks into leak entries.
//!
//! Every function here runs with the registry lock held by the caller and the calling
//! thread suppressed, so symbol resolution may allocate freely.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::callstack::{CallStack, ResolvedFrame};
use crate::classify::{classify, detect_header, Classification, Classifier};
use crate::crt::CrtHeader;
use crate::handle::{Address, HeapId, ThreadFilter, ThreadId};
use crate::registry::{AllocStats, Registry};

/// One reported leak, or a group of identical leaks when duplicates are aggregated.
#[derive(Debug, Clone, Serialize)]
pub struct LeakEntry {
    pub serial: u64,
    pub heap: HeapId,
    /// User-visible address; past the debug header for debug runtime blocks.
    pub address: Address,
    pub size: usize,
    /// Stable identity of the leak site, derived from the size and the call stack.
    pub hash: u32,
    /// Number of leaks folded into this entry.
    pub count: usize,
    pub thread_id: ThreadId,
    pub frames: Vec<ResolvedFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crt_request: Option<i32>,
}

impl LeakEntry {
    pub fn total_bytes(&self) -> usize {
        self.size.saturating_mul(self.count)
    }
}

/// Result of one report call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LeakReport {
    pub entries: Vec<LeakEntry>,
    /// Sum of the entries' repeat counts.
    pub leaks: usize,
    pub stats: AllocStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap: Option<HeapId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadId>,
}

impl LeakReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// CRC32 of the block size seeded with the call stack hash.
pub fn leak_hash(size: usize, stack: &CallStack) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(stack.hash_value());
    hasher.update(&size.to_le_bytes());
    hasher.finalize()
}

pub(crate) struct Collect {
    pub filter: ThreadFilter,
    pub aggregate: bool,
    pub max_data_dump: Option<usize>,
    pub show_internal: bool,
}

/// Number of leaks in `heaps` matching `filter`. Each block counts once.
pub(crate) fn count(
    registry: &mut Registry,
    heaps: &[HeapId],
    filter: ThreadFilter,
    classifier: &Classifier<'_>,
) -> usize {
    let mut leaks = 0;
    for &heap in heaps {
        for address in registry.addresses_by_serial(heap) {
            let Some(block) = registry.block_mut(heap, address) else {
                continue;
            };
            if !filter.matches(block.thread_id) {
                continue;
            }
            if classify(block, address, classifier).is_leak() {
                leaks += 1;
            }
        }
    }
    leaks
}

/// Builds entries for the leaks in `heaps`.
///
/// With aggregation, every other block of equal size and equal call stack in any heap is
/// claimed by the first entry and folded into its count. Claims are shared across the
/// heaps of one call.
pub(crate) fn collect(
    registry: &mut Registry,
    heaps: &[HeapId],
    request: &Collect,
    classifier: &Classifier<'_>,
) -> Vec<LeakEntry> {
    let mut claimed: HashSet<(HeapId, Address)> = HashSet::new();
    let mut entries = Vec::new();

    for &heap in heaps {
        for address in registry.addresses_by_serial(heap) {
            if claimed.contains(&(heap, address)) {
                continue;
            }
            let Some(block) = registry.block_mut(heap, address) else {
                continue;
            };
            if !request.filter.matches(block.thread_id) {
                continue;
            }
            let Classification::Leak {
                address: user_address,
                size,
                header,
            } = classify(block, address, classifier)
            else {
                continue;
            };

            let raw_size = block.size;
            let serial = block.serial;
            let thread_id = block.thread_id;
            let stack = block.call_stack.clone();

            let mut count = 1;
            if request.aggregate {
                if let Some(stack) = &stack {
                    count += claim_duplicates(registry, heap, address, raw_size, stack, &mut claimed);
                }
            }

            let frames = match &stack {
                Some(stack) => {
                    stack.resolve(classifier.resolver);
                    stack.display_frames(request.show_internal)
                }
                None => Vec::new(),
            };
            let data = dump(classifier, user_address, size, request.max_data_dump);

            entries.push(LeakEntry {
                serial,
                heap,
                address: user_address,
                size,
                hash: stack.as_deref().map_or(0, |s| leak_hash(raw_size, s)),
                count,
                thread_id,
                frames,
                data,
                crt_request: header.map(|h| h.request),
            });
        }
    }
    entries
}

fn claim_duplicates(
    registry: &Registry,
    heap: HeapId,
    address: Address,
    size: usize,
    stack: &CallStack,
    claimed: &mut HashSet<(HeapId, Address)>,
) -> usize {
    let mut erased = 0;
    for (other_heap, other_address, other) in registry.iter_blocks() {
        if (other_heap, other_address) == (heap, address) {
            continue;
        }
        let Some(other_stack) = &other.call_stack else {
            continue;
        };
        if other.reported || claimed.contains(&(other_heap, other_address)) {
            continue;
        }
        if other.size == size && **other_stack == *stack {
            claimed.insert((other_heap, other_address));
            erased += 1;
        }
    }
    erased
}

fn dump(
    classifier: &Classifier<'_>,
    address: Address,
    size: usize,
    max: Option<usize>,
) -> Option<Vec<u8>> {
    let len = max.map_or(size, |max| max.min(size));
    if len == 0 {
        return None;
    }
    let mut data = vec![0u8; len];
    classifier.inspector.read(address, &mut data).then_some(data)
}

/// Flags every block matching `filter` as reported.
pub(crate) fn mark_reported(registry: &mut Registry, filter: ThreadFilter) {
    for block in registry.iter_blocks_mut() {
        if filter.matches(block.thread_id) {
            block.reported = true;
        }
    }
}

/// Resolves the call stacks of every unreported block ahead of reporting. Startup
/// allocations are marked reported when they are skipped. Returns the number of frames
/// that could not be resolved.
pub(crate) fn resolve_stacks(registry: &mut Registry, classifier: &Classifier<'_>) -> usize {
    let mut unresolved = 0;
    for heap in registry.heap_ids() {
        for address in registry.addresses_by_serial(heap) {
            let Some(block) = registry.block_mut(heap, address) else {
                continue;
            };
            if block.reported {
                continue;
            }
            if detect_header(block, address, classifier.inspector)
                .is_some_and(|h| h.is_runtime_owned())
            {
                continue;
            }
            let Some(stack) = &block.call_stack else {
                continue;
            };
            unresolved += stack.resolve(classifier.resolver);
            if classifier.skip_startup && stack.is_startup_alloc() {
                block.reported = true;
            }
        }
    }
    unresolved
}

/// Call stack of the block at `address`, or of the debug runtime block whose user region
/// starts there.
pub(crate) fn find_stack(
    registry: &mut Registry,
    address: Address,
    classifier: &Classifier<'_>,
) -> Option<Arc<CallStack>> {
    if let Some(block) = registry.find_block_mut(address) {
        return block.call_stack.clone();
    }
    for heap in registry.heap_ids() {
        for raw in registry.addresses_by_serial(heap) {
            let Some(block) = registry.block_mut(heap, raw) else {
                continue;
            };
            if detect_header(block, raw, classifier.inspector).is_some()
                && CrtHeader::user_address(raw) == address
            {
                return block.call_stack.clone();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callstack::tests::TableResolver;
    use crate::callstack::NullResolver;
    use crate::crt::tests::{debug_block, FakeMemory};
    use crate::crt::{block_use, CrtLayout, NoInspection, HEADER_LEN};
    use std::collections::HashMap;

    const HEAP: HeapId = HeapId(0x10);

    fn alloc(registry: &mut Registry, heap: HeapId, address: usize, size: usize, thread: u64, frames: &[usize]) {
        let block = registry.record_allocation(heap, Address(address), size, ThreadId(thread), false, false);
        block.call_stack = Some(Arc::new(CallStack::new(frames.to_vec())));
    }

    fn plain() -> Classifier<'static> {
        Classifier {
            inspector: &NoInspection,
            resolver: &NullResolver,
            skip_startup: true,
        }
    }

    fn request(aggregate: bool) -> Collect {
        Collect {
            filter: ThreadFilter::All,
            aggregate,
            max_data_dump: Some(0),
            show_internal: false,
        }
    }

    #[test]
    fn count_honours_the_thread_filter() {
        let mut registry = Registry::new();
        alloc(&mut registry, HEAP, 0x100, 8, 1, &[1]);
        alloc(&mut registry, HEAP, 0x200, 8, 2, &[1]);
        alloc(&mut registry, HEAP, 0x300, 8, 2, &[2]);

        let heaps = registry.heap_ids();
        assert_eq!(count(&mut registry, &heaps, ThreadFilter::All, &plain()), 3);
        assert_eq!(count(&mut registry, &heaps, ThreadFilter::Only(ThreadId(2)), &plain()), 2);
        assert_eq!(count(&mut registry, &heaps, ThreadFilter::Only(ThreadId(9)), &plain()), 0);
    }

    #[test]
    fn marking_hides_blocks_from_counts() {
        let mut registry = Registry::new();
        alloc(&mut registry, HEAP, 0x100, 8, 1, &[1]);
        alloc(&mut registry, HEAP, 0x200, 8, 2, &[1]);
        let heaps = registry.heap_ids();

        mark_reported(&mut registry, ThreadFilter::Only(ThreadId(1)));
        assert_eq!(count(&mut registry, &heaps, ThreadFilter::All, &plain()), 1);
        mark_reported(&mut registry, ThreadFilter::All);
        mark_reported(&mut registry, ThreadFilter::All);
        assert_eq!(count(&mut registry, &heaps, ThreadFilter::All, &plain()), 0);
    }

    #[test]
    fn duplicates_fold_into_the_first_entry() {
        let mut registry = Registry::new();
        let other = HeapId(0x20);
        alloc(&mut registry, HEAP, 0x100, 16, 1, &[1, 2, 3]);
        alloc(&mut registry, HEAP, 0x200, 16, 1, &[1, 2, 3]);
        alloc(&mut registry, other, 0x300, 16, 2, &[1, 2, 3]);
        alloc(&mut registry, HEAP, 0x400, 32, 1, &[1, 2, 3]);
        alloc(&mut registry, HEAP, 0x500, 16, 1, &[9]);
        let heaps = registry.heap_ids();

        let entries = collect(&mut registry, &heaps, &request(true), &plain());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].serial, 1);
        assert_eq!(entries[0].count, 3);
        assert_eq!(entries[0].total_bytes(), 48);
        assert_eq!(entries.iter().map(|e| e.count).sum::<usize>(), 5);
        assert!(entries.iter().all(|e| e.heap == HEAP));
    }

    #[test]
    fn without_aggregation_every_leak_is_an_entry() {
        let mut registry = Registry::new();
        alloc(&mut registry, HEAP, 0x100, 16, 1, &[1, 2, 3]);
        alloc(&mut registry, HEAP, 0x200, 16, 1, &[1, 2, 3]);
        let heaps = registry.heap_ids();

        let entries = collect(&mut registry, &heaps, &request(false), &plain());
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.count == 1));
        assert_eq!(entries[0].hash, entries[1].hash);
    }

    #[test]
    fn leak_hash_depends_on_size_and_stack() {
        let stack = CallStack::new(vec![1, 2]);
        assert_eq!(leak_hash(8, &stack), leak_hash(8, &CallStack::new(vec![1, 2])));
        assert_ne!(leak_hash(8, &stack), leak_hash(16, &stack));
        assert_ne!(leak_hash(8, &stack), leak_hash(8, &CallStack::new(vec![2, 1])));
    }

    #[test]
    fn debug_blocks_report_the_user_region_and_data() {
        let memory = FakeMemory::default();
        let raw = debug_block(CrtLayout::Legacy, block_use::NORMAL, 24);
        let raw_len = raw.len();
        memory.insert(0x1000, raw);

        let mut registry = Registry::new();
        alloc(&mut registry, HEAP, 0x1000, raw_len, 1, &[1]);
        let heaps = registry.heap_ids();
        let classifier = Classifier {
            inspector: &memory,
            resolver: &NullResolver,
            skip_startup: true,
        };
        let request = Collect {
            max_data_dump: Some(4),
            ..request(false)
        };

        let entries = collect(&mut registry, &heaps, &request, &classifier);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address, Address(0x1000 + HEADER_LEN));
        assert_eq!(entries[0].size, 24);
        assert_eq!(entries[0].crt_request, Some(7));
        assert_eq!(entries[0].data.as_deref(), Some(&[0xAB; 4][..]));
    }

    #[test]
    fn resolving_early_skips_startup_leaks() {
        let resolver = TableResolver(HashMap::from([(1, "app::main"), (0x99, "_dl_init")]));
        let mut registry = Registry::new();
        alloc(&mut registry, HEAP, 0x100, 8, 1, &[1, 2]);
        alloc(&mut registry, HEAP, 0x200, 8, 1, &[0x99]);
        let classifier = Classifier {
            inspector: &NoInspection,
            resolver: &resolver,
            skip_startup: true,
        };

        assert_eq!(resolve_stacks(&mut registry, &classifier), 1);
        assert!(registry.block(HEAP, Address(0x200)).unwrap().reported);
        let heaps = registry.heap_ids();
        assert_eq!(count(&mut registry, &heaps, ThreadFilter::All, &classifier), 1);
    }

    #[test]
    fn stacks_are_found_by_user_address() {
        let memory = FakeMemory::default();
        let raw = debug_block(CrtLayout::Ucrt, block_use::CLIENT, 8);
        let raw_len = raw.len();
        memory.insert(0x1000, raw);

        let mut registry = Registry::new();
        alloc(&mut registry, HEAP, 0x1000, raw_len, 1, &[5, 6]);
        let classifier = Classifier {
            inspector: &memory,
            resolver: &NullResolver,
            skip_startup: true,
        };

        let by_raw = find_stack(&mut registry, Address(0x1000), &classifier).unwrap();
        let by_user = find_stack(&mut registry, Address(0x1000 + HEADER_LEN), &classifier).unwrap();
        assert_eq!(by_raw.frames(), &[5, 6]);
        assert!(Arc::ptr_eq(&by_raw, &by_user));
        assert!(find_stack(&mut registry, Address(0x5000), &classifier).is_none());
    }
}
