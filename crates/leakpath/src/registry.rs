//! Heaps and the live blocks they own.
//!
//! The registry itself is not synchronized; [`LeakDetector`](crate::LeakDetector) keeps it
//! behind a single mutex and every method here runs with that lock held.

use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::callstack::CallStack;
use crate::handle::{Address, HeapId, ThreadId};

/// One tracked allocation.
#[derive(Debug, Clone)]
pub struct Block {
    pub serial: u64,
    pub size: usize,
    pub thread_id: ThreadId,
    pub call_stack: Option<Arc<CallStack>>,
    pub reported: bool,
    pub debug_crt: bool,
    pub ucrt: bool,
}

#[derive(Debug, Default)]
pub struct Heap {
    pub(crate) blocks: HashMap<Address, Block>,
}

impl Heap {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn live_bytes(&self) -> usize {
        self.blocks.values().map(|b| b.size).sum()
    }
}

/// Process-wide allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocStats {
    /// Bytes ever allocated, saturating at `usize::MAX`.
    pub total: usize,
    /// Bytes currently live.
    pub current: usize,
    /// Highest value `current` has reached.
    pub peak: usize,
    pub blocks: usize,
    pub heaps: usize,
}

impl AllocStats {
    fn grow(&mut self, size: usize) {
        self.total = self.total.saturating_add(size);
        self.current += size;
        self.peak = self.peak.max(self.current);
    }
}

/// A block found under a different heap than the one it was freed to.
#[derive(Debug, Clone)]
pub struct HeapMismatch {
    pub address: Address,
    pub freed_heap: HeapId,
    pub owner_heap: HeapId,
    pub serial: u64,
    pub size: usize,
    pub thread_id: ThreadId,
    pub call_stack: Arc<CallStack>,
}

#[derive(Debug)]
pub enum FreeOutcome {
    Freed(Block),
    Untracked,
    HeapMismatch(HeapMismatch),
}

fn new_block(
    next_serial: &mut u64,
    stats: &mut AllocStats,
    size: usize,
    thread_id: ThreadId,
    debug_crt: bool,
    ucrt: bool,
) -> Block {
    let serial = *next_serial;
    *next_serial += 1;
    stats.grow(size);
    Block {
        serial,
        size,
        thread_id,
        call_stack: None,
        reported: false,
        debug_crt,
        ucrt,
    }
}

#[derive(Debug)]
pub struct Registry {
    heaps: HashMap<HeapId, Heap>,
    next_serial: u64,
    stats: AllocStats,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            heaps: HashMap::new(),
            next_serial: 1,
            stats: AllocStats::default(),
        }
    }

    /// Maps a new heap, replacing any stale state left under the same id.
    pub fn create_heap(&mut self, heap: HeapId) {
        if self.heaps.contains_key(&heap) {
            warn!(%heap, "detected a duplicate heap");
            self.destroy_heap(heap);
        }
        self.heaps.insert(heap, Heap::default());
    }

    /// Releases a heap and all of its blocks. Returns how many blocks were dropped.
    pub fn destroy_heap(&mut self, heap: HeapId) -> usize {
        let Some(state) = self.heaps.remove(&heap) else {
            return 0;
        };
        self.stats.current -= state.live_bytes();
        state.len()
    }

    pub fn record_allocation(
        &mut self,
        heap: HeapId,
        address: Address,
        size: usize,
        thread_id: ThreadId,
        debug_crt: bool,
        ucrt: bool,
    ) -> &mut Block {
        let Registry {
            heaps,
            next_serial,
            stats,
        } = self;
        let block = new_block(next_serial, stats, size, thread_id, debug_crt, ucrt);
        let blocks = &mut heaps.entry(heap).or_default().blocks;

        match blocks.entry(address) {
            Entry::Occupied(mut slot) => {
                let stale = slot.insert(block);
                stats.current -= stale.size;
                warn!(
                    %address,
                    size = stale.size,
                    new_size = size,
                    "new allocation at already allocated address"
                );
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(block),
        }
    }

    /// Removes the block at `address`.
    ///
    /// With `validate`, an untracked address is looked up in every other heap to catch
    /// memory freed to the wrong heap.
    pub fn record_free(&mut self, heap: HeapId, address: Address, validate: bool) -> FreeOutcome {
        if address.is_null() {
            return FreeOutcome::Untracked;
        }
        let Some(state) = self.heaps.get_mut(&heap) else {
            return FreeOutcome::Untracked;
        };
        if let Some(block) = state.blocks.remove(&address) {
            self.stats.current -= block.size;
            return FreeOutcome::Freed(block);
        }
        if !validate {
            return FreeOutcome::Untracked;
        }
        match self.find_block(address) {
            Some((owner_heap, block)) if owner_heap != heap => match &block.call_stack {
                Some(call_stack) => FreeOutcome::HeapMismatch(HeapMismatch {
                    address,
                    freed_heap: heap,
                    owner_heap,
                    serial: block.serial,
                    size: block.size,
                    thread_id: block.thread_id,
                    call_stack: Arc::clone(call_stack),
                }),
                None => FreeOutcome::Untracked,
            },
            _ => FreeOutcome::Untracked,
        }
    }

    /// Tracks a reallocation from `old` to `new`.
    ///
    /// A moved block is a free followed by an allocation; the free outcome is returned so
    /// the caller can surface a heap mismatch. An in-place reallocation keeps the serial,
    /// drops the call stack and moves the counters by the size delta.
    #[allow(clippy::too_many_arguments)]
    pub fn record_reallocation(
        &mut self,
        heap: HeapId,
        old: Address,
        new: Address,
        size: usize,
        thread_id: ThreadId,
        debug_crt: bool,
        ucrt: bool,
        validate: bool,
    ) -> (&mut Block, Option<FreeOutcome>) {
        if new != old {
            let freed = self.record_free(heap, old, validate);
            let block = self.record_allocation(heap, new, size, thread_id, debug_crt, ucrt);
            return (block, Some(freed));
        }

        let Registry {
            heaps,
            next_serial,
            stats,
        } = self;
        let blocks = &mut heaps.entry(heap).or_default().blocks;

        match blocks.entry(old) {
            Entry::Occupied(slot) => {
                let block = slot.into_mut();
                block.call_stack = None;
                if stats.total < usize::MAX {
                    stats.total = stats.total.saturating_sub(block.size).saturating_add(size);
                }
                stats.current = stats.current - block.size + size;
                stats.peak = stats.peak.max(stats.current);
                block.thread_id = thread_id;
                block.size = size;
                (block, None)
            }
            Entry::Vacant(slot) => {
                debug!(%heap, address = %new, "in-place reallocation of an untracked block");
                let block = new_block(next_serial, stats, size, thread_id, debug_crt, ucrt);
                (slot.insert(block), None)
            }
        }
    }

    /// Searches every heap for a block at `address`.
    pub fn find_block(&self, address: Address) -> Option<(HeapId, &Block)> {
        self.heaps
            .iter()
            .find_map(|(&id, state)| state.blocks.get(&address).map(|block| (id, block)))
    }

    pub fn find_block_mut(&mut self, address: Address) -> Option<&mut Block> {
        self.heaps
            .values_mut()
            .find_map(|state| state.blocks.get_mut(&address))
    }

    pub fn heap(&self, heap: HeapId) -> Option<&Heap> {
        self.heaps.get(&heap)
    }

    /// Heap ids in ascending order.
    pub fn heap_ids(&self) -> Vec<HeapId> {
        let mut ids: Vec<HeapId> = self.heaps.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Addresses of a heap's blocks in allocation order.
    pub fn addresses_by_serial(&self, heap: HeapId) -> Vec<Address> {
        let Some(state) = self.heaps.get(&heap) else {
            return Vec::new();
        };
        let mut entries: Vec<(u64, Address)> = state
            .blocks
            .iter()
            .map(|(&address, block)| (block.serial, address))
            .collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, address)| address).collect()
    }

    pub fn block(&self, heap: HeapId, address: Address) -> Option<&Block> {
        self.heaps.get(&heap)?.blocks.get(&address)
    }

    pub fn block_mut(&mut self, heap: HeapId, address: Address) -> Option<&mut Block> {
        self.heaps.get_mut(&heap)?.blocks.get_mut(&address)
    }

    /// Every block in every heap, paired with its heap and address.
    pub fn iter_blocks(&self) -> impl Iterator<Item = (HeapId, Address, &Block)> {
        self.heaps.iter().flat_map(|(&heap, state)| {
            state
                .blocks
                .iter()
                .map(move |(&address, block)| (heap, address, block))
        })
    }

    pub fn iter_blocks_mut(&mut self) -> impl Iterator<Item = &mut Block> {
        self.heaps
            .values_mut()
            .flat_map(|state| state.blocks.values_mut())
    }

    pub fn block_count(&self) -> usize {
        self.heaps.values().map(Heap::len).sum()
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            blocks: self.block_count(),
            heaps: self.heaps.len(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: HeapId = HeapId(0x10);
    const T: ThreadId = ThreadId(1);

    fn alloc(registry: &mut Registry, heap: HeapId, address: usize, size: usize) -> u64 {
        registry
            .record_allocation(heap, Address(address), size, T, false, false)
            .serial
    }

    #[test]
    fn serials_start_at_one_and_increase() {
        let mut registry = Registry::new();
        assert_eq!(alloc(&mut registry, H, 0x100, 8), 1);
        assert_eq!(alloc(&mut registry, H, 0x200, 8), 2);
        assert_eq!(alloc(&mut registry, HeapId(0x20), 0x300, 8), 3);
    }

    #[test]
    fn current_bytes_track_live_blocks() {
        let mut registry = Registry::new();
        let sizes = [(0x100, 16), (0x200, 32), (0x300, 64), (0x400, 8)];
        for (address, size) in sizes {
            alloc(&mut registry, H, address, size);
        }
        registry.record_free(H, Address(0x200), false);
        registry.record_free(H, Address(0x400), false);

        let stats = registry.stats();
        assert_eq!(stats.current, 16 + 64);
        assert_eq!(stats.total, 16 + 32 + 64 + 8);
        assert_eq!(stats.peak, 16 + 32 + 64 + 8);
        assert_eq!(stats.blocks, 2);
    }

    #[test]
    fn untracked_frees_are_ignored() {
        let mut registry = Registry::new();
        alloc(&mut registry, H, 0x100, 16);
        assert!(matches!(
            registry.record_free(H, Address(0x999), false),
            FreeOutcome::Untracked
        ));
        assert!(matches!(
            registry.record_free(HeapId(0x77), Address(0x100), false),
            FreeOutcome::Untracked
        ));
        assert!(matches!(
            registry.record_free(H, Address::NULL, true),
            FreeOutcome::Untracked
        ));
        assert_eq!(registry.stats().current, 16);
    }

    #[test]
    fn colliding_allocation_evicts_the_stale_block() {
        let mut registry = Registry::new();
        alloc(&mut registry, H, 0x100, 16);
        let serial = alloc(&mut registry, H, 0x100, 40);

        let stats = registry.stats();
        assert_eq!(stats.current, 40);
        assert_eq!(stats.blocks, 1);
        assert_eq!(registry.block(H, Address(0x100)).unwrap().serial, serial);
    }

    #[test]
    fn duplicate_heap_discards_stale_blocks() {
        let mut registry = Registry::new();
        alloc(&mut registry, H, 0x100, 16);
        registry.create_heap(H);
        assert_eq!(registry.stats().current, 0);
        assert!(registry.heap(H).unwrap().is_empty());
    }

    #[test]
    fn destroying_a_heap_releases_its_blocks() {
        let mut registry = Registry::new();
        alloc(&mut registry, H, 0x100, 16);
        alloc(&mut registry, H, 0x200, 16);
        alloc(&mut registry, HeapId(0x20), 0x300, 5);

        assert_eq!(registry.destroy_heap(H), 2);
        assert_eq!(registry.destroy_heap(HeapId(0x99)), 0);
        assert_eq!(registry.stats().current, 5);
        assert_eq!(registry.stats().heaps, 1);
    }

    #[test]
    fn in_place_reallocation_keeps_serial() {
        let mut registry = Registry::new();
        let serial = {
            let block = registry.record_allocation(H, Address(0x100), 64, T, false, false);
            block.call_stack = Some(Arc::new(CallStack::new(vec![1, 2])));
            block.serial
        };

        let (block, freed) =
            registry.record_reallocation(H, Address(0x100), Address(0x100), 128, T, false, false, false);
        assert!(freed.is_none());
        assert_eq!(block.serial, serial);
        assert_eq!(block.size, 128);
        assert_eq!(block.thread_id, T);
        assert!(block.call_stack.is_none());

        let stats = registry.stats();
        assert_eq!(stats.current, 128);
        assert_eq!(stats.total, 128);
        assert_eq!(stats.peak, 128);
    }

    #[test]
    fn moved_reallocation_is_free_plus_allocate() {
        let mut registry = Registry::new();
        let old_serial = alloc(&mut registry, H, 0x100, 64);
        let (block, freed) =
            registry.record_reallocation(H, Address(0x100), Address(0x200), 96, T, false, false, false);
        assert!(block.serial > old_serial);
        assert!(matches!(freed, Some(FreeOutcome::Freed(_))));
        assert!(registry.block(H, Address(0x100)).is_none());
        assert_eq!(registry.stats().current, 96);
        assert_eq!(registry.stats().total, 160);
    }

    #[test]
    fn reallocating_an_unknown_block_allocates() {
        let mut registry = Registry::new();
        let (block, _) =
            registry.record_reallocation(H, Address(0x100), Address(0x100), 32, T, false, false, false);
        assert_eq!(block.serial, 1);
        assert_eq!(registry.stats().current, 32);
    }

    #[test]
    fn total_saturates() {
        let mut registry = Registry::new();
        alloc(&mut registry, H, 0x100, usize::MAX - 10);
        registry.record_free(H, Address(0x100), false);
        alloc(&mut registry, H, 0x200, 100);
        assert_eq!(registry.stats().total, usize::MAX);
        assert_eq!(registry.stats().current, 100);
    }

    #[test]
    fn free_to_the_wrong_heap_is_detected() {
        let mut registry = Registry::new();
        let other = HeapId(0x20);
        registry.create_heap(other);
        registry
            .record_allocation(H, Address(0x100), 16, T, false, false)
            .call_stack = Some(Arc::new(CallStack::new(vec![7])));

        match registry.record_free(other, Address(0x100), true) {
            FreeOutcome::HeapMismatch(mismatch) => {
                assert_eq!(mismatch.owner_heap, H);
                assert_eq!(mismatch.freed_heap, other);
                assert_eq!(mismatch.size, 16);
            }
            outcome => panic!("unexpected outcome {outcome:?}"),
        }
        // the block stays with its real heap
        assert_eq!(registry.stats().current, 16);
        assert!(matches!(
            registry.record_free(other, Address(0x100), false),
            FreeOutcome::Untracked
        ));
    }
}
