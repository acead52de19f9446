//! Per-thread detector state.
//!
//! Each thread gets one [`ThreadContext`] per detector. The owning thread reaches it
//! through a thread-local cache; other threads reach it through the detector's
//! [`ThreadTable`] for global enable/disable and shutdown.

use crossbeam_channel::{after, select, unbounded, Receiver, Sender};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::callstack::Frame;
use crate::error::Error;
use crate::handle::{Address, HeapId, ThreadId};

pub(crate) const ENABLED: u32 = 0x1;
pub(crate) const DISABLED: u32 = 0x2;
pub(crate) const DEBUG_CRT: u32 = 0x4;
pub(crate) const UCRT: u32 = 0x8;

const STATE_MASK: u32 = ENABLED | DISABLED;

/// The allocation currently passing through a hook on this thread.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct InFlight {
    /// Frame of the outermost capture. `Some` while a capture is in flight.
    pub frame: Option<Frame>,
    pub heap: Option<HeapId>,
    pub block: Address,
    pub new_block: Address,
    pub size: usize,
}

#[derive(Debug)]
pub struct ThreadContext {
    thread_id: ThreadId,
    created_at: &'static Location<'static>,
    flags: AtomicU32,
    saved_flags: AtomicU32,
    in_flight: Mutex<InFlight>,
    exited: AtomicBool,
}

impl ThreadContext {
    #[track_caller]
    fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            created_at: Location::caller(),
            flags: AtomicU32::new(0),
            saved_flags: AtomicU32::new(0),
            in_flight: Mutex::new(InFlight::default()),
            exited: AtomicBool::new(false),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub(crate) fn created_at(&self) -> &'static Location<'static> {
        self.created_at
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Whether detection is enabled, adopting the default on first query.
    pub(crate) fn is_enabled(&self, start_disabled: bool) -> bool {
        let flags = self.flags();
        if flags & STATE_MASK == 0 {
            let initial = if start_disabled { DISABLED } else { ENABLED };
            self.flags.fetch_or(initial, Ordering::AcqRel);
        }
        self.flags() & ENABLED != 0
    }

    pub(crate) fn disable(&self) {
        self.saved_flags.store(self.flags(), Ordering::Release);
        self.replace_state(DISABLED);
    }

    pub(crate) fn enable(&self) {
        self.saved_flags.store(self.flags(), Ordering::Release);
        self.replace_state(ENABLED);
    }

    /// Global enable/disable. Saves the current state like `enable` and `disable` do.
    pub(crate) fn force(&self, enabled: bool) {
        self.saved_flags.store(self.flags(), Ordering::Release);
        self.replace_state(if enabled { ENABLED } else { DISABLED });
    }

    /// Turns detection off without touching the saved state.
    pub(crate) fn mute(&self) {
        self.replace_state(DISABLED);
    }

    /// Puts back the enabled/disabled bits saved by the last enable or disable.
    pub(crate) fn restore(&self) {
        let saved = self.saved_flags.load(Ordering::Acquire) & STATE_MASK;
        self.replace_state(saved);
    }

    pub(crate) fn state_snapshot(&self) -> u32 {
        self.flags() & STATE_MASK
    }

    pub(crate) fn restore_snapshot(&self, snapshot: u32) {
        self.replace_state(snapshot & STATE_MASK);
    }

    fn replace_state(&self, state: u32) {
        let mut current = self.flags();
        loop {
            let next = (current & !STATE_MASK) | state;
            match self.flags.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks CRT flags and claims the capture if none is in flight. Returns whether the
    /// caller is the outermost capture.
    pub(crate) fn begin_capture(&self, frame: Frame, debug_crt: bool, ucrt: bool) -> bool {
        let mut extra = 0;
        if debug_crt {
            extra |= DEBUG_CRT;
        }
        if ucrt {
            extra |= UCRT;
        }
        if extra != 0 {
            self.flags.fetch_or(extra, Ordering::AcqRel);
        }

        let mut in_flight = self.lock_in_flight();
        if in_flight.frame.is_some() {
            return false;
        }
        in_flight.frame = Some(frame);
        true
    }

    pub(crate) fn set_in_flight(
        &self,
        heap: HeapId,
        block: Address,
        new_block: Address,
        size: usize,
        narrow_to: Option<Frame>,
    ) {
        let mut in_flight = self.lock_in_flight();
        in_flight.heap = Some(heap);
        in_flight.block = block;
        in_flight.new_block = new_block;
        in_flight.size = size;
        if let Some(frame) = narrow_to {
            if !block.is_null() && in_flight.frame.is_some() {
                in_flight.frame = Some(frame);
            }
        }
    }

    pub(crate) fn in_flight(&self) -> InFlight {
        *self.lock_in_flight()
    }

    /// Clears the in-flight allocation and the CRT flags, ready for the next call.
    pub(crate) fn reset(&self) {
        *self.lock_in_flight() = InFlight::default();
        self.flags.fetch_and(!(DEBUG_CRT | UCRT), Ordering::AcqRel);
    }
}

struct ThreadSlot {
    detector: u64,
    context: Arc<ThreadContext>,
    exits: Sender<ThreadId>,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.context.exited.store(true, Ordering::Release);
        let _ = self.exits.send(self.context.thread_id);
    }
}

thread_local! {
    static SLOTS: RefCell<Vec<ThreadSlot>> = const { RefCell::new(Vec::new()) };
    static BUSY: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is inside the detector. Allocations made while busy must
/// bypass tracking. A thread whose locals are gone counts as busy.
pub(crate) fn is_busy() -> bool {
    BUSY.try_with(Cell::get).unwrap_or(true)
}

/// Marks the calling thread busy until dropped.
pub(crate) struct BusyGuard {
    previous: bool,
}

impl BusyGuard {
    pub(crate) fn enter() -> Self {
        let previous = BUSY.try_with(|busy| busy.replace(true)).unwrap_or(true);
        Self { previous }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let _ = BUSY.try_with(|busy| busy.set(self.previous));
    }
}

thread_local! {
    static HOLDS_REGISTRY: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread holds a detector's registry lock. A thread whose locals are
/// gone counts as holding it.
pub(crate) fn holds_registry() -> bool {
    HOLDS_REGISTRY.try_with(Cell::get).unwrap_or(true)
}

/// Marks the calling thread as holding the registry lock until dropped.
pub(crate) struct RegistryHeld {
    previous: bool,
}

impl RegistryHeld {
    pub(crate) fn enter() -> Self {
        let previous = HOLDS_REGISTRY.try_with(|held| held.replace(true)).unwrap_or(true);
        Self { previous }
    }
}

impl Drop for RegistryHeld {
    fn drop(&mut self) {
        let _ = HOLDS_REGISTRY.try_with(|held| held.set(self.previous));
    }
}

/// Side table of every thread context a detector has handed out.
pub(crate) struct ThreadTable {
    detector: u64,
    threads: Mutex<HashMap<ThreadId, Arc<ThreadContext>>>,
    exits_tx: Sender<ThreadId>,
    exits_rx: Receiver<ThreadId>,
}

impl ThreadTable {
    pub(crate) fn new(detector: u64) -> Self {
        let (exits_tx, exits_rx) = unbounded();
        Self {
            detector,
            threads: Mutex::new(HashMap::new()),
            exits_tx,
            exits_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<ThreadContext>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The calling thread's context, created and registered on first use.
    ///
    /// Returns `Ok(None)` once the thread's locals are being torn down.
    #[track_caller]
    pub(crate) fn current(&self) -> Result<Option<Arc<ThreadContext>>, Error> {
        let _busy = BusyGuard::enter();
        let Ok(cached) = SLOTS
            .try_with(|slots| {
                let slots = slots.try_borrow().ok()?;
                slots
                    .iter()
                    .find(|slot| slot.detector == self.detector)
                    .map(|slot| Arc::clone(&slot.context))
            })
        else {
            return Ok(None);
        };
        if let Some(context) = cached {
            return Ok(Some(context));
        }

        let context = Arc::new(ThreadContext::new(ThreadId::current()));
        {
            let mut threads = self.lock();
            threads
                .try_reserve(1)
                .map_err(|_| Error::ThreadSlotExhausted)?;
            threads.insert(context.thread_id, Arc::clone(&context));
        }
        let cached = SLOTS.try_with(|slots| {
            let Ok(mut slots) = slots.try_borrow_mut() else {
                return false;
            };
            if slots.try_reserve(1).is_err() {
                return false;
            }
            slots.push(ThreadSlot {
                detector: self.detector,
                context: Arc::clone(&context),
                exits: self.exits_tx.clone(),
            });
            true
        });
        match cached {
            Ok(true) => Ok(Some(context)),
            Ok(false) => Err(Error::ThreadSlotExhausted),
            Err(_) => Ok(None),
        }
    }

    /// Runs `f` on every registered context with the table locked.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&ThreadContext)) {
        for context in self.lock().values() {
            f(context);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Contexts of threads other than `me` that have not exited yet.
    pub(crate) fn live_except(&self, me: ThreadId) -> Vec<Arc<ThreadContext>> {
        self.lock()
            .values()
            .filter(|c| c.thread_id != me && !c.has_exited())
            .cloned()
            .collect()
    }

    fn active_except(&self, me: ThreadId) -> usize {
        self.lock()
            .values()
            .filter(|c| c.thread_id != me && !c.has_exited())
            .count()
    }

    /// Waits for every other thread that used the detector to exit.
    ///
    /// Each wait lasts `interval`; `on_wait` runs after every interval that ends with threads
    /// still running. Gives up after `max_waits` intervals. Returns whether threads were
    /// still active when the wait ended.
    pub(crate) fn wait_for_threads(
        &self,
        interval: Duration,
        max_waits: u32,
        mut on_wait: impl FnMut(usize),
    ) -> bool {
        let me = ThreadId::current();
        let mut waits = 0;
        loop {
            let active = self.active_except(me);
            if active == 0 {
                return false;
            }
            select! {
                recv(self.exits_rx) -> _ => {}
                recv(after(interval)) -> _ => {
                    waits += 1;
                    if waits >= max_waits {
                        return true;
                    }
                    on_wait(active);
                }
            }
        }
    }
}
