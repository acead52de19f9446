//! Scoped capture of one intercepted allocation call.

use std::sync::Arc;

use crate::callstack::Frame;
use crate::detector::LeakDetector;
use crate::handle::{Address, HeapId};
use crate::thread_context::ThreadContext;

/// Brackets a single intercepted allocation call.
///
/// Created by [`LeakDetector::enter_capture`] before the real allocation runs. Only the
/// outermost guard on a thread captures anything; guards created while a capture is
/// already in flight (the allocator calling itself, or an allocation made while the
/// detector records another one) pass through. When the outermost guard drops, the
/// in-flight block is recorded with its call stack.
///
/// # Examples
///
/// ```rust
/// use leakpath::{Address, DetectorBuilder, Frame, HeapId};
///
/// let detector = DetectorBuilder::new().build();
/// let heap = HeapId(0x10);
///
/// {
///     let capture = detector.enter_capture(Frame::here(), false, false);
///     let block = Address(0x1000); // returned by the real allocator
///     capture.set_allocation(heap, block, 64);
/// }
///
/// assert_eq!(detector.leaks_count(), 1);
/// ```
#[must_use = "the allocation is recorded when the guard is dropped"]
pub struct CaptureGuard<'a> {
    detector: &'a LeakDetector,
    context: Option<Arc<ThreadContext>>,
    frame: Frame,
    outermost: bool,
}

impl<'a> CaptureGuard<'a> {
    pub(crate) fn new(
        detector: &'a LeakDetector,
        context: Arc<ThreadContext>,
        frame: Frame,
        debug_crt: bool,
        ucrt: bool,
    ) -> Self {
        let outermost = context.begin_capture(frame, debug_crt, ucrt);
        Self {
            detector,
            context: Some(context),
            frame,
            outermost,
        }
    }

    pub(crate) fn inert(detector: &'a LeakDetector, frame: Frame) -> Self {
        Self {
            detector,
            context: None,
            frame,
            outermost: false,
        }
    }

    /// Whether this guard records the allocation when dropped.
    pub fn is_recording(&self) -> bool {
        self.outermost && self.context.is_some()
    }

    pub fn is_outermost(&self) -> bool {
        self.outermost
    }

    /// Stores the in-flight allocation. `new_block` is null for a plain allocation and
    /// the resulting address for a reallocation of `block`.
    pub fn set(&self, heap: HeapId, block: Address, new_block: Address, size: usize) {
        let Some(context) = &self.context else {
            return;
        };
        let narrow_to = self
            .detector
            .traces_internal_frames()
            .then_some(self.frame);
        context.set_in_flight(heap, block, new_block, size, narrow_to);
    }

    pub fn set_allocation(&self, heap: HeapId, block: Address, size: usize) {
        self.set(heap, block, Address::NULL, size);
    }

    pub fn set_reallocation(&self, heap: HeapId, old: Address, new: Address, size: usize) {
        self.set(heap, old, new, size);
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if !self.outermost {
            return;
        }
        let Some(context) = self.context.take() else {
            return;
        };
        let in_flight = context.in_flight();
        if let (Some(frame), Some(heap)) = (in_flight.frame, in_flight.heap) {
            if !in_flight.block.is_null() {
                self.detector
                    .record_capture(&context, frame, self.frame, heap, &in_flight);
            }
        }
        context.reset();
    }
}
