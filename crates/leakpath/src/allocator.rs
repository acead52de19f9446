//! Global allocator that feeds the installed detector.

use std::alloc::{GlobalAlloc, Layout, System};

use crate::callstack::Frame;
use crate::guard::installed_ref;
use crate::handle::{Address, HeapId};
use crate::thread_context::{holds_registry, is_busy, BusyGuard};

/// Global allocator that records every allocation of the process heap with the detector
/// installed by [`DetectorBuilder::build_global`](crate::DetectorBuilder::build_global).
///
/// Forwards to [`System`]. Allocations made while no detector is installed, or made by
/// the detector itself, are not tracked. Frees are always recorded before the memory is
/// released, including frees made by report hooks and reporters.
///
/// # Examples
///
/// ```rust,no_run
/// use leakpath::LeakTrackingAllocator;
///
/// #[global_allocator]
/// static GLOBAL: LeakTrackingAllocator = LeakTrackingAllocator;
/// ```
pub struct LeakTrackingAllocator;

unsafe impl GlobalAlloc for LeakTrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if is_busy() {
            return unsafe { System.alloc(layout) };
        }
        let _busy = BusyGuard::enter();
        let installed = installed_ref();
        let Some(detector) = installed.as_deref().and_then(Option::as_ref) else {
            return unsafe { System.alloc(layout) };
        };

        let capture = detector.enter_capture(Frame::here(), false, false);
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            capture.set_allocation(HeapId::PROCESS, Address::from_ptr(ptr), layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let busy = is_busy();
        // frees under the registry lock are the detector's own
        if !(busy && holds_registry()) {
            let _busy = BusyGuard::enter();
            let installed = installed_ref();
            if let Some(detector) = installed.as_deref().and_then(Option::as_ref) {
                let address = Address::from_ptr(ptr);
                if busy {
                    detector.forget(HeapId::PROCESS, address);
                } else {
                    detector.on_free(HeapId::PROCESS, address, Frame::here());
                }
            }
        }

        unsafe {
            System.dealloc(ptr, layout);
        }
    }

    /// Always moves the block: the new block is recorded and the old one forgotten before
    /// the old memory is released.
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: the caller guarantees `new_size` rounded up to `layout.align()` does not
        // overflow.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        if is_busy() {
            return unsafe { self.move_untracked(ptr, layout, new_layout) };
        }
        let _busy = BusyGuard::enter();
        let installed = installed_ref();
        let Some(detector) = installed.as_deref().and_then(Option::as_ref) else {
            return unsafe { System.realloc(ptr, layout, new_size) };
        };

        let capture = detector.enter_capture(Frame::here(), false, false);
        let new_ptr = unsafe { System.alloc(new_layout) };
        if new_ptr.is_null() {
            // the old block is untouched
            return new_ptr;
        }
        // SAFETY: both blocks are live, distinct and at least this long.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        }
        if capture.is_recording() {
            capture.set_reallocation(
                HeapId::PROCESS,
                Address::from_ptr(ptr),
                Address::from_ptr(new_ptr),
                new_size,
            );
            drop(capture);
        } else {
            drop(capture);
            detector.on_free(HeapId::PROCESS, Address::from_ptr(ptr), Frame::here());
        }

        unsafe {
            System.dealloc(ptr, layout);
        }
        new_ptr
    }
}

impl LeakTrackingAllocator {
    /// Reallocation made inside the detector. The new block is not tracked; the old one is
    /// forgotten by `dealloc` before it is released.
    unsafe fn move_untracked(&self, ptr: *mut u8, layout: Layout, new_layout: Layout) -> *mut u8 {
        let new_ptr = unsafe { System.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_layout.size()));
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}
