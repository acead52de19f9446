//! OS-level thread identifiers used to attribute blocks to their allocating thread.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Return the kernel thread ID (TID) of the calling thread.
        #[inline]
        pub fn current_tid() -> u64 {
            unsafe { libc::syscall(libc::SYS_gettid) as u64 }
        }
    } else if #[cfg(target_os = "macos")] {
        /// Return the Mach thread ID of the calling thread.
        #[inline]
        pub fn current_tid() -> u64 {
            unsafe {
                let pthread = libc::pthread_self();
                libc::pthread_mach_thread_np(pthread) as u64
            }
        }
    } else {
        use std::cell::Cell;
        use std::sync::atomic::{AtomicU64, Ordering};

        static NEXT_TID: AtomicU64 = AtomicU64::new(1);

        thread_local! {
            static TID: Cell<u64> = const { Cell::new(0) };
        }

        /// Return a process-unique identifier for the calling thread.
        ///
        /// Platforms without a cheap kernel thread id get a lazily assigned counter value.
        #[inline]
        pub fn current_tid() -> u64 {
            TID.with(|tid| {
                if tid.get() == 0 {
                    tid.set(NEXT_TID.fetch_add(1, Ordering::Relaxed));
                }
                tid.get()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_is_stable_within_a_thread() {
        assert_eq!(current_tid(), current_tid());
    }

    #[test]
    fn tid_differs_across_threads() {
        let here = current_tid();
        let there = std::thread::spawn(current_tid).join().unwrap();
        assert_ne!(here, there);
    }
}
