#[cfg(test)]
pub mod tests {
    use leakpath::{Address, DetectorBuilder, LeakTrackingAllocator, ReportOptions, ThreadId};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::thread;
    use std::time::Duration;

    #[global_allocator]
    static GLOBAL: LeakTrackingAllocator = LeakTrackingAllocator;

    // only one global detector can be installed at a time
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn quiet_global() -> DetectorBuilder {
        DetectorBuilder::new()
            .max_trace_frames(16)
            .max_data_dump(16)
            .skip_crt_startup_leaks(false)
            .report_options(ReportOptions {
                debugger: false,
                ..ReportOptions::default()
            })
            .shutdown_wait(Duration::from_millis(10))
    }

    #[test]
    fn test_moving_reallocs_race_with_counting() {
        let _serial = serial();
        let guard = quiet_global().build_global();
        let detector = guard.detector();
        let done = AtomicBool::new(false);

        thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..40 {
                    let mut buffer: Vec<u8> = Vec::with_capacity(1 << 20);
                    buffer.resize(4096, 7);
                    buffer.reserve_exact(16 << 20);
                    buffer.shrink_to_fit();
                    assert_eq!(buffer[4095], 7);
                }
                done.store(true, Ordering::Release);
            });
            while !done.load(Ordering::Acquire) {
                detector.leaks_count();
                detector.report_leaks();
            }
        });

        let buffer = vec![1u8; 64];
        let address = Address::from_ptr(buffer.as_ptr());
        assert!(detector.allocation_resolve_results(address).is_some());
        drop(buffer);
        assert!(detector.allocation_resolve_results(address).is_none());
    }

    #[test]
    fn test_free_inside_a_report_hook_is_recorded() {
        let _serial = serial();
        let guard = quiet_global().build_global();
        let detector = guard.detector();

        let held = Arc::new(Mutex::new(Some(vec![7u8; 3000])));
        let address = {
            let slot = held.lock().unwrap();
            Address::from_ptr(slot.as_ref().unwrap().as_ptr())
        };
        assert!(detector.allocation_resolve_results(address).is_some());

        let in_hook = Arc::clone(&held);
        let hook = detector
            .set_report_hook(move |_| {
                in_hook.lock().unwrap().take();
                true
            })
            .unwrap();
        assert!(detector.report_thread_leaks(ThreadId::current()) > 0);
        detector.remove_report_hook(hook);

        assert!(held.lock().unwrap().is_none());
        assert!(detector.allocation_resolve_results(address).is_none());
        detector.leaks_count();
    }

    #[test]
    fn test_reallocated_block_keeps_its_contents() {
        let _serial = serial();
        let guard = quiet_global().build_global();
        let detector = guard.detector();

        let mut grown = vec![3u16; 10];
        let before = Address::from_ptr(grown.as_ptr());
        grown.reserve_exact(10_000);
        let after = Address::from_ptr(grown.as_ptr());

        assert!(grown.iter().all(|&v| v == 3));
        assert_ne!(before, after);
        assert!(detector.allocation_resolve_results(after).is_some());
    }

    #[cfg(target_os = "linux")]
    mod process_image {
        use super::*;
        use leakpath::{LoadedModule, ModuleEnumerator};
        use std::path::PathBuf;

        /// The test executable's mapped range, read from `/proc/self/maps`.
        struct ProcessImage(PathBuf);

        impl ModuleEnumerator for ProcessImage {
            fn loaded_modules(&self) -> Vec<LoadedModule> {
                let maps = std::fs::read_to_string("/proc/self/maps").unwrap_or_default();
                let path = self.0.to_string_lossy();
                let ranges: Vec<(usize, usize)> = maps
                    .lines()
                    .filter(|line| line.split_whitespace().nth(5) == Some(path.as_ref()))
                    .filter_map(|line| {
                        let (low, high) = line.split_whitespace().next()?.split_once('-')?;
                        Some((
                            usize::from_str_radix(low, 16).ok()?,
                            usize::from_str_radix(high, 16).ok()?,
                        ))
                    })
                    .collect();
                let (Some(base), Some(end)) = (
                    ranges.iter().map(|r| r.0).min(),
                    ranges.iter().map(|r| r.1).max(),
                ) else {
                    return Vec::new();
                };
                vec![LoadedModule {
                    base,
                    size: end - base,
                    path: self.0.clone(),
                    imports_detector: false,
                }]
            }
        }

        #[test]
        fn test_excluded_executable_is_not_tracked() {
            let _serial = serial();
            let exe = std::env::current_exe().unwrap();
            let name = exe.file_name().unwrap().to_string_lossy().to_lowercase();
            let guard = quiet_global()
                .module_enumerator(Box::new(ProcessImage(exe)))
                .modules(&name, false)
                .build_global();
            let detector = guard.detector();

            let modules = detector.modules();
            assert_eq!(modules.len(), 1);
            assert!(modules[0].excluded);

            let skipped = Box::new([3u8; 200]);
            assert!(detector
                .allocation_resolve_results(Address::from_ptr(skipped.as_ptr()))
                .is_none());

            assert!(detector.enable_module(modules[0].low));
            let tracked = Box::new([4u8; 200]);
            assert!(detector
                .allocation_resolve_results(Address::from_ptr(tracked.as_ptr()))
                .is_some());
        }
    }
}
