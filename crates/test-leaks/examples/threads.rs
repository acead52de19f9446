use eyre::Result;
use leakpath::{DetectorBuilder, LeakDetector, LeakTrackingAllocator, ReportOptions, ThreadId};
use std::thread;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: LeakTrackingAllocator = LeakTrackingAllocator;

const NUM_THREADS: usize = 4;

#[inline(never)]
fn leak_record(index: usize) {
    std::mem::forget(vec![index as u8; 48]);
}

fn worker(detector: &LeakDetector, index: usize) -> usize {
    // the last worker opts out of detection
    let quiet = index == NUM_THREADS - 1;
    if quiet {
        detector.disable_leak_detection();
    }
    leak_record(index);
    let leaks = detector.thread_leaks_count(ThreadId::current());
    if quiet {
        detector.restore_leak_detection_state();
    }
    leaks
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leakpath=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    println!("threads example");

    let guard = DetectorBuilder::from_env()
        .max_data_dump(0)
        .report_options(ReportOptions {
            debugger: false,
            stdout: true,
            ..ReportOptions::default()
        })
        .build_global();

    let counts = thread::scope(|scope| {
        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|index| {
                let detector = guard.detector();
                scope.spawn(move || worker(detector, index))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(usize::MAX))
            .collect::<Vec<_>>()
    });

    for (index, leaks) in counts.iter().enumerate() {
        println!("thread {index} leaks: {leaks}");
    }
    Ok(())
}
