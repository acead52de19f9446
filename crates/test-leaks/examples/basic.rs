use eyre::Result;
use leakpath::{DetectorBuilder, LeakTrackingAllocator, ReportOptions};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: LeakTrackingAllocator = LeakTrackingAllocator;

#[inline(never)]
fn leak_buffer(len: usize) -> &'static mut [u8] {
    let buffer = vec![0xABu8; len];
    Box::leak(buffer.into_boxed_slice())
}

#[inline(never)]
fn scratch_work() {
    let scratch = vec![1u32; 32];
    std::hint::black_box(&scratch);
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leakpath=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    info!("starting");
    println!("basic example");

    let guard = DetectorBuilder::from_env()
        .max_data_dump(16)
        .report_options(ReportOptions {
            debugger: false,
            stdout: true,
            ..ReportOptions::default()
        })
        .build_global();

    let leaked = leak_buffer(64);
    std::hint::black_box(&leaked);
    scratch_work();

    println!("leaks before exit: {}", guard.detector().leaks_count());
    Ok(())
}
