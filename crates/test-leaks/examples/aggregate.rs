use eyre::Result;
use leakpath::{DetectorBuilder, LeakTrackingAllocator, ReportOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: LeakTrackingAllocator = LeakTrackingAllocator;

#[inline(never)]
fn leak_node(id: u64) {
    let node = Box::new([id; 4]);
    std::mem::forget(node);
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leakpath=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    println!("aggregate example");

    let guard = DetectorBuilder::from_env()
        .aggregate_duplicates(true)
        .max_data_dump(0)
        .report_options(ReportOptions {
            debugger: false,
            stdout: true,
            ..ReportOptions::default()
        })
        .build_global();

    for id in 0..5 {
        leak_node(id);
    }

    let report = guard.detector().leak_report(leakpath::ThreadFilter::All);
    let largest = report.entries.iter().map(|e| e.count).max().unwrap_or(0);
    println!("largest group: {largest}");
    Ok(())
}
