use eyre::Result;
use leakpath::{DetectorBuilder, Format, LeakTrackingAllocator, ReportOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: LeakTrackingAllocator = LeakTrackingAllocator;

struct Session {
    name: String,
    payload: Vec<u8>,
}

#[inline(never)]
fn open_session() -> &'static Session {
    Box::leak(Box::new(Session {
        name: "session".to_string(),
        payload: vec![7u8; 100],
    }))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("leakpath=warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let _guard = DetectorBuilder::from_env()
        .format(Format::Json)
        .max_data_dump(8)
        .report_options(ReportOptions {
            debugger: true,
            stdout: false,
            ..ReportOptions::default()
        })
        .build_global();

    let session = open_session();
    std::hint::black_box((&session.name, &session.payload));
    Ok(())
}
