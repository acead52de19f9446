use std::path::PathBuf;

/// Errors surfaced by the detector outside the tracked-allocation hot path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("thread-local storage for the detector could not be allocated")]
    ThreadSlotExhausted,

    #[error("couldn't open report file for writing: {}", path.display())]
    ReportFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install interception in {module}: {reason}")]
    Interceptor { module: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
