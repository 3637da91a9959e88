use std::io;

use thiserror::Error;

/// Start-up failures of a recording. Everything that goes wrong after the
/// output file is open is logged and absorbed instead: segment errors never
/// stop playlist polling, and playlist errors stop polling but let in-flight
/// writes drain.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid playlist URL `{0}`")]
    InvalidUrl(String),

    #[error("failed to open output file `{path}`: {source}")]
    OpenOutput {
        path: String,
        #[source]
        source: io::Error,
    },
}
