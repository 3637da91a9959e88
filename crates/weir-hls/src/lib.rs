//! HLS recording: the playlist polling engine and the stream writer that
//! appends downloaded segments to one transport-stream file in strict
//! sequence order.

mod error;
mod playlist;
mod writer;

pub use error::RecordError;
pub use playlist::Recorder;
pub use writer::{FetchTarget, StreamWriter};
