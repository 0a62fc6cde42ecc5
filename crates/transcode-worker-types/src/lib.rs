//! Wire types shared by the transcode worker and whatever drives it.
//!
//! Uses JSON Lines (one JSON object per line) over stdin/stdout pipes.

mod buffer;
pub mod messages;

pub use messages::{InboundMessage, ProgressEvent, Response, TranscodeOutput};
