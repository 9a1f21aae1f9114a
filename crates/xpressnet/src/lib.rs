//! XpressNet protocol engine for the Hornby Elite command station.
//!
//! Pure encode/decode: frame discipline in [`frame`], outgoing command
//! builders in [`command`], inbound classification in [`reply`], and the
//! shared locomotive wire encodings in [`loco`]. No I/O happens here; the
//! gateway crate owns the serial line and the concurrency around it.

pub mod command;
mod error;
pub mod frame;
pub mod loco;
pub mod reply;

pub use error::{EncodeError, FrameError};
