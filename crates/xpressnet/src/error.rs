use thiserror::Error;

/// Argument validation failures raised by the command builders.
///
/// A frame is never constructed, let alone transmitted, when one of these is
/// returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("locomotive address {0} outside 1..=9999")]
    LocoAddress(u16),
    #[error("speed step {0} outside 0..=127")]
    Speed(u8),
    #[error("function number {0} outside 0..=28")]
    Function(u8),
    #[error("accessory address {0} outside 0..=1023")]
    AccessoryAddress(u16),
}

/// Recoverable byte-stream faults reported by the framer.
///
/// Both variants discard exactly one byte, so recovery after a desync is
/// bounded by the longest frame the protocol defines.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("implausible header {header:#04x} implies a {implied}-byte frame")]
    ImplausibleHeader { header: u8, implied: usize },
    #[error("checksum mismatch on {header:#04x} frame: got {got:#04x}, computed {computed:#04x}")]
    Checksum { header: u8, got: u8, computed: u8 },
}
