//! Classification of inbound frames into semantic events.
//!
//! Frames arrive already length-sliced and checksum-verified by the framer;
//! decoding is total and anything unrecognized is preserved verbatim as
//! [`Reply::Unknown`].

use bitflags::bitflags;

use crate::loco::{Direction, HighFunctions, LocoAddress, LowFunctions};

bitflags! {
    /// Condition bits of the command-station status byte. An empty set
    /// means the station is ready.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StationStatus: u8 {
        const EMERGENCY_OFF = 0x01;
        const EMERGENCY_STOP = 0x02;
        const AUTO_START = 0x04;
        const SERVICE_MODE = 0x08;
        const POWERING_UP = 0x40;
        const RAM_CHECK_ERROR = 0x80;
    }
}

impl StationStatus {
    pub fn is_ready(self) -> bool {
        self.is_empty()
    }
}

/// A decoded reply frame.
///
/// The two state-reply halves carry no address on the wire; correlating
/// them with the most recent state request is the dispatcher's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    ThrottleUpdate { addr: LocoAddress, speed: u8, direction: Direction },
    FunctionUpdate { addr: LocoAddress, low: LowFunctions },
    StateReplyA { speed: u8, direction: Direction, low: LowFunctions },
    StateReplyB { high: HighFunctions },
    StationStatus(StationStatus),
    /// Raw version byte; `V / 100` with two decimals is the displayed form.
    Identification { version: u8 },
    TrackPowerOff,
    NormalOperationsResumed,
    EmergencyOff,
    ServiceMode,
    Ack,
    TransmissionError,
    Busy,
    Unsupported,
    Unknown(Vec<u8>),
}

/// Classifies one complete frame.
pub fn decode(frame: &[u8]) -> Reply {
    match frame {
        [0xE5, 0xF9, hi, lo, g0, f5_12, _] => Reply::FunctionUpdate {
            addr: LocoAddress::from_wire(*hi, *lo),
            low: LowFunctions::new(*g0, *f5_12),
        },
        // Byte 4 is unused by the Elite; speed/direction rides at byte 5.
        [0xE5, 0xF8, hi, lo, _, sd, _] => Reply::ThrottleUpdate {
            addr: LocoAddress::from_wire(*hi, *lo),
            speed: sd & 0x7F,
            direction: Direction::from_wire(*sd),
        },
        [0xE4, _, sd, g0, f5_12, _] => Reply::StateReplyA {
            speed: sd & 0x7F,
            direction: Direction::from_wire(*sd),
            low: LowFunctions::new(*g0, *f5_12),
        },
        [0xE3, _, g3, g4, _] => Reply::StateReplyB { high: HighFunctions::new(*g3, *g4) },
        [0x62, 0x22, s, _] => Reply::StationStatus(StationStatus::from_bits_truncate(*s)),
        [0x63, 0x21, v, _, _] => Reply::Identification { version: *v },
        [0x61, 0x00, _] => Reply::TrackPowerOff,
        [0x61, 0x01, _] => Reply::NormalOperationsResumed,
        [0x61, 0x02, _] => Reply::ServiceMode,
        [0x61, 0x80, _] => Reply::TransmissionError,
        [0x61, 0x81, _] => Reply::Busy,
        [0x61, 0x82, _] => Reply::Unsupported,
        [0x81, 0x00, _] => Reply::EmergencyOff,
        [0x01, 0x04, _] => Reply::Ack,
        other => Reply::Unknown(other.to_vec()),
    }
}
