//! Builders for every frame the gateway sends to the command station.
//!
//! Each builder validates its arguments and returns a complete wire frame,
//! checksum included. Nothing here performs I/O.

use crate::{
    error::EncodeError,
    frame,
    loco::{Direction, FunctionGroup, LocoAddress},
};

pub const MAX_SPEED: u8 = 127;
pub const MAX_ACCESSORY_ADDR: u16 = 1023;

/// Software version query.
pub fn get_version() -> Vec<u8> {
    frame::seal(vec![0x21, 0x21])
}

/// Command station status query.
pub fn get_status() -> Vec<u8> {
    frame::seal(vec![0x21, 0x24])
}

/// Cuts track power everywhere.
pub fn emergency_off() -> Vec<u8> {
    frame::seal(vec![0x21, 0x80])
}

pub fn resume_normal_operations() -> Vec<u8> {
    frame::seal(vec![0x21, 0x81])
}

/// Speed/direction operation. The direction rides on bit 7 of the speed
/// byte.
pub fn throttle(
    addr: LocoAddress,
    speed: u8,
    direction: Direction,
) -> Result<Vec<u8>, EncodeError> {
    if speed > MAX_SPEED {
        return Err(EncodeError::Speed(speed));
    }
    let [hi, lo] = addr.to_wire();
    Ok(frame::seal(vec![0xE4, 0x13, hi, lo, speed | direction.bit()]))
}

/// Function-group operation. `value` is the full group byte, taken from the
/// caller's cached [`crate::loco::FunctionBank`] after the commanded bit was
/// applied.
pub fn function(addr: LocoAddress, group: FunctionGroup, value: u8) -> Vec<u8> {
    let [hi, lo] = addr.to_wire();
    frame::seal(vec![0xE4, group.header(), hi, lo, value])
}

/// The two-frame state query. Part A answers with speed/direction and
/// F0..F12 (0xE4), part B with F13..F28 (0xE3); neither reply carries the
/// address, so the caller must correlate.
pub fn state_request(addr: LocoAddress) -> (Vec<u8>, Vec<u8>) {
    let [hi, lo] = addr.to_wire();
    (
        frame::seal(vec![0xE3, 0x00, hi, lo]),
        frame::seal(vec![0xE3, 0x08, hi, lo]),
    )
}

/// Accessory (turnout) activation. Output 2 is forward on the Elite,
/// output 1 reverse.
pub fn accessory(addr: u16, direction: Direction) -> Result<Vec<u8>, EncodeError> {
    if addr > MAX_ACCESSORY_ADDR {
        return Err(EncodeError::AccessoryAddress(addr));
    }
    let module = (addr / 4) as u8;
    let output = match direction {
        Direction::Forward => 0x81,
        Direction::Reverse => 0x80,
    };
    Ok(frame::seal(vec![0x52, module, output | (((addr % 4) as u8) << 1)]))
}
