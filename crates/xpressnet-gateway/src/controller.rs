//! The capability interface between the dispatcher and whatever is on the
//! other end of it: the Elite over a serial link, or a mock with no
//! hardware at all. Both are selected at construction and honour the same
//! contract, so the dispatcher never knows which one it is driving.

use std::collections::HashMap;

use crossbeam_channel::Sender;
use tracing::debug;
use xpressnet::{
    command,
    loco::{Direction, FunctionBank, FunctionGroup, LocoAddress},
    reply::{Reply, StationStatus},
};

use crate::{
    error::GatewayError,
    transport::{Connection, SerialTransport, TransportEvent},
};

pub trait Controller: Send {
    fn throttle(
        &mut self,
        addr: LocoAddress,
        speed: u8,
        direction: Direction,
    ) -> Result<(), GatewayError>;
    /// The Elite has no single-loco emergency stop; stopping is a plain
    /// zero-speed throttle in the current direction.
    fn stop(&mut self, addr: LocoAddress, direction: Direction) -> Result<(), GatewayError>;
    /// `value` is the full group byte, already updated by the state store.
    fn function(
        &mut self,
        addr: LocoAddress,
        group: FunctionGroup,
        value: u8,
    ) -> Result<(), GatewayError>;
    /// Issues the two-frame state query; the replies come back addressless
    /// through the event channel.
    fn request_state(&mut self, addr: LocoAddress) -> Result<(), GatewayError>;
    fn accessory(&mut self, addr: u16, direction: Direction) -> Result<(), GatewayError>;
    fn status(&mut self) -> Result<(), GatewayError>;
    fn version(&mut self) -> Result<(), GatewayError>;
    fn emergency_off(&mut self) -> Result<(), GatewayError>;
    fn resume_normal_operations(&mut self) -> Result<(), GatewayError>;
    fn is_connected(&self) -> bool;
    /// Periodic upkeep from the dispatcher tick (reconnects, for the real
    /// controller).
    fn maintain(&mut self) {}
    fn close(&mut self) {}
}

/// Drives the Elite through the serial transport.
pub struct RealController {
    transport: SerialTransport,
}

impl RealController {
    pub fn new(transport: SerialTransport) -> Self {
        Self { transport }
    }
}

impl Controller for RealController {
    fn throttle(
        &mut self,
        addr: LocoAddress,
        speed: u8,
        direction: Direction,
    ) -> Result<(), GatewayError> {
        self.transport.send(&command::throttle(addr, speed, direction)?)
    }

    fn stop(&mut self, addr: LocoAddress, direction: Direction) -> Result<(), GatewayError> {
        self.transport.send(&command::throttle(addr, 0, direction)?)
    }

    fn function(
        &mut self,
        addr: LocoAddress,
        group: FunctionGroup,
        value: u8,
    ) -> Result<(), GatewayError> {
        self.transport.send(&command::function(addr, group, value))
    }

    fn request_state(&mut self, addr: LocoAddress) -> Result<(), GatewayError> {
        let (part_a, part_b) = command::state_request(addr);
        self.transport.send(&part_a)?;
        self.transport.send(&part_b)
    }

    fn accessory(&mut self, addr: u16, direction: Direction) -> Result<(), GatewayError> {
        self.transport.send(&command::accessory(addr, direction)?)
    }

    fn status(&mut self) -> Result<(), GatewayError> {
        self.transport.send(&command::get_status())
    }

    fn version(&mut self) -> Result<(), GatewayError> {
        self.transport.send(&command::get_version())
    }

    fn emergency_off(&mut self) -> Result<(), GatewayError> {
        self.transport.send(&command::emergency_off())
    }

    fn resume_normal_operations(&mut self) -> Result<(), GatewayError> {
        self.transport.send(&command::resume_normal_operations())
    }

    fn is_connected(&self) -> bool {
        self.transport.status() == Connection::Connected
    }

    fn maintain(&mut self) {
        self.transport.maybe_reconnect();
    }

    fn close(&mut self) {
        self.transport.close();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MockLoco {
    speed: u8,
    direction: Direction,
    bank: FunctionBank,
}

/// Hardware-free stand-in. Commands mutate its private model of the layout
/// and the equivalent decoder events are pushed into the same channel the
/// serial reader would use, so the dispatch/state/broadcast path is
/// exercised identically.
pub struct MockController {
    events: Sender<TransportEvent>,
    locos: HashMap<u16, MockLoco>,
    accessories: HashMap<u16, Direction>,
}

impl MockController {
    /// Version byte reported for the pretend station, rendered as "1.41".
    pub const VERSION: u8 = 141;

    pub fn new(events: Sender<TransportEvent>) -> Self {
        Self { events, locos: HashMap::new(), accessories: HashMap::new() }
    }

    fn emit(&self, reply: Reply) {
        let _ = self.events.send(TransportEvent::Reply { reply, raw: None });
    }

    fn loco_mut(&mut self, addr: LocoAddress) -> &mut MockLoco {
        self.locos.entry(addr.value()).or_default()
    }
}

impl Controller for MockController {
    fn throttle(
        &mut self,
        addr: LocoAddress,
        speed: u8,
        direction: Direction,
    ) -> Result<(), GatewayError> {
        if speed > command::MAX_SPEED {
            return Err(xpressnet::EncodeError::Speed(speed).into());
        }
        let loco = self.loco_mut(addr);
        loco.speed = speed;
        loco.direction = direction;
        self.emit(Reply::ThrottleUpdate { addr, speed, direction });
        Ok(())
    }

    fn stop(&mut self, addr: LocoAddress, direction: Direction) -> Result<(), GatewayError> {
        self.throttle(addr, 0, direction)
    }

    fn function(
        &mut self,
        addr: LocoAddress,
        group: FunctionGroup,
        value: u8,
    ) -> Result<(), GatewayError> {
        let loco = self.loco_mut(addr);
        loco.bank.set_group(group, value);
        // Only F0..F12 have an unsolicited status frame; the high groups
        // become visible on the next state request, as on real hardware.
        if matches!(group, FunctionGroup::G0 | FunctionGroup::G1 | FunctionGroup::G2) {
            let low = loco.bank.low();
            self.emit(Reply::FunctionUpdate { addr, low });
        }
        Ok(())
    }

    fn request_state(&mut self, addr: LocoAddress) -> Result<(), GatewayError> {
        let loco = *self.loco_mut(addr);
        self.emit(Reply::StateReplyA {
            speed: loco.speed,
            direction: loco.direction,
            low: loco.bank.low(),
        });
        self.emit(Reply::StateReplyB { high: loco.bank.high() });
        Ok(())
    }

    fn accessory(&mut self, addr: u16, direction: Direction) -> Result<(), GatewayError> {
        if addr > command::MAX_ACCESSORY_ADDR {
            return Err(xpressnet::EncodeError::AccessoryAddress(addr).into());
        }
        debug!(addr, %direction, "mock accessory command");
        self.accessories.insert(addr, direction);
        Ok(())
    }

    fn status(&mut self) -> Result<(), GatewayError> {
        self.emit(Reply::StationStatus(StationStatus::empty()));
        Ok(())
    }

    fn version(&mut self) -> Result<(), GatewayError> {
        self.emit(Reply::Identification { version: Self::VERSION });
        Ok(())
    }

    fn emergency_off(&mut self) -> Result<(), GatewayError> {
        self.emit(Reply::EmergencyOff);
        Ok(())
    }

    fn resume_normal_operations(&mut self) -> Result<(), GatewayError> {
        self.emit(Reply::NormalOperationsResumed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn addr(a: u16) -> LocoAddress {
        LocoAddress::new(a).expect("valid address")
    }

    #[test]
    fn mock_round_trips_a_throttle() {
        let (tx, rx) = unbounded();
        let mut mock = MockController::new(tx);
        mock.throttle(addr(3), 40, Direction::Forward).expect("throttle");
        let ev = rx.try_recv().expect("event");
        assert_eq!(
            ev,
            TransportEvent::Reply {
                reply: Reply::ThrottleUpdate {
                    addr: addr(3),
                    speed: 40,
                    direction: Direction::Forward
                },
                raw: None,
            }
        );
    }

    #[test]
    fn mock_state_request_reflects_prior_commands() {
        let (tx, rx) = unbounded();
        let mut mock = MockController::new(tx);
        mock.throttle(addr(5), 21, Direction::Forward).expect("throttle");
        let mut bank = FunctionBank::new();
        let (group, value) = bank.set(15, true).expect("valid function");
        mock.function(addr(5), group, value).expect("function");

        // Drain the throttle echo; F15 is in a high group, so no function
        // frame is synthesized for it.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        mock.request_state(addr(5)).expect("state request");
        let TransportEvent::Reply { reply: Reply::StateReplyA { speed, direction, .. }, .. } =
            rx.try_recv().expect("part A")
        else {
            panic!("expected state reply part A");
        };
        assert_eq!(speed, 21);
        assert_eq!(direction, Direction::Forward);
        let TransportEvent::Reply { reply: Reply::StateReplyB { high }, .. } =
            rx.try_recv().expect("part B")
        else {
            panic!("expected state reply part B");
        };
        assert!(high.get(15));
        assert!(!high.get(16));
    }

    #[test]
    fn mock_rejects_out_of_range_arguments() {
        let (tx, rx) = unbounded();
        let mut mock = MockController::new(tx);
        assert!(mock.throttle(addr(3), 128, Direction::Forward).is_err());
        assert!(mock.accessory(2000, Direction::Forward).is_err());
        assert!(rx.try_recv().is_err(), "rejected commands must not emit events");
    }
}
