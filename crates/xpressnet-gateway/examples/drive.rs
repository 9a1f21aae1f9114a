//! Smoke-drives the controller interface without hardware: version and
//! status queries, a few function toggles and an accessory throw, printing
//! every event the station side would have produced.

use crossbeam_channel::unbounded;
use xpressnet::loco::{Direction, FunctionBank, LocoAddress};
use xpressnet_gateway::controller::{Controller, MockController};

fn main() {
    let (events_tx, events_rx) = unbounded();
    let mut controller = MockController::new(events_tx);

    controller.version().expect("version query");
    controller.status().expect("status query");

    let train = LocoAddress::new(103).expect("valid address");
    let mut bank = FunctionBank::new();

    controller.throttle(train, 40, Direction::Forward).expect("throttle");

    for (function, on) in [(1, true), (2, true), (2, false), (1, false)] {
        let (group, value) = bank.set(function, on).expect("valid function");
        controller.function(train, group, value).expect("function");
    }

    controller.accessory(5, Direction::Forward).expect("accessory");
    controller.accessory(5, Direction::Reverse).expect("accessory");

    controller.request_state(train).expect("state request");
    controller.stop(train, Direction::Forward).expect("stop");

    while let Ok(event) = events_rx.try_recv() {
        println!("{event:?}");
    }
}
