//! Gateway between socket clients and a Hornby Elite command station.
//!
//! Clients send JSON actions as whole text messages; the gateway encodes
//! them as XpressNet frames on the serial link, decodes the station's
//! replies, keeps a cached model of every known locomotive and accessory,
//! and fans state updates out to all connected clients.
//!
//! One thread blocks on the serial port and feeds decoded replies into a
//! channel. Everything else (client I/O, command encoding, state updates,
//! broadcasts, reconnect supervision) runs cooperatively on the single
//! [`dispatcher::Dispatcher`] loop.

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod envelope;
mod error;
pub mod net;
mod repeater;
pub mod state;
pub mod transport;

pub use error::GatewayError;
pub use repeater::Repeater;
