mod server;
mod stream;

pub use server::{SocketEvent, SocketServer};
pub use stream::{ClientStream, ConnState, OverflowPolicy};
