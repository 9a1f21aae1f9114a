use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::unbounded;
use serde_json::{Value, json};
use xpressnet_gateway::{
    controller::{MockController, RealController},
    dispatcher::Dispatcher,
    net::SocketServer,
    transport::{Link, LinkOpener, SerialTransport},
};

struct Gateway {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Gateway {
    fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().expect("dispatcher thread panicked");
    }
}

fn start_mock_gateway() -> Gateway {
    let server = SocketServer::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
        .expect("failed to bind test listener");
    let addr = server.local_addr().expect("failed to fetch listener addr");
    let (events_tx, events_rx) = unbounded();
    let controller = Box::new(MockController::new(events_tx));
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        Dispatcher::new(controller, server, events_rx, thread_stop).run();
    });
    Gateway { addr, stop, handle }
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("failed to connect to gateway");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("failed to set read timeout");
        let writer = stream.try_clone().expect("failed to clone stream");
        Self { reader: BufReader::new(stream), writer }
    }

    fn send(&mut self, action: &Value) {
        let mut line = action.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).expect("failed to send action");
    }

    fn recv(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("failed to read gateway message");
        serde_json::from_str(line.trim_end()).expect("gateway sent invalid JSON")
    }

    /// Skips interleaved broadcasts until a message with the wanted
    /// `message` (or `type`) field arrives.
    fn recv_named(&mut self, name: &str) -> Value {
        for _ in 0..20 {
            let v = self.recv();
            if v["message"] == name || v["type"] == name {
                return v;
            }
        }
        panic!("never received a {name:?} message");
    }
}

#[test]
fn mock_gateway_round_trips_client_actions() {
    let gateway = start_mock_gateway();
    let mut client = Client::connect(gateway.addr);

    let status = client.recv_named("SocketStatus");
    assert_eq!(status["data"]["Clients"], 1);
    assert_eq!(status["data"]["Controller_Connected"], true);

    client.send(&json!({
        "action": "throttle", "train_number": 3, "speed": 40, "direction": 1,
    }));
    let update = client.recv_named("Loco Speed/Direction Status");
    assert_eq!(update["status_code"], 200);
    assert_eq!(update["action"], "throttle");
    assert_eq!(update["data"]["train_number"], 3);
    assert_eq!(update["data"]["speed"], 40);
    assert_eq!(update["data"]["direction"], "Forward");

    client.send(&json!({
        "action": "function", "train_number": 3, "function_id": 0, "switch": 1,
    }));
    let functions = client.recv_named("Loco Function Status");
    assert_eq!(functions["data"]["functions"]["0"], true);
    assert_eq!(functions["data"]["functions"]["1"], false);

    client.send(&json!({ "action": "getState", "train_number": 3 }));
    let state = client.recv_named("Loco State");
    assert_eq!(state["data"]["train_number"], 3);
    assert_eq!(state["data"]["speed"], 40);
    assert_eq!(state["data"]["direction"], "Forward");
    assert_eq!(state["data"]["functions"]["0"], true);
    assert_eq!(state["data"]["functions"]["28"], false);

    gateway.shutdown();
}

#[test]
fn state_requests_queue_one_at_a_time() {
    let gateway = start_mock_gateway();
    let mut client = Client::connect(gateway.addr);
    client.recv_named("SocketStatus");

    client.send(&json!({ "action": "throttle", "train_number": 5, "speed": 10, "direction": 0 }));
    client.recv_named("Loco Speed/Direction Status");

    // Both requests in one burst; the second must wait for the first
    // reply pair, then complete.
    client.send(&json!({ "action": "getState", "train_number": 5 }));
    client.send(&json!({ "action": "getState", "train_number": 5 }));

    let first = client.recv_named("Loco State");
    assert_eq!(first["data"]["speed"], 10);
    let second = client.recv_named("Loco State");
    assert_eq!(second["data"]["speed"], 10);
    assert_eq!(second["data"]["direction"], "Reverse");

    gateway.shutdown();
}

#[test]
fn accessory_state_cache_round_trips() {
    let gateway = start_mock_gateway();
    let mut client = Client::connect(gateway.addr);
    client.recv_named("SocketStatus");

    client.send(&json!({
        "action": "setAccessoryState", "accessory_id": 4, "state": {"direction": "FORWARD"},
    }));
    let echo = client.recv_named("accessoryState");
    assert_eq!(echo["accessory_id"], 4);
    assert_eq!(echo["state"]["direction"], "FORWARD");

    client.send(&json!({ "action": "getAccessoryState", "accessory_id": 4 }));
    let cached = client.recv_named("accessoryState");
    assert_eq!(cached["state"]["direction"], "FORWARD");

    client.send(&json!({ "action": "getAccessoryStates" }));
    let all = client.recv_named("accessoryStates");
    assert_eq!(all["accessories"]["4"]["direction"], "FORWARD");

    gateway.shutdown();
}

#[test]
fn controller_status_and_unknown_actions_answer_the_sender() {
    let gateway = start_mock_gateway();
    let mut client = Client::connect(gateway.addr);
    client.recv_named("SocketStatus");

    client.send(&json!({ "action": "controller_status" }));
    let status = client.recv_named("controller_status");
    assert_eq!(status["status"], "online");

    client.send(&json!({ "action": "teleport", "train_number": 3 }));
    let rejected = client.recv_named("Unknown action");
    assert_eq!(rejected["status_code"], 400);

    client.send(&json!({ "action": "throttle", "train_number": 3, "speed": 400, "direction": 1 }));
    let invalid = client.recv_named("Missing or invalid speed");
    assert_eq!(invalid["status_code"], 400);

    gateway.shutdown();
}

/// Serial stand-in that answers a state request: the writer counts the two
/// query frames, then the reader releases the (addressless) reply pair.
struct AnsweringReader {
    release: crossbeam_channel::Receiver<()>,
    payload: Vec<u8>,
    sent: bool,
}

impl Read for AnsweringReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.sent && self.release.recv_timeout(Duration::from_millis(50)).is_ok() {
            self.sent = true;
            buf[..self.payload.len()].copy_from_slice(&self.payload);
            return Ok(self.payload.len());
        }
        if self.sent {
            thread::sleep(Duration::from_millis(50));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
    }
}

struct CountingWriter {
    writes: usize,
    release: crossbeam_channel::Sender<()>,
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes += 1;
        // The state query is two frames; answer once both have gone out.
        if self.writes == 2 {
            let _ = self.release.send(());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn addressless_state_replies_correlate_to_the_requested_address() {
    let server = SocketServer::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
        .expect("failed to bind test listener");
    let addr = server.local_addr().expect("failed to fetch listener addr");
    let (events_tx, events_rx) = unbounded();

    // Speed 0x15 forward with no functions, then empty F13..F28.
    let mut payload = vec![0xE4, 0x00, 0x95, 0x00, 0x00, 0x71];
    payload.extend([0xE3, 0x08, 0x00, 0x00, 0xEB]);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let link = std::sync::Mutex::new(Some((release_rx, payload)));
    let opener: LinkOpener = Box::new(move || {
        let Some((release, payload)) = link.lock().expect("link lock").take() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        };
        Ok(Link {
            reader: Box::new(AnsweringReader { release, payload, sent: false }),
            writer: Box::new(CountingWriter { writes: 0, release: release_tx.clone() }),
        })
    });
    let transport = SerialTransport::new(opener, Duration::ZERO, events_tx);
    let controller = Box::new(RealController::new(transport));
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        Dispatcher::new(controller, server, events_rx, thread_stop).run();
    });
    let gateway = Gateway { addr, stop, handle };

    let mut client = Client::connect(gateway.addr);
    for _ in 0..20 {
        let status = client.recv_named("SocketStatus");
        if status["data"]["Controller_Connected"] == true {
            break;
        }
    }

    client.send(&json!({ "action": "getState", "train_number": 5 }));
    let state = client.recv_named("Loco State");
    assert_eq!(state["data"]["train_number"], 5);
    assert_eq!(state["data"]["speed"], 0x15);
    assert_eq!(state["data"]["direction"], "Forward");
    assert_eq!(state["data"]["functions"]["0"], false);
    assert_eq!(state["debug"], "E3080000EB");

    gateway.shutdown();
}

/// A link that opens fine but never produces a byte, like a station that
/// went quiet: state requests must expire and notify the requester.
struct SilentReader;

impl Read for SilentReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(Duration::from_millis(50));
        Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
    }
}

#[test]
fn state_request_times_out_on_a_silent_station() {
    let server = SocketServer::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
        .expect("failed to bind test listener");
    let addr = server.local_addr().expect("failed to fetch listener addr");
    let (events_tx, events_rx) = unbounded();
    let opener: LinkOpener = Box::new(|| {
        Ok(Link { reader: Box::new(SilentReader), writer: Box::new(io::sink()) })
    });
    let transport = SerialTransport::new(opener, Duration::ZERO, events_tx);
    let controller = Box::new(RealController::new(transport));
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let handle = thread::spawn(move || {
        Dispatcher::new(controller, server, events_rx, thread_stop).run();
    });
    let gateway = Gateway { addr, stop, handle };

    let mut client = Client::connect(gateway.addr);
    // The serial link comes up on the first supervision tick; wait until
    // the gateway reports the station connected before asking it anything.
    for _ in 0..20 {
        let status = client.recv_named("SocketStatus");
        if status["data"]["Controller_Connected"] == true {
            break;
        }
    }

    client.send(&json!({ "action": "getState", "train_number": 7 }));
    let timeout = client.recv_named("Loco state request timed out");
    assert_eq!(timeout["status_code"], 504);
    assert_eq!(timeout["data"]["train_number"], 7);

    gateway.shutdown();
}
