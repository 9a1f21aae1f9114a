//! The dispatcher: one cooperative loop that owns everything except the
//! blocking serial read.
//!
//! Each pass polls the client sockets, drains the transport event channel
//! in wire arrival order, and services the supervision ticks. A broadcast
//! produced by one event is queued to every subscriber before the next
//! event is taken, and state-store updates happen on this thread only, so
//! the ordering guarantees fall out of the loop structure rather than
//! locking.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::Receiver;
use mio::Token;
use serde_json::Value;
use tracing::{debug, info, warn};
use xpressnet::{
    loco::{Direction, LocoAddress, LowFunctions},
    reply::Reply,
};

use crate::{
    controller::Controller,
    envelope::{self, ActionRequest, to_hex},
    error::GatewayError,
    net::{SocketEvent, SocketServer},
    repeater::Repeater,
    state::StateStore,
    transport::TransportEvent,
};

pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
pub const STATE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_TIMEOUT: Duration = Duration::from_millis(25);

/// Progress of the two-frame state exchange. The replies carry no address,
/// so at most one request may be on the wire; the rest wait in a FIFO.
#[derive(Debug, Default)]
enum StatePhase {
    #[default]
    Idle,
    AwaitingA,
    /// Part A has arrived; its payload is parked here until part B
    /// completes the pair.
    AwaitingB { speed: u8, direction: Direction, low: LowFunctions },
}

#[derive(Debug, Default)]
struct StateRequestTracker {
    phase: StatePhase,
    requester: Option<Token>,
    deadline: Option<Instant>,
    queue: VecDeque<(LocoAddress, Token)>,
}

impl StateRequestTracker {
    fn is_idle(&self) -> bool {
        matches!(self.phase, StatePhase::Idle)
    }

    fn begin(&mut self, requester: Token) {
        self.phase = StatePhase::AwaitingA;
        self.requester = Some(requester);
        self.deadline = Some(Instant::now() + STATE_REQUEST_TIMEOUT);
    }

    fn cancel(&mut self) {
        self.phase = StatePhase::Idle;
        self.requester = None;
        self.deadline = None;
    }

    fn timed_out(&self) -> bool {
        !self.is_idle() && self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Client-side happenings collected out of one socket poll, owned so the
/// server borrow is released before the handlers run.
enum ClientInput {
    Joined(Token),
    Left(Token),
    Message(Token, String),
}

pub struct Dispatcher {
    controller: Box<dyn Controller>,
    store: StateStore,
    server: SocketServer,
    events: Receiver<TransportEvent>,
    tracker: StateRequestTracker,
    reconnect: Repeater,
    stop: Arc<AtomicBool>,
    last_client_count: usize,
    scratch: Vec<ClientInput>,
}

impl Dispatcher {
    pub fn new(
        controller: Box<dyn Controller>,
        server: SocketServer,
        events: Receiver<TransportEvent>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            controller,
            store: StateStore::new(),
            server,
            events,
            tracker: StateRequestTracker::default(),
            reconnect: Repeater::every(RECONNECT_INTERVAL),
            stop,
            last_client_count: 0,
            scratch: Vec::new(),
        }
    }

    /// Runs until the stop flag flips. Never panics out of the loop; every
    /// failure degrades into an envelope or a log line.
    pub fn run(&mut self) {
        while !self.stop.load(Ordering::Relaxed) {
            let mut inputs = std::mem::take(&mut self.scratch);
            self.server.poll_with(Some(POLL_TIMEOUT), |ev| match ev {
                SocketEvent::Connected { token, .. } => inputs.push(ClientInput::Joined(token)),
                SocketEvent::Disconnected { token } => inputs.push(ClientInput::Left(token)),
                SocketEvent::Message { token, text } => {
                    inputs.push(ClientInput::Message(token, text.to_string()));
                }
            });
            for input in inputs.drain(..) {
                match input {
                    ClientInput::Joined(token) => debug!(?token, "subscriber joined"),
                    ClientInput::Left(token) => debug!(?token, "subscriber left"),
                    ClientInput::Message(token, text) => self.handle_message(token, &text),
                }
            }
            self.scratch = inputs;

            while let Ok(ev) = self.events.try_recv() {
                self.handle_transport_event(ev);
            }

            if self.reconnect.fired() {
                self.controller.maintain();
            }
            self.check_state_timeout();
            self.sync_socket_status();
        }
        self.controller.close();
    }

    /// Broadcasts `SocketStatus` whenever the subscriber count moved,
    /// whatever made it move (join, leave, or a send that found a dead
    /// peer).
    fn sync_socket_status(&mut self) {
        let count = self.server.client_count();
        if count != self.last_client_count {
            self.last_client_count = count;
            self.broadcast_socket_status();
        }
    }

    fn broadcast_socket_status(&mut self) {
        let env =
            envelope::socket_status(self.server.client_count(), self.controller.is_connected());
        self.server.broadcast(&env.to_string());
    }

    fn send_value(&mut self, token: Token, value: &Value) {
        self.server.send_to(token, &value.to_string());
    }

    fn broadcast_value(&mut self, value: &Value) {
        self.server.broadcast(&value.to_string());
    }

    fn handle_message(&mut self, token: Token, text: &str) {
        let req: ActionRequest = match serde_json::from_str(text) {
            Ok(req) => req,
            Err(err) => {
                debug!(?err, "unparsable client action");
                self.send_value(token, &envelope::bad_request("Invalid request"));
                return;
            }
        };

        // Nothing reaches the encoder while the station is away; the
        // originating subscriber alone hears about it.
        if !self.controller.is_connected() {
            self.send_value(token, &envelope::controller_status(false));
            return;
        }

        match req.action.as_str() {
            "getControllerStatus" => self.run_command(token, |c| c.status()),
            "getControllerVersion" => self.run_command(token, |c| c.version()),
            "emergencyOff" => self.run_command(token, |c| c.emergency_off()),
            "resumeNormalOperations" => {
                self.run_command(token, |c| c.resume_normal_operations());
            }
            "throttle" => self.handle_throttle(token, &req),
            "stop" => self.handle_stop(token, &req),
            "function" => self.handle_function(token, &req),
            "getState" => self.handle_get_state(token, &req),
            "setAccessoryDirection" => self.handle_accessory_direction(token, &req),
            "setAccessoryState" => self.handle_set_accessory_state(token, &req),
            "getAccessoryState" => self.handle_get_accessory_state(token, &req),
            "getAccessoryStates" => {
                let env = envelope::accessory_states(self.store.accessory_states());
                self.broadcast_value(&env);
            }
            "controller_status" => {
                self.send_value(token, &envelope::controller_status(true));
            }
            other => {
                debug!(action = other, "unknown client action");
                self.send_value(token, &envelope::bad_request("Unknown action"));
            }
        }
    }

    /// Runs a parameterless station command and reports failures to the
    /// caller only.
    fn run_command<F>(&mut self, token: Token, f: F)
    where
        F: FnOnce(&mut dyn Controller) -> Result<(), GatewayError>,
    {
        if let Err(err) = f(self.controller.as_mut()) {
            self.report_command_error(token, &err);
        }
    }

    fn report_command_error(&mut self, token: Token, err: &GatewayError) {
        match err {
            GatewayError::NotConnected | GatewayError::Transport(_) => {
                warn!(%err, "command failed");
                self.send_value(token, &envelope::controller_status(false));
            }
            GatewayError::Encode(encode) => {
                self.send_value(token, &envelope::bad_request(&encode.to_string()));
            }
        }
    }

    fn loco_address(&mut self, token: Token, train_number: Option<u16>) -> Option<LocoAddress> {
        let Some(raw) = train_number else {
            self.send_value(token, &envelope::bad_request("Missing train_number"));
            return None;
        };
        match LocoAddress::new(raw) {
            Ok(addr) => Some(addr),
            Err(err) => {
                self.send_value(token, &envelope::bad_request(&err.to_string()));
                None
            }
        }
    }

    fn handle_throttle(&mut self, token: Token, req: &ActionRequest) {
        let Some(addr) = self.loco_address(token, req.train_number) else { return };
        let Some(speed) = req.speed.and_then(|s| u8::try_from(s).ok()).filter(|s| *s <= 127)
        else {
            self.send_value(token, &envelope::bad_request("Missing or invalid speed"));
            return;
        };
        let Some(direction) = req.direction.as_ref().and_then(|d| d.resolve()) else {
            self.send_value(token, &envelope::bad_request("Missing or invalid direction"));
            return;
        };
        info!(train = %addr, speed, %direction, "throttle");
        match self.controller.throttle(addr, speed, direction) {
            Ok(()) => {
                // Commanded values are cached immediately; the station's
                // own update overwrites them if it disagrees.
                self.store.apply_throttle_update(addr, speed, direction);
            }
            Err(err) => self.report_command_error(token, &err),
        }
    }

    fn handle_stop(&mut self, token: Token, req: &ActionRequest) {
        let Some(addr) = self.loco_address(token, req.train_number) else { return };
        let direction =
            self.store.snapshot(addr).map_or(Direction::default(), |snap| snap.direction);
        info!(train = %addr, "stop");
        match self.controller.stop(addr, direction) {
            Ok(()) => {
                self.store.apply_throttle_update(addr, 0, direction);
            }
            Err(err) => self.report_command_error(token, &err),
        }
    }

    fn handle_function(&mut self, token: Token, req: &ActionRequest) {
        let Some(addr) = self.loco_address(token, req.train_number) else { return };
        let Some(function_id) = req.function_id else {
            self.send_value(token, &envelope::bad_request("Missing function_id"));
            return;
        };
        let Some(on) = req.switch.as_ref().and_then(|s| s.resolve()) else {
            self.send_value(token, &envelope::bad_request("Missing or invalid switch"));
            return;
        };
        let (group, value) = match self.store.set_commanded_function(addr, function_id, on) {
            Ok(update) => update,
            Err(err) => {
                self.send_value(token, &envelope::bad_request(&err.to_string()));
                return;
            }
        };
        info!(train = %addr, function_id, on, "function");
        if let Err(err) = self.controller.function(addr, group, value) {
            self.report_command_error(token, &err);
        }
    }

    fn handle_get_state(&mut self, token: Token, req: &ActionRequest) {
        let Some(addr) = self.loco_address(token, req.train_number) else { return };
        info!(train = %addr, "state request");
        if self.tracker.is_idle() {
            self.start_state_request(addr, token);
        } else {
            // One exchange on the wire at a time; the rest queue.
            self.tracker.queue.push_back((addr, token));
        }
    }

    fn start_state_request(&mut self, addr: LocoAddress, token: Token) {
        self.store.set_pending(addr);
        self.tracker.begin(token);
        if let Err(err) = self.controller.request_state(addr) {
            self.store.clear_pending();
            self.tracker.cancel();
            self.report_command_error(token, &err);
            self.service_state_queue();
        }
    }

    fn service_state_queue(&mut self) {
        while self.tracker.is_idle() {
            let Some((addr, token)) = self.tracker.queue.pop_front() else { return };
            self.start_state_request(addr, token);
        }
    }

    fn check_state_timeout(&mut self) {
        if !self.tracker.timed_out() {
            return;
        }
        let addr = self.store.pending();
        let requester = self.tracker.requester;
        warn!(train = ?addr.map(|a| a.value()), "state request timed out");
        self.store.clear_pending();
        self.tracker.cancel();
        if let (Some(addr), Some(token)) = (addr, requester) {
            self.send_value(token, &envelope::state_timeout(addr));
        }
        self.service_state_queue();
    }

    fn handle_accessory_direction(&mut self, token: Token, req: &ActionRequest) {
        let Some(addr) = req.accessory_number else {
            self.send_value(token, &envelope::bad_request("Missing accessory_number"));
            return;
        };
        let Some(direction) = req.direction.as_ref().and_then(|d| d.resolve()) else {
            self.send_value(token, &envelope::bad_request("Invalid accessory direction"));
            return;
        };
        info!(accessory = addr, %direction, "accessory");
        match self.controller.accessory(addr, direction) {
            Ok(()) => self.store.set_accessory_direction(addr, direction),
            Err(err) => self.report_command_error(token, &err),
        }
    }

    fn handle_set_accessory_state(&mut self, token: Token, req: &ActionRequest) {
        let (Some(id), Some(state)) = (req.accessory_id.as_ref(), req.state.as_ref()) else {
            self.send_value(token, &envelope::bad_request("Missing accessory_id or state"));
            return;
        };
        self.store.set_accessory_state(id, state.clone());
        let env = envelope::accessory_state(id, state);
        self.broadcast_value(&env);
    }

    fn handle_get_accessory_state(&mut self, token: Token, req: &ActionRequest) {
        let Some(id) = req.accessory_id.as_ref() else {
            self.send_value(token, &envelope::bad_request("Missing accessory_id"));
            return;
        };
        let state = self.store.accessory_state(id);
        let env = envelope::accessory_state(id, &state);
        self.broadcast_value(&env);
    }

    fn handle_transport_event(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Connected => {
                info!("command station online");
                self.broadcast_socket_status();
            }
            TransportEvent::Disconnected => {
                warn!("command station offline");
                // Any exchange on the wire died with the link.
                self.store.clear_pending();
                self.tracker.cancel();
                self.tracker.queue.clear();
                self.broadcast_socket_status();
            }
            TransportEvent::Reply { reply, raw } => self.handle_reply(reply, raw.as_deref()),
        }
    }

    fn handle_reply(&mut self, reply: Reply, raw: Option<&[u8]>) {
        let hex = raw.map(to_hex);
        let debug_field = hex.as_deref();
        match reply {
            Reply::ThrottleUpdate { addr, speed, direction } => {
                self.store.apply_throttle_update(addr, speed, direction);
                let env = envelope::throttle_update(addr, speed, direction, debug_field);
                self.broadcast_value(&env);
            }
            Reply::FunctionUpdate { addr, low } => {
                self.store.apply_function_update(addr, low);
                let env = envelope::function_update(addr, low, debug_field);
                self.broadcast_value(&env);
            }
            Reply::StateReplyA { speed, direction, low } => {
                if self.store.pending().is_some() {
                    self.tracker.phase = StatePhase::AwaitingB { speed, direction, low };
                } else {
                    debug!("state reply part A with no pending request");
                }
            }
            Reply::StateReplyB { high } => {
                let (Some(addr), StatePhase::AwaitingB { speed, direction, low }) =
                    (self.store.pending(), &self.tracker.phase)
                else {
                    debug!("state reply part B with no pending request");
                    return;
                };
                let snapshot =
                    self.store.apply_state_reply(addr, *speed, *direction, *low, high);
                let env = envelope::loco_state(&snapshot, debug_field);
                self.broadcast_value(&env);
                self.store.clear_pending();
                self.tracker.cancel();
                self.service_state_queue();
            }
            Reply::StationStatus(status) => {
                let env = envelope::station_status(status, debug_field);
                self.broadcast_value(&env);
            }
            Reply::Identification { version } => {
                let env = envelope::identification(version, debug_field);
                self.broadcast_value(&env);
            }
            Reply::TrackPowerOff => {
                self.broadcast_value(&envelope::simple(500, "Track power off", debug_field));
            }
            Reply::NormalOperationsResumed => {
                self.broadcast_value(&envelope::simple(
                    200,
                    "Normal operations resumed",
                    debug_field,
                ));
            }
            Reply::EmergencyOff => {
                self.broadcast_value(&envelope::simple(500, "Emergency off", debug_field));
            }
            Reply::ServiceMode => {
                self.broadcast_value(&envelope::simple(503, "In service mode", debug_field));
            }
            Reply::Ack => {
                self.broadcast_value(&envelope::simple(200, "Command OK", debug_field));
            }
            Reply::TransmissionError => {
                self.broadcast_value(&envelope::simple(400, "Transmission error", debug_field));
            }
            Reply::Busy => {
                self.broadcast_value(&envelope::simple(503, "Command station busy", debug_field));
            }
            Reply::Unsupported => {
                self.broadcast_value(&envelope::simple(
                    400,
                    "Command not supported",
                    debug_field,
                ));
            }
            Reply::Unknown(bytes) => {
                self.broadcast_value(&envelope::unknown_data(&bytes));
            }
        }
    }
}
