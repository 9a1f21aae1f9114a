//! Cached model of every locomotive and accessory the gateway has seen.
//!
//! The store is owned by the dispatcher thread; replies are applied in wire
//! arrival order, so updates for a given locomotive are naturally
//! serialized. Commanded values are written through optimistically and an
//! inbound update always wins over a stale commanded one, because applying
//! a reply overwrites the affected range wholesale.

use std::collections::HashMap;

use serde_json::{Map, Value};
use xpressnet::{
    EncodeError,
    loco::{Direction, FunctionBank, FunctionGroup, HighFunctions, LocoAddress, LowFunctions},
};

#[derive(Debug, Clone, Copy, Default)]
struct Loco {
    speed: u8,
    direction: Direction,
    bank: FunctionBank,
}

/// Immutable copy of one locomotive's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocoSnapshot {
    pub addr: LocoAddress,
    pub speed: u8,
    pub direction: Direction,
    bank: FunctionBank,
}

impl LocoSnapshot {
    pub fn function(&self, n: u8) -> bool {
        self.bank.get(n)
    }
}

#[derive(Debug, Default)]
pub struct StateStore {
    locos: HashMap<u16, Loco>,
    accessory_directions: HashMap<u16, Direction>,
    /// Client-defined accessory state blobs, keyed by the id the client
    /// sent (numbers and strings share one namespace, as in JSON output).
    accessory_states: Map<String, Value>,
    pending: Option<LocoAddress>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locomotives are created on first reference, by either direction of
    /// traffic.
    fn loco_mut(&mut self, addr: LocoAddress) -> &mut Loco {
        self.locos.entry(addr.value()).or_default()
    }

    fn snapshot_of(addr: LocoAddress, loco: &Loco) -> LocoSnapshot {
        LocoSnapshot { addr, speed: loco.speed, direction: loco.direction, bank: loco.bank }
    }

    pub fn apply_throttle_update(
        &mut self,
        addr: LocoAddress,
        speed: u8,
        direction: Direction,
    ) -> LocoSnapshot {
        let loco = self.loco_mut(addr);
        loco.speed = speed;
        loco.direction = direction;
        Self::snapshot_of(addr, loco)
    }

    /// Merges F0..F12; F13..F28 stay untouched.
    pub fn apply_function_update(&mut self, addr: LocoAddress, low: LowFunctions) -> LocoSnapshot {
        let loco = self.loco_mut(addr);
        loco.bank.apply_low(low);
        Self::snapshot_of(addr, loco)
    }

    /// Replaces the full state from a completed state-reply pair.
    pub fn apply_state_reply(
        &mut self,
        addr: LocoAddress,
        speed: u8,
        direction: Direction,
        low: LowFunctions,
        high: HighFunctions,
    ) -> LocoSnapshot {
        let loco = self.loco_mut(addr);
        loco.speed = speed;
        loco.direction = direction;
        loco.bank.apply_low(low);
        loco.bank.apply_high(high);
        Self::snapshot_of(addr, loco)
    }

    /// Applies a commanded function bit and hands back the group byte the
    /// encoder needs. The cache is updated before transmission; a later
    /// inbound update overwrites it if the station disagrees.
    pub fn set_commanded_function(
        &mut self,
        addr: LocoAddress,
        function: u8,
        on: bool,
    ) -> Result<(FunctionGroup, u8), EncodeError> {
        self.loco_mut(addr).bank.set(function, on)
    }

    pub fn snapshot(&self, addr: LocoAddress) -> Option<LocoSnapshot> {
        self.locos.get(&addr.value()).map(|loco| Self::snapshot_of(addr, loco))
    }

    pub fn set_pending(&mut self, addr: LocoAddress) {
        self.pending = Some(addr);
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    pub fn pending(&self) -> Option<LocoAddress> {
        self.pending
    }

    pub fn set_accessory_direction(&mut self, addr: u16, direction: Direction) {
        self.accessory_directions.insert(addr, direction);
    }

    pub fn accessory_direction(&self, addr: u16) -> Option<Direction> {
        self.accessory_directions.get(&addr).copied()
    }

    pub fn set_accessory_state(&mut self, id: &Value, state: Value) {
        self.accessory_states.insert(accessory_key(id), state);
    }

    /// Cached blob for one accessory id; an empty object when unknown.
    pub fn accessory_state(&self, id: &Value) -> Value {
        self.accessory_states
            .get(&accessory_key(id))
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn accessory_states(&self) -> &Map<String, Value> {
        &self.accessory_states
    }
}

fn accessory_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: u16) -> LocoAddress {
        LocoAddress::new(a).expect("valid address")
    }

    #[test]
    fn throttle_update_writes_through() {
        let mut store = StateStore::new();
        let snap = store.apply_throttle_update(addr(3), 40, Direction::Forward);
        assert_eq!(snap.speed, 40);
        assert_eq!(snap.direction, Direction::Forward);
        assert_eq!(store.snapshot(addr(3)), Some(snap));
    }

    #[test]
    fn function_update_preserves_high_functions() {
        let mut store = StateStore::new();
        store.set_commanded_function(addr(3), 20, true).expect("valid function");
        store.apply_function_update(addr(3), LowFunctions::new(0x10, 0x01));
        let snap = store.snapshot(addr(3)).expect("loco exists");
        assert!(snap.function(0));
        assert!(snap.function(5));
        assert!(snap.function(20), "F20 must survive a low-group update");
        assert!(!snap.function(1));
    }

    #[test]
    fn state_reply_replaces_everything() {
        let mut store = StateStore::new();
        store.set_commanded_function(addr(7), 2, true).expect("valid function");
        store.set_commanded_function(addr(7), 25, true).expect("valid function");
        let snap = store.apply_state_reply(
            addr(7),
            15,
            Direction::Reverse,
            LowFunctions::new(0, 0),
            HighFunctions::new(0, 0),
        );
        assert_eq!(snap.speed, 15);
        assert_eq!(snap.direction, Direction::Reverse);
        for n in 0..=28 {
            assert!(!snap.function(n), "function {n} must be cleared");
        }
    }

    #[test]
    fn commanded_function_returns_group_byte_for_encoder() {
        let mut store = StateStore::new();
        let (group, value) = store.set_commanded_function(addr(3), 0, true).expect("valid");
        assert_eq!(group.header(), 0x20);
        assert_eq!(value, 0x10);
        // Inbound wins: a reply clearing F0 overrides the commanded bit.
        store.apply_function_update(addr(3), LowFunctions::new(0, 0));
        assert!(!store.snapshot(addr(3)).expect("loco exists").function(0));
    }

    #[test]
    fn pending_slot_is_single() {
        let mut store = StateStore::new();
        assert_eq!(store.pending(), None);
        store.set_pending(addr(5));
        assert_eq!(store.pending(), Some(addr(5)));
        store.set_pending(addr(9));
        assert_eq!(store.pending(), Some(addr(9)));
        store.clear_pending();
        assert_eq!(store.pending(), None);
    }

    #[test]
    fn accessory_states_share_a_key_namespace_with_json() {
        let mut store = StateStore::new();
        store.set_accessory_state(&Value::from(4), Value::from("closed"));
        assert_eq!(store.accessory_state(&Value::from(4)), Value::from("closed"));
        assert_eq!(store.accessory_state(&Value::from("4")), Value::from("closed"));
        assert_eq!(store.accessory_state(&Value::from(9)), serde_json::json!({}));
        assert_eq!(store.accessory_states().len(), 1);
    }

    #[test]
    fn accessory_direction_is_cached() {
        let mut store = StateStore::new();
        assert_eq!(store.accessory_direction(4), None);
        store.set_accessory_direction(4, Direction::Forward);
        assert_eq!(store.accessory_direction(4), Some(Direction::Forward));
    }
}
