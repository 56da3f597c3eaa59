//! Typed domain events and the listener bus
//!
//! One [`ListenerSet`] exists per event kind. Emission snapshots the
//! registered callbacks before iterating, so a listener adding or removing
//! subscriptions from inside a callback cannot race the fan-out, and the
//! snapshot runs on the worker pool so a slow listener cannot stall the
//! dispatcher thread.

use crate::workers::WorkerPool;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Track power states reported by the command station
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Track power on (system go)
    On,
    /// Track power off (system stop)
    Off,
    /// Locomotives halted, track power still on
    Halt,
    /// Booster overload forced power off
    Overload,
}

/// Track power changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerEvent {
    pub state: PowerState,
}

/// A feedback-module contact changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorEvent {
    /// Feedback device identifier
    pub device_id: u16,
    /// Contact/port number on the device
    pub contact: u16,
    /// Value before the change (edge detection)
    pub previous: u8,
    /// Current value
    pub status: u8,
    /// Time since the previous change, in milliseconds
    pub elapsed_ms: u32,
}

/// Logical accessory positions
///
/// `Red2`/`Green2` only occur for bi-address devices (three-way turnouts,
/// multi-aspect signals) whose state space spans two protocol addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessoryValue {
    Red,
    Green,
    Red2,
    Green2,
}

impl AccessoryValue {
    /// Wire value of a single-address position (0 red, 1 green)
    pub fn from_wire(value: u8) -> Self {
        if value == 0 {
            Self::Red
        } else {
            Self::Green
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Red => 0,
            Self::Green => 1,
            Self::Red2 => 2,
            Self::Green2 => 3,
        }
    }
}

/// A logical accessory changed position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessoryEvent {
    /// Primary protocol address
    pub address: u16,
    pub value: AccessoryValue,
    /// Number of discrete states (2, 3 or 4)
    pub states: u8,
}

/// Locomotive driving directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// Wire values: 1 forward, 2 backward; anything else defaults forward
    pub fn from_wire(value: u8) -> Self {
        if value == 2 {
            Self::Backward
        } else {
            Self::Forward
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Forward => 1,
            Self::Backward => 2,
        }
    }
}

/// Locomotive speed feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocSpeedEvent {
    pub uid: u32,
    /// 0..=1000
    pub speed: u16,
}

/// Locomotive direction feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocDirectionEvent {
    pub uid: u32,
    pub direction: Direction,
}

/// Locomotive function feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocFunctionEvent {
    pub uid: u32,
    pub function: u8,
    pub on: bool,
}

/// A polled measurement channel produced a new value
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementEvent {
    pub uid: u32,
    pub channel: u8,
    pub raw: u16,
    /// Calibrated display value, if calibration has been received
    pub value: Option<f64>,
    pub name: String,
    pub unit: String,
}

/// The watchdog detected a silent connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectionEvent {
    pub reason: String,
}

/// Handle returned by [`ListenerSet::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registered callbacks for one event kind
pub struct ListenerSet<E> {
    listeners: Mutex<Vec<(SubscriptionId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E: Clone + Send + Sync + 'static> ListenerSet<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback; the returned id removes it again
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a callback
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().retain(|(sid, _)| *sid != id);
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Fan the event out on the worker pool
    ///
    /// The listener vec is snapshotted before iteration; callbacks run off
    /// the calling thread.
    pub fn emit(&self, event: E, pool: &WorkerPool) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if snapshot.is_empty() {
            return;
        }
        pool.execute(move || {
            for listener in &snapshot {
                listener(&event);
            }
        });
    }
}

impl<E: Clone + Send + Sync + 'static> Default for ListenerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// All listener registries of one controller
#[derive(Default)]
pub struct EventBus {
    pub power: ListenerSet<PowerEvent>,
    pub sensor: ListenerSet<SensorEvent>,
    pub accessory: ListenerSet<AccessoryEvent>,
    pub loc_speed: ListenerSet<LocSpeedEvent>,
    pub loc_direction: ListenerSet<LocDirectionEvent>,
    pub loc_function: ListenerSet<LocFunctionEvent>,
    pub measurement: ListenerSet<MeasurementEvent>,
    pub disconnection: ListenerSet<DisconnectionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let set: ListenerSet<PowerEvent> = ListenerSet::new();
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let id = set.subscribe(move |e: &PowerEvent| {
            tx.send(e.state).unwrap();
        });
        set.emit(PowerEvent { state: PowerState::On }, &pool);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PowerState::On
        );

        set.unsubscribe(id);
        assert!(set.is_empty());
        set.emit(PowerEvent { state: PowerState::Off }, &pool);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_listener_may_mutate_registry_during_callback() {
        let set: Arc<ListenerSet<SensorEvent>> = Arc::new(ListenerSet::new());
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let set_clone = Arc::clone(&set);
        set.subscribe(move |_e: &SensorEvent| {
            // Subscribing from inside a callback must not deadlock or panic.
            set_clone.subscribe(|_e: &SensorEvent| {});
            tx.send(()).unwrap();
        });

        set.emit(
            SensorEvent {
                device_id: 1,
                contact: 2,
                previous: 0,
                status: 1,
                elapsed_ms: 10,
            },
            &pool,
        );
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_accessory_value_wire_mapping() {
        assert_eq!(AccessoryValue::from_wire(0), AccessoryValue::Red);
        assert_eq!(AccessoryValue::from_wire(1), AccessoryValue::Green);
        assert_eq!(AccessoryValue::Red2.to_wire(), 2);
    }

    #[test]
    fn test_direction_wire_mapping() {
        assert_eq!(Direction::from_wire(1), Direction::Forward);
        assert_eq!(Direction::from_wire(2), Direction::Backward);
        assert_eq!(Direction::from_wire(0), Direction::Forward);
    }
}
