//! Bi-address accessory reconciliation
//!
//! Three-way turnouts and multi-aspect signals occupy two consecutive
//! protocol addresses; their logical position is only defined by the pair
//! of physical switch events, never by either alone. The reconciler knows
//! the pairs from the accessory catalog, buffers the first half of each
//! pair and emits one logical event once the second half arrives:
//!
//! - both halves green: `Green`
//! - first half on the primary address: `Red`
//! - first half on the secondary address: `Red2`
//!
//! A buffered half that is never paired would otherwise live for the whole
//! connection, so unpaired halves are evicted after a bounded window and
//! forwarded as a plain event for the pair's primary address.

use crate::catalog::AccessoryItem;
use crate::events::{AccessoryEvent, AccessoryValue};
use log::warn;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How long the first half of a pair waits for its partner
pub const PAIRING_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct Pair {
    primary: u16,
    secondary: u16,
    states: u8,
}

#[derive(Debug, Clone, Copy)]
struct PendingHalf {
    /// Physical address the half arrived on
    address: u16,
    green: bool,
    at: Instant,
}

#[derive(Default)]
pub struct AccessoryReconciler {
    /// Physical address (primary or secondary) to its pair
    pairs: HashMap<u16, Pair>,
    /// First halves waiting for their partner, keyed by primary address
    pending: HashMap<u16, PendingHalf>,
}

impl AccessoryReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the bi-address pairs declared by the accessory catalog
    ///
    /// Idempotent; re-loading the catalog replaces the pair table but
    /// leaves buffered halves alone.
    pub fn load_catalog(&mut self, items: &[AccessoryItem]) {
        self.pairs.clear();
        for item in items {
            if let Some(secondary) = item.secondary_address {
                let pair = Pair {
                    primary: item.address,
                    secondary,
                    states: item.states,
                };
                self.pairs.insert(pair.primary, pair);
                self.pairs.insert(pair.secondary, pair);
            }
        }
    }

    /// Number of buffered unpaired halves
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one physical switch event; returns the logical events to emit
    pub fn observe(&mut self, address: u16, green: bool) -> Vec<AccessoryEvent> {
        self.observe_at(address, green, Instant::now())
    }

    fn observe_at(&mut self, address: u16, green: bool, now: Instant) -> Vec<AccessoryEvent> {
        let mut events = self.evict_stale(now);

        let Some(pair) = self.pairs.get(&address).copied() else {
            events.push(AccessoryEvent {
                address,
                value: AccessoryValue::from_wire(green as u8),
                states: 2,
            });
            return events;
        };

        match self.pending.remove(&pair.primary) {
            Some(first) => {
                let value = if first.green && green {
                    AccessoryValue::Green
                } else if first.address == pair.primary {
                    AccessoryValue::Red
                } else {
                    AccessoryValue::Red2
                };
                events.push(AccessoryEvent {
                    address: pair.primary,
                    value,
                    states: pair.states,
                });
            }
            None => {
                self.pending.insert(
                    pair.primary,
                    PendingHalf {
                        address,
                        green,
                        at: now,
                    },
                );
            }
        }
        events
    }

    /// Evict halves older than the pairing window, forwarding each as a
    /// plain event so the observation is not silently lost
    fn evict_stale(&mut self, now: Instant) -> Vec<AccessoryEvent> {
        let mut evicted = Vec::new();
        self.pending.retain(|primary, half| {
            if now.duration_since(half.at) < PAIRING_WINDOW {
                return true;
            }
            warn!(
                "Unpaired accessory half at address {} evicted after {:?}",
                half.address, PAIRING_WINDOW
            );
            let states = self.pairs.get(primary).map_or(2, |p| p.states);
            evicted.push(AccessoryEvent {
                address: *primary,
                value: AccessoryValue::from_wire(half.green as u8),
                states,
            });
            false
        });
        evicted
    }
}
