//! Transport layer: CAN-over-TCP socket, virtual loopback, HTTP side-channel
//!
//! A transport owns the connection to the command station, produces the
//! inbound frame stream and accepts outbound frames. Request/response
//! correlation lives here: a reader thread offers every inbound frame to
//! the pending-request table first; unclaimed frames flow to the event
//! channel the dispatcher drains.

pub mod http;
mod loopback;
mod tcp;

pub use http::{CatalogSource, HttpClient, IconData, IconFormat};
pub use loopback::{LoopbackTransport, VIRTUAL_LINK_UID, VIRTUAL_MAIN_UID};
pub use tcp::TcpTransport;

use crate::can::{CanFrame, MAX_DLC};
use crate::error::Result;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default reply timeout for control commands
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
/// Default reply timeout for discovery commands (multi-packet)
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(5000);
/// Quiet period that ends an open-ended response sequence
const SEQUENCE_QUIET_WINDOW: Duration = Duration::from_millis(300);

/// A request frame together with its correlated replies
///
/// Empty `responses` means "no answer", which several commands legitimately
/// produce; it is never an error.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: CanFrame,
    pub responses: Vec<CanFrame>,
}

impl Exchange {
    pub fn answered(&self) -> bool {
        !self.responses.is_empty()
    }

    pub fn first(&self) -> Option<&CanFrame> {
        self.responses.first()
    }
}

/// How many replies a request expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// One reply completes the exchange
    Single,
    /// Collect replies until a closing frame (DLC below 8) or a quiet period
    Sequence,
}

/// Timeout and reply expectation for [`Transport::send_and_await`]
#[derive(Debug, Clone, Copy)]
pub struct AwaitSpec {
    pub timeout: Duration,
    pub expect: Expect,
}

impl AwaitSpec {
    /// Short single-reply wait for control commands
    pub fn control() -> Self {
        Self {
            timeout: CONTROL_TIMEOUT,
            expect: Expect::Single,
        }
    }

    /// Long multi-reply wait for discovery commands
    pub fn discovery() -> Self {
        Self {
            timeout: DISCOVERY_TIMEOUT,
            expect: Expect::Sequence,
        }
    }

    pub fn single(timeout: Duration) -> Self {
        Self {
            timeout,
            expect: Expect::Single,
        }
    }

    pub fn sequence(timeout: Duration) -> Self {
        Self {
            timeout,
            expect: Expect::Sequence,
        }
    }
}

/// Connection to a command station
///
/// All methods take `&self`; implementations are internally synchronized so
/// the facade, dispatcher and watchdog can share one handle.
pub trait Transport: Send + Sync {
    /// Establish the connection; idempotent
    fn connect(&self) -> Result<()>;

    /// Tear the connection down; idempotent, unblocks pending awaits
    fn close(&self);

    /// Fire-and-forget send
    fn send(&self, frame: CanFrame) -> Result<()>;

    /// Send and block the calling thread for correlated replies
    ///
    /// Returns within `spec.timeout` plus scheduling jitter; on timeout the
    /// exchange simply has no responses. Concurrent callers correlate
    /// independently.
    fn send_and_await(&self, frame: CanFrame, spec: AwaitSpec) -> Exchange;

    /// The inbound frame stream (frames not claimed by an await)
    fn events(&self) -> Receiver<CanFrame>;

    fn is_connected(&self) -> bool;

    /// Whether this is the in-process virtual station
    fn is_virtual(&self) -> bool {
        false
    }
}

struct PendingEntry {
    id: u64,
    request: CanFrame,
    tx: Sender<CanFrame>,
}

/// Outstanding `send_and_await` requests, shared with the reader thread
pub(crate) struct PendingTable {
    entries: Mutex<Vec<PendingEntry>>,
    next_id: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an outstanding request and get its reply channel
    pub fn register(&self, request: CanFrame) -> (u64, Receiver<CanFrame>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(PendingEntry { id, request, tx });
        (id, rx)
    }

    /// Remove a completed or timed-out request; late replies are discarded
    pub fn complete(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    /// Drop all entries, unblocking every waiting caller
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Offer an inbound frame; returns true if a pending request claimed it
    pub fn offer(&self, frame: &CanFrame) -> bool {
        let mut entries = self.entries.lock();
        let mut claimed = false;
        entries.retain(|e| {
            if !claimed && frame.is_response_to(&e.request) {
                match e.tx.send(*frame) {
                    Ok(()) => {
                        claimed = true;
                        true
                    }
                    // Receiver gone (caller timed out); drop the entry and
                    // let another matching request claim the frame.
                    Err(_) => false,
                }
            } else {
                true
            }
        });
        claimed
    }
}

/// Collect replies from a registered pending channel per the await spec
pub(crate) fn await_responses(
    rx: &Receiver<CanFrame>,
    request: CanFrame,
    spec: AwaitSpec,
) -> Exchange {
    let deadline = Instant::now() + spec.timeout;
    let mut responses = Vec::new();

    match spec.expect {
        Expect::Single => {
            if let Ok(frame) = rx.recv_timeout(spec.timeout) {
                responses.push(frame);
            }
        }
        Expect::Sequence => loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            let wait = if responses.is_empty() {
                remaining
            } else {
                SEQUENCE_QUIET_WINDOW.min(remaining)
            };
            match rx.recv_timeout(wait) {
                Ok(frame) => {
                    // A reply shorter than a full data frame closes the
                    // sequence (status-config end marker).
                    let closing = frame.dlc < MAX_DLC;
                    responses.push(frame);
                    if closing {
                        break;
                    }
                }
                Err(_) => break,
            }
        },
    }

    Exchange { request, responses }
}
