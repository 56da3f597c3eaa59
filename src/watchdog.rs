//! Connection liveness watchdog
//!
//! The station broadcasts keepalive frames continuously; the dispatcher
//! stamps every inbound frame into a shared timestamp. The watchdog
//! compares that stamp against its interval and, on a breach, raises one
//! disconnection event, tears the transport down and optionally runs a
//! reconnect cycle. The breach is latched so a dead connection produces
//! one event, not one per tick.

use crate::error::Result;
use crate::events::{DisconnectionEvent, EventBus};
use crate::transport::Transport;
use crate::workers::WorkerPool;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub(crate) type Reconnect = Arc<dyn Fn() -> Result<()> + Send + Sync>;

pub(crate) struct Watchdog {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn spawn(
        interval: Duration,
        transport: Arc<dyn Transport>,
        last_seen: Arc<Mutex<Instant>>,
        bus: Arc<EventBus>,
        pool: Arc<WorkerPool>,
        reconnect: Option<Reconnect>,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let tick = (interval / 4).max(Duration::from_millis(10));
        let handle = thread::Builder::new()
            .name("trackio-watchdog".to_string())
            .spawn({
                let shutdown = Arc::clone(&shutdown);
                move || {
                    let mut breached = false;
                    while !shutdown.load(Ordering::Relaxed) {
                        thread::sleep(tick);
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        let gap = last_seen.lock().elapsed();
                        if gap <= interval {
                            breached = false;
                            continue;
                        }
                        if breached {
                            continue;
                        }
                        breached = true;
                        warn!("No frame received for {gap:?}, connection considered lost");
                        bus.disconnection.emit(
                            DisconnectionEvent {
                                reason: format!("no keepalive for {gap:?}"),
                            },
                            &pool,
                        );
                        transport.close();
                        if let Some(reconnect) = &reconnect {
                            match reconnect() {
                                Ok(()) => {
                                    info!("Reconnected after watchdog breach");
                                    *last_seen.lock() = Instant::now();
                                    breached = false;
                                }
                                Err(e) => error!("Reconnect failed: {e}"),
                            }
                        }
                    }
                }
            })?;
        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::AtomicUsize;

    const INTERVAL: Duration = Duration::from_millis(200);

    fn setup() -> (
        Arc<dyn Transport>,
        Arc<Mutex<Instant>>,
        Arc<EventBus>,
        Arc<WorkerPool>,
        crossbeam_channel::Receiver<DisconnectionEvent>,
    ) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.connect().unwrap();
        let bus = Arc::new(EventBus::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        bus.disconnection.subscribe(move |e: &DisconnectionEvent| {
            tx.send(e.clone()).unwrap();
        });
        (
            transport,
            Arc::new(Mutex::new(Instant::now())),
            bus,
            Arc::new(WorkerPool::new(1).unwrap()),
            rx,
        )
    }

    #[test]
    fn test_breach_raises_exactly_one_event() {
        let (transport, last_seen, bus, pool, rx) = setup();
        *last_seen.lock() = Instant::now() - Duration::from_secs(10);
        let mut watchdog =
            Watchdog::spawn(INTERVAL, transport, last_seen, bus, pool, None).unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        // Still silent; the latch must suppress further events.
        thread::sleep(INTERVAL * 4);
        assert!(rx.try_recv().is_err());
        watchdog.shutdown();
    }

    #[test]
    fn test_latch_resets_when_traffic_resumes() {
        let (transport, last_seen, bus, pool, rx) = setup();
        *last_seen.lock() = Instant::now() - Duration::from_secs(10);
        let mut watchdog = Watchdog::spawn(
            INTERVAL,
            transport,
            Arc::clone(&last_seen),
            bus,
            pool,
            None,
        )
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        // Traffic resumes, then goes silent again: a second breach event.
        *last_seen.lock() = Instant::now();
        thread::sleep(INTERVAL / 2);
        *last_seen.lock() = Instant::now() - Duration::from_secs(10);
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        watchdog.shutdown();
    }

    #[test]
    fn test_reconnect_runs_once_per_breach() {
        let (transport, last_seen, bus, pool, rx) = setup();
        *last_seen.lock() = Instant::now() - Duration::from_secs(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let reconnect: Reconnect = Arc::new({
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });
        let mut watchdog = Watchdog::spawn(
            INTERVAL,
            transport,
            Arc::clone(&last_seen),
            bus,
            pool,
            Some(reconnect),
        )
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        thread::sleep(INTERVAL);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        // Successful reconnect refreshed the timestamp.
        assert!(last_seen.lock().elapsed() < Duration::from_secs(5));
        watchdog.shutdown();
    }
}
