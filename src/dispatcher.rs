//! Event dispatcher thread
//!
//! One background thread drains the transport's inbound stream, classifies
//! each frame by command code, updates the registry/reconciler and fans the
//! decoded events out through the bus. A malformed frame is logged and
//! dropped; nothing a frame contains may stop the thread.

use crate::accessory::AccessoryReconciler;
use crate::can::commands::{
    ping_reply, CommandKind, APP_UID, APP_VERSION, DEVICE_TYPE_SOFTWARE, SYS_GO, SYS_HALT,
    SYS_LOC_EMERGENCY_STOP, SYS_OVERLOAD, SYS_STATUS, SYS_STOP,
};
use crate::can::CanFrame;
use crate::catalog::AccessoryProtocol;
use crate::devices::DeviceRegistry;
use crate::error::Result;
use crate::events::{
    Direction, EventBus, LocDirectionEvent, LocFunctionEvent, LocSpeedEvent, PowerEvent,
    PowerState, SensorEvent,
};
use crate::transport::Transport;
use crate::workers::WorkerPool;
use crossbeam_channel::RecvTimeoutError;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Shutdown-flag poll granularity of the blocking pull
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Everything the dispatcher thread shares with the facade and watchdog
#[derive(Clone)]
pub(crate) struct DispatcherContext {
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<Mutex<DeviceRegistry>>,
    pub reconciler: Arc<Mutex<AccessoryReconciler>>,
    pub bus: Arc<EventBus>,
    pub pool: Arc<WorkerPool>,
    /// Timestamp of the last inbound frame, read by the watchdog
    pub last_seen: Arc<Mutex<Instant>>,
    pub power_on: Arc<AtomicBool>,
}

pub(crate) struct Dispatcher {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn spawn(ctx: DispatcherContext) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("trackio-dispatcher".to_string())
            .spawn({
                let shutdown = Arc::clone(&shutdown);
                move || {
                    let events = ctx.transport.events();
                    while !shutdown.load(Ordering::Relaxed) {
                        match events.recv_timeout(POLL_INTERVAL) {
                            Ok(frame) => handle_frame(&ctx, &frame),
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => {
                                debug!("Inbound frame channel closed, dispatcher exits");
                                break;
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

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle_frame(ctx: &DispatcherContext, frame: &CanFrame) {
    // Any inbound frame proves the connection alive.
    *ctx.last_seen.lock() = Instant::now();

    match CommandKind::of(frame) {
        CommandKind::Bootloader => {}
        CommandKind::Ping if !frame.is_response() => on_ping_request(ctx, frame),
        CommandKind::Ping => ctx.registry.lock().on_ping_reply(frame),
        CommandKind::StatusConfig if frame.is_response() => {
            ctx.registry.lock().on_status_config_frame(frame)
        }
        CommandKind::StatusConfig => {}
        CommandKind::FeedbackEvent => on_feedback(ctx, frame),
        CommandKind::AccessorySwitch if frame.is_response() => on_accessory(ctx, frame),
        CommandKind::System => on_system(ctx, frame),
        CommandKind::LocSpeed if frame.is_response() => on_loc_speed(ctx, frame),
        CommandKind::LocDirection if frame.is_response() => on_loc_direction(ctx, frame),
        CommandKind::LocFunction if frame.is_response() => on_loc_function(ctx, frame),
        CommandKind::Unknown => {
            debug!("Ignoring frame with unknown command {:#04x}", frame.command)
        }
        _ => {}
    }
}

/// Answer a member ping with our own identity, but only once the main
/// device is resolved so we never self-announce into an unknown bus
fn on_ping_request(ctx: &DispatcherContext, frame: &CanFrame) {
    if ctx.registry.lock().main_device().is_none() {
        return;
    }
    let reply = ping_reply(frame.hash, APP_UID, APP_VERSION, DEVICE_TYPE_SOFTWARE);
    if let Err(e) = ctx.transport.send(reply) {
        debug!("Could not answer member ping: {e}");
    }
}

fn on_feedback(ctx: &DispatcherContext, frame: &CanFrame) {
    if frame.dlc != 8 {
        warn!("Dropping malformed feedback frame (dlc {})", frame.dlc);
        return;
    }
    let event = SensorEvent {
        device_id: u16::from_be_bytes([frame.data[0], frame.data[1]]),
        contact: u16::from_be_bytes([frame.data[2], frame.data[3]]),
        previous: frame.data[4],
        status: frame.data[5],
        // The wire carries the time since the last change in 10 ms units.
        elapsed_ms: u16::from_be_bytes([frame.data[6], frame.data[7]]) as u32 * 10,
    };
    ctx.bus.sensor.emit(event, &ctx.pool);
}

fn on_accessory(ctx: &DispatcherContext, frame: &CanFrame) {
    if frame.dlc < 6 {
        warn!("Dropping malformed accessory frame (dlc {})", frame.dlc);
        return;
    }
    // Only the activation edge carries the position; deactivation echoes
    // are bookkeeping.
    if frame.data[5] != 1 {
        return;
    }
    let uid = frame.device_uid();
    let Some((_, address)) = AccessoryProtocol::split_uid(uid) else {
        debug!("Accessory frame outside known address ranges: {uid:#06x}");
        return;
    };
    let green = frame.data[4] == 1;
    for event in ctx.reconciler.lock().observe(address, green) {
        ctx.bus.accessory.emit(event, &ctx.pool);
    }
}

fn on_system(ctx: &DispatcherContext, frame: &CanFrame) {
    if frame.dlc < 5 {
        warn!("Dropping malformed system frame (dlc {})", frame.dlc);
        return;
    }
    let state = match frame.data[4] {
        SYS_STOP => Some(PowerState::Off),
        SYS_GO => Some(PowerState::On),
        SYS_HALT => Some(PowerState::Halt),
        SYS_OVERLOAD => Some(PowerState::Overload),
        SYS_LOC_EMERGENCY_STOP => {
            ctx.bus.loc_speed.emit(
                LocSpeedEvent {
                    uid: frame.device_uid(),
                    speed: 0,
                },
                &ctx.pool,
            );
            None
        }
        SYS_STATUS if frame.dlc == 8 => {
            let raw = u16::from_be_bytes([frame.data[6], frame.data[7]]);
            let event = ctx
                .registry
                .lock()
                .update_measurement(frame.device_uid(), frame.data[5], raw);
            if let Some(event) = event {
                ctx.bus.measurement.emit(event, &ctx.pool);
            }
            None
        }
        SYS_STATUS => None,
        sub => {
            debug!("Ignoring system sub-command {sub:#04x}");
            None
        }
    };
    if let Some(state) = state {
        ctx.power_on.store(
            matches!(state, PowerState::On | PowerState::Halt),
            Ordering::Relaxed,
        );
        ctx.bus.power.emit(PowerEvent { state }, &ctx.pool);
    }
}

fn on_loc_speed(ctx: &DispatcherContext, frame: &CanFrame) {
    if frame.dlc < 6 {
        return;
    }
    ctx.bus.loc_speed.emit(
        LocSpeedEvent {
            uid: frame.device_uid(),
            speed: u16::from_be_bytes([frame.data[4], frame.data[5]]),
        },
        &ctx.pool,
    );
}

fn on_loc_direction(ctx: &DispatcherContext, frame: &CanFrame) {
    if frame.dlc < 5 {
        return;
    }
    ctx.bus.loc_direction.emit(
        LocDirectionEvent {
            uid: frame.device_uid(),
            direction: Direction::from_wire(frame.data[4]),
        },
        &ctx.pool,
    );
}

fn on_loc_function(ctx: &DispatcherContext, frame: &CanFrame) {
    if frame.dlc < 6 {
        return;
    }
    ctx.bus.loc_function.emit(
        LocFunctionEvent {
            uid: frame.device_uid(),
            function: frame.data[4],
            on: frame.data[5] != 0,
        },
        &ctx.pool,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::commands::{member_ping, CMD_ACCESSORY_SWITCH, CMD_S88_EVENT, CMD_STATUS_CONFIG, CMD_SYSTEM};
    use crate::can::generate_hash;
    use crate::transport::LoopbackTransport;

    const UID: u32 = 0x4353_0001;

    fn context() -> (DispatcherContext, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.connect().unwrap();
        let ctx = DispatcherContext {
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
            registry: Arc::new(Mutex::new(DeviceRegistry::new())),
            reconciler: Arc::new(Mutex::new(AccessoryReconciler::new())),
            bus: Arc::new(EventBus::new()),
            pool: Arc::new(WorkerPool::new(1).unwrap()),
            last_seen: Arc::new(Mutex::new(Instant::now())),
            power_on: Arc::new(AtomicBool::new(false)),
        };
        (ctx, transport)
    }

    fn make_main_known(ctx: &DispatcherContext) {
        let hash = generate_hash(UID);
        let frame = |payload: &[u8]| CanFrame::new((CMD_STATUS_CONFIG << 1) | 1, hash, payload);
        let mut registry = ctx.registry.lock();
        registry.on_status_config_frame(&frame(&[0, 0, 0, 0, 0, 0, 0x47, 0x11]));
        registry.on_status_config_frame(&frame(b"60214\0\0\0"));
        registry.on_status_config_frame(&frame(b"CS2\0\0\0\0\0"));
        let mut closing = [0u8; 6];
        closing[0..4].copy_from_slice(&UID.to_be_bytes());
        closing[5] = 3;
        registry.on_status_config_frame(&frame(&closing));
    }

    #[test]
    fn test_sensor_event_decoding() {
        let (ctx, transport) = context();
        let (tx, rx) = crossbeam_channel::unbounded();
        ctx.bus.sensor.subscribe(move |e: &SensorEvent| {
            tx.send(*e).unwrap();
        });
        let mut dispatcher = Dispatcher::spawn(ctx).unwrap();

        transport.inject(CanFrame::new(
            (CMD_S88_EVENT << 1) | 1,
            0x0301,
            &[0x00, 0x01, 0x00, 0x05, 0, 1, 0x00, 0x0A],
        ));
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.device_id, 1);
        assert_eq!(event.contact, 5);
        assert_eq!(event.previous, 0);
        assert_eq!(event.status, 1);
        assert_eq!(event.elapsed_ms, 100);
        dispatcher.shutdown();
    }

    #[test]
    fn test_accessory_echo_becomes_logical_event() {
        let (ctx, transport) = context();
        let (tx, rx) = crossbeam_channel::unbounded();
        ctx.bus.accessory.subscribe(move |e: &crate::events::AccessoryEvent| {
            tx.send(*e).unwrap();
        });
        let mut dispatcher = Dispatcher::spawn(ctx).unwrap();

        // DCC address 5 = uid 0x3804, green, activation.
        transport.inject(CanFrame::new(
            (CMD_ACCESSORY_SWITCH << 1) | 1,
            0x0301,
            &[0x00, 0x00, 0x38, 0x04, 1, 1],
        ));
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.address, 5);
        assert_eq!(event.value, crate::events::AccessoryValue::Green);

        // Deactivation echo produces nothing.
        transport.inject(CanFrame::new(
            (CMD_ACCESSORY_SWITCH << 1) | 1,
            0x0301,
            &[0x00, 0x00, 0x38, 0x04, 1, 0],
        ));
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        dispatcher.shutdown();
    }

    #[test]
    fn test_power_events_update_flag() {
        let (ctx, transport) = context();
        let power_on = Arc::clone(&ctx.power_on);
        let (tx, rx) = crossbeam_channel::unbounded();
        ctx.bus.power.subscribe(move |e: &PowerEvent| {
            tx.send(e.state).unwrap();
        });
        let mut dispatcher = Dispatcher::spawn(ctx).unwrap();

        transport.inject(CanFrame::new(
            (CMD_SYSTEM << 1) | 1,
            0x0301,
            &[0, 0, 0, 0, SYS_GO],
        ));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), PowerState::On);
        assert!(power_on.load(Ordering::Relaxed));

        transport.inject(CanFrame::new(
            (CMD_SYSTEM << 1) | 1,
            0x0301,
            &[0, 0, 0, 0, SYS_OVERLOAD],
        ));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PowerState::Overload
        );
        assert!(!power_on.load(Ordering::Relaxed));
        dispatcher.shutdown();
    }

    #[test]
    fn test_ping_answered_only_after_main_device_known() {
        let (ctx, transport) = context();
        let ctx_clone = ctx.clone();
        let mut dispatcher = Dispatcher::spawn(ctx).unwrap();

        transport.inject(member_ping(0x0777));
        thread::sleep(Duration::from_millis(200));
        assert!(transport.sent_frames().is_empty());

        make_main_known(&ctx_clone);
        transport.inject(member_ping(0x0778));
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let sent = transport.sent_frames();
            if let Some(reply) = sent.first() {
                assert!(reply.is_response());
                assert_eq!(reply.device_uid(), APP_UID);
                break;
            }
            assert!(Instant::now() < deadline, "no ping reply sent");
            thread::sleep(Duration::from_millis(10));
        }
        dispatcher.shutdown();
    }

    #[test]
    fn test_bad_frame_does_not_stop_dispatch() {
        let (ctx, transport) = context();
        let (tx, rx) = crossbeam_channel::unbounded();
        ctx.bus.sensor.subscribe(move |e: &SensorEvent| {
            tx.send(*e).unwrap();
        });
        let mut dispatcher = Dispatcher::spawn(ctx).unwrap();

        // Truncated feedback frame and an unknown command, then a good one.
        transport.inject(CanFrame::new((CMD_S88_EVENT << 1) | 1, 0, &[1, 2]));
        transport.inject(CanFrame::new(0xEE, 0, &[0xFF; 8]));
        transport.inject(CanFrame::new(
            (CMD_S88_EVENT << 1) | 1,
            0,
            &[0, 1, 0, 2, 1, 0, 0, 1],
        ));
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.contact, 2);
        dispatcher.shutdown();
    }

    #[test]
    fn test_keepalive_refreshes_last_seen() {
        let (ctx, transport) = context();
        let last_seen = Arc::clone(&ctx.last_seen);
        *last_seen.lock() = Instant::now() - Duration::from_secs(60);
        let mut dispatcher = Dispatcher::spawn(ctx).unwrap();

        transport.inject(CanFrame::new(0x36, 0x0301, &[])); // bootloader
        let deadline = Instant::now() + Duration::from_secs(1);
        while last_seen.lock().elapsed() > Duration::from_secs(5) {
            assert!(Instant::now() < deadline, "timestamp not refreshed");
            thread::sleep(Duration::from_millis(10));
        }
        dispatcher.shutdown();
    }
}
