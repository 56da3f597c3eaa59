//! Command facade: the public control surface of one station connection
//!
//! A [`CsController`] owns the transport, registry, reconciler, event bus
//! and the background threads (dispatcher, watchdog, measurement poller).
//! Domain calls translate into encoded frames; control commands other than
//! `power` refuse to run while disconnected or with track power off.

use crate::accessory::AccessoryReconciler;
use crate::can::commands::{
    accessory_switch, loc_direction, loc_function, loc_speed, member_ping, status_config,
    switch_time_ticks, system_go, system_status_channel, system_stop, APP_UID,
};
use crate::can::generate_hash;
use crate::catalog::{AccessoryItem, AccessoryProtocol, Locomotive};
use crate::config::ControllerConfig;
use crate::devices::{Channel, Device, DeviceRegistry};
use crate::dispatcher::{Dispatcher, DispatcherContext};
use crate::error::{Error, Result};
use crate::events::{AccessoryValue, Direction, EventBus, PowerEvent, PowerState};
use crate::transport::{
    AwaitSpec, CatalogSource, HttpClient, LoopbackTransport, TcpTransport, Transport,
};
use crate::watchdog::{Reconnect, Watchdog};
use crate::workers::WorkerPool;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Worker threads for listener fan-out and fire-and-forget work
const POOL_SIZE: usize = 2;

pub struct CsController {
    config: ControllerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<Mutex<DeviceRegistry>>,
    reconciler: Arc<Mutex<AccessoryReconciler>>,
    bus: Arc<EventBus>,
    pool: Arc<WorkerPool>,
    last_seen: Arc<Mutex<Instant>>,
    power_on: Arc<AtomicBool>,
    /// Our own participant hash, used on every outbound control frame
    hash: u16,
    locomotives: Mutex<Vec<Locomotive>>,
    accessories: Mutex<Vec<AccessoryItem>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    watchdog: Mutex<Option<Watchdog>>,
    poller: Mutex<Option<MeasurementPoller>>,
}

impl CsController {
    /// Build a controller for the configured station; virtual mode swaps in
    /// the in-process loopback
    pub fn new(config: ControllerConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = if config.connection.virtual_mode {
            Arc::new(LoopbackTransport::new())
        } else {
            Arc::new(TcpTransport::new(
                &config.connection.host,
                config.connection.can_port,
            ))
        };
        Self::with_transport(config, transport)
    }

    /// Build a controller around an explicit transport (tests, embedding)
    pub fn with_transport(config: ControllerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Ok(Self {
            config,
            transport,
            registry: Arc::new(Mutex::new(DeviceRegistry::new())),
            reconciler: Arc::new(Mutex::new(AccessoryReconciler::new())),
            bus: Arc::new(EventBus::new()),
            pool: Arc::new(WorkerPool::new(POOL_SIZE)?),
            last_seen: Arc::new(Mutex::new(Instant::now())),
            power_on: Arc::new(AtomicBool::new(false)),
            hash: generate_hash(APP_UID),
            locomotives: Mutex::new(Vec::new()),
            accessories: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
            watchdog: Mutex::new(None),
            poller: Mutex::new(None),
        })
    }

    /// Connect, discover the bus members and start the background threads
    ///
    /// Idempotent: an established connection is torn down first so threads
    /// are never duplicated.
    pub fn connect(&self) -> Result<()> {
        self.disconnect();
        self.transport.connect()?;
        *self.last_seen.lock() = Instant::now();

        *self.dispatcher.lock() = Some(Dispatcher::spawn(self.context())?);

        run_discovery(
            &self.transport,
            &self.registry,
            self.hash,
            self.discovery_timeout(),
        );
        self.fetch_catalogs();

        if !self.transport.is_virtual() && self.config.timing.watchdog_interval_secs > 0 {
            let reconnect = self
                .config
                .connection
                .auto_connect
                .then(|| self.reconnector());
            *self.watchdog.lock() = Some(Watchdog::spawn(
                Duration::from_secs(self.config.timing.watchdog_interval_secs),
                Arc::clone(&self.transport),
                Arc::clone(&self.last_seen),
                Arc::clone(&self.bus),
                Arc::clone(&self.pool),
                reconnect,
            )?);
        }
        if self.config.timing.measurement_poll_secs > 0 {
            *self.poller.lock() = Some(MeasurementPoller::spawn(
                Duration::from_secs(self.config.timing.measurement_poll_secs),
                self.context(),
            )?);
        }

        info!(
            "Connected, {} bus member(s) discovered",
            self.registry.lock().len()
        );
        Ok(())
    }

    /// Stop the background threads and close the transport; idempotent
    pub fn disconnect(&self) {
        if let Some(mut poller) = self.poller.lock().take() {
            poller.shutdown();
        }
        if let Some(mut watchdog) = self.watchdog.lock().take() {
            watchdog.shutdown();
        }
        if let Some(mut dispatcher) = self.dispatcher.lock().take() {
            dispatcher.shutdown();
        }
        self.transport.close();
        self.power_on.store(false, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Listener registration point
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    fn context(&self) -> DispatcherContext {
        DispatcherContext {
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            reconciler: Arc::clone(&self.reconciler),
            bus: Arc::clone(&self.bus),
            pool: Arc::clone(&self.pool),
            last_seen: Arc::clone(&self.last_seen),
            power_on: Arc::clone(&self.power_on),
        }
    }

    fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timing.discovery_timeout_ms)
    }

    /// Reconnect closure handed to the watchdog
    fn reconnector(&self) -> Reconnect {
        let transport = Arc::clone(&self.transport);
        let registry = Arc::clone(&self.registry);
        let hash = self.hash;
        let timeout = self.discovery_timeout();
        Arc::new(move || {
            transport.connect()?;
            run_discovery(&transport, &registry, hash, timeout);
            Ok(())
        })
    }

    /// Switch track power; the only control allowed while power is off
    pub fn power(&self, on: bool) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::NotConnected);
        }
        let frame = if on {
            system_go(self.hash)
        } else {
            system_stop(self.hash)
        };
        let spec = AwaitSpec::single(Duration::from_millis(self.config.timing.control_timeout_ms));
        let exchange = self.transport.send_and_await(frame, spec);
        if !exchange.answered() {
            debug!("Power command not acknowledged within timeout");
        }
        // The confirmation was claimed by the await, so apply it here
        // instead of in the dispatcher.
        self.power_on.store(on, Ordering::Relaxed);
        let state = if on { PowerState::On } else { PowerState::Off };
        self.bus.power.emit(PowerEvent { state }, &self.pool);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::NotConnected);
        }
        if !self.power_on.load(Ordering::Relaxed) {
            return Err(Error::PowerOff);
        }
        Ok(())
    }

    /// Set a locomotive's speed (0..=1000)
    pub fn change_velocity(&self, loc_uid: u32, speed: u16) -> Result<()> {
        self.ensure_ready()?;
        self.transport.send(loc_speed(self.hash, loc_uid, speed))
    }

    pub fn change_direction(&self, loc_uid: u32, direction: Direction) -> Result<()> {
        self.ensure_ready()?;
        self.transport
            .send(loc_direction(self.hash, loc_uid, direction.to_wire()))
    }

    pub fn change_function(&self, loc_uid: u32, function: u8, on: bool) -> Result<()> {
        self.ensure_ready()?;
        self.transport
            .send(loc_function(self.hash, loc_uid, function, on))
    }

    /// Switch an accessory to a logical position
    ///
    /// `address` is the 1-based protocol address from the catalog. `Red2`
    /// and `Green2` target the secondary address of a bi-address device;
    /// `Green` on a bi-address device activates green on both halves.
    pub fn switch_accessory(
        &self,
        address: u16,
        protocol: AccessoryProtocol,
        value: AccessoryValue,
        switch_time_ms: Option<u16>,
    ) -> Result<()> {
        self.ensure_ready()?;
        if address == 0 {
            return Err(Error::InvalidParameter(
                "accessory address must be 1 or higher".to_string(),
            ));
        }
        let millis = switch_time_ms.unwrap_or(self.config.timing.default_switch_time_ms);
        let ticks = switch_time_ticks(millis);
        let secondary = self.secondary_of(address).unwrap_or(address + 1);

        let targets: Vec<(u16, u8)> = match value {
            AccessoryValue::Red => vec![(address, 0)],
            AccessoryValue::Green => {
                if self.secondary_of(address).is_some() {
                    vec![(address, 1), (secondary, 1)]
                } else {
                    vec![(address, 1)]
                }
            }
            AccessoryValue::Red2 => vec![(secondary, 0)],
            AccessoryValue::Green2 => vec![(secondary, 1)],
        };
        for (addr, position) in targets {
            let uid = protocol.address_base() + u32::from(addr - 1);
            self.transport
                .send(accessory_switch(self.hash, uid, position, Some(ticks)))?;
        }
        Ok(())
    }

    fn secondary_of(&self, address: u16) -> Option<u16> {
        self.accessories
            .lock()
            .iter()
            .find(|item| item.address == address)
            .and_then(|item| item.secondary_address)
    }

    pub fn locomotives(&self) -> Vec<Locomotive> {
        self.locomotives.lock().clone()
    }

    pub fn accessories(&self) -> Vec<AccessoryItem> {
        self.accessories.lock().clone()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry.lock().devices()
    }

    /// Current measurement channels of the main device
    pub fn track_measurements(&self) -> Vec<Channel> {
        self.registry
            .lock()
            .main_device()
            .map(|d| d.channels.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Pull the catalogs over the HTTP side-channel
    ///
    /// A failing catalog fetch degrades the controller (no names, no
    /// bi-address pairs) but never fails the connection.
    fn fetch_catalogs(&self) {
        if self.transport.is_virtual() {
            return;
        }
        let Some(article) = self
            .registry
            .lock()
            .main_device()
            .map(|d| d.article.clone())
        else {
            warn!("No main device resolved, skipping catalog fetch");
            return;
        };
        let source = CatalogSource::for_article(&article);
        let client = match HttpClient::new(
            &self.config.connection.host,
            self.config.connection.http_port,
            source,
        ) {
            Ok(client) => client,
            Err(e) => {
                warn!("HTTP client unavailable: {e}");
                return;
            }
        };
        match client.fetch_locomotives() {
            Ok(loks) => *self.locomotives.lock() = loks,
            Err(e) => warn!("Locomotive catalog fetch failed: {e}"),
        }
        match client.fetch_accessories() {
            Ok(items) => {
                self.reconciler.lock().load_catalog(&items);
                *self.accessories.lock() = items;
            }
            Err(e) => warn!("Accessory catalog fetch failed: {e}"),
        }
    }
}

impl Drop for CsController {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Discover bus members and fetch descriptors for incomplete ones
///
/// Safe to re-run: replies upsert by uid, so a second pass refreshes
/// devices in place. Incomplete devices stay registered and are retried on
/// the next pass.
fn run_discovery(
    transport: &Arc<dyn Transport>,
    registry: &Arc<Mutex<DeviceRegistry>>,
    hash: u16,
    timeout: Duration,
) {
    let exchange = transport.send_and_await(member_ping(hash), AwaitSpec::sequence(timeout));
    {
        let mut reg = registry.lock();
        for reply in &exchange.responses {
            reg.on_ping_reply(reply);
        }
    }

    let incomplete = registry.lock().incomplete_uids();
    for uid in incomplete {
        // Descriptor packets correlate by the sender's hash, so the request
        // carries the device's hash rather than our own.
        let exchange = transport.send_and_await(
            status_config(generate_hash(uid), uid, 0),
            AwaitSpec::sequence(timeout),
        );
        if exchange.answered() {
            registry.lock().apply_exchange(&exchange);
        } else {
            debug!("Device {uid:#010x} did not answer status-config, left incomplete");
        }
    }

    // Channel descriptors for the devices that announce any.
    let channel_requests: Vec<(u32, u8)> = registry
        .lock()
        .devices()
        .iter()
        .filter(|d| d.is_complete())
        .map(|d| {
            (
                d.uid,
                d.measurement_channel_count.max(d.config_channel_count),
            )
        })
        .collect();
    for (uid, count) in channel_requests {
        for index in 1..=count {
            let exchange = transport.send_and_await(
                status_config(generate_hash(uid), uid, index),
                AwaitSpec::sequence(timeout),
            );
            if exchange.answered() {
                registry.lock().apply_exchange(&exchange);
            }
        }
    }
}

/// Periodic measurement reads of the main device's channels
struct MeasurementPoller {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl MeasurementPoller {
    fn spawn(interval: Duration, ctx: DispatcherContext) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let tick = interval.min(Duration::from_millis(200));
        let handle = thread::Builder::new()
            .name("trackio-measure-poll".to_string())
            .spawn({
                let shutdown = Arc::clone(&shutdown);
                move || {
                    let mut next = Instant::now() + interval;
                    while !shutdown.load(Ordering::Relaxed) {
                        thread::sleep(tick);
                        if shutdown.load(Ordering::Relaxed) || Instant::now() < next {
                            continue;
                        }
                        next = Instant::now() + interval;
                        poll_once(&ctx);
                    }
                }
            })?;
        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MeasurementPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_once(ctx: &DispatcherContext) {
    let Some((uid, channels)) = ctx
        .registry
        .lock()
        .main_device()
        .map(|d| (d.uid, d.channels.keys().copied().collect::<Vec<u8>>()))
    else {
        return;
    };
    for channel in channels {
        let exchange = ctx.transport.send_and_await(
            system_status_channel(generate_hash(uid), uid, channel),
            AwaitSpec::control(),
        );
        let Some(reply) = exchange.first() else {
            continue;
        };
        if reply.dlc != 8 {
            continue;
        }
        let raw = u16::from_be_bytes([reply.data[6], reply.data[7]]);
        // The reply was claimed by the await, so the event is emitted here.
        let event = ctx.registry.lock().update_measurement(uid, channel, raw);
        if let Some(event) = event {
            ctx.bus.measurement.emit(event, &ctx.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::transport::{VIRTUAL_LINK_UID, VIRTUAL_MAIN_UID};

    fn virtual_controller() -> (CsController, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let controller = CsController::with_transport(
            ControllerConfig::virtual_defaults(),
            Arc::clone(&transport) as Arc<dyn Transport>,
        )
        .unwrap();
        (controller, transport)
    }

    #[test]
    fn test_power_while_disconnected_fails_without_frames() {
        let (controller, transport) = virtual_controller();
        match controller.power(true) {
            Err(Error::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
        assert!(transport.sent_frames().is_empty());
    }

    #[test]
    fn test_connect_discovers_virtual_devices() {
        let (controller, _transport) = virtual_controller();
        controller.connect().unwrap();

        let devices = controller.devices();
        assert_eq!(devices.len(), 2);
        let main = devices.iter().find(|d| d.uid == VIRTUAL_MAIN_UID).unwrap();
        assert_eq!(main.article, "60214");
        assert_eq!(main.name, "Central Station 2");
        assert_eq!(main.channels.len(), 4);
        let link = devices.iter().find(|d| d.uid == VIRTUAL_LINK_UID).unwrap();
        assert!(link.is_feedback());
        assert_eq!(link.feedback_buses.len(), 3);

        let measurements = controller.track_measurements();
        assert_eq!(measurements.len(), 4);
        assert!(measurements.iter().any(|c| c.name == "VOLT"));
        controller.disconnect();
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let (controller, _transport) = virtual_controller();
        controller.connect().unwrap();
        run_discovery(
            &controller.transport,
            &controller.registry,
            controller.hash,
            Duration::from_secs(1),
        );
        assert_eq!(controller.devices().len(), 2);
        controller.disconnect();
    }

    #[test]
    fn test_controls_refused_while_power_off() {
        let (controller, transport) = virtual_controller();
        controller.connect().unwrap();
        transport.clear_sent();

        match controller.change_velocity(0x4001, 500) {
            Err(Error::PowerOff) => {}
            other => panic!("expected PowerOff, got {other:?}"),
        }
        assert!(transport.sent_frames().is_empty());
        controller.disconnect();
    }

    #[test]
    fn test_switch_accessory_dcc_address_and_ticks() {
        let (controller, transport) = virtual_controller();
        controller.connect().unwrap();
        controller.power(true).unwrap();
        transport.clear_sent();

        controller
            .switch_accessory(
                5,
                AccessoryProtocol::Dcc,
                AccessoryValue::Green,
                Some(250),
            )
            .unwrap();
        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        let frame = &sent[0];
        assert_eq!(frame.device_uid(), 0x3804);
        assert_eq!(frame.data[4], 1);
        assert_eq!(frame.data[5], 1);
        assert_eq!(u16::from_be_bytes([frame.data[6], frame.data[7]]), 2);
        controller.disconnect();
    }

    #[test]
    fn test_switch_bi_address_green_sends_both_halves() {
        let (controller, transport) = virtual_controller();
        controller.connect().unwrap();
        controller.power(true).unwrap();
        *controller.accessories.lock() = vec![AccessoryItem {
            address: 10,
            secondary_address: Some(11),
            name: "DWW".to_string(),
            item_type: "dreiwegweiche".to_string(),
            states: 3,
            protocol: AccessoryProtocol::Motorola,
            switch_time_ms: None,
        }];
        transport.clear_sent();

        controller
            .switch_accessory(
                10,
                AccessoryProtocol::Motorola,
                AccessoryValue::Green,
                None,
            )
            .unwrap();
        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].device_uid(), 0x3009);
        assert_eq!(sent[1].device_uid(), 0x300A);
        controller.disconnect();
    }

    #[test]
    fn test_power_roundtrip_gates_controls() {
        let (controller, transport) = virtual_controller();
        controller.connect().unwrap();
        controller.power(true).unwrap();
        transport.clear_sent();

        controller.change_velocity(0x4001, 500).unwrap();
        controller
            .change_direction(0x4001, Direction::Backward)
            .unwrap();
        controller.change_function(0x4001, 0, true).unwrap();
        assert_eq!(transport.sent_frames().len(), 3);

        controller.power(false).unwrap();
        assert!(controller.change_velocity(0x4001, 100).is_err());
        controller.disconnect();
    }

    #[test]
    fn test_zero_address_rejected() {
        let (controller, _transport) = virtual_controller();
        controller.connect().unwrap();
        controller.power(true).unwrap();
        match controller.switch_accessory(
            0,
            AccessoryProtocol::Motorola,
            AccessoryValue::Red,
            None,
        ) {
            Err(Error::InvalidParameter(_)) => {}
            other => panic!("expected InvalidParameter, got {other:?}"),
        }
        controller.disconnect();
    }
}
