//! Virtual command station (in-process loopback transport)
//!
//! Synthesizes the inbound frames a real Central Station would produce, so
//! the whole core runs without hardware: a member ping finds a virtual
//! station and a virtual feedback module, status-config requests return
//! canned descriptor sequences, control commands are echoed back as
//! responses and measurement reads answer with jittered values.
//!
//! The loopback honors the same [`Transport`] contract as the TCP
//! implementation, so nothing above the transport can tell the difference.

use super::{await_responses, AwaitSpec, Exchange, PendingTable, Transport};
use crate::can::commands::{
    ping_reply, CommandKind, CMD_BOOTLOADER, CMD_STATUS_CONFIG, SYS_STATUS,
};
use crate::can::{generate_hash, CanFrame};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use log::debug;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Uid of the virtual station (article 60214)
pub const VIRTUAL_MAIN_UID: u32 = 0x4353_0001;
/// Uid of the virtual feedback module (article 60883)
pub const VIRTUAL_LINK_UID: u32 = 0x5338_0001;

const VIRTUAL_MAIN_VERSION: u16 = 0x0145;
const VIRTUAL_LINK_VERSION: u16 = 0x0103;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

struct VirtualChannel {
    number: u8,
    power: i8,
    range_start: u16,
    range_end: u16,
    red_range: u16,
    name: &'static str,
    unit: &'static str,
}

fn main_channels() -> [VirtualChannel; 4] {
    [
        VirtualChannel {
            number: 1,
            power: -3,
            range_start: 0,
            range_end: 2500,
            red_range: 2000,
            name: "MAIN",
            unit: "A",
        },
        VirtualChannel {
            number: 2,
            power: -3,
            range_start: 0,
            range_end: 500,
            red_range: 400,
            name: "PROG",
            unit: "A",
        },
        VirtualChannel {
            number: 3,
            power: -1,
            range_start: 100,
            range_end: 270,
            red_range: 240,
            name: "VOLT",
            unit: "V",
        },
        VirtualChannel {
            number: 4,
            power: 0,
            range_start: 0,
            range_end: 80,
            red_range: 65,
            name: "TEMP",
            unit: "C",
        },
    ]
}

pub struct LoopbackTransport {
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    pending: Arc<PendingTable>,
    events_tx: Sender<CanFrame>,
    events_rx: Receiver<CanFrame>,
    sent: Mutex<Vec<CanFrame>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(PendingTable::new()),
            events_tx,
            events_rx,
            sent: Mutex::new(Vec::new()),
            keepalive: Mutex::new(None),
        }
    }

    /// Frames callers have sent through this transport (test introspection)
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Push an arbitrary inbound frame, as if the station had sent it
    pub fn inject(&self, frame: CanFrame) {
        self.route(frame);
    }

    fn route(&self, frame: CanFrame) {
        if !self.pending.offer(&frame) {
            let _ = self.events_tx.send(frame);
        }
    }

    fn synthesize(&self, request: CanFrame) {
        match CommandKind::of(&request) {
            _ if request.is_response() => {}
            CommandKind::Ping => {
                self.route(ping_reply(
                    generate_hash(VIRTUAL_MAIN_UID),
                    VIRTUAL_MAIN_UID,
                    VIRTUAL_MAIN_VERSION,
                    0x0000,
                ));
                self.route(ping_reply(
                    generate_hash(VIRTUAL_LINK_UID),
                    VIRTUAL_LINK_UID,
                    VIRTUAL_LINK_VERSION,
                    0x0040,
                ));
            }
            CommandKind::StatusConfig => {
                let uid = request.device_uid();
                let index = request.data[4];
                for frame in descriptor_sequence(uid, index) {
                    self.route(frame);
                }
            }
            CommandKind::System if request.dlc >= 6 && request.data[4] == SYS_STATUS => {
                self.route(measurement_reply(&request));
            }
            CommandKind::System
            | CommandKind::LocSpeed
            | CommandKind::LocDirection
            | CommandKind::LocFunction
            | CommandKind::AccessorySwitch => {
                // Echo as a response frame, the way the station confirms
                // control commands to all participants.
                let mut echo = request;
                echo.command |= 0x01;
                self.route(echo);
            }
            other => {
                debug!("Virtual station ignores {:?}", other);
            }
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the status-config reply sequence for a virtual device
fn descriptor_sequence(uid: u32, index: u8) -> Vec<CanFrame> {
    let hash = generate_hash(uid);
    let mut packets: Vec<[u8; 8]> = Vec::new();

    if index == 0 {
        let (meas, cfg, serial, article, name) = match uid {
            VIRTUAL_MAIN_UID => (4u8, 0u8, 0x0000_4711u32, "60214", "Central Station 2"),
            VIRTUAL_LINK_UID => (0u8, 3u8, 0x0000_0815u32, "60883", "Link S88"),
            _ => return Vec::new(),
        };
        let mut pkt0 = [0u8; 8];
        pkt0[0] = meas;
        pkt0[1] = cfg;
        pkt0[4..8].copy_from_slice(&serial.to_be_bytes());
        packets.push(pkt0);
        packets.push(text_packet(article));
        packets.extend(text_packets(name));
    } else {
        let channel = match uid {
            VIRTUAL_MAIN_UID => {
                let channels = main_channels();
                match channels.into_iter().find(|c| c.number == index) {
                    Some(c) => c,
                    None => return Vec::new(),
                }
            }
            VIRTUAL_LINK_UID => {
                if index > 3 {
                    return Vec::new();
                }
                VirtualChannel {
                    number: index,
                    power: 0,
                    range_start: 0,
                    range_end: 16,
                    red_range: 0,
                    name: "Bus",
                    unit: "",
                }
            }
            _ => return Vec::new(),
        };
        let mut pkt0 = [0u8; 8];
        pkt0[0] = channel.number;
        pkt0[1] = channel.power as u8;
        pkt0[2..4].copy_from_slice(&channel.range_start.to_be_bytes());
        pkt0[4..6].copy_from_slice(&channel.range_end.to_be_bytes());
        pkt0[6..8].copy_from_slice(&channel.red_range.to_be_bytes());
        packets.push(pkt0);
        let text = format!("{}\0{}\0", channel.name, channel.unit);
        packets.extend(text_packets(&text));
    }

    let count = packets.len() as u8;
    let mut frames: Vec<CanFrame> = packets
        .into_iter()
        .map(|p| CanFrame::new((CMD_STATUS_CONFIG << 1) | 1, hash, &p))
        .collect();

    // Closing frame echoes the request and carries the packet count.
    let mut closing = [0u8; 6];
    closing[0..4].copy_from_slice(&uid.to_be_bytes());
    closing[4] = index;
    closing[5] = count;
    frames.push(CanFrame::new((CMD_STATUS_CONFIG << 1) | 1, hash, &closing));
    frames
}

fn text_packet(text: &str) -> [u8; 8] {
    let mut pkt = [0u8; 8];
    let bytes = text.as_bytes();
    let len = bytes.len().min(8);
    pkt[..len].copy_from_slice(&bytes[..len]);
    pkt
}

fn text_packets(text: &str) -> Vec<[u8; 8]> {
    text.as_bytes().chunks(8).map(|chunk| {
        let mut pkt = [0u8; 8];
        pkt[..chunk.len()].copy_from_slice(chunk);
        pkt
    }).collect()
}

/// Jittered measurement reply for a system status read
fn measurement_reply(request: &CanFrame) -> CanFrame {
    let channel = request.data[5];
    let (lo, hi) = main_channels()
        .iter()
        .find(|c| c.number == channel)
        .map(|c| (c.range_start, c.range_end))
        .unwrap_or((0, 100));
    let mid = (lo + hi) / 2;
    let spread = ((hi - lo) / 10).max(1);
    let value: u16 = rand::thread_rng().gen_range(mid.saturating_sub(spread)..mid + spread);

    let mut payload = [0u8; 8];
    payload[0..4].copy_from_slice(&request.data[0..4]);
    payload[4] = SYS_STATUS;
    payload[5] = channel;
    payload[6..8].copy_from_slice(&value.to_be_bytes());
    CanFrame::new(request.command | 0x01, generate_hash(VIRTUAL_MAIN_UID), &payload)
}

impl Transport for LoopbackTransport {
    fn connect(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Relaxed);

        // Periodic keepalives, like the bootloader frames a real station
        // broadcasts. The watchdog is inert in virtual mode, but the frames
        // keep the dispatcher path honest.
        let handle = thread::Builder::new()
            .name("trackio-virtual-keepalive".to_string())
            .spawn({
                let shutdown = Arc::clone(&self.shutdown);
                let events_tx = self.events_tx.clone();
                let hash = generate_hash(VIRTUAL_MAIN_UID);
                move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        thread::sleep(KEEPALIVE_INTERVAL);
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        let _ = events_tx.send(CanFrame::new(CMD_BOOTLOADER << 1, hash, &[]));
                    }
                }
            })?;
        *self.keepalive.lock() = Some(handle);
        Ok(())
    }

    fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.keepalive.lock().take() {
            let _ = handle.join();
        }
        self.pending.clear();
        self.connected.store(false, Ordering::Relaxed);
    }

    fn send(&self, frame: CanFrame) -> Result<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(Error::NotConnected);
        }
        self.sent.lock().push(frame);
        self.synthesize(frame);
        Ok(())
    }

    fn send_and_await(&self, frame: CanFrame, spec: AwaitSpec) -> Exchange {
        let (id, rx) = self.pending.register(frame);
        if self.send(frame).is_err() {
            self.pending.complete(id);
            return Exchange {
                request: frame,
                responses: Vec::new(),
            };
        }
        let exchange = await_responses(&rx, frame, spec);
        self.pending.complete(id);
        exchange
    }

    fn events(&self) -> Receiver<CanFrame> {
        self.events_rx.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::commands::{accessory_switch, member_ping, status_config, system_go};

    #[test]
    fn test_ping_finds_both_virtual_members() {
        let transport = LoopbackTransport::new();
        transport.connect().unwrap();

        let exchange =
            transport.send_and_await(member_ping(0x0301), AwaitSpec::sequence(Duration::from_secs(1)));
        let uids: Vec<u32> = exchange.responses.iter().map(|f| f.device_uid()).collect();
        assert!(uids.contains(&VIRTUAL_MAIN_UID));
        assert!(uids.contains(&VIRTUAL_LINK_UID));
    }

    #[test]
    fn test_status_config_sequence_has_closing_frame() {
        let transport = LoopbackTransport::new();
        transport.connect().unwrap();

        // Data packets carry no uid, so the request hash must match the
        // replying device's hash for them to correlate.
        let exchange = transport.send_and_await(
            status_config(generate_hash(VIRTUAL_MAIN_UID), VIRTUAL_MAIN_UID, 0),
            AwaitSpec::discovery(),
        );
        assert!(exchange.responses.len() >= 3);
        let closing = exchange.responses.last().unwrap();
        assert_eq!(closing.dlc, 6);
        assert_eq!(closing.device_uid(), VIRTUAL_MAIN_UID);
        assert_eq!(closing.data[5] as usize, exchange.responses.len() - 1);
    }

    #[test]
    fn test_control_echo_reaches_event_stream() {
        let transport = LoopbackTransport::new();
        transport.connect().unwrap();
        let events = transport.events();

        transport
            .send(accessory_switch(0x0301, 0x3804, 1, Some(2)))
            .unwrap();
        let echo = events.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(echo.is_response());
        assert_eq!(echo.device_uid(), 0x3804);
    }

    #[test]
    fn test_power_echo_and_sent_log() {
        let transport = LoopbackTransport::new();
        transport.connect().unwrap();

        let exchange = transport.send_and_await(system_go(0x0301), AwaitSpec::control());
        assert!(exchange.answered());
        assert_eq!(transport.sent_frames().len(), 1);
    }

    #[test]
    fn test_disconnected_send_fails() {
        let transport = LoopbackTransport::new();
        match transport.send(member_ping(0x0301)) {
            Err(Error::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
    }
}
