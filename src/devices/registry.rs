//! Registry of discovered bus members
//!
//! Devices are announced by ping replies and fleshed out by status-config
//! descriptor sequences. Sequences collected by `send_and_await` arrive as
//! a complete [`Exchange`]; sequences observed passively on the event path
//! arrive frame by frame and are reassembled here, keyed by sender hash,
//! until the closing frame names the device and packet count.

use super::device::Device;
use crate::can::{CanFrame, MAX_DLC};
use crate::events::MeasurementEvent;
use crate::transport::Exchange;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u32, Device>,
    /// Partial status-config sequences on the passive path, keyed by hash
    partial: HashMap<u16, Vec<[u8; 8]>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, uid: u32) -> Option<&Device> {
        self.devices.get(&uid)
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    /// The main command station, once its article is known
    pub fn main_device(&self) -> Option<&Device> {
        self.devices.values().find(|d| d.is_main())
    }

    /// The feedback module, once its article is known
    pub fn feedback_device(&self) -> Option<&Device> {
        self.devices.values().find(|d| d.is_feedback())
    }

    /// Uids still missing their base descriptor
    pub fn incomplete_uids(&self) -> Vec<u32> {
        self.devices
            .values()
            .filter(|d| !d.is_complete())
            .map(|d| d.uid)
            .collect()
    }

    /// Upsert a device from a ping reply
    ///
    /// Idempotent: a second reply for a known uid only refreshes the
    /// identity fields.
    pub fn on_ping_reply(&mut self, frame: &CanFrame) {
        if frame.dlc != 8 {
            return;
        }
        let uid = frame.device_uid();
        let version = u16::from_be_bytes([frame.data[4], frame.data[5]]);
        let device_type = u16::from_be_bytes([frame.data[6], frame.data[7]]);
        let device = self.devices.entry(uid).or_insert_with(|| Device::new(uid));
        device.apply_identity(version, device_type);
        debug!(
            "Ping reply from {uid:#010x} ({}, v{})",
            device.type_name,
            device.version_string()
        );
    }

    /// Feed one status-config response frame from the passive event path
    pub fn on_status_config_frame(&mut self, frame: &CanFrame) {
        if frame.dlc == MAX_DLC {
            self.partial.entry(frame.hash).or_default().push(frame.data);
            return;
        }
        if frame.dlc != 6 {
            return;
        }
        let packets = self.partial.remove(&frame.hash).unwrap_or_default();
        let uid = frame.device_uid();
        self.apply_sequence(uid, frame.data[4], frame.data[5], packets);
    }

    /// Apply a complete status-config exchange from active discovery
    pub fn apply_exchange(&mut self, exchange: &Exchange) {
        let mut packets: Vec<[u8; 8]> = Vec::new();
        let mut closing: Option<&CanFrame> = None;
        for response in &exchange.responses {
            if response.dlc == MAX_DLC {
                packets.push(response.data);
            } else if response.dlc == 6 {
                closing = Some(response);
            }
        }
        let Some(closing) = closing else {
            warn!(
                "Status-config exchange for {:#010x} ended without closing frame",
                exchange.request.device_uid()
            );
            return;
        };
        self.apply_sequence(closing.device_uid(), closing.data[4], closing.data[5], packets);
    }

    fn apply_sequence(&mut self, uid: u32, index: u8, expected: u8, packets: Vec<[u8; 8]>) {
        if packets.len() != expected as usize {
            warn!(
                "Dropping status-config sequence for {uid:#010x} index {index}: \
                 got {} packets, closing frame announced {expected}",
                packets.len()
            );
            return;
        }
        let device = self.devices.entry(uid).or_insert_with(|| Device::new(uid));
        if index == 0 {
            device.apply_descriptor(&packets);
            debug!(
                "Device {uid:#010x} described: article {} name {:?}",
                device.article, device.name
            );
        } else {
            device.apply_channel_descriptor(&packets);
        }
    }

    /// Store a raw measurement reading and build the event for listeners
    pub fn update_measurement(
        &mut self,
        uid: u32,
        channel: u8,
        raw: u16,
    ) -> Option<MeasurementEvent> {
        let device = self.devices.get_mut(&uid)?;
        let ch = device.channels.get_mut(&channel)?;
        ch.raw_value = raw;
        Some(MeasurementEvent {
            uid,
            channel,
            raw,
            value: ch.display_value(),
            name: ch.name.clone(),
            unit: ch.unit.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::commands::{ping_reply, CMD_STATUS_CONFIG};
    use crate::can::generate_hash;

    const UID: u32 = 0x4353_0001;

    fn status_frame(hash: u16, payload: &[u8]) -> CanFrame {
        CanFrame::new((CMD_STATUS_CONFIG << 1) | 1, hash, payload)
    }

    fn base_sequence(hash: u16) -> Vec<CanFrame> {
        let mut pkt0 = [0u8; 8];
        pkt0[0] = 4;
        pkt0[4..8].copy_from_slice(&0x4711u32.to_be_bytes());
        let article = *b"60214\0\0\0";
        let name_a = *b"Central ";
        let name_b = *b"Station\0";

        let mut frames: Vec<CanFrame> = [pkt0, article, name_a, name_b]
            .iter()
            .map(|p| status_frame(hash, p))
            .collect();
        let mut closing = [0u8; 6];
        closing[0..4].copy_from_slice(&UID.to_be_bytes());
        closing[4] = 0;
        closing[5] = 4;
        frames.push(status_frame(hash, &closing));
        frames
    }

    #[test]
    fn test_ping_reply_upsert_is_idempotent() {
        let mut registry = DeviceRegistry::new();
        let reply = ping_reply(generate_hash(UID), UID, 0x0145, 0x0000);

        registry.on_ping_reply(&reply);
        registry.on_ping_reply(&reply);
        assert_eq!(registry.len(), 1);
        let device = registry.get(UID).unwrap();
        assert_eq!(device.version_string(), "1.69");
        assert_eq!(registry.incomplete_uids(), vec![UID]);
    }

    #[test]
    fn test_passive_reassembly_by_hash() {
        let mut registry = DeviceRegistry::new();
        let hash = generate_hash(UID);
        for frame in base_sequence(hash) {
            registry.on_status_config_frame(&frame);
        }
        let device = registry.get(UID).unwrap();
        assert_eq!(device.article, "60214");
        assert_eq!(device.name, "Central Station");
        assert!(device.is_complete());
        assert!(registry.main_device().is_some());
    }

    #[test]
    fn test_packet_count_mismatch_drops_sequence() {
        let mut registry = DeviceRegistry::new();
        let hash = generate_hash(UID);
        let mut frames = base_sequence(hash);
        frames.remove(1); // lose the article packet
        for frame in frames {
            registry.on_status_config_frame(&frame);
        }
        // Device exists (entry from closing frame path is skipped on
        // mismatch), so nothing was recorded at all.
        assert!(registry.get(UID).is_none());
    }

    #[test]
    fn test_apply_exchange() {
        let mut registry = DeviceRegistry::new();
        let hash = generate_hash(UID);
        let exchange = Exchange {
            request: crate::can::commands::status_config(hash, UID, 0),
            responses: base_sequence(hash),
        };
        registry.apply_exchange(&exchange);
        assert!(registry.get(UID).unwrap().is_complete());
    }

    #[test]
    fn test_exchange_without_closing_is_ignored() {
        let mut registry = DeviceRegistry::new();
        let hash = generate_hash(UID);
        let mut frames = base_sequence(hash);
        frames.pop();
        let exchange = Exchange {
            request: crate::can::commands::status_config(hash, UID, 0),
            responses: frames,
        };
        registry.apply_exchange(&exchange);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_measurement() {
        let mut registry = DeviceRegistry::new();
        let hash = generate_hash(UID);
        for frame in base_sequence(hash) {
            registry.on_status_config_frame(&frame);
        }
        // Channel 3: VOLT, scale -1.
        let mut pkt0 = [0u8; 8];
        pkt0[0] = 3;
        pkt0[1] = (-1i8) as u8;
        pkt0[4..6].copy_from_slice(&270u16.to_be_bytes());
        let text = *b"VOLT\0V\0\0";
        let mut closing = [0u8; 6];
        closing[0..4].copy_from_slice(&UID.to_be_bytes());
        closing[4] = 3;
        closing[5] = 2;
        registry.on_status_config_frame(&status_frame(hash, &pkt0));
        registry.on_status_config_frame(&status_frame(hash, &text));
        registry.on_status_config_frame(&status_frame(hash, &closing));

        let event = registry.update_measurement(UID, 3, 185).unwrap();
        assert_eq!(event.raw, 185);
        assert_eq!(event.value, Some(18.5));
        assert_eq!(event.unit, "V");

        assert!(registry.update_measurement(UID, 99, 1).is_none());
        assert!(registry.update_measurement(0xDEAD, 1, 1).is_none());
    }
}
