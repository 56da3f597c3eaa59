//! Command codes and outbound frame builders
//!
//! Codes are given pre-shift; the wire command byte is `code << 1` with the
//! response bit in the LSB. Builders produce complete request frames for
//! everything the facade and discovery send.

use super::frame::CanFrame;

// Protocol command codes (pre-shift)
pub const CMD_SYSTEM: u8 = 0x00;
pub const CMD_LOC_SPEED: u8 = 0x04;
pub const CMD_LOC_DIRECTION: u8 = 0x05;
pub const CMD_LOC_FUNCTION: u8 = 0x06;
pub const CMD_ACCESSORY_SWITCH: u8 = 0x0B;
pub const CMD_S88_EVENT: u8 = 0x11;
pub const CMD_PING: u8 = 0x18;
pub const CMD_BOOTLOADER: u8 = 0x1B;
pub const CMD_STATUS_CONFIG: u8 = 0x1D;

// System sub-commands (payload byte 4, after the uid)
pub const SYS_STOP: u8 = 0x00;
pub const SYS_GO: u8 = 0x01;
pub const SYS_HALT: u8 = 0x02;
pub const SYS_LOC_EMERGENCY_STOP: u8 = 0x03;
pub const SYS_OVERLOAD: u8 = 0x0A;
pub const SYS_STATUS: u8 = 0x0B;

/// Uid this software announces itself with when answering member pings
pub const APP_UID: u32 = 0x5452_4B01;
/// Software version announced in ping replies (major.minor)
pub const APP_VERSION: u16 = 0x0100;
/// Device-type identifier for a software participant
pub const DEVICE_TYPE_SOFTWARE: u16 = 0xFFFF;

/// Classification of an inbound frame by command code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    System,
    LocSpeed,
    LocDirection,
    LocFunction,
    AccessorySwitch,
    FeedbackEvent,
    Ping,
    Bootloader,
    StatusConfig,
    Unknown,
}

impl CommandKind {
    /// Classify a frame; codes this core does not speak map to `Unknown`
    pub fn of(frame: &CanFrame) -> Self {
        match frame.command_code() {
            CMD_SYSTEM => Self::System,
            CMD_LOC_SPEED => Self::LocSpeed,
            CMD_LOC_DIRECTION => Self::LocDirection,
            CMD_LOC_FUNCTION => Self::LocFunction,
            CMD_ACCESSORY_SWITCH => Self::AccessorySwitch,
            CMD_S88_EVENT => Self::FeedbackEvent,
            CMD_PING => Self::Ping,
            CMD_BOOTLOADER => Self::Bootloader,
            CMD_STATUS_CONFIG => Self::StatusConfig,
            _ => Self::Unknown,
        }
    }
}

#[inline]
fn request(code: u8, hash: u16, payload: &[u8]) -> CanFrame {
    CanFrame::new(code << 1, hash, payload)
}

#[inline]
fn response(code: u8, hash: u16, payload: &[u8]) -> CanFrame {
    CanFrame::new((code << 1) | 0x01, hash, payload)
}

/// Broadcast member ping; every bus participant answers with its identity
pub fn member_ping(hash: u16) -> CanFrame {
    request(CMD_PING, hash, &[])
}

/// Identity reply to a member ping
pub fn ping_reply(hash: u16, uid: u32, version: u16, device_type: u16) -> CanFrame {
    let mut payload = [0u8; 8];
    payload[0..4].copy_from_slice(&uid.to_be_bytes());
    payload[4..6].copy_from_slice(&version.to_be_bytes());
    payload[6..8].copy_from_slice(&device_type.to_be_bytes());
    response(CMD_PING, hash, &payload)
}

/// Track power on (system go, broadcast uid 0)
pub fn system_go(hash: u16) -> CanFrame {
    request(CMD_SYSTEM, hash, &[0, 0, 0, 0, SYS_GO])
}

/// Track power off (system stop, broadcast uid 0)
pub fn system_stop(hash: u16) -> CanFrame {
    request(CMD_SYSTEM, hash, &[0, 0, 0, 0, SYS_STOP])
}

/// Read one measurement channel of a device
pub fn system_status_channel(hash: u16, uid: u32, channel: u8) -> CanFrame {
    let mut payload = [0u8; 6];
    payload[0..4].copy_from_slice(&uid.to_be_bytes());
    payload[4] = SYS_STATUS;
    payload[5] = channel;
    request(CMD_SYSTEM, hash, &payload)
}

/// Set locomotive speed (0..=1000)
pub fn loc_speed(hash: u16, loc_uid: u32, speed: u16) -> CanFrame {
    let mut payload = [0u8; 6];
    payload[0..4].copy_from_slice(&loc_uid.to_be_bytes());
    payload[4..6].copy_from_slice(&speed.min(1000).to_be_bytes());
    request(CMD_LOC_SPEED, hash, &payload)
}

/// Set locomotive direction (wire values: 1 forward, 2 backward)
pub fn loc_direction(hash: u16, loc_uid: u32, direction: u8) -> CanFrame {
    let mut payload = [0u8; 5];
    payload[0..4].copy_from_slice(&loc_uid.to_be_bytes());
    payload[4] = direction;
    request(CMD_LOC_DIRECTION, hash, &payload)
}

/// Set locomotive function state
pub fn loc_function(hash: u16, loc_uid: u32, function: u8, on: bool) -> CanFrame {
    let mut payload = [0u8; 6];
    payload[0..4].copy_from_slice(&loc_uid.to_be_bytes());
    payload[4] = function;
    payload[5] = u8::from(on);
    request(CMD_LOC_FUNCTION, hash, &payload)
}

/// Switch an accessory
///
/// `accessory_uid` is the protocol base plus the zero-based address,
/// `position` the wire value (0 red, 1 green), `ticks` the switch time in
/// device tick units. With `ticks` the station handles deactivation itself.
pub fn accessory_switch(hash: u16, accessory_uid: u32, position: u8, ticks: Option<u16>) -> CanFrame {
    let mut payload = [0u8; 8];
    payload[0..4].copy_from_slice(&accessory_uid.to_be_bytes());
    payload[4] = position;
    payload[5] = 1; // activate output
    match ticks {
        Some(t) => {
            payload[6..8].copy_from_slice(&t.to_be_bytes());
            request(CMD_ACCESSORY_SWITCH, hash, &payload)
        }
        None => request(CMD_ACCESSORY_SWITCH, hash, &payload[..6]),
    }
}

/// Request a device's status-config descriptor block
///
/// Index 0 is the device descriptor, indices 1.. the channel descriptors.
pub fn status_config(hash: u16, uid: u32, index: u8) -> CanFrame {
    let mut payload = [0u8; 5];
    payload[0..4].copy_from_slice(&uid.to_be_bytes());
    payload[4] = index;
    request(CMD_STATUS_CONFIG, hash, &payload)
}

/// Convert a switch time in milliseconds to device tick units
///
/// The station nominally counts 10 ms ticks, but observed firmware scales
/// the field by another factor of ten, so the conversion divides twice.
pub fn switch_time_ticks(millis: u16) -> u16 {
    millis / 10 / 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_ping_frame() {
        let frame = member_ping(0x0301);
        assert_eq!(frame.command, 0x30);
        assert_eq!(frame.dlc, 0);
        assert_eq!(frame.hash, 0x0301);
    }

    #[test]
    fn test_ping_reply_payload() {
        let frame = ping_reply(0x0301, 0x5452_4B01, 0x0100, 0xFFFF);
        assert_eq!(frame.command, 0x31);
        assert!(frame.is_response());
        assert_eq!(frame.device_uid(), 0x5452_4B01);
        assert_eq!(&frame.data[4..6], &[0x01, 0x00]);
        assert_eq!(&frame.data[6..8], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_system_go_stop() {
        let go = system_go(0x0301);
        assert_eq!(go.command, 0x00);
        assert_eq!(go.dlc, 5);
        assert_eq!(go.data[4], SYS_GO);

        let stop = system_stop(0x0301);
        assert_eq!(stop.data[4], SYS_STOP);
    }

    #[test]
    fn test_loc_speed_clamped() {
        let frame = loc_speed(0x0301, 0x4001, 5000);
        assert_eq!(frame.dlc, 6);
        assert_eq!(u16::from_be_bytes([frame.data[4], frame.data[5]]), 1000);
    }

    #[test]
    fn test_accessory_switch_with_ticks() {
        let frame = accessory_switch(0x0301, 0x3804, 1, Some(2));
        assert_eq!(frame.command, 0x16);
        assert_eq!(frame.dlc, 8);
        assert_eq!(frame.device_uid(), 0x3804);
        assert_eq!(frame.data[4], 1);
        assert_eq!(frame.data[5], 1);
        assert_eq!(u16::from_be_bytes([frame.data[6], frame.data[7]]), 2);
    }

    #[test]
    fn test_accessory_switch_without_ticks() {
        let frame = accessory_switch(0x0301, 0x3000, 0, None);
        assert_eq!(frame.dlc, 6);
    }

    #[test]
    fn test_switch_time_ticks_scale() {
        // 250 ms -> 25 ten-millisecond ticks -> 2 firmware units
        assert_eq!(switch_time_ticks(250), 2);
        assert_eq!(switch_time_ticks(200), 2);
        assert_eq!(switch_time_ticks(1000), 10);
        assert_eq!(switch_time_ticks(90), 0);
    }

    #[test]
    fn test_command_kind_classification() {
        assert_eq!(CommandKind::of(&member_ping(0)), CommandKind::Ping);
        assert_eq!(CommandKind::of(&system_go(0)), CommandKind::System);
        assert_eq!(
            CommandKind::of(&CanFrame::new(0xEE, 0, &[])),
            CommandKind::Unknown
        );
        assert_eq!(
            CommandKind::of(&CanFrame::new(0x23, 0, &[0; 8])),
            CommandKind::FeedbackEvent
        );
    }
}
