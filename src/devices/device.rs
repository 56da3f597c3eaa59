//! One discovered bus member and its measurement/configuration channels

use std::collections::BTreeMap;

/// Article numbers of main command stations
pub const MAIN_ARTICLES: &[&str] = &["60213", "60214", "60215", "60216", "60226"];
/// Article number of the Link S88 feedback module
pub const FEEDBACK_ARTICLE: &str = "60883";

/// Human name for a ping-reply device type code
pub fn describe_device_type(device_type: u16) -> &'static str {
    match device_type {
        0x0000 => "Central Station",
        0x0010 => "Gleisbox",
        0x0020 => "Connect 6021",
        0x0040 => "Link S88",
        0xFFFF => "Software client",
        _ => "Unknown",
    }
}

/// A measurement or feedback channel described by a channel descriptor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    pub number: u8,
    pub name: String,
    pub unit: String,
    /// Decimal scale exponent; display value is `raw * 10^scale`
    pub scale: i8,
    pub range_start: u16,
    pub range_end: u16,
    /// Upper bound of the normal operating range
    pub red_range: u16,
    pub raw_value: u16,
    /// Set once the descriptor has been received
    pub calibrated: bool,
}

impl Channel {
    /// Scaled display value, once the channel is calibrated
    pub fn display_value(&self) -> Option<f64> {
        self.calibrated
            .then(|| self.raw_value as f64 * 10f64.powi(self.scale as i32))
    }

    /// Whether the last raw reading exceeds the red range
    pub fn in_red_range(&self) -> bool {
        self.red_range > 0 && self.raw_value >= self.red_range
    }
}

/// A bus member assembled from ping replies and status-config descriptors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Device {
    pub uid: u32,
    /// Firmware version, major in the high byte
    pub version: u16,
    /// Raw device type code from the ping reply
    pub device_type: u16,
    pub type_name: String,
    pub serial: u32,
    /// Article number, e.g. "60214"
    pub article: String,
    pub name: String,
    pub measurement_channel_count: u8,
    pub config_channel_count: u8,
    /// Measurement channels, keyed by channel number
    pub channels: BTreeMap<u8, Channel>,
    /// Feedback bus descriptors of a Link S88, keyed by bus number
    pub feedback_buses: BTreeMap<u8, Channel>,
}

impl Device {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            ..Default::default()
        }
    }

    /// A device is complete once the base descriptor has supplied both
    /// article and name
    pub fn is_complete(&self) -> bool {
        !self.article.is_empty() && !self.name.is_empty()
    }

    pub fn is_main(&self) -> bool {
        MAIN_ARTICLES.contains(&self.article.as_str())
    }

    pub fn is_feedback(&self) -> bool {
        self.article == FEEDBACK_ARTICLE
    }

    /// "major.minor" firmware version string
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.version >> 8, self.version & 0xFF)
    }

    /// Apply the version and type fields of a ping reply
    pub fn apply_identity(&mut self, version: u16, device_type: u16) {
        self.version = version;
        self.device_type = device_type;
        self.type_name = describe_device_type(device_type).to_string();
    }

    /// Apply a base descriptor (status-config index 0)
    ///
    /// Packet 0 carries the channel counts and serial, packet 1 the article
    /// number as ASCII, the remaining packets the device name.
    pub fn apply_descriptor(&mut self, packets: &[[u8; 8]]) {
        let Some(head) = packets.first() else {
            return;
        };
        self.measurement_channel_count = head[0];
        self.config_channel_count = head[1];
        self.serial = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        if let Some(article) = packets.get(1) {
            self.article = packet_text(article);
        }
        if packets.len() > 2 {
            self.name = packets_text(&packets[2..]);
        }
    }

    /// Apply a channel descriptor (status-config index >= 1)
    ///
    /// Packet 0 carries number, scale exponent and ranges; the remaining
    /// packets carry "name\0unit\0".
    pub fn apply_channel_descriptor(&mut self, packets: &[[u8; 8]]) {
        let Some(head) = packets.first() else {
            return;
        };
        let mut channel = Channel {
            number: head[0],
            scale: head[1] as i8,
            range_start: u16::from_be_bytes([head[2], head[3]]),
            range_end: u16::from_be_bytes([head[4], head[5]]),
            red_range: u16::from_be_bytes([head[6], head[7]]),
            calibrated: true,
            ..Default::default()
        };
        if packets.len() > 1 {
            let text = packets_text(&packets[1..]);
            let mut parts = text.split('\0');
            channel.name = parts.next().unwrap_or_default().to_string();
            channel.unit = parts.next().unwrap_or_default().to_string();
        }
        if self.is_feedback() {
            self.feedback_buses.insert(channel.number, channel);
        } else {
            self.channels.insert(channel.number, channel);
        }
    }
}

/// NUL-terminated ASCII from one packet
fn packet_text(packet: &[u8; 8]) -> String {
    let end = packet.iter().position(|&b| b == 0).unwrap_or(8);
    String::from_utf8_lossy(&packet[..end]).into_owned()
}

/// Concatenated ASCII across packets, trimmed of trailing NULs
fn packets_text(packets: &[[u8; 8]]) -> String {
    let bytes: Vec<u8> = packets.iter().flatten().copied().collect();
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    String::from_utf8_lossy(&bytes[..end])
        .trim_end()
        .to_string()
}
