//! Locomotive and accessory catalogs
//!
//! Catalogs arrive over the HTTP side-channel, either as legacy delimited
//! "CS2 files" or as CS3 JSON documents. Both parse into the same domain
//! types; bi-address declarations feed the accessory reconciler and the
//! decoder protocol feeds `switch_accessory`.

pub mod cs2file;
pub mod json;

use serde::{Deserialize, Serialize};

/// Accessory decoder protocols and their CAN address bases
///
/// The protocols occupy disjoint address ranges on the bus; the physical
/// accessory uid is the base plus the zero-based address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessoryProtocol {
    Motorola,
    Dcc,
    Sx1,
}

impl AccessoryProtocol {
    pub fn address_base(self) -> u32 {
        match self {
            Self::Motorola => 0x3000,
            Self::Sx1 => 0x2800,
            Self::Dcc => 0x3800,
        }
    }

    /// Map a decoder-type string from the catalogs ("mm2", "dcc", "sx1")
    pub fn from_decoder_type(s: &str) -> Self {
        let s = s.to_ascii_lowercase();
        if s.starts_with("dcc") {
            Self::Dcc
        } else if s.starts_with("sx") {
            Self::Sx1
        } else {
            Self::Motorola
        }
    }

    /// Classify a physical accessory uid back into protocol and 1-based address
    pub fn split_uid(uid: u32) -> Option<(Self, u16)> {
        for protocol in [Self::Dcc, Self::Motorola, Self::Sx1] {
            let base = protocol.address_base();
            if (base..base + 0x0400).contains(&uid) {
                return Some((protocol, (uid - base + 1) as u16));
            }
        }
        None
    }
}

/// A locomotive function slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub number: u8,
    /// Function type identifier from the catalog (icon/behavior class)
    pub kind: u16,
    pub value: u8,
}

/// A locomotive catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locomotive {
    pub uid: u32,
    pub address: u16,
    pub name: String,
    pub icon: Option<String>,
    pub velocity: u16,
    pub direction: u8,
    pub functions: Vec<FunctionDef>,
}

/// An accessory catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessoryItem {
    /// Primary protocol address (1-based)
    pub address: u16,
    /// Second address of a bi-address device (three-way turnouts,
    /// multi-aspect signals)
    pub secondary_address: Option<u16>,
    pub name: String,
    /// Raw type string from the catalog (e.g. "rechtsweiche")
    pub item_type: String,
    /// Number of discrete states (2, 3 or 4)
    pub states: u8,
    pub protocol: AccessoryProtocol,
    pub switch_time_ms: Option<u16>,
}

impl AccessoryItem {
    /// Whether this device spans two protocol addresses
    pub fn is_bi_address(&self) -> bool {
        self.secondary_address.is_some()
    }
}

/// Derive state count and secondary address from a catalog type string
///
/// Three-way turnouts and HP012-style signals span two consecutive
/// addresses; the SH01 variants add a fourth aspect.
pub(crate) fn classify_type(item_type: &str, address: u16) -> (u8, Option<u16>) {
    let t = item_type.to_ascii_lowercase();
    if t.contains("012_sh01") {
        (4, Some(address + 1))
    } else if t.contains("dreiweg") || t.contains("012") {
        (3, Some(address + 1))
    } else {
        (2, None)
    }
}

/// Parse a catalog number that may be decimal or 0x-prefixed hex
pub(crate) fn parse_number(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}
