//! Parser for the legacy "CS2 file" catalog format
//!
//! The format is line oriented: a `[section]` header, then entries that
//! start in column zero, attributes indented as ` .key=value` and nested
//! attribute groups introduced by a value-less ` .group` line with
//! ` ..key=value` members:
//!
//! ```text
//! [lokomotive]
//! lok
//!  .uid=0x4001
//!  .name=BR 81 002
//!  .funktionen
//!  ..nr=0
//!  ..typ=1
//! ```
//!
//! Unparseable entries are skipped with a warning; a single bad record
//! never fails the whole catalog.

use super::{classify_type, parse_number, AccessoryItem, AccessoryProtocol, FunctionDef, Locomotive};
use log::warn;

/// One nested attribute group (e.g. `.funktionen`)
#[derive(Debug, Clone, Default)]
pub struct Cs2Group {
    pub name: String,
    pub fields: Vec<(String, String)>,
}

/// One entry (e.g. `lok`, `artikel`) with its attributes and groups
#[derive(Debug, Clone, Default)]
pub struct Cs2Entry {
    pub name: String,
    pub fields: Vec<(String, String)>,
    pub groups: Vec<Cs2Group>,
}

impl Cs2Entry {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn number(&self, key: &str) -> Option<u32> {
        self.field(key).and_then(parse_number)
    }
}

/// Parse the raw entry structure of a CS2 file
pub fn parse(content: &str) -> Vec<Cs2Entry> {
    let mut entries: Vec<Cs2Entry> = Vec::new();

    for line in content.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('[') || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix(" ..") {
            // Group member
            if let Some(entry) = entries.last_mut() {
                if let Some(group) = entry.groups.last_mut() {
                    if let Some((k, v)) = rest.split_once('=') {
                        group.fields.push((k.to_string(), v.to_string()));
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix(" .") {
            if let Some(entry) = entries.last_mut() {
                match rest.split_once('=') {
                    Some((k, v)) => entry.fields.push((k.to_string(), v.to_string())),
                    None => entry.groups.push(Cs2Group {
                        name: rest.to_string(),
                        fields: Vec::new(),
                    }),
                }
            }
        } else {
            entries.push(Cs2Entry {
                name: line.trim().to_string(),
                ..Default::default()
            });
        }
    }

    entries
}

/// Parse a `lokomotive.cs2` document
pub fn parse_locomotives(content: &str) -> Vec<Locomotive> {
    parse(content)
        .into_iter()
        .filter(|e| e.name == "lok" || e.name == "lokomotive")
        .filter_map(|entry| {
            let Some(uid) = entry.number("uid") else {
                warn!("Skipping locomotive without uid: {:?}", entry.field("name"));
                return None;
            };
            let functions = entry
                .groups
                .iter()
                .filter(|g| g.name == "funktionen")
                .filter_map(|g| {
                    let get = |key: &str| {
                        g.fields
                            .iter()
                            .find(|(k, _)| k == key)
                            .and_then(|(_, v)| parse_number(v))
                    };
                    Some(FunctionDef {
                        number: get("nr")? as u8,
                        kind: get("typ").unwrap_or(0) as u16,
                        value: get("wert").unwrap_or(0) as u8,
                    })
                })
                .collect();
            Some(Locomotive {
                uid,
                address: entry.number("adresse").unwrap_or(0) as u16,
                name: entry.field("name").unwrap_or_default().to_string(),
                icon: entry.field("icon").map(str::to_string),
                velocity: entry.number("velocity").unwrap_or(0) as u16,
                direction: entry.number("richtung").unwrap_or(1) as u8,
                functions,
            })
        })
        .collect()
}

/// Parse a `magnetartikel.cs2` document
pub fn parse_accessories(content: &str) -> Vec<AccessoryItem> {
    parse(content)
        .into_iter()
        .filter(|e| e.name == "artikel")
        .filter_map(|entry| {
            let Some(address) = entry.number("id") else {
                warn!("Skipping accessory without id: {:?}", entry.field("name"));
                return None;
            };
            let address = address as u16;
            let item_type = entry.field("typ").unwrap_or("std_rot_gruen").to_string();
            let (states, secondary_address) = classify_type(&item_type, address);
            Some(AccessoryItem {
                address,
                secondary_address,
                name: entry.field("name").unwrap_or_default().to_string(),
                item_type,
                states,
                protocol: entry
                    .field("dectyp")
                    .map(AccessoryProtocol::from_decoder_type)
                    .unwrap_or(AccessoryProtocol::Motorola),
                switch_time_ms: entry.number("schaltzeit").map(|t| t as u16),
            })
        })
        .collect()
}
