//! Parser for CS3 JSON catalog documents
//!
//! The CS3 web app serves locomotives at `/app/api/loks` and accessories at
//! `/app/api/mags`. Field types are not stable across firmware versions
//! (numbers sometimes arrive as hex strings), so parsing goes through
//! `serde_json::Value` and coerces leniently; a malformed record is skipped
//! with a warning.

use super::{classify_type, parse_number, AccessoryItem, AccessoryProtocol, FunctionDef, Locomotive};
use crate::error::{Error, Result};
use log::warn;
use serde_json::Value;

/// Coerce a JSON field that may be a number or a (possibly hex) string
fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v as u32),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn field_u32(obj: &Value, key: &str) -> Option<u32> {
    obj.get(key).and_then(as_u32)
}

fn field_str(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Extract the record array from a document that is either a bare array or
/// an object wrapping one under `key`
fn records<'a>(doc: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    doc.as_array()
        .or_else(|| doc.get(key).and_then(Value::as_array))
        .ok_or_else(|| Error::Catalog(format!("expected array (or `{key}` array)")))
}

/// Parse a CS3 locomotive document
pub fn parse_locomotives(content: &str) -> Result<Vec<Locomotive>> {
    let doc: Value =
        serde_json::from_str(content).map_err(|e| Error::Catalog(e.to_string()))?;
    let loks = records(&doc, "loks")?;

    Ok(loks
        .iter()
        .filter_map(|lok| {
            let Some(uid) = field_u32(lok, "uid") else {
                warn!("Skipping locomotive without uid: {:?}", field_str(lok, "name"));
                return None;
            };
            let functions = lok
                .get("funktionen")
                .and_then(Value::as_array)
                .map(|fns| {
                    fns.iter()
                        .filter_map(|f| {
                            Some(FunctionDef {
                                number: field_u32(f, "nr")? as u8,
                                kind: field_u32(f, "typ").unwrap_or(0) as u16,
                                value: field_u32(f, "wert").unwrap_or(0) as u8,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(Locomotive {
                uid,
                address: field_u32(lok, "address").or(field_u32(lok, "adresse")).unwrap_or(0) as u16,
                name: field_str(lok, "name").unwrap_or_default(),
                icon: field_str(lok, "icon"),
                velocity: field_u32(lok, "velocity").unwrap_or(0) as u16,
                direction: field_u32(lok, "richtung").unwrap_or(1) as u8,
                functions,
            })
        })
        .collect())
}

/// Parse a CS3 accessory document
pub fn parse_accessories(content: &str) -> Result<Vec<AccessoryItem>> {
    let doc: Value =
        serde_json::from_str(content).map_err(|e| Error::Catalog(e.to_string()))?;
    let mags = records(&doc, "mags")?;

    Ok(mags
        .iter()
        .filter_map(|mag| {
            let Some(address) = field_u32(mag, "id").or(field_u32(mag, "address")) else {
                warn!("Skipping accessory without id: {:?}", field_str(mag, "name"));
                return None;
            };
            let address = address as u16;
            let item_type = field_str(mag, "typ").unwrap_or_else(|| "std_rot_gruen".to_string());
            let (states, secondary_address) = classify_type(&item_type, address);
            Some(AccessoryItem {
                address,
                secondary_address,
                name: field_str(mag, "name").unwrap_or_default(),
                item_type,
                states,
                protocol: field_str(mag, "dectyp")
                    .map(|s| AccessoryProtocol::from_decoder_type(&s))
                    .unwrap_or(AccessoryProtocol::Motorola),
                switch_time_ms: field_u32(mag, "schaltzeit").map(|t| t as u16),
            })
        })
        .collect())
}
