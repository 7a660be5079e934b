//! Beacon payload parsing
//!
//! Devices advertise with a free-text UTF-16LE payload that contains, in order,
//! a host name, an IPv4 address and a MAC address. Anything around or between
//! those three fields is ignored, and the first left-to-right match wins.

use crate::types::DeviceIdentity;
use regex::Regex;
use std::sync::LazyLock;

/// Host label: letters, digits, `_`, `.` and `-`
const NAME: &str = r"([a-zA-Z0-9_.\-]+)";

/// Lazy filler between fields
const FILLER: &str = r".*?";

/// One IPv4 octet, 0-255
const OCTET: &str = r"(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)";

/// MAC starting directly after the address. The address may not be followed by
/// a digit, so the first character has to be a hex letter.
const MAC_ADJACENT: &str = r"([a-fA-F][0-9a-fA-F]:(?:[0-9a-fA-F]{2}:){4}[0-9a-fA-F]{2})";

const MAC: &str = r"((?:[0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2})";

/// The MAC may not run on into another hex digit or colon
const MAC_END: &str = r"(?:\z|[^:0-9a-fA-F])";

// The regex crate has no lookahead, so "not followed by" is written as a
// consuming alternative: either the MAC starts right away, or one non-digit
// is consumed before the filler. Both accept and pick the same matches.
static BEACON_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let ipv4 = format!(r"((?:{OCTET}\.){{3}}{OCTET})");
    let expr = format!(r"(?s){NAME}{FILLER}{ipv4}(?:{MAC_ADJACENT}|\D{FILLER}{MAC}){MAC_END}");
    Regex::new(&expr).expect("beacon pattern is a valid regex")
});

/// Decodes a raw datagram as UTF-16LE text.
///
/// Unpaired surrogates and a trailing odd byte become U+FFFD.
pub fn decode_payload(payload: &[u8]) -> String {
    let units = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));

    let mut text: String = char::decode_utf16(units)
        .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();

    if payload.len() % 2 == 1 {
        text.push(char::REPLACEMENT_CHARACTER);
    }

    text
}

/// Encodes text the way devices put it on the wire.
pub fn encode_beacon(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Parses a raw beacon datagram.
///
/// Returns `None` when the payload is not a device beacon.
pub fn parse_beacon(payload: &[u8]) -> Option<DeviceIdentity> {
    parse_beacon_text(&decode_payload(payload))
}

/// Parses already-decoded beacon text.
pub fn parse_beacon_text(text: &str) -> Option<DeviceIdentity> {
    let fields = BEACON_PATTERN.captures(text)?;

    let name = fields.get(1)?.as_str();
    let network_address = fields.get(2)?.as_str();
    let hardware_address = fields.get(3).or_else(|| fields.get(4))?.as_str();

    Some(DeviceIdentity::new(name, network_address, hardware_address))
}
