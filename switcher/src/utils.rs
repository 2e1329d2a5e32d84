//! Small helpers shared by the protocol adapter and the seeder.

use std::net::IpAddr;

/// Big-endian hex rendering of a 32-bit value, zero padded.
pub fn u32_to_hex_be(value: u32) -> String {
    format!("{value:08x}")
}

/// Little-endian (byte-reversed) hex rendering of a 32-bit value.
pub fn u32_to_hex_le(value: u32) -> String {
    let bytes = value.to_le_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

/// Packs an IPv4 address into a big-endian u32 for the upstream subscribe.
/// IPv6 peers without a v4 mapping pack as zero.
pub fn ip_to_u32(ip: IpAddr) -> u32 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(u32::from).unwrap_or(0),
    }
}

/// Drops characters that would break logging or re-encoding of a worker
/// name: anything outside graphic ASCII, plus quoting and bracket
/// metacharacters.
pub fn filter_worker_name(name: &str) -> String {
    name.chars()
        .filter(|c| {
            c.is_ascii_graphic()
                && !matches!(c, '"' | '\'' | '\\' | '{' | '}' | '[' | ']' | '(' | ')')
        })
        .collect()
}

/// Strips a leading `0x`-prefixed 40-hex-digit wallet address (and the dot
/// separating it from the rest) from an Ethereum worker name.
pub fn strip_eth_addr_from_full_name(name: &str) -> &str {
    let bytes = name.as_bytes();
    if bytes.len() >= 43
        && name.starts_with("0x")
        && bytes[2..42].iter().all(|b| b.is_ascii_hexdigit())
        && bytes[42] == b'.'
    {
        &name[43..]
    } else {
        name
    }
}
