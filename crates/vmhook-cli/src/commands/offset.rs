//! Offset command implementation.

use super::hex_utils::parse_hex_address;
use anyhow::Result;

/// Signed distance from `from` to `to`, formatted as printed.
pub fn describe(from: u64, to: u64) -> String {
    let diff = to.abs_diff(from);
    let sign = if to >= from { "" } else { "-" };
    format!("{}{} ({}0x{:X})", sign, diff, sign, diff)
}

pub fn run(from: &str, to: &str) -> Result<()> {
    let from_addr = parse_hex_address(from)?;
    let to_addr = parse_hex_address(to)?;

    println!("From: 0x{:X}", from_addr);
    println!("To:   0x{:X}", to_addr);
    println!();
    println!("Offset: {}", describe(from_addr, to_addr));

    Ok(())
}
