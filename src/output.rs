/*! Human and collector-mode printers.
§6 treats these as pure formatting over a already-queried [`crate::device::Device`];
neither mode blocks on anything or talks to a sink.
*/

use std::fmt::Write as _;

use crate::device::Device;

/// Render the device's revision, serial number and requested channels as a
/// multi-line, human-oriented report.
pub fn format_human(device: &Device, channels: &[usize]) -> String {
    let mut out = String::new();
    match device.revision() {
        Ok(rev) => writeln!(out, "revision: {rev}").unwrap(),
        Err(e) => writeln!(out, "revision: error: {e}").unwrap(),
    }
    match device.serial_number() {
        Ok(serial) => writeln!(out, "serial: {serial}").unwrap(),
        Err(e) => writeln!(out, "serial: error: {e}").unwrap(),
    }
    for &i in channels {
        match device.channel(i) {
            Ok(v) => writeln!(out, "channel{:02}: {v}", i + 1).unwrap(),
            Err(e) => writeln!(out, "channel{:02}: error: {e}", i + 1).unwrap(),
        }
    }
    out
}

/// Render `channels` in collector-mode format (§6): a bare value for a
/// single channel, or `meterXX:V` space-separated pairs for more than one,
/// with `nan` standing in for any channel that failed to read. No trailing
/// newline; the caller writes it with a single `println!` or equivalent.
pub fn format_collector(device: &Device, channels: &[usize]) -> String {
    let value = |i: usize| match device.channel(i) {
        Ok(v) => v.to_string(),
        Err(_) => "nan".to_string(),
    };

    if channels.len() == 1 {
        return value(channels[0]);
    }

    channels
        .iter()
        .map(|&i| format!("meter{:02}:{}", i + 1, value(i)))
        .collect::<Vec<_>>()
        .join(" ")
}
