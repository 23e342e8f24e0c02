//! Human-readable byte sizes for progress messages.

const UNITS: &[&str] = &["KiB", "MiB", "GiB", "TiB", "PiB"];

/// Bytes in one GiB, the unit worker sizing works in.
pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Format a byte count, e.g. `512 B`, `1.50 GiB`.
pub fn human_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.2} {unit}")
}

/// Bytes expressed in GiB.
pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / GIB
}
