use std::time::Duration;

/// Format bytes in human-readable format (B, KB, MB, GB, TB)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format a per-second rate with a decimal prefix, e.g. `1.50 kB/s`.
pub fn format_rate(per_second: f64, unit: &str) -> String {
    const PREFIXES: &[&str] = &["", "k", "M", "G", "T"];
    if !per_second.is_finite() || per_second <= 0.0 {
        return format!("0 {}", unit);
    }

    let mut rate = per_second;
    let mut prefix_index = 0;
    while rate >= 1000.0 && prefix_index < PREFIXES.len() - 1 {
        rate /= 1000.0;
        prefix_index += 1;
    }

    format!("{:.2} {}{}", rate, PREFIXES[prefix_index], unit)
}

/// Format elapsed time, keeping millisecond precision below a minute.
pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    if seconds < 1 {
        format!("{}ms", elapsed.as_millis())
    } else if seconds < 60 {
        format!("{:.3}s", elapsed.as_secs_f64())
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}
