//! # Utility Functions
//!
//! Small helpers used across rteval: human-readable durations and memory
//! sizes, the `/proc/loadavg` reader, console table printing and a privilege
//! check.
//!
//! ```rust
//! use rteval::utils::{format_duration, format_remaining};
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
//! assert_eq!(
//!     format_remaining(Duration::from_secs(90061)),
//!     "1 days, 1 hours, 1 minutes, 1 seconds"
//! );
//! ```

use std::io;
use std::path::Path;
use std::time::Duration;

/// Split a duration into whole days, hours, minutes and seconds
pub fn split_duration(duration: Duration) -> (u64, u64, u64, u64) {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    (days, hours, minutes, seconds)
}

/// Format a duration compactly for log lines
///
/// Sub-minute durations keep two decimals; longer ones use compound units.
///
/// ```rust
/// # use rteval::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
/// assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
/// assert_eq!(format_duration(Duration::from_secs(90000)), "1d 1h 0m 0s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    if duration < Duration::from_secs(60) {
        return format!("{:.2}s", duration.as_secs_f64());
    }
    let (days, hours, minutes, seconds) = split_duration(duration);
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else {
        format!("{}m {}s", minutes, seconds)
    }
}

/// Progress-report form of a remaining duration
pub fn format_remaining(duration: Duration) -> String {
    let (days, hours, minutes, seconds) = split_duration(duration);
    format!(
        "{} days, {} hours, {} minutes, {} seconds",
        days, hours, minutes, seconds
    )
}

/// Format a KiB amount with binary units
///
/// ```rust
/// # use rteval::utils::format_kib;
/// assert_eq!(format_kib(512), "512 KiB");
/// assert_eq!(format_kib(16318480), "15.56 GiB");
/// ```
pub fn format_kib(kib: u64) -> String {
    const UNITS: [&str; 3] = ["MiB", "GiB", "TiB"];
    if kib < 1024 {
        return format!("{} KiB", kib);
    }
    let mut value = kib as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Read the one-minute load average from a `/proc/loadavg`-format file
pub fn read_loadavg(path: &Path) -> io::Result<f64> {
    let text = std::fs::read_to_string(path)?;
    text.split_whitespace()
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected load average format: {:?}", text.trim()),
            )
        })
}

/// Whether the process runs with root privileges
///
/// Real-time priorities and some kernel interfaces need root.
pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Print a table row with consistent formatting
///
/// ```rust
/// # use rteval::utils::{print_table_row, print_table_separator};
/// let widths = [10, 8, 8];
/// print_table_separator(&widths);
/// print_table_row(&["Source", "Min", "Max"], &widths);
/// print_table_separator(&widths);
/// ```
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    print!("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        print!(" {:width$} |", column, width = width);
    }
    println!();
}

/// Print a `+----+----+` separator matching `widths`
pub fn print_table_separator(widths: &[usize]) {
    print!("+");
    for &width in widths {
        print!("{}+", "-".repeat(width + 2));
    }
    println!();
}
