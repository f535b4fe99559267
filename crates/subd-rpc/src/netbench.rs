//! Persisted network benchmark.
//!
//! The file holds the measured link speed in bytes per second as decimal
//! text followed by a newline.

use std::path::Path;

use anyhow::{Context, Result};

/// Reads a saved benchmark. A missing file yields `None`.
pub fn load_netbench(path: &Path) -> Result<Option<u64>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let speed = text
        .trim()
        .parse::<u64>()
        .with_context(|| format!("Malformed network benchmark in {}", path.display()))?;
    Ok((speed > 0).then_some(speed))
}

pub fn save_netbench(path: &Path, bytes_per_second: u64) -> Result<()> {
    std::fs::write(path, format!("{bytes_per_second}\n"))
        .with_context(|| format!("Failed to write {}", path.display()))
}
