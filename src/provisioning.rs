//! Device tag provisioning.
//!
//! Tags are a base identifier plus a four digit uppercase hex suffix, e.g.
//! `D202E7DF` + `0814`. Tag lists are kept as plain text, one tag per line.

use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Largest value a four digit hex suffix can hold.
pub const MAX_SUFFIX: u32 = 0xFFFF;

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Invalid hex bound {0:?}")]
    InvalidHex(String),

    #[error("Hex bound {0:?} does not fit a four digit suffix")]
    SuffixOutOfRange(String),

    #[error("Range start {start} is after range end {end}")]
    InvertedRange { start: String, end: String },

    #[error("Tag file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Generates `base + {:04X}` for every value from `start_hex` to `end_hex` inclusive.
pub fn generate_tags(base: &str, start_hex: &str, end_hex: &str) -> Result<Vec<String>, ProvisioningError> {
    let start = parse_hex(start_hex)?;
    let end = parse_hex(end_hex)?;
    if start > end {
        return Err(ProvisioningError::InvertedRange {
            start: start_hex.to_string(),
            end: end_hex.to_string(),
        });
    }

    let tags: Vec<String> = (start..=end).map(|i| format!("{}{:04X}", base, i)).collect();
    info!("Generated {} tags for base {}", tags.len(), base);
    Ok(tags)
}

fn parse_hex(value: &str) -> Result<u32, ProvisioningError> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let parsed =
        u32::from_str_radix(digits, 16).map_err(|_| ProvisioningError::InvalidHex(value.to_string()))?;
    if parsed > MAX_SUFFIX {
        return Err(ProvisioningError::SuffixOutOfRange(value.to_string()));
    }
    Ok(parsed)
}

/// Keeps tags with `from <= tag <= to`, compared as strings.
pub fn select_range(tags: &[String], from: &str, to: &str) -> Vec<String> {
    let selected: Vec<String> = tags
        .iter()
        .filter(|tag| from <= tag.as_str() && tag.as_str() <= to)
        .cloned()
        .collect();
    if selected.is_empty() {
        warn!("No tags found between {} and {}", from, to);
    }
    selected
}

/// Reads one tag per line, skipping blank lines.
pub fn load_tag_file(path: &Path) -> Result<Vec<String>, ProvisioningError> {
    let content = fs::read_to_string(path).map_err(|source| ProvisioningError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn write_tag_file(path: &Path, tags: &[String]) -> Result<(), ProvisioningError> {
    let mut content = tags.join("\n");
    content.push('\n');
    fs::write(path, content).map_err(|source| ProvisioningError::Io {
        path: path.display().to_string(),
        source,
    })?;
    info!("Saved {} tags to {}", tags.len(), path.display());
    Ok(())
}
