//! Balance fingerprint persistence.
//!
//! The only cross-run state artifact: a 16-hex-char digest over the
//! current quotas, saved to a single text file. Comparing it against
//! the previous run's digest detects balance changes without storing
//! any history.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::types::BalanceSnapshot;

/// Default fingerprint file path.
const DEFAULT_FINGERPRINT_FILE: &str = "balance_fingerprint.txt";

/// Hex characters kept from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 16;

/// Compute the fingerprint for a set of balances.
///
/// Canonical input is `{accountKey: quota}` with sorted keys and no
/// extraneous whitespace. `used` is excluded: it moves every run and
/// would make every fingerprint differ.
pub fn compute(balances: &BTreeMap<String, BalanceSnapshot>) -> String {
    let canonical: BTreeMap<&str, f64> = balances
        .iter()
        .map(|(key, snapshot)| {
            let quota = if snapshot.quota.is_finite() {
                snapshot.quota
            } else {
                0.0
            };
            (key.as_str(), quota)
        })
        .collect();
    let json = serde_json::to_string(&canonical).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())[..FINGERPRINT_LEN].to_string()
}

/// Load the previous fingerprint from disk.
/// Returns None if the file doesn't exist (first run).
pub fn load(path: Option<&str>) -> Result<Option<String>> {
    let path = path.unwrap_or(DEFAULT_FINGERPRINT_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved fingerprint found, treating as first run");
        return Ok(None);
    }

    let contents = std::fs::read_to_string(path)
        .context(format!("Failed to read fingerprint from {path}"))?;
    let fingerprint = contents.trim().to_string();

    if fingerprint.is_empty() {
        return Ok(None);
    }

    debug!(path, fingerprint = %fingerprint, "Fingerprint loaded from disk");
    Ok(Some(fingerprint))
}

/// Overwrite the persisted fingerprint. Callers treat failures as
/// non-fatal; the next run simply sees no prior state.
pub fn save(fingerprint: &str, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_FINGERPRINT_FILE);
    std::fs::write(path, fingerprint)
        .context(format!("Failed to write fingerprint to {path}"))?;

    debug!(path, fingerprint, "Fingerprint saved");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
