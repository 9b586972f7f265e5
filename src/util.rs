//! Hashing, time, and input-validation helpers.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{FidelityError, Result};

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

pub fn now_utc_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Validate that a path is not empty and does not contain null bytes.
pub fn validate_path(p: &Path, label: &str) -> Result<()> {
    let s = p.to_string_lossy();
    if s.is_empty() {
        return Err(FidelityError::Validation(format!("{label} path is empty")));
    }
    if s.contains('\0') {
        return Err(FidelityError::Validation(format!(
            "{label} path contains null byte"
        )));
    }
    Ok(())
}

/// Canonicalize a path if it exists, otherwise return it unchanged.
pub fn canonicalize_if_exists(p: &Path, label: &str) -> Result<PathBuf> {
    validate_path(p, label)?;
    if p.exists() {
        std::fs::canonicalize(p)
            .map_err(|e| FidelityError::Validation(format!("{label} path invalid: {e}")))
    } else {
        Ok(p.to_path_buf())
    }
}

/// A sweep axis must be non-empty and free of duplicates.
pub fn validate_axis(values: &[i64], label: &str) -> Result<()> {
    if values.is_empty() {
        return Err(FidelityError::Validation(format!("{label} axis is empty")));
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(FidelityError::Validation(format!(
            "{label} axis contains duplicate values"
        )));
    }
    Ok(())
}

/// Index of the axis value closest to `value`; the first one wins on ties.
pub fn nearest_index(axis: &[i64], value: i64) -> Option<usize> {
    axis.iter()
        .enumerate()
        .min_by_key(|(_, v)| (**v - value).unsigned_abs())
        .map(|(i, _)| i)
}

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("LDEFID_GIT_HASH");
pub const BUILD_TS: &str = env!("LDEFID_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-line version string for display.
pub fn version_string() -> String {
    format!("ldefid v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn axis_validation() {
        assert!(validate_axis(&[10, 12, 14], "dt").is_ok());
        assert!(validate_axis(&[150, 75], "win2").is_ok());
        assert!(validate_axis(&[], "dt").is_err());
        assert!(validate_axis(&[10, 12, 10], "dt").is_err());
    }

    #[test]
    fn nearest_index_prefers_first_on_tie() {
        let axis = [10, 20, 30];
        assert_eq!(nearest_index(&axis, 14), Some(0));
        assert_eq!(nearest_index(&axis, 15), Some(0));
        assert_eq!(nearest_index(&axis, 26), Some(2));
        assert_eq!(nearest_index(&axis, 1000), Some(2));
        assert_eq!(nearest_index(&[], 5), None);
    }

    #[test]
    fn empty_path_rejected() {
        assert!(validate_path(Path::new(""), "events").is_err());
        assert!(validate_path(Path::new("ZZ.csv"), "events").is_ok());
    }

    #[test]
    fn version_string_non_empty() {
        assert!(version_string().contains("ldefid"));
    }
}
