//! Structured error types for the fidelity-analysis library.
//!
//! Every public library function returns [`Result<T>`] which carries a
//! subsystem-tagged [`FidelityError`].  Insufficient statistics is *not* an
//! error: [`crate::correlate::correlate`] reports it as a flag.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Domain-specific error type for the library.
#[derive(Error, Debug)]
pub enum FidelityError {
    #[error("extract: {0}")]
    Extract(String),

    #[error("filter: {0}")]
    Filter(String),

    #[error("readout correction: {0}")]
    Correction(String),

    #[error("fidelity: {0}")]
    Fidelity(String),

    #[error("sweep: {0}")]
    Sweep(String),

    #[error("store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// CSV decode/encode errors (auto-converted via `?` in the table readers).
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, FidelityError>;

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Extension trait that adds subsystem context to any `Result<T, E>`.
///
/// ```ignore
/// std::fs::read(path).ctx_store("read archive")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_extract(self, msg: &str) -> Result<T>;
    fn ctx_sweep(self, msg: &str) -> Result<T>;
    fn ctx_store(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_extract(self, msg: &str) -> Result<T> {
        self.map_err(|e| FidelityError::Extract(format!("{msg}: {e}")))
    }
    fn ctx_sweep(self, msg: &str) -> Result<T> {
        self.map_err(|e| FidelityError::Sweep(format!("{msg}: {e}")))
    }
    fn ctx_store(self, msg: &str) -> Result<T> {
        self.map_err(|e| FidelityError::Store(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| FidelityError::Config(format!("{msg}: {e}")))
    }
}

/// Same as [`ResultExt`] but for `Option<T>` (converts `None` into an error).
pub trait OptionExt<T> {
    fn required_extract(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required_extract(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| FidelityError::Extract(msg.to_string()))
    }
}
