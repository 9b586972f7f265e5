//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. An explicit `--config` path
//! 2. `ldefid.toml` next to the executable
//! 3. `$HOME/.config/ldefid/config.toml` (`%LOCALAPPDATA%\ldefid\config.toml` on Windows)
//! 4. Environment variable overrides (e.g. `LDEFID_OUTPUT_DIR`)
//!
//! CLI arguments always take precedence over config file values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FidelityError, Result, ResultExt as _};
use crate::fidelity::CorrectionMode;
use crate::readout::ReadoutFidelities;

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LdeConfig {
    pub paths: PathsConfig,
    pub extraction: ExtractionConfig,
    pub readout: ReadoutConfig,
    pub sweep: SweepConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root below which run folders are looked up.
    pub data_dir: PathBuf,
    /// Where event tables and sweep archives are written.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Earliest accepted click time (time-tagger bins).
    pub start: i64,
    /// Latest accepted click time.
    pub stop: i64,
    /// Substring identifying detection files; also their name prefix.
    pub detection_marker: String,
    pub outcome_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutConfig {
    pub f0_a: f64,
    pub u_f0_a: f64,
    pub f1_a: f64,
    pub u_f1_a: f64,
    pub f0_b: f64,
    pub u_f0_b: f64,
    pub f1_b: f64,
    pub u_f1_b: f64,
    /// Extremal values of node B's F1 used by the lower-bound modes.
    pub f1_b_upper: f64,
    pub f1_b_lower: f64,
}

/// An axis given either as explicit values or as `{start, stop, step}`
/// with an exclusive `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisSpec {
    Values(Vec<i64>),
    Range { start: i64, stop: i64, step: i64 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub dt: AxisSpec,
    pub win1: AxisSpec,
    pub win2: AxisSpec,
    pub ch0_start: i64,
    pub ch1_offset: i64,
    pub dt_min: i64,
    pub dt_slices: bool,
    pub mode: CorrectionMode,
    pub parallel: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines log file.  Empty string means no file logging.
    pub json_log_file: String,
    /// Whether to output JSON to stdout instead of human-readable stderr.
    pub json_stdout: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("ldefid-output"),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            start: 630,
            stop: 880,
            detection_marker: "hhp_data".to_string(),
            outcome_prefix: "ssro_data".to_string(),
        }
    }
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        // corrected for imperfect initialization
        Self {
            f0_a: 0.921,
            u_f0_a: 0.003,
            f1_a: 0.997,
            u_f1_a: 0.001,
            f0_b: 0.822,
            u_f0_b: 0.008,
            f1_b: 0.989,
            u_f1_b: 0.010,
            f1_b_upper: 0.998,
            f1_b_lower: 0.962,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            dt: AxisSpec::Range {
                start: 10,
                stop: 151,
                step: 2,
            },
            win1: AxisSpec::Values(vec![150]),
            win2: AxisSpec::Values(vec![75, 150]),
            ch0_start: 640,
            ch1_offset: 30,
            dt_min: 0,
            dt_slices: false,
            mode: CorrectionMode::Default,
            parallel: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_stdout: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl AxisSpec {
    pub fn values(&self) -> Result<Vec<i64>> {
        match *self {
            AxisSpec::Values(ref v) => Ok(v.clone()),
            AxisSpec::Range { start, stop, step } => {
                if step <= 0 {
                    return Err(FidelityError::Config(format!(
                        "axis step must be positive, got {step}"
                    )));
                }
                Ok((start..stop).step_by(step as usize).collect())
            }
        }
    }
}

impl ReadoutConfig {
    /// The measured fidelities with their uncertainties.
    pub fn regular(&self) -> ReadoutFidelities {
        ReadoutFidelities {
            f0_a: self.f0_a,
            f0_b: self.f0_b,
            f1_a: self.f1_a,
            f1_b: self.f1_b,
            u_f0_a: self.u_f0_a,
            u_f0_b: self.u_f0_b,
            u_f1_a: self.u_f1_a,
            u_f1_b: self.u_f1_b,
        }
    }

    /// Node B's F1 at its upper bound, taken as exact.
    pub fn extremal_upper(&self) -> ReadoutFidelities {
        self.regular().with_f1_b(self.f1_b_upper, 0.0)
    }

    /// Node B's F1 at its lower bound, taken as exact.
    pub fn extremal_lower(&self) -> ReadoutFidelities {
        self.regular().with_f1_b(self.f1_b_lower, 0.0)
    }

    pub fn validate(&self) -> Result<()> {
        self.regular().validate()?;
        self.extremal_upper().validate()?;
        self.extremal_lower().validate()?;
        if self.f1_b_lower > self.f1_b_upper {
            return Err(FidelityError::Validation(format!(
                "f1_b_lower {} exceeds f1_b_upper {}",
                self.f1_b_lower, self.f1_b_upper
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl LdeConfig {
    /// Try to load from a specific path.  Returns `Ok(default)` if the file
    /// does not exist; returns `Err` if the file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: LdeConfig = toml::from_str(&text).ctx_config("parse config TOML")?;
        Ok(cfg)
    }

    /// Load config using the standard search order.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("ldefid.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        #[cfg(windows)]
        {
            if let Ok(local) = std::env::var("LOCALAPPDATA") {
                let candidate = PathBuf::from(local).join("ldefid").join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        #[cfg(not(windows))]
        {
            if let Some(home) = std::env::var_os("HOME") {
                let candidate = PathBuf::from(home)
                    .join(".config")
                    .join("ldefid")
                    .join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("LDEFID_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("LDEFID_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("LDEFID_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(mode) = std::env::var("LDEFID_MODE") {
            self.sweep.mode = mode.parse().ctx_config("LDEFID_MODE")?;
        }
        Ok(())
    }
}
