//! Sweep archives: `fidelities<suffix>.json` and `correlations<suffix>.json`.
//!
//! Each file is an envelope carrying the sweep's run id, a creation
//! timestamp and the SHA-256 of its payload.  The payload hash is taken
//! over the compact JSON encoding of the payload value, so it is
//! independent of the envelope's pretty-printing.

use std::path::{Path, PathBuf};

use ndarray::{Array3, Array5};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FidelityError, Result, ResultExt as _};
use crate::fidelity::CorrectionMode;
use crate::sweep::{ParityTensors, SweepGrid, SweepResult, SweepSettings};
use crate::util;

pub const FIDELITIES_FORMAT: &str = "ldefid-fidelities-v1";
pub const CORRELATIONS_FORMAT: &str = "ldefid-correlations-v1";

/// Deterministic archive suffix for a sweep variant.
pub fn archive_suffix(mode: CorrectionMode, dt_slices: bool, dt_min: i64) -> String {
    let mut s = String::new();
    if let Some(tag) = mode.tag() {
        s.push('_');
        s.push_str(tag);
    }
    if dt_slices {
        s.push_str("_dtslices");
    } else {
        s.push_str(&format!("_dtmin{dt_min}"));
    }
    s
}

pub fn archive_paths(dir: &Path, suffix: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("fidelities{suffix}.json")),
        dir.join(format!("correlations{suffix}.json")),
    )
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FidelityTensors {
    fidelity: Array3<f64>,
    fidelity_uncertainty: Array3<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorrelationTensors {
    raw: Array5<u64>,
    corrected: Array5<f64>,
    corrected_uncertainty: Array5<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FidelitiesPayload {
    grid: SweepGrid,
    settings: SweepSettings,
    evaluated: Array3<bool>,
    psi1: FidelityTensors,
    psi2: FidelityTensors,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorrelationsPayload {
    grid: SweepGrid,
    psi1: CorrelationTensors,
    psi2: CorrelationTensors,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    run_id: Uuid,
    created_at_utc: String,
    suffix: String,
    payload_sha256: String,
    payload: serde_json::Value,
}

fn split(t: &ParityTensors) -> (FidelityTensors, CorrelationTensors) {
    (
        FidelityTensors {
            fidelity: t.fidelity.clone(),
            fidelity_uncertainty: t.fidelity_uncertainty.clone(),
        },
        CorrelationTensors {
            raw: t.raw.clone(),
            corrected: t.corrected.clone(),
            corrected_uncertainty: t.corrected_uncertainty.clone(),
        },
    )
}

fn join(f: FidelityTensors, c: CorrelationTensors) -> ParityTensors {
    ParityTensors {
        fidelity: f.fidelity,
        fidelity_uncertainty: f.fidelity_uncertainty,
        raw: c.raw,
        corrected: c.corrected,
        corrected_uncertainty: c.corrected_uncertainty,
    }
}

// ---------------------------------------------------------------------------
// Envelope I/O
// ---------------------------------------------------------------------------

fn write_envelope<P: Serialize>(
    path: &Path,
    format: &str,
    run_id: Uuid,
    suffix: &str,
    payload: &P,
) -> Result<()> {
    let payload = serde_json::to_value(payload).ctx_store("serialize payload")?;
    let canonical = serde_json::to_vec(&payload).ctx_store("encode payload")?;
    let envelope = Envelope {
        format: format.to_string(),
        run_id,
        created_at_utc: util::now_utc_rfc3339(),
        suffix: suffix.to_string(),
        payload_sha256: util::sha256_hex(&canonical),
        payload,
    };
    let json = serde_json::to_vec_pretty(&envelope).ctx_store("serialize archive")?;
    std::fs::write(path, json).ctx_store(&format!("write archive {}", path.display()))?;
    debug!(path = %path.display(), %run_id, "archive written");
    Ok(())
}

fn read_envelope<P: DeserializeOwned>(path: &Path, format: &str, suffix: &str) -> Result<(Uuid, P)> {
    let bytes = std::fs::read(path).ctx_store(&format!("read archive {}", path.display()))?;
    let envelope: Envelope = serde_json::from_slice(&bytes)
        .ctx_store(&format!("parse archive {}", path.display()))?;

    if envelope.format != format {
        return Err(FidelityError::Store(format!(
            "{}: unexpected format {:?}",
            path.display(),
            envelope.format
        )));
    }
    if envelope.suffix != suffix {
        return Err(FidelityError::Store(format!(
            "{}: archive suffix {:?} does not match {:?}",
            path.display(),
            envelope.suffix,
            suffix
        )));
    }
    let canonical = serde_json::to_vec(&envelope.payload).ctx_store("encode payload")?;
    if util::sha256_hex(&canonical) != envelope.payload_sha256 {
        return Err(FidelityError::Store(format!(
            "{}: payload hash mismatch",
            path.display()
        )));
    }
    let payload = serde_json::from_value(envelope.payload)
        .ctx_store(&format!("decode payload {}", path.display()))?;
    Ok((envelope.run_id, payload))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Write both archives of `result` into `dir`; returns the suffix used.
pub fn save(result: &SweepResult, dir: &Path) -> Result<String> {
    let s = &result.settings;
    let suffix = archive_suffix(s.mode, s.dt_slices, s.dt_min);
    std::fs::create_dir_all(dir).ctx_store(&format!("create dir {}", dir.display()))?;
    let (fid_path, cor_path) = archive_paths(dir, &suffix);

    let (f1, c1) = split(&result.psi1);
    let (f2, c2) = split(&result.psi2);
    let fidelities = FidelitiesPayload {
        grid: result.grid.clone(),
        settings: result.settings,
        evaluated: result.evaluated.clone(),
        psi1: f1,
        psi2: f2,
    };
    let correlations = CorrelationsPayload {
        grid: result.grid.clone(),
        psi1: c1,
        psi2: c2,
    };

    write_envelope(&fid_path, FIDELITIES_FORMAT, result.run_id, &suffix, &fidelities)?;
    write_envelope(&cor_path, CORRELATIONS_FORMAT, result.run_id, &suffix, &correlations)?;
    info!(dir = %dir.display(), %suffix, run_id = %result.run_id, "sweep archives saved");
    Ok(suffix)
}

/// Load the archive pair of the given sweep variant.
pub fn load(dir: &Path, mode: CorrectionMode, dt_slices: bool, dt_min: i64) -> Result<SweepResult> {
    let suffix = archive_suffix(mode, dt_slices, dt_min);
    let (fid_path, cor_path) = archive_paths(dir, &suffix);

    let (fid_run, fid): (Uuid, FidelitiesPayload) =
        read_envelope(&fid_path, FIDELITIES_FORMAT, &suffix)?;
    let (cor_run, cor): (Uuid, CorrelationsPayload) =
        read_envelope(&cor_path, CORRELATIONS_FORMAT, &suffix)?;

    if fid_run != cor_run {
        return Err(FidelityError::Store(format!(
            "archives belong to different runs ({fid_run} vs {cor_run})"
        )));
    }
    if fid.grid != cor.grid {
        return Err(FidelityError::Store("archive axes disagree".into()));
    }

    let shape = fid.grid.shape();
    let result = SweepResult {
        run_id: fid_run,
        grid: fid.grid,
        settings: fid.settings,
        evaluated: fid.evaluated,
        psi1: join(fid.psi1, cor.psi1),
        psi2: join(fid.psi2, cor.psi2),
    };
    for t in [&result.psi1, &result.psi2] {
        if t.grid_shapes().iter().any(|&s| s != shape) || result.evaluated.dim() != shape {
            return Err(FidelityError::Store(format!(
                "tensor shapes do not match grid {shape:?}"
            )));
        }
    }
    info!(dir = %dir.display(), %suffix, run_id = %result.run_id, "sweep archives loaded");
    Ok(result)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(mode: CorrectionMode, dt_slices: bool, dt_min: i64) -> SweepResult {
        let grid = SweepGrid::new(vec![10, 12, 14], vec![150], vec![75, 150]).unwrap();
        let shape = grid.shape();
        let mut r = SweepResult {
            run_id: Uuid::new_v4(),
            grid,
            settings: SweepSettings {
                ch0_start: 640,
                ch1_offset: 30,
                dt_min,
                dt_slices,
                mode,
            },
            evaluated: Array3::from_elem(shape, false),
            psi1: ParityTensors::zeros(shape),
            psi2: ParityTensors::zeros(shape),
        };
        r.evaluated[[1, 0, 1]] = true;
        r.psi1.fidelity[[1, 0, 1]] = 0.1 + 0.2;
        r.psi1.fidelity_uncertainty[[1, 0, 1]] = 1.0 / 3.0;
        r.psi2.corrected[[1, 0, 1, 2, 3]] = -0.012_345_678_901_234_567;
        r.psi2.corrected_uncertainty[[1, 0, 1, 2, 3]] = 2f64.sqrt() / 7.0;
        r.psi2.raw[[1, 0, 1, 0, 0]] = u64::from(u32::MAX) + 17;
        r
    }

    #[test]
    fn suffix_rules() {
        assert_eq!(archive_suffix(CorrectionMode::Default, false, 0), "_dtmin0");
        assert_eq!(archive_suffix(CorrectionMode::Default, true, 0), "_dtslices");
        assert_eq!(
            archive_suffix(CorrectionMode::LowerBound, false, 12),
            "_lowerbound_dtmin12"
        );
        assert_eq!(
            archive_suffix(CorrectionMode::RawBestGuess, true, 5),
            "_rawbestguess_dtslices"
        );
    }

    #[test]
    fn round_trip_is_bit_identical() {
        let dir = tempdir().unwrap();
        let r = sample(CorrectionMode::BestGuess, false, 4);
        let suffix = save(&r, dir.path()).unwrap();
        assert_eq!(suffix, "_bestguess_dtmin4");
        assert!(dir.path().join("fidelities_bestguess_dtmin4.json").exists());
        assert!(dir.path().join("correlations_bestguess_dtmin4.json").exists());

        let back = load(dir.path(), CorrectionMode::BestGuess, false, 4).unwrap();
        assert_eq!(back, r);
        assert_eq!(
            back.psi1.fidelity[[1, 0, 1]].to_bits(),
            r.psi1.fidelity[[1, 0, 1]].to_bits()
        );
        assert_eq!(
            back.psi2.corrected_uncertainty[[1, 0, 1, 2, 3]].to_bits(),
            r.psi2.corrected_uncertainty[[1, 0, 1, 2, 3]].to_bits()
        );
    }

    #[test]
    fn other_variant_is_not_found() {
        let dir = tempdir().unwrap();
        save(&sample(CorrectionMode::Raw, true, 0), dir.path()).unwrap();
        assert!(load(dir.path(), CorrectionMode::Raw, false, 0).is_err());
        assert!(load(dir.path(), CorrectionMode::Default, true, 0).is_err());
        assert!(load(dir.path(), CorrectionMode::Raw, true, 0).is_ok());
    }

    #[test]
    fn tampered_payload_detected() {
        let dir = tempdir().unwrap();
        let r = sample(CorrectionMode::Default, false, 0);
        save(&r, dir.path()).unwrap();
        let (fid_path, _) = archive_paths(dir.path(), "_dtmin0");
        let text = std::fs::read_to_string(&fid_path).unwrap();
        let tampered = text.replacen("\"ch0_start\": 640", "\"ch0_start\": 641", 1);
        assert_ne!(text, tampered);
        std::fs::write(&fid_path, tampered).unwrap();
        let err = load(dir.path(), CorrectionMode::Default, false, 0).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn mixed_runs_rejected() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        save(&sample(CorrectionMode::Default, false, 0), dir.path()).unwrap();
        save(&sample(CorrectionMode::Default, false, 0), other.path()).unwrap();
        let (_, cor) = archive_paths(dir.path(), "_dtmin0");
        let (_, other_cor) = archive_paths(other.path(), "_dtmin0");
        std::fs::copy(&other_cor, &cor).unwrap();
        let err = load(dir.path(), CorrectionMode::Default, false, 0).unwrap_err();
        assert!(err.to_string().contains("different runs"));
    }
}
