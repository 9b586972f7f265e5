//! Heralding-event extraction from time-tagger runs.
//!
//! A run is a detection file (`sync,time,channel,marker`) plus its companion
//! outcome file (`ssro1,ssro2,cr1,cr2,gate`) with one row per sync marker.
//! For every marker at sync `s` the window pair is sync `s-1` (first node)
//! and sync `s` (second node); a cycle becomes an event only when each
//! window holds exactly one click inside `[start, stop]`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::error::{FidelityError, OptionExt as _, Result, ResultExt as _};
use crate::event::{EventTable, HeraldEvent, RawDetection, ShotOutcome};

/// Trailing three-digit run index of a detection file stem.
static RUN_INDEX_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"(\d{3})$").unwrap());

#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    clicks: u32,
    first: RawDetection,
}

// ---------------------------------------------------------------------------
// Core extraction
// ---------------------------------------------------------------------------

/// Build the heralding events of one run.
///
/// `outcomes[i]` belongs to the i-th marker of `detections`; a shorter
/// outcome stream is rejected because events would be mis-paired.
pub fn extract(
    detections: &[RawDetection],
    outcomes: &[ShotOutcome],
    start: i64,
    stop: i64,
) -> Result<EventTable> {
    if start > stop {
        return Err(FidelityError::Validation(format!(
            "extraction range start {start} > stop {stop}"
        )));
    }

    let markers = detections.iter().filter(|d| d.is_marker()).count();
    if outcomes.len() < markers {
        return Err(FidelityError::Extract(format!(
            "{markers} sync markers but only {} outcome rows",
            outcomes.len()
        )));
    }
    if outcomes.len() > markers {
        warn!(
            markers,
            outcomes = outcomes.len(),
            "outcome stream longer than marker count; trailing rows ignored"
        );
    }

    let mut windows: HashMap<u64, WindowSlot> = HashMap::new();
    for d in detections
        .iter()
        .filter(|d| !d.is_marker() && d.time >= start && d.time <= stop)
    {
        if d.channel > 1 {
            return Err(FidelityError::Extract(format!(
                "detection at sync {} on unknown channel {}",
                d.sync, d.channel
            )));
        }
        windows
            .entry(d.sync)
            .and_modify(|slot| slot.clicks += 1)
            .or_insert(WindowSlot {
                clicks: 1,
                first: *d,
            });
    }

    let single = |sync: u64| -> Option<RawDetection> {
        windows
            .get(&sync)
            .filter(|slot| slot.clicks == 1)
            .map(|slot| slot.first)
    };

    let mut table = EventTable::with_capacity(outcomes.len());
    for (i, marker) in detections.iter().filter(|d| d.is_marker()).enumerate() {
        let Some(prev) = marker.sync.checked_sub(1) else {
            continue;
        };
        let (Some(w1), Some(w2)) = (single(prev), single(marker.sync)) else {
            continue;
        };
        let shot = outcomes[i];
        table.push(HeraldEvent {
            t1: w1.time,
            t2: w2.time,
            ch1: w1.channel,
            ch2: w2.channel,
            ro1: shot.ssro1,
            ro2: shot.ssro2,
            cr1: shot.cr1,
            cr2: shot.cr2,
            gp: shot.gate,
        });
    }

    debug!(markers, events = table.len(), "run extracted");
    Ok(table)
}

// ---------------------------------------------------------------------------
// File readers / writers
// ---------------------------------------------------------------------------

pub fn read_detections(path: &Path) -> Result<Vec<RawDetection>> {
    read_rows(path, "detections")
}

pub fn read_outcomes(path: &Path) -> Result<Vec<ShotOutcome>> {
    read_rows(path, "outcomes")
}

pub fn write_detections(path: &Path, rows: &[RawDetection]) -> Result<()> {
    write_rows(path, rows)
}

pub fn write_outcomes(path: &Path, rows: &[ShotOutcome]) -> Result<()> {
    write_rows(path, rows)
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path, label: &str) -> Result<Vec<T>> {
    let mut rdr = csv::Reader::from_path(path)
        .ctx_extract(&format!("open {label} {}", path.display()))?;
    rdr.deserialize::<T>()
        .enumerate()
        .map(|(row, rec)| rec.ctx_extract(&format!("{} row {}", path.display(), row + 1)))
        .collect()
}

fn write_rows<T: serde::Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for r in rows {
        wtr.serialize(r)?;
    }
    wtr.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Run discovery
// ---------------------------------------------------------------------------

/// A detection file and its companion outcome file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    pub index: u32,
    pub detections: PathBuf,
    pub outcomes: PathBuf,
}

/// Detection file name for run `index`.
pub fn detection_file_name(cfg: &ExtractionConfig, index: u32) -> String {
    format!("{}-{index:03}.csv", cfg.detection_marker)
}

/// Outcome file name for run `index`.
pub fn outcome_file_name(cfg: &ExtractionConfig, index: u32) -> String {
    format!("{}-{index:03}.csv", cfg.outcome_prefix)
}

/// Find every run below `folder`, sorted by path.
pub fn discover_runs(folder: &Path, cfg: &ExtractionConfig) -> Result<Vec<RunFiles>> {
    if !folder.is_dir() {
        return Err(FidelityError::Extract(format!(
            "data folder {} does not exist",
            folder.display()
        )));
    }

    let mut files = Vec::new();
    collect_files(folder, &mut files)?;
    files.sort();

    let mut runs = Vec::new();
    for path in files {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.starts_with('.') || !name.contains(&cfg.detection_marker) {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .required_extract(&format!("non-UTF-8 file name {}", path.display()))?;
        let index: u32 = RUN_INDEX_RE
            .captures(stem)
            .and_then(|c| c.get(1))
            .required_extract(&format!("no run index in {}", path.display()))?
            .as_str()
            .parse()
            .ctx_extract("parse run index")?;
        let outcomes = path.with_file_name(outcome_file_name(cfg, index));
        if !outcomes.exists() {
            return Err(FidelityError::Extract(format!(
                "run {index:03}: missing outcome file {}",
                outcomes.display()
            )));
        }
        runs.push(RunFiles {
            index,
            detections: path,
            outcomes,
        });
    }
    Ok(runs)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).ctx_extract(&format!("read dir {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

pub fn extract_run(run: &RunFiles, cfg: &ExtractionConfig) -> Result<EventTable> {
    let detections = read_detections(&run.detections)?;
    let outcomes = read_outcomes(&run.outcomes)?;
    extract(&detections, &outcomes, cfg.start, cfg.stop)
        .ctx_extract(&format!("run {:03}", run.index))
}

/// Extract and concatenate the events of every run below `folder`.
pub fn extract_folder(folder: &Path, cfg: &ExtractionConfig) -> Result<EventTable> {
    let runs = discover_runs(folder, cfg)?;
    if runs.is_empty() {
        warn!(folder = %folder.display(), "no detection files found");
    }
    let mut table = EventTable::new();
    for run in &runs {
        let events = extract_run(run, cfg)?;
        debug!(run = run.index, events = events.len(), "run added");
        table.append(events);
    }
    info!(folder = %folder.display(), runs = runs.len(), events = table.len(), "found events in total");
    Ok(table)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
