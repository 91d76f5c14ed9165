//! Saved scan history and file exports.

use crate::model::ScanRecord;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use time::macros::format_description;

const APP_DIR: &str = "neuronav-scan";

pub fn data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("no platform data directory available")?;
    Ok(base.join(APP_DIR))
}

fn results_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("results"))
}

pub fn save_record(record: &ScanRecord) -> Result<PathBuf> {
    save_record_in(&results_dir()?, record)
}

pub fn load_recent(limit: usize) -> Result<Vec<ScanRecord>> {
    load_recent_in(&results_dir()?, limit)
}

/// File names sort chronologically: `<utc timestamp>-<job id>.json`.
fn record_file_name(record: &ScanRecord) -> String {
    let stamp = time::OffsetDateTime::now_utc()
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .unwrap_or_else(|_| "unknown".into());
    let job: String = record
        .job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{stamp}-{job}.json")
}

fn save_record_in(dir: &Path, record: &ScanRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(record_file_name(record));
    let body = serde_json::to_string_pretty(record)?;
    fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    tracing::info!(path = %path.display(), "saved scan record");
    Ok(path)
}

fn load_recent_in(dir: &Path, limit: usize) -> Result<Vec<ScanRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();
    paths.reverse();

    let mut out = Vec::new();
    for path in paths {
        if out.len() >= limit {
            break;
        }
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<ScanRecord>(&raw) {
            Ok(record) => out.push(record),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
        }
    }
    Ok(out)
}

pub fn export_json(path: &Path, record: &ScanRecord) -> Result<()> {
    let body = serde_json::to_string_pretty(record)?;
    fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// One row per class probability, most likely first.
pub fn render_csv(record: &ScanRecord) -> String {
    let mut out = String::from(
        "saved_at_utc,job_id,file_name,predicted_class,confidence,class,probability\n",
    );
    for (class, prob) in record.result.ranked() {
        out.push_str(&format!(
            "{},{},{},{},{:.6},{},{:.6}\n",
            csv_field(&record.saved_at_utc),
            csv_field(&record.job_id),
            csv_field(&record.file_name),
            csv_field(&record.result.predicted_class),
            record.result.confidence,
            csv_field(class),
            prob
        ));
    }
    out
}

pub fn export_csv(path: &Path, record: &ScanRecord) -> Result<()> {
    fs::write(path, render_csv(record)).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
