//! Post-completion processing.
//!
//! Turns a completed snapshot into a saved record and performs requested exports.

use crate::model::{ControllerConfig, ScanRecord, Snapshot};
use crate::storage;
use std::path::{Path, PathBuf};

/// Where finished results should go.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputTargets {
    pub auto_save: bool,
    pub export_json: Option<PathBuf>,
    pub export_csv: Option<PathBuf>,
}

/// Result of post-completion processing, ready for presentation layers.
pub(crate) struct ProcessedScan {
    pub record: ScanRecord,
    pub messages: Vec<String>,
}

/// Build the record for a completed snapshot, auto-save it and run exports.
/// Returns `None` unless the snapshot is `Completed`.
pub(crate) fn process_completion(
    cfg: &ControllerConfig,
    targets: &OutputTargets,
    snapshot: &Snapshot,
) -> Option<ProcessedScan> {
    let record = ScanRecord::from_snapshot(snapshot, cfg)?;
    let mut messages = Vec::new();

    if targets.auto_save {
        match storage::save_record(&record) {
            Ok(p) => messages.push(format!("Saved: {}", p.display())),
            Err(e) => {
                tracing::warn!(error = %e, "auto-save failed");
                messages.push(format!("Save failed: {e:#}"));
            }
        }
    }

    if let Some(path) = targets.export_json.as_deref() {
        messages.push(export_message("JSON", path, storage::export_json(path, &record)));
    }
    if let Some(path) = targets.export_csv.as_deref() {
        messages.push(export_message("CSV", path, storage::export_csv(path, &record)));
    }

    Some(ProcessedScan { record, messages })
}

fn export_message(kind: &str, path: &Path, res: anyhow::Result<()>) -> String {
    match res {
        Ok(()) => format!("Exported {kind}: {}", path.display()),
        Err(e) => format!("Export {kind} failed: {e:#}"),
    }
}
