//! Text summary builder for CLI output.
//!
//! Formats a completed prediction into human-readable lines for text mode and the TUI.

use crate::model::{PredictionResult, ScanRecord};

const BAR_WIDTH: usize = 24;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Human label for a backend class name.
pub(crate) fn class_label(class: &str) -> String {
    match class {
        "glioma" => "Glioma".into(),
        "meningioma" => "Meningioma".into(),
        "notumor" => "No tumor detected".into(),
        "pituitary" => "Pituitary tumor".into(),
        other => other.to_string(),
    }
}

pub(crate) fn probability_bar(p: f64) -> String {
    let filled = ((p.clamp(0.0, 1.0) * BAR_WIDTH as f64).round() as usize).min(BAR_WIDTH);
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled))
}

/// Lines describing a prediction: headline, ranked probabilities, heatmap reference.
pub(crate) fn prediction_lines(result: &PredictionResult) -> Vec<String> {
    let mut lines = vec![format!(
        "Prediction: {} ({:.1}% confidence)",
        class_label(&result.predicted_class),
        result.confidence * 100.0
    )];
    let ranked = result.ranked();
    let width = ranked
        .iter()
        .map(|(c, _)| class_label(c).chars().count())
        .max()
        .unwrap_or(0);
    for (class, p) in ranked {
        lines.push(format!(
            "  {:<width$}  {} {:>5.1}%",
            class_label(class),
            probability_bar(p),
            p * 100.0
        ));
    }
    if let Some(url) = result.heatmap_url.as_deref() {
        if url.starts_with("data:") {
            lines.push("Heatmap: inline image attached to result".into());
        } else {
            lines.push(format!("Heatmap: {url}"));
        }
    }
    lines
}

pub(crate) fn build_text_summary(record: &ScanRecord) -> TextSummary {
    let mut lines = vec![
        format!("File: {}", record.file_name),
        format!("Scan ID: {}", record.job_id),
    ];
    lines.extend(prediction_lines(&record.result));
    TextSummary { lines }
}
