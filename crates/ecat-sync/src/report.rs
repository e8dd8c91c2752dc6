use std::path::Path;

use anyhow::{Context, Result};
use ecat_core::RunSummary;
use ecat_storage::RunArchive;

/// Most recent archived summaries first. Run directories sort by their timestamp prefix.
pub async fn recent_summaries(reports_root: &Path, dataset_id: &str, runs: usize) -> Result<Vec<RunSummary>> {
    let dataset_dir = reports_root.join(dataset_id);
    let mut entries = tokio::fs::read_dir(&dataset_dir)
        .await
        .with_context(|| format!("reading {}", dataset_dir.display()))?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await.map(|ft| ft.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    dirs.reverse();

    let mut summaries = Vec::new();
    for dir in dirs.into_iter().take(runs.max(1)) {
        let path = dir.join("summary.json");
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        summaries.push(serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?);
    }
    Ok(summaries)
}

pub async fn history_markdown(reports_root: &Path, dataset_id: &str, runs: usize) -> Result<String> {
    let summaries = recent_summaries(reports_root, dataset_id, runs).await?;
    let mut lines = vec![format!("# Run history: {dataset_id}"), String::new()];
    for summary in summaries {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- state: {:?}", summary.final_state));
        lines.push(format!(
            "- added / updated / removed: {} / {} / {}",
            summary.added, summary.updated, summary.removed
        ));
        lines.push(format!("- failed fetches: {} of {}", summary.failed, summary.requested));
        if summary.rolled_back {
            lines.push("- rolled back".to_string());
        }
        if let Some(error) = &summary.error {
            lines.push(format!("- error: {error}"));
        }
        lines.push(String::new());
    }
    if let Some(reason) = RunArchive::new(reports_root).halt_reason(dataset_id).await? {
        lines.push(format!(
            "**Dataset is halted ({reason}); run `ecat-cli clear-halt` after repairing the catalog.**"
        ));
    }
    Ok(lines.join("\n"))
}
