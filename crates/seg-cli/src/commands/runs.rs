//! Runs command for listing stored segmentation runs.

use std::io::Write;

use anyhow::{Context, Result};
use seg_core::AnomalyCounts;
use seg_db::{Database, RunRecord};
use serde::Serialize;

// ========== Human-Readable Output ==========

/// Format runs as a table, oldest first.
pub fn write_runs<W: Write>(writer: &mut W, runs: &[RunRecord]) -> Result<()> {
    writeln!(writer, "RUNS")?;
    writeln!(writer)?;

    if runs.is_empty() {
        writeln!(writer, "No runs stored.")?;
        writeln!(writer)?;
        writeln!(
            writer,
            "Hint: Run 'seg segment <input> --store' to record one."
        )?;
        return Ok(());
    }

    writeln!(
        writer,
        "{:<8}  {:<19}  {:>6}  {:>8}  {:>10}  {:>9}  Source",
        "ID", "Recorded", "Frames", "Episodes", "Activities", "Anomalies"
    )?;
    writeln!(
        writer,
        "────────  ───────────────────  ──────  ────────  ──────────  ─────────  ──────────────"
    )?;
    for run in runs {
        let id_short: String = run.id.chars().take(8).collect();
        writeln!(
            writer,
            "{:<8}  {:<19}  {:>6}  {:>8}  {:>10}  {:>9}  {}",
            id_short,
            run.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            run.frames,
            run.episodes,
            run.activities,
            run.anomalies.total(),
            run.source
        )?;
    }
    Ok(())
}

// ========== JSON Output ==========

/// A stored run as printed by `--json`.
#[derive(Debug, Serialize)]
pub struct JsonRun {
    pub id: String,
    pub recorded_at: String,
    pub source: String,
    pub frames: i64,
    pub entities: i64,
    pub episodes: i64,
    pub activities: i64,
    pub anomalies: AnomalyCounts,
    pub config: serde_json::Value,
}

impl JsonRun {
    pub fn from_record(run: &RunRecord) -> Result<Self> {
        let config = serde_json::from_str(&run.config)
            .with_context(|| format!("run {} has an unreadable config", run.id))?;
        Ok(Self {
            id: run.id.clone(),
            recorded_at: run
                .recorded_at
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            source: run.source.clone(),
            frames: run.frames,
            entities: run.entities,
            episodes: run.episodes,
            activities: run.activities,
            anomalies: run.anomalies,
            config,
        })
    }
}

// ========== Public Interface ==========

/// Runs the runs command.
pub fn run<W: Write>(writer: &mut W, db: &Database, json: bool) -> Result<()> {
    let runs = db.list_runs().context("failed to list runs")?;

    if json {
        let runs = runs
            .iter()
            .map(JsonRun::from_record)
            .collect::<Result<Vec<_>>>()?;
        writeln!(writer, "{}", serde_json::to_string_pretty(&runs)?)?;
    } else {
        write_runs(writer, &runs)?;
    }
    Ok(())
}
