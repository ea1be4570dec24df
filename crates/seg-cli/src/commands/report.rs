//! Report command for showing the timeline of a stored run.
//!
//! This module implements `seg report <run>`, which prints a run's entities,
//! episodes and activities, optionally narrowed to one entity. The table
//! writers are shared with `seg segment`.

use std::io::Write;

use anyhow::{Context, Result};
use seg_core::{Activity, AnomalyCounts, EntityId, EntityRecord, Episode, EpisodeFlags};
use seg_db::{Database, RunRecord};
use serde::Serialize;

use super::runs::JsonRun;

// ========== Human-Readable Output ==========

/// Truncates by characters, not bytes, to keep multi-byte ids intact.
fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() > width {
        format!("{}...", value.chars().take(width - 3).collect::<String>())
    } else {
        value.to_string()
    }
}

const fn flag_label(flags: EpisodeFlags) -> &'static str {
    match (flags.truncated, flags.unterminated) {
        (false, false) => "-",
        (true, false) => "truncated",
        (false, true) => "unterminated",
        (true, true) => "truncated, unterminated",
    }
}

pub fn write_anomalies<W: Write>(writer: &mut W, anomalies: &AnomalyCounts) -> Result<()> {
    writeln!(
        writer,
        "Anomalies: {} out-of-order, {} overlapping, {} gaps, {} ambiguous",
        anomalies.out_of_order, anomalies.overlapping, anomalies.gaps, anomalies.ambiguous
    )?;
    Ok(())
}

pub fn write_entities<W: Write>(writer: &mut W, entities: &[EntityRecord]) -> Result<()> {
    writeln!(writer, "ENTITIES")?;
    if entities.is_empty() {
        writeln!(writer, "No entities.")?;
        return Ok(());
    }
    writeln!(writer, "{:<20}  {:<10}  {:>10}", "ID", "Kind", "First seen")?;
    writeln!(writer, "────────────────────  ──────────  ──────────")?;
    for entity in entities {
        writeln!(
            writer,
            "{:<20}  {:<10}  {:>10.3}",
            truncate(entity.id.as_str(), 20),
            entity.kind.as_str(),
            entity.first_seen
        )?;
    }
    Ok(())
}

pub fn write_episodes<W: Write>(writer: &mut W, episodes: &[Episode]) -> Result<()> {
    writeln!(writer, "EPISODES")?;
    if episodes.is_empty() {
        writeln!(writer, "No episodes.")?;
        return Ok(());
    }
    writeln!(
        writer,
        "{:>4}  {:<20}  {:<8}  {:>8}  {:>8}  {:>4}  Flags",
        "ID", "Subject", "Relation", "Start", "End", "Conf"
    )?;
    writeln!(
        writer,
        "────  ────────────────────  ────────  ────────  ────────  ────  ────────────"
    )?;
    for episode in episodes {
        writeln!(
            writer,
            "{:>4}  {:<20}  {:<8}  {:>8.3}  {:>8.3}  {:>4.2}  {}",
            episode.id.to_string(),
            truncate(&episode.subject.to_string(), 20),
            episode.relation.as_str(),
            episode.start,
            episode.end,
            episode.confidence.value(),
            flag_label(episode.flags)
        )?;
    }
    Ok(())
}

pub fn write_activities<W: Write>(writer: &mut W, activities: &[Activity]) -> Result<()> {
    writeln!(writer, "ACTIVITIES")?;
    if activities.is_empty() {
        writeln!(writer, "No activities.")?;
        return Ok(());
    }
    writeln!(
        writer,
        "{:>4}  {:<10}  {:>8}  {:>8}  {:<12}  Roles",
        "ID", "Name", "Start", "End", "Episodes"
    )?;
    writeln!(
        writer,
        "────  ──────────  ────────  ────────  ────────────  ──────────────────"
    )?;
    for activity in activities {
        let episodes: Vec<String> = activity.episodes.iter().map(ToString::to_string).collect();
        let roles: Vec<String> = activity
            .roles
            .iter()
            .map(|(role, entity)| format!("{role}={entity}"))
            .collect();
        writeln!(
            writer,
            "{:>4}  {:<10}  {:>8.3}  {:>8.3}  {:<12}  {}",
            activity.id.to_string(),
            truncate(&activity.name, 10),
            activity.start,
            activity.end,
            episodes.join(","),
            roles.join(" ")
        )?;
    }
    Ok(())
}

fn write_report<W: Write>(writer: &mut W, report: &Report) -> Result<()> {
    let run = &report.run;
    writeln!(writer, "Run {}", run.id)?;
    writeln!(writer, "Source: {}", run.source)?;
    writeln!(
        writer,
        "Recorded: {}",
        run.recorded_at.format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    writeln!(writer, "Frames: {}", run.frames)?;
    write_anomalies(writer, &run.anomalies)?;
    if let Some(entity) = &report.entity {
        writeln!(writer, "Entity: {entity}")?;
    }
    writeln!(writer)?;
    write_entities(writer, &report.entities)?;
    writeln!(writer)?;
    write_episodes(writer, &report.episodes)?;
    writeln!(writer)?;
    write_activities(writer, &report.activities)?;
    Ok(())
}

// ========== JSON Output ==========

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    run: JsonRun,
    entity: Option<&'a EntityId>,
    entities: &'a [EntityRecord],
    episodes: &'a [Episode],
    activities: &'a [Activity],
}

// ========== Public Interface ==========

struct Report {
    run: RunRecord,
    entity: Option<EntityId>,
    entities: Vec<EntityRecord>,
    episodes: Vec<Episode>,
    activities: Vec<Activity>,
}

fn load_report(db: &Database, run: &str, entity: Option<&str>) -> Result<Report> {
    let run = db
        .resolve_run(run)
        .with_context(|| format!("failed to find run {run}"))?;
    let entity = entity
        .map(EntityId::new)
        .transpose()
        .context("invalid entity id")?;

    let mut entities = db.list_entities(&run.id)?;
    if let Some(entity) = &entity {
        entities.retain(|record| &record.id == entity);
    }
    let episodes = db.list_episodes(&run.id, entity.as_ref())?;
    let activities = db.list_activities(&run.id, entity.as_ref())?;

    Ok(Report {
        run,
        entity,
        entities,
        episodes,
        activities,
    })
}

/// Runs the report command.
pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    run: &str,
    entity: Option<&str>,
    json: bool,
) -> Result<()> {
    let report = load_report(db, run, entity)?;
    tracing::debug!(
        run = %report.run.id,
        episodes = report.episodes.len(),
        activities = report.activities.len(),
        "Loaded report"
    );

    if json {
        let output = JsonReport {
            run: JsonRun::from_record(&report.run)?,
            entity: report.entity.as_ref(),
            entities: &report.entities,
            episodes: &report.episodes,
            activities: &report.activities,
        };
        writeln!(writer, "{}", serde_json::to_string_pretty(&output)?)?;
    } else {
        write_report(writer, &report)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use seg_core::SegmenterConfig;

    use crate::commands::fixtures::{pick_snapshot, recorded_at};

    fn stored_pick() -> (Database, RunRecord) {
        let mut db = Database::open_in_memory().unwrap();
        let run = db
            .store_run_at(
                "pick.jsonl",
                &SegmenterConfig::default(),
                51,
                &pick_snapshot(),
                recorded_at(),
            )
            .unwrap();
        (db, run)
    }

    fn render(db: &Database, run: &str, entity: Option<&str>) -> String {
        let mut output = Vec::new();
        super::run(&mut output, db, run, entity, false).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn report_shows_full_timeline() {
        let (db, run) = stored_pick();

        let output = render(&db, &run.id[..8], None).replace(&run.id, "[RUN]");

        assert_snapshot!(output, @r"
        Run [RUN]
        Source: pick.jsonl
        Recorded: 2025-03-01 12:00:00 UTC
        Frames: 51
        Anomalies: 0 out-of-order, 0 overlapping, 1 gaps, 0 ambiguous

        ENTITIES
        ID                    Kind        First seen
        ────────────────────  ──────────  ──────────
        cup                   object           0.000
        hand                  robot_link       0.000
        table                 fixture          0.000

        EPISODES
          ID  Subject               Relation     Start       End  Conf  Flags
        ────  ────────────────────  ────────  ────────  ────────  ────  ────────────
          e2  cup~table             contact      0.000     1.400  1.00  truncated
          e0  hand~cup              contact      1.000     3.000  1.00  -
          e1  cup                   motion       1.300     2.500  1.00  -

        ACTIVITIES
          ID  Name           Start       End  Episodes      Roles
        ────  ──────────  ────────  ────────  ────────────  ──────────────────
          a0  pick           0.000     3.000  e0,e1,e2      actor=hand object=cup surface=table
        ");
    }

    #[test]
    fn report_narrows_to_entity() {
        let (db, run) = stored_pick();

        let output = render(&db, &run.id, Some("table"));

        assert!(output.contains("Entity: table"));
        assert!(output.contains("cup~table"));
        assert!(!output.contains("hand~cup"));
        assert!(!output.contains("robot_link"));
        assert!(output.contains("surface=table"));
    }

    #[test]
    fn report_json_lists_records() {
        let (db, run) = stored_pick();

        let mut output = Vec::new();
        super::run(&mut output, &db, &run.id, Some("hand"), true).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();

        assert_eq!(value["run"]["id"], run.id.as_str());
        assert_eq!(value["entity"], "hand");
        assert_eq!(value["episodes"].as_array().unwrap().len(), 1);
        assert_eq!(value["activities"][0]["name"], "pick");
        assert_eq!(value["run"]["config"]["hysteresis_frames"], 1);
    }

    #[test]
    fn unknown_run_is_an_error() {
        let (db, _) = stored_pick();
        let mut output = Vec::new();
        let err = super::run(&mut output, &db, "nope", None, false).unwrap_err();
        assert_eq!(err.to_string(), "failed to find run nope");
    }

    #[test]
    fn long_values_are_truncated() {
        assert_eq!(truncate("gripper_left_finger~mug", 20), "gripper_left_fing...");
        assert_eq!(truncate("cup", 20), "cup");
    }
}
