//! Segment command: runs a recording through the engine.
//!
//! Reads frames from a JSON-lines or scene recording, segments them, prints
//! the finalized timeline and optionally stores it as a run.

use std::fs::File;
use std::io::{BufReader, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use seg_core::{CancelToken, FrameError, Segmenter, TimelineSnapshot};
use seg_db::Database;
use serde::Serialize;

use super::report::{write_activities, write_anomalies, write_episodes};
use crate::readers::{JsonLines, SceneOptions, read_scene};
use crate::{Config, InputFormat, SegmentArgs};

fn scene_options(args: &SegmentArgs) -> SceneOptions {
    SceneOptions {
        scene_id: args.scene_id,
        frame_period: Duration::from_millis(args.frame_period_ms).as_secs_f64(),
        ignore: args.ignore.iter().cloned().collect(),
    }
}

#[derive(Debug, Serialize)]
struct JsonSegment<'a> {
    run_id: Option<&'a str>,
    source: &'a str,
    frames: usize,
    cancelled: bool,
    timeline: &'a TimelineSnapshot,
}

fn write_summary<W: Write>(
    writer: &mut W,
    source: &str,
    frames: usize,
    cancelled: bool,
    snapshot: &TimelineSnapshot,
    run_id: Option<&str>,
) -> Result<()> {
    writeln!(writer, "Segmented {frames} frames from {source}")?;
    if cancelled {
        writeln!(writer, "Interrupted before the end of input")?;
    }
    writeln!(
        writer,
        "Entities: {}  Episodes: {}  Activities: {}",
        snapshot.entities.len(),
        snapshot.episodes.len(),
        snapshot.activities.len()
    )?;
    write_anomalies(writer, &snapshot.anomalies)?;
    if let Some(run_id) = run_id {
        writeln!(writer, "Stored as run {run_id}")?;
    }
    writeln!(writer)?;
    let episodes: Vec<_> = snapshot.effective_episodes().cloned().collect();
    write_episodes(writer, &episodes)?;
    writeln!(writer)?;
    write_activities(writer, &snapshot.activities)?;
    Ok(())
}

/// Runs the segment command.
///
/// A malformed frame stops segmentation, but the timeline committed up to
/// that point is still printed (and stored with `--store`) before the error
/// is returned. Cancelling through `cancel` does the same without an error.
pub fn run<W: Write>(
    writer: &mut W,
    config: &Config,
    args: &SegmentArgs,
    db: Option<&mut Database>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut engine =
        Segmenter::new(config.segmenter.clone()).context("invalid segmenter configuration")?;
    let file = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let source = args.input.display().to_string();

    let outcome = match args.format {
        InputFormat::Jsonl => engine.run(JsonLines::new(BufReader::new(file)), cancel),
        InputFormat::Scene => {
            let frames = read_scene(BufReader::new(file), &scene_options(args))
                .with_context(|| format!("failed to read scene from {source}"))?;
            engine = engine.with_provider(Arc::new(config.proximity));
            engine.run(frames.into_iter().map(Ok::<_, FrameError>), cancel)
        }
    };

    let snapshot = engine.finalize().context("failed to finalize timeline")?;
    let frames = engine.frames_accepted();
    let cancelled = outcome.as_ref().is_ok_and(|summary| summary.cancelled);
    tracing::info!(
        source = %source,
        frames,
        cancelled,
        episodes = snapshot.episodes.len(),
        activities = snapshot.activities.len(),
        "Segmented recording"
    );

    let run_id = match db {
        Some(db) => {
            let run = db
                .store_run(&source, &config.segmenter, frames, &snapshot)
                .context("failed to store run")?;
            Some(run.id)
        }
        None => None,
    };

    if args.json {
        let output = JsonSegment {
            run_id: run_id.as_deref(),
            source: &source,
            frames,
            cancelled,
            timeline: &snapshot,
        };
        writeln!(writer, "{}", serde_json::to_string_pretty(&output)?)?;
    } else {
        write_summary(writer, &source, frames, cancelled, &snapshot, run_id.as_deref())?;
    }

    outcome.context("segmentation stopped at a fatal error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use insta::assert_snapshot;
    use seg_core::{BodyState, EntityPair, Frame, PairPredicates, Pose, Relation, Twist};

    use crate::commands::fixtures::{id, pick_snapshot};

    fn args(input: &Path, format: InputFormat) -> SegmentArgs {
        SegmentArgs {
            input: input.to_path_buf(),
            format,
            scene_id: 1,
            frame_period_ms: 50,
            ignore: Vec::new(),
            store: false,
            json: false,
        }
    }

    fn write_jsonl(path: &Path, frames: &[Frame]) {
        let lines: Vec<String> = frames
            .iter()
            .map(|f| serde_json::to_string(f).unwrap())
            .collect();
        std::fs::write(path, lines.join("\n")).unwrap();
    }

    /// Hand grasps a cup at 1.0 s, the cup lifts at 1.3 s and leaves the
    /// table after 1.4 s; the grasp ends after 3.0 s.
    fn pick_frames() -> Vec<Frame> {
        (0..=50)
            .map(|i| {
                let t = f64::from(i) / 10.0;
                let moving = (13..=25).contains(&i);
                let twist = if moving {
                    Twist::linear(0.0, 0.0, 0.5)
                } else {
                    Twist::default()
                };
                let touching = |on: bool| {
                    if on {
                        PairPredicates::touching()
                    } else {
                        PairPredicates::apart(0.2)
                    }
                };
                Frame::new(t)
                    .with_body(id("cup"), BodyState::moving(Pose::at(0.0, 0.0, 0.8), twist))
                    .with_pair(
                        EntityPair::new(id("hand"), id("cup")).unwrap(),
                        touching((10..=30).contains(&i)),
                    )
                    .with_pair(
                        EntityPair::new(id("cup"), id("table")).unwrap(),
                        touching(i <= 14),
                    )
            })
            .collect()
    }

    #[test]
    fn segments_and_stores_jsonl_recording() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("pick.jsonl");
        write_jsonl(&input, &pick_frames());
        let mut db = Database::open_in_memory().unwrap();

        let mut output = Vec::new();
        run(
            &mut output,
            &Config::default(),
            &args(&input, InputFormat::Jsonl),
            Some(&mut db),
            &CancelToken::new(),
        )
        .unwrap();
        let output = String::from_utf8(output).unwrap();

        assert!(output.starts_with("Segmented 51 frames from "));
        assert!(output.contains("Stored as run "));
        assert!(output.contains("actor=hand object=cup surface=table"));

        let runs = db.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].frames, 51);
        assert_eq!(runs[0].activities, 1);
        let stored = db.list_activities(&runs[0].id, None).unwrap();
        assert_eq!(stored[0].name, "pick");
    }

    #[test]
    fn malformed_line_still_prints_partial_timeline() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("broken.jsonl");
        let pair = EntityPair::new(id("hand"), id("cup")).unwrap();
        let first = Frame::new(0.0).with_pair(pair.clone(), PairPredicates::touching());
        let second = Frame::new(0.1).with_pair(pair, PairPredicates::touching());
        std::fs::write(
            &input,
            format!(
                "{}\n{}\nnot json\n",
                serde_json::to_string(&first).unwrap(),
                serde_json::to_string(&second).unwrap()
            ),
        )
        .unwrap();

        let mut output = Vec::new();
        let err = run(
            &mut output,
            &Config::default(),
            &args(&input, InputFormat::Jsonl),
            None,
            &CancelToken::new(),
        )
        .unwrap_err();
        let output = String::from_utf8(output).unwrap();

        assert_eq!(err.to_string(), "segmentation stopped at a fatal error");
        assert!(format!("{err:#}").contains("line 3"));
        assert!(output.starts_with("Segmented 2 frames"));
        assert!(output.contains("unterminated"));
    }

    #[test]
    fn out_of_order_lines_are_not_counted() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("shuffled.jsonl");
        let frames: Vec<Frame> = [0.0, 0.1, 0.05, 0.2]
            .into_iter()
            .map(|t| {
                Frame::new(t).with_pair(EntityPair::new(id("hand"), id("cup")).unwrap(), PairPredicates::touching())
            })
            .collect();
        write_jsonl(&input, &frames);
        let mut db = Database::open_in_memory().unwrap();

        let mut output = Vec::new();
        run(
            &mut output,
            &Config::default(),
            &args(&input, InputFormat::Jsonl),
            Some(&mut db),
            &CancelToken::new(),
        )
        .unwrap();
        let output = String::from_utf8(output).unwrap();

        assert!(output.starts_with("Segmented 3 frames"), "{output}");
        assert!(output.contains("Anomalies: 1 out-of-order"));
        assert_eq!(db.list_runs().unwrap()[0].frames, 3);
    }

    #[test]
    fn cancelled_run_still_stores_timeline() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("pick.jsonl");
        write_jsonl(&input, &pick_frames());
        let mut db = Database::open_in_memory().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut segment_args = args(&input, InputFormat::Jsonl);
        segment_args.json = true;
        let mut output = Vec::new();
        run(&mut output, &Config::default(), &segment_args, Some(&mut db), &cancel).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();

        assert_eq!(value["frames"], 0);
        assert_eq!(value["cancelled"], true);
        let run_id = value["run_id"].as_str().unwrap();
        assert_eq!(db.resolve_run(run_id).unwrap().frames, 0);
    }

    #[test]
    fn scene_recording_uses_proximity() {
        let temp = tempfile::tempdir().unwrap();
        let input = temp.path().join("refined_poses.json");
        let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        // object 1 sits on object 2 for frames 0..10, then lifts away
        let mut scene = serde_json::Map::new();
        for frame in 0..20 {
            let z = if frame < 10 { 30.0 } else { 300.0 };
            scene.insert(
                frame.to_string(),
                serde_json::json!({
                    "1": [{ "t": [0.0, 0.0, z], "R": identity }],
                    "2": [{ "t": [0.0, 0.0, 0.0], "R": identity }],
                    "9": [{ "t": [5000.0, 0.0, 0.0], "R": identity }]
                }),
            );
        }
        let recording = serde_json::json!({ "1": scene });
        std::fs::write(&input, recording.to_string()).unwrap();

        let mut segment_args = args(&input, InputFormat::Scene);
        segment_args.ignore = vec!["9".to_string()];
        segment_args.json = true;

        let mut output = Vec::new();
        run(&mut output, &Config::default(), &segment_args, None, &CancelToken::new()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&output).unwrap();

        assert_eq!(value["frames"], 20);
        assert!(value["run_id"].is_null());
        let timeline: TimelineSnapshot = serde_json::from_value(value["timeline"].clone()).unwrap();
        assert_eq!(timeline.entities.len(), 2);
        let contact: Vec<_> = timeline
            .episodes
            .iter()
            .filter(|e| e.relation == Relation::Contact)
            .collect();
        assert_eq!(contact.len(), 1);
        assert!((contact[0].end - 0.45).abs() < 1e-9);
        assert!(timeline.episodes.iter().any(|e| e.relation == Relation::Motion));
    }

    #[test]
    fn summary_lists_effective_episodes() {
        let mut output = Vec::new();
        write_summary(&mut output, "pick.jsonl", 51, false, &pick_snapshot(), None).unwrap();
        let output = String::from_utf8(output).unwrap();

        assert_snapshot!(output, @r"
        Segmented 51 frames from pick.jsonl
        Entities: 3  Episodes: 3  Activities: 1
        Anomalies: 0 out-of-order, 0 overlapping, 1 gaps, 0 ambiguous

        EPISODES
          ID  Subject               Relation     Start       End  Conf  Flags
        ────  ────────────────────  ────────  ────────  ────────  ────  ────────────
          e0  hand~cup              contact      1.000     3.000  1.00  -
          e1  cup                   motion       1.300     2.500  1.00  -
          e2  cup~table             contact      0.000     1.400  1.00  truncated

        ACTIVITIES
          ID  Name           Start       End  Episodes      Roles
        ────  ──────────  ────────  ────────  ────────────  ──────────────────
          a0  pick           0.000     3.000  e0,e1,e2      actor=hand object=cup surface=table
        ");
    }
}
