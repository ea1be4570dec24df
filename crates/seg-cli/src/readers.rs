//! Frame readers for recorded input.
//!
//! Two formats are understood:
//! - JSON lines, one serialized [`Frame`] per line
//! - scene recordings, `{scene: {frame: {object: [{"t": [..], "R": [..]}]}}}`
//!   with positions in millimetres and row-major rotation matrices

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{BufRead, Lines, Read};

use anyhow::{Context, Result, bail};
use seg_core::{BodyState, EntityId, Frame, FrameError, Pose, Quaternion, Vec3};
use serde::Deserialize;

/// Millimetres per metre.
const MM_PER_M: f64 = 1000.0;

/// Streams frames from JSON lines. Blank lines are skipped.
pub struct JsonLines<R> {
    lines: Lines<R>,
    line: usize,
}

impl<R: BufRead> JsonLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

impl<R: BufRead> Iterator for JsonLines<R> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line += 1;
            let line = match line {
                Ok(line) => line,
                Err(err) => return Some(Err(malformed(self.line, &err))),
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Some(serde_json::from_str(trimmed).map_err(|err| malformed(self.line, &err)));
        }
    }
}

fn malformed(line: usize, err: &dyn std::fmt::Display) -> FrameError {
    FrameError::Malformed {
        position: format!("line {line}"),
        message: err.to_string(),
    }
}

/// Which part of a scene recording to read, and how to stamp it.
#[derive(Debug, Clone)]
pub struct SceneOptions {
    pub scene_id: u32,
    /// Seconds between consecutive frames.
    pub frame_period: f64,
    /// Object ids to leave out.
    pub ignore: BTreeSet<String>,
}

impl Default for SceneOptions {
    fn default() -> Self {
        Self {
            scene_id: 1,
            frame_period: 0.05,
            ignore: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScenePose {
    /// Translation in millimetres.
    t: [f64; 3],
    /// Row-major rotation matrix.
    #[serde(rename = "R")]
    r: [f64; 9],
}

impl ScenePose {
    fn to_pose(&self) -> Pose {
        let [x, y, z] = self.t;
        Pose::new(
            Vec3::new(x / MM_PER_M, y / MM_PER_M, z / MM_PER_M),
            Quaternion::from_rotation_matrix(self.r),
        )
    }
}

type Scene = BTreeMap<String, BTreeMap<String, Vec<ScenePose>>>;

/// Reads one scene of a scene recording into frames.
///
/// Frames are ordered by numeric frame id and stamped `frame_period` apart,
/// starting at zero. Only the first pose listed per object is used, and
/// bodies carry no velocity so it is estimated from consecutive poses.
#[expect(
    clippy::cast_precision_loss,
    reason = "frame positions stay far below 2^52"
)]
pub fn read_scene<R: Read>(reader: R, options: &SceneOptions) -> Result<Vec<Frame>> {
    let mut scenes: HashMap<String, Scene> =
        serde_json::from_reader(reader).context("failed to parse scene recording")?;
    let Some(scene) = scenes.remove(&options.scene_id.to_string()) else {
        bail!("scene {} not found in recording", options.scene_id);
    };

    let mut ordered = Vec::with_capacity(scene.len());
    for (frame_id, objects) in scene {
        let index: u64 = frame_id
            .parse()
            .with_context(|| format!("frame id {frame_id:?} is not a number"))?;
        ordered.push((index, objects));
    }
    ordered.sort_by_key(|(index, _)| *index);

    let mut frames = Vec::with_capacity(ordered.len());
    for (position, (_, objects)) in ordered.into_iter().enumerate() {
        let mut frame = Frame::new(position as f64 * options.frame_period);
        for (object, poses) in objects {
            if options.ignore.contains(&object) {
                continue;
            }
            let Some(pose) = poses.first() else {
                continue;
            };
            let id = EntityId::new(object).context("scene recording has an empty object id")?;
            frame = frame.with_body(
                id,
                BodyState {
                    pose: pose.to_pose(),
                    twist: None,
                },
            );
        }
        frames.push(frame);
    }

    tracing::debug!(
        scene = options.scene_id,
        frames = frames.len(),
        ignored = options.ignore.len(),
        "Read scene recording"
    );
    Ok(frames)
}
