//! Storage layer for segmented timelines.
//!
//! Persists finalized runs (entities, episodes and activities) using
//! `rusqlite`.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! A `Database` instance can be moved between threads but not shared across
//! them without external synchronization.
//!
//! # Schema
//!
//! Every row belongs to a run, identified by a random UUID. `recorded_at` is
//! stored as RFC 3339 TEXT in UTC, so lexicographic order matches
//! chronological order. Episode and activity ids are the in-run arena indexes
//! assigned by the timeline store. Times inside a run are seconds from the
//! start of the recording, stored as REAL.
//!
//! The run's configuration, anomaly counts and activity role bindings are
//! JSON payloads.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use seg_core::{
    Activity, ActivityId, AnomalyCounts, Confidence, DetectorId, EntityId, EntityKind, EntityPair,
    EntityRecord, Episode, EpisodeFlags, EpisodeId, Relation, SegmenterConfig, Subject,
    TimelineSnapshot,
};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A JSON payload could not be encoded or decoded.
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    /// Failed to parse a run timestamp.
    #[error("invalid timestamp for run {run_id}: {timestamp}")]
    TimestampParse {
        run_id: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored row does not decode into a timeline record.
    #[error("invalid record in run {run_id}: {message}")]
    InvalidRecord { run_id: String, message: String },
    /// No run matches the given id or prefix.
    #[error("no run matches {0}")]
    UnknownRun(String),
    /// Several runs match the given prefix.
    #[error("run prefix {prefix} is ambiguous ({count} matches)")]
    AmbiguousRun { prefix: String, count: usize },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// A stored run with its totals.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    /// Where the frames came from, usually the input path.
    pub source: String,
    /// The engine configuration as JSON.
    pub config: String,
    pub frames: i64,
    pub entities: i64,
    pub episodes: i64,
    pub activities: i64,
    pub anomalies: AnomalyCounts,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                recorded_at TEXT NOT NULL,
                source TEXT NOT NULL,
                config TEXT NOT NULL,
                frames INTEGER NOT NULL DEFAULT 0,
                entities INTEGER NOT NULL DEFAULT 0,
                episodes INTEGER NOT NULL DEFAULT 0,
                activities INTEGER NOT NULL DEFAULT 0,
                anomalies TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_recorded ON runs(recorded_at);

            CREATE TABLE IF NOT EXISTS entities (
                run_id TEXT NOT NULL,
                id TEXT NOT NULL,
                kind TEXT NOT NULL,
                first_seen REAL NOT NULL,
                PRIMARY KEY (run_id, id),
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            );

            -- Episodes: one finalized interval per row
            -- first_entity/second_entity: the subject; second_entity is NULL for single bodies
            -- start_s/end_s: seconds from the start of the recording
            CREATE TABLE IF NOT EXISTS episodes (
                run_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                first_entity TEXT NOT NULL,
                second_entity TEXT,
                relation TEXT NOT NULL,
                start_s REAL NOT NULL,
                end_s REAL NOT NULL,
                truncated INTEGER NOT NULL DEFAULT 0,
                unterminated INTEGER NOT NULL DEFAULT 0,
                confidence REAL NOT NULL,
                detector TEXT NOT NULL,
                supersedes INTEGER,
                PRIMARY KEY (run_id, id),
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_first ON episodes(run_id, first_entity);
            CREATE INDEX IF NOT EXISTS idx_episodes_second ON episodes(run_id, second_entity);

            CREATE TABLE IF NOT EXISTS activities (
                run_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                name TEXT NOT NULL,
                rule_index INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                roles TEXT NOT NULL,
                start_s REAL NOT NULL,
                end_s REAL NOT NULL,
                PRIMARY KEY (run_id, id),
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS activity_episodes (
                run_id TEXT NOT NULL,
                activity_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                episode_id INTEGER NOT NULL,
                PRIMARY KEY (run_id, activity_id, position),
                FOREIGN KEY (run_id, activity_id) REFERENCES activities(run_id, id) ON DELETE CASCADE,
                FOREIGN KEY (run_id, episode_id) REFERENCES episodes(run_id, id) ON DELETE CASCADE
            );
            ",
        )?;
        Ok(())
    }

    /// Stores a finalized timeline as a new run, stamped with the current time.
    pub fn store_run(
        &mut self,
        source: &str,
        config: &SegmenterConfig,
        frames: usize,
        snapshot: &TimelineSnapshot,
    ) -> Result<RunRecord, DbError> {
        self.store_run_at(source, config, frames, snapshot, Utc::now())
    }

    /// Stores a finalized timeline as a new run recorded at `recorded_at`.
    ///
    /// Everything is written in one transaction.
    pub fn store_run_at(
        &mut self,
        source: &str,
        config: &SegmenterConfig,
        frames: usize,
        snapshot: &TimelineSnapshot,
        recorded_at: DateTime<Utc>,
    ) -> Result<RunRecord, DbError> {
        let run = RunRecord {
            id: Uuid::new_v4().to_string(),
            recorded_at,
            source: source.to_string(),
            config: serde_json::to_string(config)?,
            frames: count(frames),
            entities: count(snapshot.entities.len()),
            episodes: count(snapshot.episodes.len()),
            activities: count(snapshot.activities.len()),
            anomalies: snapshot.anomalies,
        };

        let tx = self.conn.transaction()?;
        tx.execute(
            "
            INSERT INTO runs
            (id, recorded_at, source, config, frames, entities, episodes, activities, anomalies)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                run.id,
                format_timestamp(run.recorded_at),
                run.source,
                run.config,
                run.frames,
                run.entities,
                run.episodes,
                run.activities,
                serde_json::to_string(&run.anomalies)?,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO entities (run_id, id, kind, first_seen) VALUES (?, ?, ?, ?)",
            )?;
            for entity in &snapshot.entities {
                stmt.execute(params![
                    run.id,
                    entity.id.as_str(),
                    entity.kind.as_str(),
                    entity.first_seen,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO episodes
                (run_id, id, first_entity, second_entity, relation, start_s, end_s,
                 truncated, unterminated, confidence, detector, supersedes)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            for episode in &snapshot.episodes {
                let (first, second) = match &episode.subject {
                    Subject::Entity(id) => (id.as_str(), None),
                    Subject::Pair(pair) => (pair.first().as_str(), Some(pair.second().as_str())),
                };
                stmt.execute(params![
                    run.id,
                    index(episode.id.value()),
                    first,
                    second,
                    episode.relation.as_str(),
                    episode.start,
                    episode.end,
                    episode.flags.truncated,
                    episode.flags.unterminated,
                    f64::from(episode.confidence.value()),
                    episode.detector.as_str(),
                    episode.supersedes.map(|id| index(id.value())),
                ])?;
            }
        }
        {
            let mut activity_stmt = tx.prepare(
                "
                INSERT INTO activities
                (run_id, id, name, rule_index, priority, roles, start_s, end_s)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;
            let mut link_stmt = tx.prepare(
                "
                INSERT INTO activity_episodes (run_id, activity_id, position, episode_id)
                VALUES (?, ?, ?, ?)
                ",
            )?;
            for activity in &snapshot.activities {
                activity_stmt.execute(params![
                    run.id,
                    index(activity.id.value()),
                    activity.name,
                    count(activity.rule_index),
                    activity.priority,
                    serde_json::to_string(&activity.roles)?,
                    activity.start,
                    activity.end,
                ])?;
                for (position, episode) in activity.episodes.iter().enumerate() {
                    link_stmt.execute(params![
                        run.id,
                        index(activity.id.value()),
                        count(position),
                        index(episode.value()),
                    ])?;
                }
            }
        }
        tx.commit()?;

        info!(
            run = %run.id,
            episodes = run.episodes,
            activities = run.activities,
            "Stored run"
        );
        Ok(run)
    }

    /// Lists all runs, oldest first.
    pub fn list_runs(&self) -> Result<Vec<RunRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, recorded_at, source, config, frames, entities, episodes, activities, anomalies
            FROM runs
            ORDER BY recorded_at ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map([], raw_run)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.decode()?);
        }
        Ok(runs)
    }

    /// Finds the run whose id equals or starts with `prefix`.
    pub fn resolve_run(&self, prefix: &str) -> Result<RunRecord, DbError> {
        let exact = self
            .conn
            .query_row(
                "
                SELECT id, recorded_at, source, config, frames, entities, episodes, activities, anomalies
                FROM runs WHERE id = ?
                ",
                [prefix],
                raw_run,
            )
            .optional()?;
        if let Some(raw) = exact {
            return raw.decode();
        }

        let mut matches: Vec<RunRecord> = self
            .list_runs()?
            .into_iter()
            .filter(|run| run.id.starts_with(prefix))
            .collect();
        debug!(prefix, matches = matches.len(), "Resolving run prefix");
        match matches.len() {
            0 => Err(DbError::UnknownRun(prefix.to_string())),
            1 => Ok(matches.swap_remove(0)),
            count => Err(DbError::AmbiguousRun {
                prefix: prefix.to_string(),
                count,
            }),
        }
    }

    /// Lists the entities of a run, by id.
    pub fn list_entities(&self, run_id: &str) -> Result<Vec<EntityRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, first_seen FROM entities WHERE run_id = ? ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?;
        let mut entities = Vec::new();
        for row in rows {
            let (id, kind, first_seen) = row?;
            entities.push(EntityRecord {
                id: entity_id(run_id, id)?,
                kind: EntityKind::from_str(&kind).map_err(|err| invalid(run_id, err))?,
                first_seen,
            });
        }
        Ok(entities)
    }

    /// Lists a run's episodes ordered by start, optionally only those
    /// involving `entity`.
    pub fn list_episodes(&self, run_id: &str, entity: Option<&EntityId>) -> Result<Vec<Episode>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, first_entity, second_entity, relation, start_s, end_s,
                   truncated, unterminated, confidence, detector, supersedes
            FROM episodes
            WHERE run_id = ?1 AND (?2 IS NULL OR first_entity = ?2 OR second_entity = ?2)
            ORDER BY start_s ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map(params![run_id, entity.map(EntityId::as_str)], |row| {
            Ok(RawEpisode {
                id: row.get(0)?,
                first: row.get(1)?,
                second: row.get(2)?,
                relation: row.get(3)?,
                start: row.get(4)?,
                end: row.get(5)?,
                truncated: row.get(6)?,
                unterminated: row.get(7)?,
                confidence: row.get(8)?,
                detector: row.get(9)?,
                supersedes: row.get(10)?,
            })
        })?;
        let mut episodes = Vec::new();
        for row in rows {
            episodes.push(row?.decode(run_id)?);
        }
        Ok(episodes)
    }

    /// Lists a run's activities ordered by start, optionally only those with
    /// `entity` bound to a role.
    pub fn list_activities(&self, run_id: &str, entity: Option<&EntityId>) -> Result<Vec<Activity>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, name, rule_index, priority, roles, start_s, end_s
            FROM activities
            WHERE run_id = ?
            ORDER BY start_s ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
            ))
        })?;

        let mut link_stmt = self.conn.prepare(
            "
            SELECT episode_id FROM activity_episodes
            WHERE run_id = ? AND activity_id = ?
            ORDER BY position ASC
            ",
        )?;
        let mut activities = Vec::new();
        for row in rows {
            let (id, name, rule_index, priority, roles, start, end) = row?;
            let roles: BTreeMap<String, EntityId> = serde_json::from_str(&roles)?;
            if entity.is_some_and(|e| !roles.values().any(|bound| bound == e)) {
                continue;
            }
            let links = link_stmt.query_map(params![run_id, id], |row| row.get::<_, i64>(0))?;
            let mut episodes = Vec::new();
            for link in links {
                episodes.push(EpisodeId::new(unsigned(run_id, link?)?));
            }
            activities.push(Activity {
                id: ActivityId::new(unsigned(run_id, id)?),
                name,
                rule_index: usize::try_from(rule_index).map_err(|err| invalid(run_id, err))?,
                priority,
                roles,
                episodes,
                start,
                end,
            });
        }
        Ok(activities)
    }

    /// Deletes a run and everything recorded under it.
    pub fn delete_run(&self, run_id: &str) -> Result<bool, DbError> {
        let deleted = self.conn.execute("DELETE FROM runs WHERE id = ?", [run_id])?;
        Ok(deleted > 0)
    }
}

struct RawRun {
    id: String,
    recorded_at: String,
    source: String,
    config: String,
    frames: i64,
    entities: i64,
    episodes: i64,
    activities: i64,
    anomalies: String,
}

fn raw_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        recorded_at: row.get(1)?,
        source: row.get(2)?,
        config: row.get(3)?,
        frames: row.get(4)?,
        entities: row.get(5)?,
        episodes: row.get(6)?,
        activities: row.get(7)?,
        anomalies: row.get(8)?,
    })
}

impl RawRun {
    fn decode(self) -> Result<RunRecord, DbError> {
        let recorded_at = parse_timestamp(&self.recorded_at, &self.id)?;
        Ok(RunRecord {
            recorded_at,
            anomalies: serde_json::from_str(&self.anomalies)?,
            id: self.id,
            source: self.source,
            config: self.config,
            frames: self.frames,
            entities: self.entities,
            episodes: self.episodes,
            activities: self.activities,
        })
    }
}

struct RawEpisode {
    id: i64,
    first: String,
    second: Option<String>,
    relation: String,
    start: f64,
    end: f64,
    truncated: bool,
    unterminated: bool,
    confidence: f64,
    detector: String,
    supersedes: Option<i64>,
}

impl RawEpisode {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "confidence was stored from an f32"
    )]
    fn decode(self, run_id: &str) -> Result<Episode, DbError> {
        let first = entity_id(run_id, self.first)?;
        let subject = match self.second {
            None => Subject::Entity(first),
            Some(second) => Subject::Pair(
                EntityPair::new(first, entity_id(run_id, second)?).map_err(|err| invalid(run_id, err))?,
            ),
        };
        Ok(Episode {
            id: EpisodeId::new(unsigned(run_id, self.id)?),
            subject,
            relation: Relation::from_str(&self.relation).map_err(|err| invalid(run_id, err))?,
            start: self.start,
            end: self.end,
            flags: EpisodeFlags {
                truncated: self.truncated,
                unterminated: self.unterminated,
            },
            confidence: Confidence::clamped(self.confidence as f32),
            detector: DetectorId::new(self.detector).map_err(|err| invalid(run_id, err))?,
            supersedes: self
                .supersedes
                .map(|id| unsigned(run_id, id).map(EpisodeId::new))
                .transpose()?,
        })
    }
}

fn invalid(run_id: &str, err: impl std::fmt::Display) -> DbError {
    DbError::InvalidRecord {
        run_id: run_id.to_string(),
        message: err.to_string(),
    }
}

fn entity_id(run_id: &str, id: String) -> Result<EntityId, DbError> {
    EntityId::new(id).map_err(|err| invalid(run_id, err))
}

fn unsigned(run_id: &str, value: i64) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|err| invalid(run_id, err))
}

fn count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn index(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_timestamp(timestamp: &str, run_id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            run_id: run_id.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use seg_core::{ActivityMatch, ClosedEpisode, Entity, TimelineStore};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn closed(subject: Subject, relation: Relation, start: f64, end: f64) -> ClosedEpisode {
        ClosedEpisode {
            detector: DetectorId::for_slot(relation, &subject),
            subject,
            relation,
            start,
            end,
            flags: EpisodeFlags::default(),
            confidence: Confidence::MAX,
        }
    }

    /// A small pick timeline built straight through the store.
    fn pick_snapshot() -> TimelineSnapshot {
        let store = TimelineStore::new();
        for name in ["hand", "cup", "table"] {
            store.register_entity(&Entity::new(id(name), EntityKind::Object), 0.0);
        }
        let hand_cup = Subject::Pair(EntityPair::new(id("hand"), id("cup")).unwrap());
        let cup_table = Subject::Pair(EntityPair::new(id("cup"), id("table")).unwrap());
        let grasp = store.append_episode(closed(hand_cup, Relation::Contact, 1.0, 3.0)).unwrap();
        let lift = store
            .append_episode(closed(Subject::Entity(id("cup")), Relation::Motion, 1.3, 2.5))
            .unwrap();
        let mut leave = closed(cup_table, Relation::Contact, 0.0, 1.4);
        leave.flags = EpisodeFlags::TRUNCATED;
        let leave = store.append_episode(leave).unwrap();

        let roles = [("actor", "hand"), ("object", "cup"), ("surface", "table")]
            .into_iter()
            .map(|(role, entity)| (role.to_string(), id(entity)))
            .collect();
        store
            .append_activity(ActivityMatch {
                name: "pick".to_string(),
                rule_index: 0,
                priority: 10,
                roles,
                episodes: vec![grasp, lift, leave],
                start: 0.0,
                end: 3.0,
            })
            .unwrap();

        let mut snapshot = store.finalize();
        snapshot.anomalies.gaps = 1;
        snapshot
    }

    fn recorded_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn schema_matches_data_model() {
        let db = Database::open_in_memory().expect("open in-memory db");

        assert_eq!(
            table_columns(&db.conn, "runs"),
            vec![
                "id",
                "recorded_at",
                "source",
                "config",
                "frames",
                "entities",
                "episodes",
                "activities",
                "anomalies",
            ]
        );
        assert_eq!(
            table_columns(&db.conn, "episodes"),
            vec![
                "run_id",
                "id",
                "first_entity",
                "second_entity",
                "relation",
                "start_s",
                "end_s",
                "truncated",
                "unterminated",
                "confidence",
                "detector",
                "supersedes",
            ]
        );
        assert_eq!(
            table_columns(&db.conn, "activity_episodes"),
            vec!["run_id", "activity_id", "position", "episode_id"]
        );

        let episode_indexes = index_names(&db.conn, "episodes");
        let expected: HashSet<String> = ["idx_episodes_first", "idx_episodes_second"]
            .into_iter()
            .map(String::from)
            .collect();
        assert!(expected.is_subset(&episode_indexes));
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    fn index_names(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .expect("prepare index_list");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query index_list");
        rows.map(|row| row.expect("index_list row")).collect()
    }

    #[test]
    fn store_run_round_trips_timeline() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let snapshot = pick_snapshot();
        let config = SegmenterConfig::default();

        let run = db
            .store_run_at("pick.jsonl", &config, 51, &snapshot, recorded_at())
            .unwrap();
        assert_eq!(run.episodes, 3);
        assert_eq!(run.activities, 1);

        let runs = db.list_runs().unwrap();
        assert_eq!(runs, vec![run.clone()]);
        let stored: SegmenterConfig = serde_json::from_str(&runs[0].config).unwrap();
        assert_eq!(stored, config);
        assert_eq!(runs[0].anomalies.gaps, 1);

        let episodes = db.list_episodes(&run.id, None).unwrap();
        let mut expected = snapshot.episodes.clone();
        expected.sort_by(|a, b| a.start.total_cmp(&b.start));
        assert_eq!(episodes, expected);

        assert_eq!(db.list_activities(&run.id, None).unwrap(), snapshot.activities);
        assert_eq!(db.list_entities(&run.id).unwrap().len(), 3);
    }

    #[test]
    fn entity_filter_applies_to_episodes_and_activities() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let run = db
            .store_run_at("pick.jsonl", &SegmenterConfig::default(), 51, &pick_snapshot(), recorded_at())
            .unwrap();

        let table = db.list_episodes(&run.id, Some(&id("table"))).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table[0].flags.truncated);

        assert_eq!(db.list_episodes(&run.id, Some(&id("cup"))).unwrap().len(), 3);
        assert_eq!(db.list_activities(&run.id, Some(&id("hand"))).unwrap().len(), 1);
        assert!(db.list_activities(&run.id, Some(&id("shelf"))).unwrap().is_empty());
    }

    #[test]
    fn resolve_run_accepts_unique_prefix() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let run = db
            .store_run_at("a.jsonl", &SegmenterConfig::default(), 0, &TimelineSnapshot::default(), recorded_at())
            .unwrap();

        assert_eq!(db.resolve_run(&run.id).unwrap().id, run.id);
        assert_eq!(db.resolve_run(&run.id[..8]).unwrap().id, run.id);
        assert!(matches!(
            db.resolve_run("zzzz"),
            Err(DbError::UnknownRun(_))
        ));

        db.store_run_at("b.jsonl", &SegmenterConfig::default(), 0, &TimelineSnapshot::default(), recorded_at())
            .unwrap();
        assert!(matches!(
            db.resolve_run(""),
            Err(DbError::AmbiguousRun { count: 2, .. })
        ));
    }

    #[test]
    fn delete_run_cascades() {
        let mut db = Database::open_in_memory().expect("open in-memory db");
        let run = db
            .store_run_at("pick.jsonl", &SegmenterConfig::default(), 51, &pick_snapshot(), recorded_at())
            .unwrap();

        assert!(db.delete_run(&run.id).unwrap());
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(!db.delete_run(&run.id).unwrap());
    }

    #[test]
    fn reopening_keeps_runs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg.db");
        {
            let mut db = Database::open(&path).unwrap();
            db.store_run_at("a.jsonl", &SegmenterConfig::default(), 3, &pick_snapshot(), recorded_at())
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let runs = db.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].recorded_at, recorded_at());
        assert_eq!(runs[0].frames, 3);
    }
}
