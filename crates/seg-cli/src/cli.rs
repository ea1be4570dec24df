//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Episode segmenter.
///
/// Turns recorded kinematic frames into contact, support and motion episodes,
/// and recognizes activities such as pick and place from them.
#[derive(Debug, Parser)]
#[command(name = "seg", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Segment a recording into episodes and activities.
    Segment(SegmentArgs),

    /// List stored runs.
    Runs {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the timeline of a stored run.
    Report {
        /// Run id, or a unique prefix of one.
        run: String,

        /// Only show episodes and activities involving this entity.
        #[arg(long)]
        entity: Option<String>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the configured activity rules.
    Rules {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Recording formats understood by `seg segment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum InputFormat {
    /// One native frame per line.
    #[default]
    Jsonl,
    /// Per-object poses keyed by scene and frame id, positions in millimetres.
    Scene,
}

/// Arguments for `seg segment`.
#[derive(Debug, Args)]
pub struct SegmentArgs {
    /// Recording to segment.
    pub input: PathBuf,

    /// Format of the recording.
    #[arg(long, value_enum, default_value_t = InputFormat::Jsonl)]
    pub format: InputFormat,

    /// Scene to read from a scene recording.
    #[arg(long, default_value_t = 1)]
    pub scene_id: u32,

    /// Time between consecutive scene frames.
    #[arg(long, default_value_t = 50)]
    pub frame_period_ms: u64,

    /// Object to leave out of a scene recording (repeatable).
    #[arg(long = "ignore", value_name = "ID")]
    pub ignore: Vec<String>,

    /// Save the finalized timeline to the database.
    #[arg(long)]
    pub store: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_defaults() {
        let cli = Cli::try_parse_from(["seg", "segment", "run.jsonl"]).unwrap();
        let Some(Commands::Segment(args)) = cli.command else {
            panic!("expected segment command");
        };
        assert_eq!(args.format, InputFormat::Jsonl);
        assert_eq!(args.scene_id, 1);
        assert_eq!(args.frame_period_ms, 50);
        assert!(args.ignore.is_empty());
        assert!(!args.store);
    }

    #[test]
    fn segment_scene_flags() {
        let cli = Cli::try_parse_from([
            "seg",
            "segment",
            "refined_poses.json",
            "--format",
            "scene",
            "--scene-id",
            "2",
            "--ignore",
            "5",
            "--ignore",
            "7",
            "--store",
        ])
        .unwrap();
        let Some(Commands::Segment(args)) = cli.command else {
            panic!("expected segment command");
        };
        assert_eq!(args.format, InputFormat::Scene);
        assert_eq!(args.scene_id, 2);
        assert_eq!(args.ignore, vec!["5", "7"]);
        assert!(args.store);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["seg", "runs", "--json", "-v", "--config", "seg.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("seg.toml")));
        assert!(matches!(cli.command, Some(Commands::Runs { json: true })));
    }
}
