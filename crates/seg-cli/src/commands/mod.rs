//! CLI subcommand implementations.

pub mod report;
pub mod rules;
pub mod runs;
pub mod segment;
