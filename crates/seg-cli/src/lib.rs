//! Episode segmenter CLI library.
//!
//! This crate provides the CLI interface for the episode segmenter: argument
//! parsing, configuration loading, recording readers and the subcommands.

mod cli;
pub mod commands;
mod config;
pub mod readers;

pub use cli::{Cli, Commands, InputFormat, SegmentArgs};
pub use config::Config;
