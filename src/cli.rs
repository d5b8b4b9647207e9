use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::split_list;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    /// Only show failing files
    Quiet,
    /// Show failing files and the summary
    #[default]
    Normal,
    /// Also show valid files and warnings
    Verbose,
    /// Verbose, plus debug logging
    Debug,
}

impl VerbosityLevel {
    /// Log filter used when `RUST_LOG` is not set
    pub fn default_log_filter(self) -> &'static str {
        match self {
            VerbosityLevel::Quiet => "error",
            VerbosityLevel::Normal => "warn",
            VerbosityLevel::Verbose => "info",
            VerbosityLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Validate XML files against their schemas, downloading remote schemas only once
#[derive(Parser, Debug, Clone)]
#[command(name = "validate-xml")]
#[command(about = "Validate XML files against their schemas with concurrent workers and schema caching")]
#[command(version)]
pub struct Cli {
    /// Files or directories to validate, one job each
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<PathBuf>,

    /// Number of validation worker threads
    #[arg(short = 't', long = "threads", conflicts_with = "no_threads")]
    pub threads: Option<usize>,

    /// Validate with a single worker thread
    #[arg(long = "no-threads")]
    pub no_threads: bool,

    /// File extensions to process (comma-separated)
    #[arg(
        short = 'e',
        long = "extensions",
        help = "File extensions to process (e.g., 'xml,cmdi')"
    )]
    pub extensions: Option<String>,

    /// Include file patterns (glob syntax)
    #[arg(long = "include", action = clap::ArgAction::Append)]
    pub include_patterns: Vec<String>,

    /// Exclude file patterns (glob syntax)
    #[arg(long = "exclude", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Directory for downloaded schemas
    #[arg(short = 'c', long = "schema-cache-dir")]
    pub schema_cache_dir: Option<PathBuf>,

    /// Configuration file (TOML or JSON)
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Check persistent identifier syntax
    #[arg(short = 'p', long = "check-pids")]
    pub check_pids: bool,

    /// Check persistent identifier syntax and resolve them
    #[arg(short = 'P', long = "check-and-resolve-pids")]
    pub check_and_resolve_pids: bool,

    /// Also print valid files and warnings
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Only print failing files
    #[arg(short = 'q', long = "quiet", conflicts_with_all = ["verbose", "debug"])]
    pub quiet: bool,

    /// Print debugging information
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    #[arg(long = "format", value_enum)]
    pub format: Option<OutputFormat>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn get_extensions(&self) -> Option<Vec<String>> {
        self.extensions.as_deref().map(split_list)
    }

    pub fn validate(&self) -> Result<(), String> {
        for path in &self.paths {
            if !path.exists() {
                return Err(format!("Path does not exist: {}", path.display()));
            }
        }
        if let Some(threads) = self.threads
            && threads == 0
        {
            return Err("Number of threads must be greater than 0".to_string());
        }
        Ok(())
    }
}
