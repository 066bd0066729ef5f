use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Environment variable naming the index directory
pub const DIR_ENV: &str = "GENDEX_DIR";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Index directory. Defaults to $GENDEX_DIR, then ./.gendex
    #[clap(long, global = true)]
    pub dir: Option<PathBuf>,

    /// Embedding model, overriding the one in config.yaml
    #[clap(long, global = true)]
    pub model: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
#[group(multiple = false)]
pub struct ModeArgs {
    /// Re-embed every chunk
    #[clap(long, default_value = "false")]
    pub full: bool,

    /// Reuse vectors of unchanged chunks (default)
    #[clap(long, default_value = "false")]
    pub incremental: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SettingsArgs {
    /// Print current settings
    Get {},
    /// Change the default minimum confidence
    Set {
        /// Minimum confidence in percent [0, 100]
        #[clap(long)]
        confidence_threshold: f32,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build a new generation of the index
    Rebuild {
        #[clap(flatten)]
        mode: ModeArgs,

        /// Project tree to index. Defaults to the current directory
        #[clap(long)]
        root: Option<PathBuf>,

        /// Index a memory-notes file (JSONL) instead of a project tree.
        /// Without a value, ~/.gendex/notes.jsonl is used
        #[clap(long, num_args = 0..=1, conflicts_with = "root")]
        notes: Option<Option<PathBuf>>,

        /// Don't draw a progress bar
        #[clap(long, default_value = "false")]
        no_progress: bool,
    },
    /// Search the index
    Query {
        /// Text to search for
        #[clap(allow_hyphen_values = true)]
        text: String,

        /// Number of candidates to fetch
        #[clap(short, long, default_value = "10")]
        k: usize,

        /// Minimum confidence for this query only [0, 100]
        #[clap(long)]
        min_confidence: Option<f32>,
    },
    /// Show or change settings
    Settings {
        #[clap(subcommand)]
        action: SettingsArgs,
    },
    /// Show generation, lock and analytics state
    Status {},
    /// Check every generation on disk
    Verify {},
    /// Remove every generation and analytics record
    Clean {
        /// Required; there is no undo
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}
