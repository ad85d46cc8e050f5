use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::archive::index::{DEFAULT_FAN_OUT, MAX_FAN_OUT, MIN_FAN_OUT};
use crate::archive::{DEFAULT_INDEX_THRESHOLD, WriterOptions};
use crate::codec::{DEFAULT_LEVEL, MAX_LEVEL};

#[derive(Parser, Debug)]
#[command(name = "barc")]
#[command(version)]
#[command(about = "Create, list and extract random-access compressed archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  barc create site.barc public/        pack a directory tree\n  \
  barc list -v site.barc               show sizes and compression ratios\n  \
  barc extract -p site.barc index.html | less")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', global = true, action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// More diagnostics on stderr (-DD => trace)
    #[arg(long = "debug", short = 'D', global = true, action = clap::ArgAction::Count)]
    pub debug: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pack files and directories into a new archive
    #[command(visible_alias = "c")]
    Create(CreateArgs),

    /// Extract entries from an archive
    #[command(visible_alias = "x")]
    Extract(ExtractArgs),

    /// List archive contents
    #[command(visible_alias = "l")]
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Archive to write (replaced if it exists)
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    /// Files or directories to add; directories are walked recursively
    #[arg(value_name = "INPUTS", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Compression level
    #[arg(short = 'l', long, default_value_t = DEFAULT_LEVEL,
          value_parser = clap::value_parser!(u32).range(0..=(MAX_LEVEL as i64)))]
    pub level: u32,

    /// Emit a search tree once the archive holds this many entries
    #[arg(long, value_name = "N", default_value_t = DEFAULT_INDEX_THRESHOLD)]
    pub index_threshold: usize,

    /// Never emit a search tree
    #[arg(long, conflicts_with = "index_threshold")]
    pub no_index: bool,

    /// Slots per search tree node
    #[arg(long, default_value_t = DEFAULT_FAN_OUT,
          value_parser = clap::value_parser!(u16).range((MIN_FAN_OUT as i64)..=(MAX_FAN_OUT as i64)))]
    pub fan_out: u16,
}

impl CreateArgs {
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions::default()
            .level(self.level)
            .index_threshold((!self.no_index).then_some(self.index_threshold))
            .fan_out(self.fan_out)
    }
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Archive to read
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    /// Entries to extract (default: all)
    #[arg(value_name = "NAMES")]
    pub names: Vec<String>,

    /// Extract files into exdir
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<PathBuf>,

    /// Extract files to pipe, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Never overwrite existing files
    #[arg(short = 'n', conflicts_with = "overwrite")]
    pub never_overwrite: bool,

    /// Overwrite files WITHOUT prompting
    #[arg(short = 'o')]
    pub overwrite: bool,

    /// Junk paths (do not make directories)
    #[arg(short = 'j')]
    pub junk_paths: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Archive to read
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,

    /// List verbosely
    #[arg(short = 'v')]
    pub verbose: bool,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || matches!(&self.command, Command::Extract(args) if args.pipe)
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Default `tracing` filter level implied by `-q` and `-D`.
    pub fn log_level(&self) -> tracing::Level {
        match (self.quiet, self.debug) {
            (q, _) if q > 1 => tracing::Level::ERROR,
            (_, 0) => tracing::Level::WARN,
            (_, 1) => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}
