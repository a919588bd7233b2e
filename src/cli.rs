//! Command-line surface. spec.md scopes the CLI front-end out except for one
//! illustrative `sort` subcommand exercising the whole pipeline end to end;
//! everything else here exists to make that one command runnable, not to be
//! a complete toolkit front end.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::sort::DEFAULT_MAX_BUFFER_COUNT;

#[derive(Parser, Debug)]
#[command(name = "bamforge", version, about = "Parallel BAM/SAM I/O engine and external-memory sort")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Drop logging to WARN and above.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Raise logging to TRACE.
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge and sort one or more SAM/BAM inputs into one coordinate- or
    /// name-ordered output, spilling to disk once the in-memory buffer fills.
    Sort(SortArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortBy {
    Position,
    Name,
}

#[derive(Parser, Debug)]
pub struct SortArgs {
    /// Input path, repeatable; `stdin` reads one stream from standard input.
    #[arg(long = "in", required = true, num_args = 1..)]
    pub inputs: Vec<String>,

    /// Output path; `stdout` writes BGZF-BAM to standard output.
    #[arg(long = "out", default_value = "stdout")]
    pub output: String,

    /// Sort order for the merged output.
    #[arg(long, value_enum, default_value_t = SortBy::Position)]
    pub by: SortBy,

    /// BGZF compression level for the final output, 0-9.
    #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=9))]
    pub compression: u32,

    /// Records buffered per run before it is sorted and spilled to disk.
    #[arg(long = "max-records", default_value_t = DEFAULT_MAX_BUFFER_COUNT)]
    pub max_records: usize,

    /// Whether spilled runs are BGZF-compressed (1) or written raw (0).
    #[arg(long = "temp-compress", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub temp_compress: u8,

    /// Worker threads for compression/decompression/parsing.
    #[arg(long, default_value_t = num_cpus::get())]
    pub threads: usize,

    /// Force single-threaded codec paths, overriding `--threads`.
    #[arg(long = "no-threads")]
    pub no_threads: bool,

    /// Directory for spilled run files.
    #[arg(long, default_value_os_t = std::env::temp_dir())]
    pub tmpdir: PathBuf,

    /// Also write a sibling `<out>.bai` index (requires a file, not `stdout`).
    #[arg(long)]
    pub index: bool,
}

impl SortArgs {
    pub fn effective_threads(&self) -> usize {
        if self.no_threads {
            1
        } else {
            self.threads.max(1)
        }
    }
}
