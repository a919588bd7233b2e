//! Binary entry point for the `sort` subcommand.
//!
//! Wires the CLI surface (`cli.rs`) to the library's pipeline pieces: parse
//! args first, install a reloadable tracing subscriber so `--quiet`/
//! `--verbose` can change the filter after the fact, then drive the pipeline
//! to completion and let a top-level `Err` become a nonzero exit.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use bamforge::bgzf::BgzfWriter;
use bamforge::cli::{Cli, Command, SortArgs, SortBy};
use bamforge::error::CoreError;
use bamforge::index::IndexBuilder;
use bamforge::multi_reader::{MultiReader, Source};
use bamforge::pool::ThreadPool;
use bamforge::record::binary;
use bamforge::sort::{Comparator, SortPipeline};

fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let (filtered_layer, reload_handle) = tracing_subscriber::reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filtered_layer)
        .init();

    let cli = Cli::parse();
    if cli.quiet {
        reload_handle.modify(|filter| *filter = EnvFilter::new("WARN"))?;
    }
    if cli.verbose {
        reload_handle.modify(|filter| *filter = EnvFilter::new("TRACE"))?;
    }

    match cli.command {
        Command::Sort(args) => run_sort(args),
    }
}

/// Opens one CLI input spec: the literal `stdin`, or a path on disk.
fn open_source(input: &str, pool: Arc<ThreadPool>) -> anyhow::Result<Source> {
    if input == "stdin" {
        Ok(Source::from_reader(Box::new(io::stdin()), pool)?)
    } else {
        Ok(Source::open(std::path::Path::new(input), pool)?)
    }
}

fn run_sort(args: SortArgs) -> anyhow::Result<()> {
    if args.index && args.output == "stdout" {
        anyhow::bail!("--index requires a file output, not stdout");
    }

    let pool = ThreadPool::new(args.effective_threads());

    let mut sources = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        let source = open_source(input, Arc::clone(&pool))?;
        sources.push((input.clone(), source));
    }
    // Inputs are merely fanned in here, not assumed pre-sorted: the sort
    // stage re-sorts everything regardless, so `Unsorted` (first-source-
    // drains-first) is the cheapest correct ingest order.
    let mut ingest = MultiReader::from_sources(sources, Comparator::Unsorted)?;
    let header = ingest.header().clone();

    let comparator = match args.by {
        SortBy::Position => Comparator::ByPosition,
        SortBy::Name => Comparator::ByName,
    };
    let mut pipeline = SortPipeline::new(header.clone(), comparator, Arc::clone(&pool))
        .with_max_buffer_count(args.max_records)
        .with_temp_compress(args.temp_compress != 0)
        .with_tmpdir(args.tmpdir.clone());

    let mut read_count = 0u64;
    while let Some(record) = ingest.read().map_err(CoreError::Record)? {
        pipeline.push(record)?;
        read_count += 1;
    }
    info!(records_read = read_count, "finished ingesting inputs");

    let output_write: Box<dyn Write + Send> = if args.output == "stdout" {
        Box::new(io::stdout())
    } else {
        Box::new(File::create(&args.output)?)
    };
    let mut writer = BgzfWriter::new(output_write, Arc::clone(&pool), args.compression);
    header.write_binary(&mut writer, "bamforge", "bamforge").map_err(CoreError::Io)?;

    let mut index_builder = args.index.then(|| IndexBuilder::new(header.references().len()));

    let write_count = pipeline.finish(|_hdr, record| {
        let bin = record.effective_bin() as u32;
        let start = writer.logical_position();
        binary::encode_record(&mut writer, &record).map_err(CoreError::Record)?;
        let end = writer.logical_position();
        if let Some(builder) = index_builder.as_mut() {
            builder.observe(&record, bin, start, end);
        }
        Ok(())
    })?;

    let (_, remap) = writer.finish().map_err(CoreError::Bgzf)?;

    if let Some(builder) = index_builder {
        let bai_path = format!("{}.bai", args.output);
        let mut bai_file = File::create(&bai_path)?;
        builder.close(&remap, &mut bai_file).map_err(CoreError::Index)?;
        info!(path = %bai_path, "wrote BAI index");
    }

    info!(records_read = read_count, records_written = write_count, "sort complete");
    pool.shutdown();
    Ok(())
}
