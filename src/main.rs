use blobby::archive::{
    create_blob, extract_blob, list_blob, CreateOptions, ExtractOptions, ListFormat, ListOptions,
};
use blobby::codec::{Compression, DEFAULT_ZSTD_LEVEL};
use clap::{ArgGroup, Parser};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Pack files into a blob, list a blob, or unpack it again.
#[derive(Parser, Debug)]
#[command(name = "blobby", version, about = "Blob file archiver")]
#[command(group(ArgGroup::new("action").required(true).args(["list", "extract", "create"])))]
struct Cli {
    /// List the members of a blob
    #[arg(short = 'l', value_name = "BLOB-FILE")]
    list: Option<PathBuf>,

    /// Extract every member of a blob
    #[arg(short = 'x', value_name = "BLOB-FILE")]
    extract: Option<PathBuf>,

    /// Create a blob from the given pathnames
    #[arg(short = 'c', value_name = "BLOB-FILE", requires = "pathnames")]
    create: Option<PathBuf>,

    /// Compress the blob as a whole
    #[arg(short = 'z', conflicts_with_all = ["list", "extract"])]
    compress: bool,

    /// Compression codec used with -z: xz (default) or zstd
    #[arg(long, value_name = "CODEC", value_parser = parse_codec, requires = "compress")]
    codec: Option<Compression>,

    /// Zstd compression level (1-19; ignored for xz)
    #[arg(long, default_value_t = DEFAULT_ZSTD_LEVEL)]
    level: i32,

    /// Verify checksums while listing
    #[arg(long, conflicts_with_all = ["extract", "create"])]
    verify: bool,

    /// List members as JSON objects, one per line
    #[arg(long, conflicts_with_all = ["extract", "create"])]
    json: bool,

    /// Directory to extract into (default: current directory)
    #[arg(short = 'C', long = "directory", value_name = "DIR", conflicts_with_all = ["list", "create"])]
    output_dir: Option<PathBuf>,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    /// Files to add to the blob (create only)
    #[arg(value_name = "PATHNAMES", conflicts_with_all = ["list", "extract"])]
    pathnames: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("blobby: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if let Some(blob) = cli.list {
        let opts = ListOptions {
            verify: cli.verify,
            format: if cli.json { ListFormat::Json } else { ListFormat::Text },
        };
        list_blob(&blob, &opts, &mut out)?;
    } else if let Some(blob) = cli.extract {
        let opts = ExtractOptions { output_dir: cli.output_dir.unwrap_or_else(|| PathBuf::from(".")) };
        extract_blob(&blob, &opts, &mut out)?;
    } else if let Some(blob) = cli.create {
        let compression = match (cli.compress, cli.codec) {
            (false, _)          => Compression::None,
            (true, None)        => Compression::Xz,
            (true, Some(codec)) => codec,
        };
        let opts = CreateOptions { compression, level: cli.level };
        create_blob(&blob, &cli.pathnames, &opts, &mut out)?;
    }

    out.flush()?;
    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) {
    let level = if verbose { "blobby=debug" } else { "blobby=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn parse_codec(s: &str) -> Result<Compression, String> {
    match Compression::from_name(s) {
        Some(Compression::None) | None => Err(format!("unknown codec '{s}' (expected xz or zstd)")),
        Some(c) => Ok(c),
    }
}
