use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use tracing::info;
use tracing_subscriber::EnvFilter;

use era_diff::{
    apply_to_path, copy_direct, format_sum, generate, measure, open_source, unit_bytes,
    BlockCopier, BlockList, BlockSums, Error, Progress, WINDOW_SIZE,
};

#[derive(FromArgs)]
/// Incremental block device backup driven by dm-era block lists.
struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Copy(CopyArgs),
    Apply(ApplyArgs),
    Direct(DirectArgs),
    Blocksum(BlocksumArgs),
}

#[derive(FromArgs)]
/// Read an era_invalidate block list on stdin and write a diff stream to
/// stdout, or only print its payload size in bytes.
#[argh(subcommand, name = "copy")]
struct CopyArgs {
    /// tracking block size in 512-byte sectors
    #[argh(option, short = 'b')]
    block_size: u64,

    /// device or image to read the changed blocks from; without it only the
    /// total size is printed
    #[argh(option, short = 's')]
    source: Option<PathBuf>,

    /// show copy progress on stderr
    #[argh(switch, short = 'p')]
    progress: bool,

    /// log more on stderr, repeat for more detail (RUST_LOG overrides this)
    #[argh(switch, short = 'v')]
    verbose: u8,
}

#[derive(FromArgs)]
/// Apply a diff stream read from stdin to a file or block device.
#[argh(subcommand, name = "apply")]
struct ApplyArgs {
    /// file or block device to write to; missing files are created
    #[argh(positional)]
    destination: PathBuf,

    /// show copy progress on stderr
    #[argh(switch, short = 'p')]
    progress: bool,

    /// log more on stderr, repeat for more detail (RUST_LOG overrides this)
    #[argh(switch, short = 'v')]
    verbose: u8,
}

#[derive(FromArgs)]
/// Copy the blocks listed on stdin from one device to another in place.
#[argh(subcommand, name = "direct")]
struct DirectArgs {
    /// tracking block size in 512-byte sectors
    #[argh(option, short = 'b')]
    block_size: u64,

    /// device or image to read from
    #[argh(positional)]
    source: PathBuf,

    /// existing file or block device to write to
    #[argh(positional)]
    destination: PathBuf,

    /// show copy progress on stderr
    #[argh(switch, short = 'p')]
    progress: bool,

    /// log more on stderr, repeat for more detail (RUST_LOG overrides this)
    #[argh(switch, short = 'v')]
    verbose: u8,
}

#[derive(FromArgs)]
/// Print an MD5 checksum for every window of a file or of stdin.
#[argh(subcommand, name = "blocksum")]
struct BlocksumArgs {
    /// window size in bytes
    #[argh(option, short = 'w', default = "WINDOW_SIZE")]
    window: usize,

    /// file or device to read; stdin when omitted
    #[argh(positional)]
    input: Option<PathBuf>,

    /// log more on stderr, repeat for more detail (RUST_LOG overrides this)
    #[argh(switch, short = 'v')]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_copy(args: CopyArgs) -> Result<()> {
    unit_bytes(args.block_size)?;
    let stdin = io::stdin();
    let blocks = BlockList::new(stdin.lock())?;
    let source = match args.source {
        Some(source) => source,
        None => {
            let summary = measure(blocks, args.block_size)?;
            println!("{}", summary.bytes);
            return Ok(());
        }
    };

    let file = open_source(&source)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut progress = Progress::new(args.progress);
    let summary = generate(
        blocks,
        &file,
        &mut out,
        args.block_size,
        &mut BlockCopier::new(),
        &mut progress,
    )?;
    out.flush().context("Failed to flush diff stream")?;
    progress.finish();
    info!(
        source = %source.display(),
        bytes = summary.stream_len(),
        "diff stream complete"
    );
    Ok(())
}

fn run_apply(args: ApplyArgs) -> Result<()> {
    let stdin = io::stdin();
    let mut progress = Progress::new(args.progress);
    apply_to_path(
        &mut stdin.lock(),
        &args.destination,
        &mut BlockCopier::new(),
        &mut progress,
    )?;
    progress.finish();
    Ok(())
}

fn run_direct(args: DirectArgs) -> Result<()> {
    unit_bytes(args.block_size)?;
    let source = open_source(&args.source)?;
    let stdin = io::stdin();
    let mut progress = Progress::new(args.progress);
    copy_direct(
        BlockList::new(stdin.lock())?,
        &source,
        &args.destination,
        args.block_size,
        &mut BlockCopier::new(),
        &mut progress,
    )?;
    progress.finish();
    Ok(())
}

fn run_blocksum(args: BlocksumArgs) -> Result<()> {
    let input: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(io::stdin()),
    };
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for sum in BlockSums::new(input, args.window)? {
        let (index, digest) = sum?;
        writeln!(out, "{}", format_sum(index, &digest)).context("Failed to write output")?;
    }
    out.flush().context("Failed to write output")?;
    Ok(())
}

fn main() {
    let args: Args = argh::from_env();
    init_logging(match &args.command {
        Command::Copy(args) => args.verbose,
        Command::Apply(args) => args.verbose,
        Command::Direct(args) => args.verbose,
        Command::Blocksum(args) => args.verbose,
    });
    let result = match args.command {
        Command::Copy(args) => run_copy(args),
        Command::Apply(args) => run_apply(args),
        Command::Direct(args) => run_direct(args),
        Command::Blocksum(args) => run_blocksum(args),
    };
    if let Err(err) = result {
        if let Some(Error::DeviceBusy { .. }) = err.downcast_ref::<Error>() {
            eprintln!("error: {:#}; unmount it or stop whatever holds it open", err);
        } else {
            eprintln!("error: {:#}", err);
        }
        std::process::exit(1);
    }
}
