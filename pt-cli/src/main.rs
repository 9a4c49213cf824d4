//! Decode an Intel PT trace file at the packet, event, or instruction
//! level.
//!
//! Set the environment variable `RUST_LOG=trace` for per-item logging.
//!
//! Grounded in `tools/iptr-raw-logger` and `tools/iptr-perf-pt-analyzer`'s
//! `clap`-derive + `anyhow::Context` + `memmap2` shape, generalized into
//! one binary with three subcommands instead of one binary per tool.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pt_image::{NO_CR3, TracedImage};
use pt_insn::InsnDecoder;
use pt_packet::{Cursor, PacketIterator};
use pt_query::{Config, QueryDecoder};

#[derive(Parser)]
#[command(about = "Decode an Intel PT trace at the packet, event, or instruction level")]
struct Cmdline {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every packet, one per line.
    Dump {
        /// Path to a raw Intel PT trace.
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Print every event released by the query/event decoder.
    Events {
        /// Path to a raw Intel PT trace.
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Print every instruction the instruction-flow decoder reconstructs.
    Insns {
        /// Path to a raw Intel PT trace.
        #[arg(short, long)]
        input: PathBuf,
        /// Path to the binary executed while tracing; mapped at
        /// `--vaddr` across every ASID.
        #[arg(short, long)]
        image: PathBuf,
        /// Virtual address the image file is mapped at.
        #[arg(short, long, default_value_t = 0)]
        vaddr: u64,
    },
}

fn mmap_input(path: &PathBuf) -> Result<memmap2::Mmap> {
    let file = File::open(path).context("failed to open input file")?;
    // SAFETY: caller owns the file and does not expect it to be
    // concurrently truncated; the decoders below detect that case.
    unsafe { memmap2::Mmap::map(&file) }.context("failed to mmap input file")
}

fn run_dump(input: &PathBuf) -> Result<()> {
    let buf = mmap_input(input)?;
    let mut cursor = Cursor::new(&buf);
    cursor.sync_forward().context("no PSB found in trace")?;
    for item in PacketIterator::new(cursor) {
        match item {
            Ok((packet, len)) => println!("{packet:?}\t({len} bytes)"),
            Err(e) => {
                log::warn!("decode error: {e}");
                break;
            }
        }
    }
    Ok(())
}

fn run_events(input: &PathBuf) -> Result<()> {
    let buf = mmap_input(input)?;
    let mut decoder = QueryDecoder::new(&buf, Config::default());
    decoder.sync_forward().context("no PSB found in trace")?;
    loop {
        match decoder.event() {
            Ok((event, status)) => println!("{:?}\t{status:?}", event.kind),
            Err(pt_error::ErrorKind::Eos) => break,
            Err(pt_error::ErrorKind::BadQuery) => {
                // The stream wants a branch query we have no way to
                // answer without instruction context; skip past it.
                if decoder.cond_branch().is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("decode error: {e}");
                break;
            }
        }
    }
    Ok(())
}

fn run_insns(input: &PathBuf, image_path: &PathBuf, vaddr: u64) -> Result<()> {
    let buf = mmap_input(input)?;
    let mut decoder = QueryDecoder::new(&buf, Config::default());
    decoder.sync_forward().context("no PSB found in trace")?;

    let image_len = std::fs::metadata(image_path)
        .context("failed to stat image file")?
        .len();
    let mut image = TracedImage::new();
    image
        .add_file(image_path, 0, image_len, NO_CR3, vaddr)
        .map_err(|e| anyhow::anyhow!("failed to add image section: {e}"))?;

    let mut insns = InsnDecoder::new(decoder, std::sync::Arc::new(image));
    loop {
        match insns.next() {
            Ok((record, status)) => {
                println!(
                    "{:#x}\t{:?}\t{:?}\t{status:?}",
                    record.ip,
                    record.iclass,
                    record.flags
                );
            }
            Err(pt_error::ErrorKind::Eos) => break,
            Err(e) => {
                log::warn!("decode error: {e}");
                break;
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cmdline = Cmdline::parse();
    match cmdline.command {
        Command::Dump { input } => run_dump(&input),
        Command::Events { input } => run_events(&input),
        Command::Insns {
            input,
            image,
            vaddr,
        } => run_insns(&input, &image, vaddr),
    }
}
