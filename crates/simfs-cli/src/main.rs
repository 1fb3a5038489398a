#![forbid(unsafe_code)]
//! Command-line driver for SimFS volumes.
//!
//! Mounts the image per invocation, runs one operation, and unmounts. The
//! graphical front-end this replaces drove the same facade calls.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simfs::{defrag, repair, Filesystem};
use std::io::Write as _;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "simfs", about = "SimFS — simulated block filesystem toolkit")]
struct Cli {
    /// Path to the volume image.
    image: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and format a fresh volume image.
    Mkfs {
        /// Volume size in MiB.
        #[arg(long, default_value_t = 100)]
        size_mib: u64,
    },
    /// Show volume counters and the fragmentation score.
    Info {
        #[arg(long)]
        json: bool,
    },
    /// List a directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory.
    Mkdir { path: String },
    /// Write a file from a host file or a generated fill pattern.
    Write {
        path: String,
        /// Host file to copy in.
        #[arg(long, conflicts_with = "fill_kib")]
        input: Option<PathBuf>,
        /// Generate this many KiB of patterned bytes instead.
        #[arg(long)]
        fill_kib: Option<usize>,
    },
    /// Print a file's contents to stdout.
    Cat { path: String },
    /// Delete a file.
    Rm { path: String },
    /// Report fragmentation statistics.
    Frag {
        #[arg(long)]
        json: bool,
    },
    /// Compact the volume into a dense prefix.
    Defrag {
        #[arg(long)]
        json: bool,
    },
    /// Inject a simulated crash. Exits without unmounting, like the dead
    /// process it imitates; pass --recover to repair in the same session.
    Crash {
        /// Crash mid-write into this path instead of corrupting the
        /// most-recently-modified file.
        #[arg(long)]
        during_write: Option<String>,
        /// Payload size for the mid-write variant, in KiB.
        #[arg(long, default_value_t = 16)]
        payload_kib: usize,
        /// Fraction of the payload's blocks written before the crash.
        #[arg(long, default_value_t = 0.5)]
        fraction: f64,
        /// Run recovery immediately after the injection.
        #[arg(long)]
        recover: bool,
    },
    /// Repair the volume after a simulated crash.
    Recover {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut fs = Filesystem::new(&cli.image);

    match cli.command {
        Command::Mkfs { size_mib } => {
            fs.create_volume(size_mib * 1024 * 1024)
                .context("creating volume")?;
            fs.unmount()?;
            println!("created {} ({size_mib} MiB)", cli.image.display());
            Ok(())
        }
        // The corrupted set lives in memory for the mount's lifetime, so a
        // crash injection must end the process without the clean unmount
        // path unless recovery runs in the same session.
        Command::Crash {
            during_write,
            payload_kib,
            fraction,
            recover: recover_now,
        } => {
            mount_with_warning(&mut fs)?;
            crash(&mut fs, during_write, payload_kib, fraction)?;
            if recover_now {
                recover(&mut fs, false)?;
                fs.unmount().context("unmounting volume")?;
            } else {
                println!("volume left dirty; reopen and run `recover`");
            }
            Ok(())
        }
        command => {
            mount_with_warning(&mut fs)?;
            let result = dispatch(&mut fs, command);
            // Leave the image dirty on disk only if unmount itself fails.
            let unmount = fs.unmount();
            result?;
            unmount.context("unmounting volume")?;
            Ok(())
        }
    }
}

fn mount_with_warning(fs: &mut Filesystem) -> Result<()> {
    let report = fs.mount().context("mounting volume")?;
    if !report.was_clean {
        eprintln!("warning: volume was not cleanly unmounted; run `recover`");
    }
    Ok(())
}

fn dispatch(fs: &mut Filesystem, command: Command) -> Result<()> {
    match command {
        Command::Mkfs { .. } => unreachable!("handled before mount"),
        Command::Info { json } => info(fs, json),
        Command::Ls { path } => ls(fs, &path),
        Command::Mkdir { path } => {
            fs.create_dir(&path)?;
            println!("created {path}");
            Ok(())
        }
        Command::Write {
            path,
            input,
            fill_kib,
        } => write(fs, &path, input, fill_kib),
        Command::Cat { path } => {
            let data = fs.read_file(&path)?;
            std::io::stdout().write_all(&data)?;
            Ok(())
        }
        Command::Rm { path } => {
            fs.delete_file(&path)?;
            println!("deleted {path}");
            Ok(())
        }
        Command::Frag { json } => frag(fs, json),
        Command::Defrag { json } => defrag_cmd(fs, json),
        Command::Crash { .. } => unreachable!("handled before dispatch"),
        Command::Recover { json } => recover(fs, json),
    }
}

fn info(fs: &Filesystem, json: bool) -> Result<()> {
    let stats = fs.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("total blocks:        {}", stats.total_blocks);
        println!("free blocks:         {}", stats.free_blocks);
        println!("used blocks:         {}", stats.used_blocks);
        println!("free inodes:         {}", stats.free_inodes);
        println!("fragmentation score: {:.1}", stats.fragmentation_score);
    }
    Ok(())
}

fn ls(fs: &Filesystem, path: &str) -> Result<()> {
    for entry in fs.list_dir(path)? {
        let kind = match entry.kind {
            simfs::types::FileKind::Dir => "dir ",
            _ => "file",
        };
        println!("{kind}  {:>6}  {}", entry.inode.0, entry.name);
    }
    Ok(())
}

fn write(
    fs: &mut Filesystem,
    path: &str,
    input: Option<PathBuf>,
    fill_kib: Option<usize>,
) -> Result<()> {
    let data = match (input, fill_kib) {
        (Some(host), _) => {
            std::fs::read(&host).with_context(|| format!("reading {}", host.display()))?
        }
        (None, Some(kib)) => (0..kib * 1024).map(|i| (i % 251) as u8).collect(),
        (None, None) => anyhow::bail!("pass --input or --fill-kib"),
    };
    if !fs.file_exists(path) {
        fs.create_file(path)?;
    }
    fs.write_file(path, &data)?;
    println!("wrote {} bytes to {path}", data.len());
    Ok(())
}

fn frag(fs: &Filesystem, json: bool) -> Result<()> {
    let report = defrag::analyze(fs)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("files:                 {}", report.total_files);
        println!("fragmented files:      {}", report.fragmented_files);
        println!("total fragments:       {}", report.total_fragments);
        println!("avg fragments/file:    {:.2}", report.average_fragments_per_file);
        println!("largest free run:      {}", report.largest_contiguous_free_run);
        println!("score:                 {:.1}", report.score);
    }
    Ok(())
}

fn defrag_cmd(fs: &mut Filesystem, json: bool) -> Result<()> {
    let mut progress = |done: usize, total: usize| {
        eprint!("\rcompacting {done}/{total}");
        if done == total {
            eprintln!();
        }
    };
    let report = defrag::defragment(fs, Some(&mut progress))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "compacted {} files; score {:.1} -> {:.1}",
            report.files_compacted, report.score_before, report.score_after
        );
    }
    Ok(())
}

fn crash(
    fs: &mut Filesystem,
    during_write: Option<String>,
    payload_kib: usize,
    fraction: f64,
) -> Result<()> {
    let report = match during_write {
        Some(path) => {
            let payload: Vec<u8> = (0..payload_kib * 1024).map(|i| (i % 239) as u8).collect();
            repair::simulate_crash_during_write(fs, &path, &payload, fraction)?
        }
        None => repair::simulate_crash(fs)?,
    };
    println!(
        "crash injected: inode {} with {} corrupted blocks; run `recover`",
        report.target.0,
        report.corrupted_blocks.len()
    );
    Ok(())
}

fn recover(fs: &mut Filesystem, json: bool) -> Result<()> {
    let report = repair::run_recovery(fs)?;
    if json {
        println!("{}", report.to_json()?);
    } else {
        println!(
            "recovery {:?}: freed {} blocks, removed {} files",
            report.outcome,
            report.freed_blocks,
            report.removed_files.len()
        );
        for path in &report.removed_files {
            println!("  removed {path}");
        }
    }
    Ok(())
}
