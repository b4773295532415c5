//! blockpatch CLI - diff, apply, sign and verify directory trees.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockpatch::{
    CancelToken, CompressionAlgorithm, CompressionSettings, DiffOptions, NoProgress, Progress,
};

/// blockpatch - content-addressed diff & patch for directory trees
#[derive(Parser)]
#[command(name = "blockpatch")]
#[command(version)]
#[command(about = "Compute and apply binary patches between directory trees")]
struct Cli {
    /// Be chatty about what's happening
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Hide progress bars and extra info
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the difference between two directories
    Diff {
        /// Directory with older files, a signature file generated from it,
        /// or /dev/null for a from-scratch patch
        old: PathBuf,

        /// Directory with newer files
        new: PathBuf,

        /// Path to write the patch to; the signature lands next to it
        /// with `.sig` appended
        #[arg(default_value = "patch.pwr")]
        patch: PathBuf,

        /// Make sure the patch applies cleanly by applying it (slower)
        #[arg(long)]
        verify: bool,

        /// Compression quality
        #[arg(long, default_value_t = 1)]
        quality: i32,

        /// Compression algorithm (none, brotli, zstd)
        #[arg(long, default_value = "brotli")]
        compression: CompressionAlgorithm,
    },

    /// Use a patch to bring a directory to a new version
    Apply {
        /// Patch file previously generated with `diff`
        patch: PathBuf,

        /// Directory to patch
        old: PathBuf,

        /// Directory to create newer files in, instead of working in-place
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Patch the old directory itself (staged, then swapped)
        #[arg(long)]
        inplace: bool,
    },

    /// Generate a signature file for a directory
    Sign {
        /// Directory to sign
        dir: PathBuf,

        /// Path to write the signature to
        signature: PathBuf,

        /// Compression quality
        #[arg(long, default_value_t = 1)]
        quality: i32,

        /// Compression algorithm (none, brotli, zstd)
        #[arg(long, default_value = "brotli")]
        compression: CompressionAlgorithm,
    },

    /// Use a signature to verify the integrity of a directory
    Verify {
        /// Signature file to read
        signature: PathBuf,

        /// Directory to verify
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "blockpatch=debug"
    } else {
        "blockpatch=warn"
    };
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

fn run(cli: Cli) -> blockpatch::Result<()> {
    let progress = make_progress(cli.quiet);
    let cancel = CancelToken::new();

    match cli.command {
        Commands::Diff {
            old,
            new,
            patch,
            verify,
            quality,
            compression,
        } => run_diff(
            &old,
            &new,
            &patch,
            DiffOptions {
                compression: CompressionSettings::new(compression, quality),
                verify,
            },
            progress.as_ref(),
            &cancel,
        ),
        Commands::Apply {
            patch,
            old,
            dir,
            inplace,
        } => run_apply(&patch, &old, dir.as_deref(), inplace, progress.as_ref(), &cancel),
        Commands::Sign {
            dir,
            signature,
            quality,
            compression,
        } => blockpatch::sign(
            &dir,
            &signature,
            CompressionSettings::new(compression, quality),
            progress.as_ref(),
            &cancel,
        ),
        Commands::Verify { signature, dir } => {
            blockpatch::verify(&signature, &dir, progress.as_ref(), &cancel)?;
            println!("Verified {}", dir.display());
            Ok(())
        }
    }
}

fn run_diff(
    old: &Path,
    new: &Path,
    patch: &Path,
    options: DiffOptions,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> blockpatch::Result<()> {
    let sig = sig_path_for(patch);
    let start = Instant::now();

    let stats = blockpatch::diff(old, new, patch, &sig, options, progress, cancel)?;

    let elapsed = start.elapsed();
    let total = stats.total();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let per_second = (total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64;
    println!(
        "Processed {} in {:.1?} ({}/s)",
        HumanBytes(total),
        elapsed,
        HumanBytes(per_second)
    );

    let patch_size = fs::metadata(patch).map(|m| m.len()).unwrap_or(0);
    let sig_size = fs::metadata(&sig).map(|m| m.len()).unwrap_or(0);
    println!(
        "Patch is {} ({} reused, {} fresh), signature is {}",
        HumanBytes(patch_size),
        HumanBytes(stats.reused_bytes),
        HumanBytes(stats.fresh_bytes),
        HumanBytes(sig_size)
    );
    Ok(())
}

fn run_apply(
    patch: &Path,
    old: &Path,
    dir: Option<&Path>,
    inplace: bool,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> blockpatch::Result<()> {
    if let Some(output) = dir {
        blockpatch::apply(patch, old, output, progress, cancel)?;
        println!("Rebuilt tree in {}", output.display());
        return Ok(());
    }

    if !inplace {
        return Err(blockpatch::PatchError::Stream(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "pass --dir to write elsewhere, or --inplace to patch the old directory",
        )));
    }

    // Stage into a sibling, then swap: the engine never patches in place.
    let (stage, backup) = staging_paths(old)?;
    if stage.exists() {
        fs::remove_dir_all(&stage).map_err(|e| blockpatch::PatchError::io(&stage, e))?;
    }
    blockpatch::apply(patch, old, &stage, progress, cancel)?;

    if backup.exists() {
        fs::remove_dir_all(&backup).map_err(|e| blockpatch::PatchError::io(&backup, e))?;
    }
    fs::rename(old, &backup).map_err(|e| blockpatch::PatchError::io(old, e))?;
    if let Err(e) = fs::rename(&stage, old) {
        // Put the old tree back before giving up
        let _ = fs::rename(&backup, old);
        return Err(blockpatch::PatchError::io(&stage, e));
    }
    fs::remove_dir_all(&backup).map_err(|e| blockpatch::PatchError::io(&backup, e))?;
    println!("Patched {} in place", old.display());
    Ok(())
}

fn sig_path_for(patch: &Path) -> PathBuf {
    let mut name = patch.as_os_str().to_os_string();
    name.push(".sig");
    PathBuf::from(name)
}

fn staging_paths(old: &Path) -> blockpatch::Result<(PathBuf, PathBuf)> {
    let parent = old.parent().unwrap_or_else(|| Path::new("."));
    let name = old
        .file_name()
        .ok_or_else(|| blockpatch::PatchError::PathNotFound(old.to_path_buf()))?
        .to_string_lossy();
    Ok((
        parent.join(format!(".{name}.stage")),
        parent.join(format!(".{name}.bak")),
    ))
}

/// Progress bar bridging [`indicatif`] into the engine's callback.
struct BarProgress {
    bar: ProgressBar,
}

impl Progress for BarProgress {
    fn begin(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
    }

    fn advance(&self, bytes: u64) {
        self.bar.inc(bytes);
    }
}

fn make_progress(quiet: bool) -> Box<dyn Progress> {
    if quiet {
        return Box::new(NoProgress);
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} ({bytes_per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    Box::new(BarProgress { bar })
}
