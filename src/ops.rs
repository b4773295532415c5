//! Top-level operations: diff, apply, sign, verify.
//!
//! These wrap the engine modules with path handling — resolving a diff
//! target that may be a directory, a signature file, or the `/dev/null`
//! sentinel — and with the optional post-diff verification pass that
//! rebuilds the source in a throwaway directory.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tracing::info;

use crate::apply::ApplyContext;
use crate::container::Container;
use crate::diff::{DiffContext, DiffStats};
use crate::error::{PatchError, Result};
use crate::progress::{CancelToken, Progress};
use crate::sign::{read_signature, verify_signature, write_signature};
use crate::signature::{compute_signature, BlockHash};
use crate::wire::CompressionSettings;

/// Diff target sentinel meaning "empty container, empty signature".
pub const NULL_TARGET: &str = "/dev/null";

/// Options for [`diff`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Compression for the patch and signature artifacts.
    pub compression: CompressionSettings,
    /// Rebuild the source in a temp dir afterwards and verify it against
    /// the emitted signature.
    pub verify: bool,
}

/// Compute a patch turning `target` into `source`.
///
/// `target` may be a directory (walked and hashed), a signature file
/// (loaded), or [`NULL_TARGET`]. The patch is written to `patch_path` and
/// the fresh source signature to `sig_path`.
///
/// # Errors
///
/// Surfaces walker, engine and I/O errors; with `verify` set, also any
/// mismatch found while checking the rebuilt tree.
pub fn diff(
    target: &Path,
    source: &Path,
    patch_path: &Path,
    sig_path: &Path,
    options: DiffOptions,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> Result<DiffStats> {
    let (target_container, target_signature) = resolve_target(target, progress, cancel)?;
    let source_container = Container::walk(source)?;
    info!(source = %source_container.summary(), "computing differences");

    let patch_file = File::create(patch_path).map_err(|e| PatchError::io(patch_path, e))?;
    let sig_file = File::create(sig_path).map_err(|e| PatchError::io(sig_path, e))?;

    let stats = DiffContext {
        source_container: &source_container,
        source_root: source,
        target_container: &target_container,
        target_signature: &target_signature,
        compression: options.compression,
    }
    .write_patch(
        BufWriter::new(patch_file),
        BufWriter::new(sig_file),
        progress,
        cancel,
    )?;

    if options.verify {
        let scratch = tempfile::tempdir().map_err(PatchError::Stream)?;
        info!(dir = %scratch.path().display(), "verifying patch by rebuilding source");
        apply(patch_path, target, scratch.path(), progress, cancel)?;
        verify(sig_path, scratch.path(), progress, cancel)?;
    }

    Ok(stats)
}

/// Apply the patch at `patch_path` to the target tree, writing the source
/// tree under `output_root` (created fresh, never in place).
///
/// # Errors
///
/// Surfaces wire, target and output errors from the apply engine.
pub fn apply(
    patch_path: &Path,
    target_root: &Path,
    output_root: &Path,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let patch = File::open(patch_path).map_err(|e| PatchError::io(patch_path, e))?;
    ApplyContext {
        target_root,
        output_root,
    }
    .apply(BufReader::new(patch), progress, cancel)
}

/// Walk `dir` and write its signature artifact to `sig_path`.
///
/// # Errors
///
/// Surfaces walker and I/O errors.
pub fn sign(
    dir: &Path,
    sig_path: &Path,
    compression: CompressionSettings,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let container = Container::walk(dir)?;
    info!(container = %container.summary(), "signing");
    let out = File::create(sig_path).map_err(|e| PatchError::io(sig_path, e))?;
    write_signature(
        &container,
        dir,
        BufWriter::new(out),
        compression,
        progress,
        cancel,
    )
}

/// Verify the directory at `dir` against the signature at `sig_path`.
///
/// # Errors
///
/// Returns [`PatchError::IntegrityMismatch`] or
/// [`PatchError::LengthMismatch`] when the directory deviates, besides the
/// usual wire and I/O errors.
pub fn verify(
    sig_path: &Path,
    dir: &Path,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let sig_file = File::open(sig_path).map_err(|e| PatchError::io(sig_path, e))?;
    let (container, hashes) = read_signature(BufReader::new(sig_file))?;
    verify_signature(&container, &hashes, dir, progress, cancel)
}

/// Resolve a diff target into a container and its signature.
fn resolve_target(
    target: &Path,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> Result<(Container, Vec<BlockHash>)> {
    if target == Path::new(NULL_TARGET) {
        return Ok((Container::empty(), Vec::new()));
    }

    let meta = fs::metadata(target).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PatchError::PathNotFound(target.to_path_buf())
        } else {
            PatchError::io(target, e)
        }
    })?;

    if meta.is_dir() {
        info!(target = %target.display(), "computing target signature");
        let container = Container::walk(target)?;
        let signature = compute_signature(&container, target, progress, cancel)?;
        Ok((container, signature))
    } else {
        info!(target = %target.display(), "reading target signature from file");
        let file = File::open(target).map_err(|e| PatchError::io(target, e))?;
        read_signature(BufReader::new(file))
    }
}
