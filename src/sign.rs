//! Signature artifacts: writing, reading, and directory verification.
//!
//! A signature file records a container and its full block-hash sequence.
//! Verification re-walks nothing: it re-hashes the directory against the
//! *recorded* container and compares hash lists element-wise, so a renamed
//! or missing file surfaces as a read error or hash mismatch rather than a
//! silent pass.

use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::container::Container;
use crate::error::{HashKind, PatchError, Result};
use crate::progress::{CancelToken, Progress};
use crate::recipe::SignatureHeader;
use crate::signature::{block_count, compute_signature, compute_signature_to, BlockHash};
use crate::wire::{CompressionSettings, WireReader, WireWriter, SIGNATURE_MAGIC};

/// Write a signature artifact for `container`, whose bytes live under
/// `root`, into `out`.
///
/// Hashes are streamed as they are computed; memory stays O(1) in the
/// signature length.
///
/// # Errors
///
/// Returns an I/O error if a container file cannot be read or the output
/// cannot be written, or [`PatchError::Cancelled`].
pub fn write_signature(
    container: &Container,
    root: &Path,
    out: impl Write,
    compression: CompressionSettings,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let mut wire = WireWriter::new(out);
    wire.write_magic(&SIGNATURE_MAGIC)?;
    wire.write_message(&SignatureHeader { compression })?;
    let mut wire = wire.compress(&compression)?;
    wire.write_message(container)?;

    compute_signature_to(container, root, progress, cancel, &mut |hash| {
        wire.write_message(&hash)
    })?;

    wire.finish()?.flush()?;
    debug!(container = %container.summary(), "signature written");
    Ok(())
}

/// Read a signature artifact: the recorded container and its block hashes.
///
/// # Errors
///
/// Returns [`PatchError::BadMagic`], [`PatchError::TruncatedStream`] if the
/// stream ends before the container's declared block count is read, or
/// other wire errors.
pub fn read_signature(reader: impl Read) -> Result<(Container, Vec<BlockHash>)> {
    let mut wire = WireReader::new(reader);
    wire.expect_magic(&SIGNATURE_MAGIC)?;
    let header: SignatureHeader = wire.read_message()?;
    let mut wire = wire.decompress(&header.compression)?;

    let container: Container = wire.read_message()?;
    let total: u64 = container.files.iter().map(|f| block_count(f.size)).sum();
    let mut hashes = Vec::with_capacity(total as usize);
    for _ in 0..total {
        hashes.push(wire.read_message::<BlockHash>()?);
    }
    Ok((container, hashes))
}

/// Verify that the directory at `root` matches a recorded signature.
///
/// The directory is re-hashed against the recorded container; the hash
/// lists are then compared element-wise, weak checksum first.
///
/// # Errors
///
/// Returns [`PatchError::LengthMismatch`] if the block counts differ, or
/// [`PatchError::IntegrityMismatch`] naming the first differing block and
/// which hash (weak or strong) disagreed.
pub fn verify_signature(
    container: &Container,
    expected: &[BlockHash],
    root: &Path,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> Result<()> {
    let actual = compute_signature(container, root, progress, cancel)?;

    if actual.len() != expected.len() {
        return Err(PatchError::LengthMismatch {
            expected: expected.len() as u64,
            got: actual.len() as u64,
        });
    }

    for (block, (want, got)) in expected.iter().zip(&actual).enumerate() {
        if want.weak != got.weak {
            return Err(PatchError::IntegrityMismatch {
                kind: HashKind::Weak,
                block: block as u64,
            });
        }
        if want.strong != got.strong {
            return Err(PatchError::IntegrityMismatch {
                kind: HashKind::Strong,
                block: block as u64,
            });
        }
    }

    info!(blocks = expected.len(), "signature verified");
    Ok(())
}
