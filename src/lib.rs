//! # blockpatch
//!
//! Content-addressed binary diff and patch for directory trees.
//!
//! blockpatch extends the classic rsync rolling-checksum algorithm across
//! whole trees: it walks a directory into a [`Container`], hashes it in
//! fixed-size blocks, and emits a compact patch that rebuilds a new tree
//! from an old one by copying unchanged blocks and embedding fresh bytes.
//! Patches and signatures are framed, compressed artifacts that a later
//! invocation (or another machine) can consume on their own.
//!
//! ## Features
//!
//! - **Rolling checksum**: two-component weak hash with O(1) window sliding
//! - **Strong hash**: BLAKE3 confirmation of every block match
//! - **Containers**: files, directories and symlinks with deterministic order
//! - **Streaming**: one window and one literal buffer, whatever the tree size
//! - **Self-verifying**: signatures allow block-level integrity checks
//!
//! ## Example
//!
//! ```rust
//! use std::fs;
//! use blockpatch::{apply, diff, verify, CancelToken, DiffOptions, NoProgress};
//!
//! # fn main() -> blockpatch::Result<()> {
//! let old = tempfile::tempdir()?;
//! let new = tempfile::tempdir()?;
//! fs::write(old.path().join("save.dat"), b"version one")?;
//! fs::write(new.path().join("save.dat"), b"version two")?;
//!
//! let work = tempfile::tempdir()?;
//! let patch = work.path().join("patch.pwr");
//! let sig = work.path().join("patch.pwr.sig");
//! let stats = diff(
//!     old.path(),
//!     new.path(),
//!     &patch,
//!     &sig,
//!     DiffOptions::default(),
//!     &NoProgress,
//!     &CancelToken::new(),
//! )?;
//! assert_eq!(stats.total(), 11);
//!
//! let rebuilt = work.path().join("rebuilt");
//! apply(&patch, old.path(), &rebuilt, &NoProgress, &CancelToken::new())?;
//! verify(&sig, &rebuilt, &NoProgress, &CancelToken::new())?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod apply;
mod checksum;
mod container;
mod diff;
mod error;
mod hash;
mod ops;
mod progress;
mod recipe;
mod sign;
mod signature;
mod wire;

pub use apply::ApplyContext;
pub use checksum::RollingChecksum;
pub use container::{default_dir_filter, Container, DirEntry, FileEntry, SymlinkEntry};
pub use diff::{DiffContext, DiffStats};
pub use error::{HashKind, PatchError, Result};
pub use hash::StrongHash;
pub use ops::{apply, diff, sign, verify, DiffOptions, NULL_TARGET};
pub use progress::{CancelToken, NoProgress, Progress};
pub use recipe::{Operation, PatchHeader, SignatureHeader};
pub use sign::{read_signature, verify_signature, write_signature};
pub use signature::{
    block_count, block_len, compute_signature, compute_signature_to, BlockHash, CandidateBlock,
    HashIndex, BLOCK_SIZE,
};
pub use wire::{
    CompressedReader, CompressedWriter, CompressionAlgorithm, CompressionSettings,
    CountingWriter, WireReader, WireWriter, PATCH_MAGIC, SIGNATURE_MAGIC,
};
