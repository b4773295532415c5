//! Error types for blockpatch operations.

use std::path::PathBuf;

use thiserror::Error;

/// Which of the two block hashes failed to match during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    /// The rolling (weak) checksum.
    Weak,
    /// The cryptographic (strong) hash.
    Strong,
}

impl std::fmt::Display for HashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weak => write!(f, "weak hash"),
            Self::Strong => write!(f, "strong hash"),
        }
    }
}

/// Errors that can occur during blockpatch operations.
///
/// No variant is recovered inside the engine; callers decide what to do.
#[derive(Error, Debug)]
pub enum PatchError {
    /// I/O error during read/write operations.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// I/O error on an anonymous stream (no associated path).
    #[error("I/O error: {0}")]
    Stream(#[from] std::io::Error),

    /// The stream does not start with the expected magic bytes.
    #[error("Bad magic: expected {expected:?}, got {got:?}")]
    BadMagic {
        /// Magic the reader was opened for.
        expected: [u8; 4],
        /// Bytes actually found.
        got: [u8; 4],
    },

    /// EOF in the middle of a frame.
    #[error("Truncated stream: EOF mid-frame")]
    TruncatedStream,

    /// The decompressor rejected its input.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// The header names a compression algorithm this build does not know.
    #[error("Unknown compression algorithm: {0:#x}")]
    UnknownCompression(u8),

    /// A framed payload failed to decode.
    #[error("Failed to decode message: {0}")]
    Decode(String),

    /// A message failed to encode.
    #[error("Failed to encode message: {0}")]
    Encode(String),

    /// Signature verification failed at a specific block.
    #[error("Integrity mismatch: {kind} differs at block {block}")]
    IntegrityMismatch {
        /// Which hash differed.
        kind: HashKind,
        /// Flat block index of the first mismatch.
        block: u64,
    },

    /// The directory produced a different number of blocks than the signature records.
    #[error("Length mismatch: expected {expected} blocks, got {got}")]
    LengthMismatch {
        /// Block count recorded in the signature.
        expected: u64,
        /// Block count produced by re-hashing.
        got: u64,
    },

    /// Apply produced a file whose size differs from the container's declaration.
    #[error("Output size mismatch for {path:?}: got {got}, want {want}")]
    OutputSizeMismatch {
        /// Output file path.
        path: PathBuf,
        /// Bytes actually written.
        got: u64,
        /// Size declared by the container.
        want: u64,
    },

    /// A copy operation ran past the end of its target file.
    #[error("Short data: target file {path:?} ended {missing} bytes early")]
    ShortData {
        /// Target file path.
        path: PathBuf,
        /// Bytes that could not be read.
        missing: u64,
    },

    /// A recipe references a target file index the target tree does not have.
    #[error("Target file missing: index {0}")]
    TargetFileMissing(u64),

    /// The recipe ended before every file's operation list was terminated.
    #[error("Unexpected end of recipe")]
    UnexpectedEndOfRecipe,

    /// The root path handed to the walker does not exist.
    #[error("Path not found: {0:?}")]
    PathNotFound(PathBuf),

    /// An entry could not be read while walking a tree.
    #[error("Unreadable entry {path:?}: {source}")]
    Unreadable {
        /// Entry that failed.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
}

impl PatchError {
    /// Wrap an I/O error with the path it occurred on.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for blockpatch operations.
pub type Result<T> = std::result::Result<T, PatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_io() {
        let err = PatchError::io(
            "some/file",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        assert!(err.to_string().contains("some/file"));
    }

    #[test]
    fn error_display_bad_magic() {
        let err = PatchError::BadMagic {
            expected: *b"BPAT",
            got: *b"ZZZZ",
        };
        assert!(err.to_string().contains("Bad magic"));
    }

    #[test]
    fn error_display_integrity_mismatch() {
        let weak = PatchError::IntegrityMismatch {
            kind: HashKind::Weak,
            block: 7,
        };
        let strong = PatchError::IntegrityMismatch {
            kind: HashKind::Strong,
            block: 7,
        };
        assert!(weak.to_string().contains("weak hash"));
        assert!(strong.to_string().contains("strong hash"));
        assert_ne!(weak.to_string(), strong.to_string());
    }

    #[test]
    fn error_display_output_size_mismatch() {
        let err = PatchError::OutputSizeMismatch {
            path: PathBuf::from("out/a.bin"),
            got: 10,
            want: 20,
        };
        let msg = err.to_string();
        assert!(msg.contains("got 10"));
        assert!(msg.contains("want 20"));
    }

    #[test]
    fn error_display_unknown_compression() {
        let err = PatchError::UnknownCompression(0x7f);
        assert!(err.to_string().contains("0x7f"));
    }
}
