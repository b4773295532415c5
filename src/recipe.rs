//! Message types that make up patch and signature artifacts.
//!
//! A patch is: magic, an uncompressed [`PatchHeader`], then (compressed)
//! the target container, the source container, and one [`Operation`] list
//! per source file, each terminated by [`Operation::End`]. A signature is:
//! magic, [`SignatureHeader`], then (compressed) the signed container
//! followed by its block hashes.

use serde::{Deserialize, Serialize};

use crate::wire::CompressionSettings;

/// Uncompressed header frame of a patch artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    /// Compression applied to the rest of the stream.
    pub compression: CompressionSettings,
}

/// Uncompressed header frame of a signature artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureHeader {
    /// Compression applied to the rest of the stream.
    pub compression: CompressionSettings,
}

/// One step in reconstructing a source file from a target tree.
///
/// Executing a file's operation list in order yields exactly the file's
/// declared size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Copy `block_count` consecutive blocks from a target file, starting
    /// at `start_block`. The final block of a target file may be short.
    BlockRange {
        /// Index of the file in the target container.
        file_index: u32,
        /// First block to copy.
        start_block: u32,
        /// Number of consecutive blocks.
        block_count: u32,
    },
    /// Embed literal bytes.
    Data {
        /// The bytes themselves.
        bytes: Vec<u8>,
    },
    /// Terminates a file's operation list.
    End,
}

impl Operation {
    /// Check if this is a copy operation.
    #[must_use]
    pub const fn is_block_range(&self) -> bool {
        matches!(self, Self::BlockRange { .. })
    }

    /// Check if this is a literal operation.
    #[must_use]
    pub const fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }
}
