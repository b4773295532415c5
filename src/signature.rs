//! Block signature computation and lookup.
//!
//! A container's files form one conceptual flat byte stream, partitioned
//! into fixed-size blocks (the final block of each file may be short). The
//! signature is one [`BlockHash`] per block in stream order: a rolling weak
//! checksum for fast candidate filtering plus a BLAKE3 strong hash for
//! confirmation. The [`HashIndex`] turns a signature into the weak-keyed
//! lookup table the diff engine matches against.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::checksum::RollingChecksum;
use crate::container::Container;
use crate::error::{PatchError, Result};
use crate::hash::StrongHash;
use crate::progress::{CancelToken, Progress};

/// Size of a signature block in bytes. Every artifact assumes this value.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Bytes hashed per read, a whole number of blocks.
const HASH_CHUNK: usize = 128 * BLOCK_SIZE;

/// Number of blocks needed to cover `size` bytes.
#[must_use]
pub fn block_count(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64)
}

/// Length in bytes of block `index` of a `size`-byte file.
///
/// Full blocks are [`BLOCK_SIZE`]; the final block is whatever remains.
#[must_use]
pub fn block_len(size: u64, index: u64) -> u64 {
    (size - index * BLOCK_SIZE as u64).min(BLOCK_SIZE as u64)
}

/// Weak and strong hash of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    /// Rolling checksum of the block bytes.
    pub weak: u32,
    /// BLAKE3 hash of the block bytes.
    pub strong: StrongHash,
}

impl BlockHash {
    /// Hash a block of data.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            weak: RollingChecksum::new(data).digest(),
            strong: StrongHash::compute(data),
        }
    }
}

/// Compute the full signature of a container rooted at `root`.
///
/// Hashes are produced in flat-stream order: every block of every file in
/// `files` order.
///
/// # Errors
///
/// Returns an I/O error if a container file cannot be read, or
/// [`PatchError::Cancelled`] if the token trips.
pub fn compute_signature(
    container: &Container,
    root: &Path,
    progress: &dyn Progress,
    cancel: &CancelToken,
) -> Result<Vec<BlockHash>> {
    let mut hashes = Vec::with_capacity(block_count(container.size) as usize);
    compute_signature_to(container, root, progress, cancel, &mut |hash| {
        hashes.push(hash);
        Ok(())
    })?;
    Ok(hashes)
}

/// Compute a container's signature, streaming each hash into `sink`.
///
/// Uses O(1) memory in the signature length; within each read chunk the
/// per-block hashes are computed in parallel, but `sink` observes them in
/// strict stream order.
///
/// # Errors
///
/// Returns an I/O error if a container file cannot be read,
/// [`PatchError::Cancelled`] if the token trips, or whatever error `sink`
/// returns.
pub fn compute_signature_to(
    container: &Container,
    root: &Path,
    progress: &dyn Progress,
    cancel: &CancelToken,
    sink: &mut dyn FnMut(BlockHash) -> Result<()>,
) -> Result<()> {
    progress.begin(container.size);

    let mut chunk = vec![0u8; HASH_CHUNK];
    for entry in &container.files {
        let path = root.join(&entry.path);
        let mut file = File::open(&path).map_err(|e| PatchError::io(&path, e))?;

        loop {
            cancel.check()?;
            let filled = read_up_to(&mut file, &mut chunk)
                .map_err(|e| PatchError::io(&path, e))?;
            if filled == 0 {
                break;
            }

            let hashes: Vec<BlockHash> = chunk[..filled]
                .par_chunks(BLOCK_SIZE)
                .map(BlockHash::compute)
                .collect();
            for hash in hashes {
                sink(hash)?;
            }
            progress.advance(filled as u64);

            if filled < chunk.len() {
                break;
            }
        }
    }

    Ok(())
}

/// Fill `buf` from `reader`, stopping only at EOF or a full buffer.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// One indexed target block: where it lives and what it hashes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateBlock {
    /// Index of the file in the target container.
    pub file_index: u32,
    /// Block index within that file.
    pub block_index: u32,
    /// Real byte length of the block (short for final blocks).
    pub len: u32,
    /// Strong hash confirming a match.
    pub strong: StrongHash,
}

/// Candidate lists longer than this are considered saturated and skipped,
/// bounding worst-case matching time on degenerate inputs (e.g. large
/// zero-filled regions).
const MAX_CANDIDATES: usize = 32;

/// Weak-hash lookup table over a target container's signature.
///
/// Two-level lookup: the u32 weak hash narrows to a candidate list, then a
/// strong-hash comparison confirms. Full-size and short (final) blocks are
/// kept in separate maps because a short block can only match a window of
/// exactly its own length.
#[derive(Debug, Default)]
pub struct HashIndex {
    full: FxHashMap<u32, Vec<CandidateBlock>>,
    short: FxHashMap<u32, Vec<CandidateBlock>>,
    /// Distinct short-block lengths present, descending.
    short_lens: Vec<u32>,
}

impl HashIndex {
    /// Build the index for a target container and its signature.
    ///
    /// `signature` must be in flat-stream order as produced by
    /// [`compute_signature`]; extra or missing trailing hashes are ignored
    /// (verification is the place that checks counts).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(container: &Container, signature: &[BlockHash]) -> Self {
        let mut index = Self {
            full: FxHashMap::with_capacity_and_hasher(
                signature.len(),
                rustc_hash::FxBuildHasher,
            ),
            ..Self::default()
        };

        let mut cursor = 0usize;
        for (file_index, entry) in container.files.iter().enumerate() {
            let blocks = block_count(entry.size);
            for block_index in 0..blocks {
                let Some(hash) = signature.get(cursor) else {
                    return index;
                };
                cursor += 1;

                let len = block_len(entry.size, block_index) as u32;
                let candidate = CandidateBlock {
                    file_index: file_index as u32,
                    block_index: block_index as u32,
                    len,
                    strong: hash.strong,
                };

                let bucket = if len as usize == BLOCK_SIZE {
                    &mut index.full
                } else {
                    if !index.short_lens.contains(&len) {
                        index.short_lens.push(len);
                    }
                    &mut index.short
                };
                let list = bucket.entry(hash.weak).or_default();
                // Saturated lists stop growing; one extra entry marks them.
                if list.len() <= MAX_CANDIDATES {
                    list.push(candidate);
                }
            }
        }

        index.short_lens.sort_unstable_by(|a, b| b.cmp(a));
        index
    }

    /// True if the index holds no blocks at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.short.is_empty()
    }

    /// True if any full-size block has this weak hash.
    #[must_use]
    pub fn has_full(&self, weak: u32) -> bool {
        self.full
            .get(&weak)
            .is_some_and(|list| list.len() <= MAX_CANDIDATES)
    }

    /// Find a full-size block matching the window `data`.
    ///
    /// `prefer` nominates a `(file_index, block_index)` pair; when several
    /// candidates confirm, the preferred one wins, which keeps copy
    /// operations coalescible.
    #[must_use]
    pub fn find_full(
        &self,
        weak: u32,
        data: &[u8],
        prefer: Option<(u32, u32)>,
    ) -> Option<&CandidateBlock> {
        let list = self.full.get(&weak)?;
        if list.len() > MAX_CANDIDATES {
            return None;
        }
        let strong = StrongHash::compute(data);
        Self::pick(list.iter().filter(|c| c.strong == strong), prefer)
    }

    /// Find a short final block of exactly `data.len()` bytes matching `data`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn find_short(
        &self,
        weak: u32,
        data: &[u8],
        prefer: Option<(u32, u32)>,
    ) -> Option<&CandidateBlock> {
        let list = self.short.get(&weak)?;
        if list.len() > MAX_CANDIDATES {
            return None;
        }
        let len = data.len() as u32;
        if !list.iter().any(|c| c.len == len) {
            return None;
        }
        let strong = StrongHash::compute(data);
        Self::pick(
            list.iter().filter(|c| c.len == len && c.strong == strong),
            prefer,
        )
    }

    /// Distinct short-block lengths present in the target, descending.
    #[must_use]
    pub fn short_lens(&self) -> &[u32] {
        &self.short_lens
    }

    fn pick<'a>(
        matching: impl Iterator<Item = &'a CandidateBlock>,
        prefer: Option<(u32, u32)>,
    ) -> Option<&'a CandidateBlock> {
        if let Some((file, block)) = prefer {
            let mut best = None;
            for candidate in matching {
                if candidate.file_index == file && candidate.block_index == block {
                    return Some(candidate);
                }
                best.get_or_insert(candidate);
            }
            best
        } else {
            matching.min_by_key(|c| (c.file_index, c.block_index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn block_count_math() {
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(1), 1);
        assert_eq!(block_count(BLOCK_SIZE as u64), 1);
        assert_eq!(block_count(BLOCK_SIZE as u64 + 1), 2);
        assert_eq!(block_count(10 * BLOCK_SIZE as u64), 10);
    }

    #[test]
    fn block_len_math() {
        let size = BLOCK_SIZE as u64 + 6 * 1024;
        assert_eq!(block_len(size, 0), BLOCK_SIZE as u64);
        assert_eq!(block_len(size, 1), 6 * 1024);
    }

    #[test]
    fn block_hash_compute() {
        let data = vec![7u8; 1000];
        let hash = BlockHash::compute(&data);
        assert_eq!(hash.weak, RollingChecksum::new(&data).digest());
        assert_eq!(hash.strong, StrongHash::compute(&data));
    }

    fn tree_with(files: &[(&str, Vec<u8>)]) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let mut f = std::fs::File::create(tmp.path().join(name)).unwrap();
            f.write_all(contents).unwrap();
        }
        tmp
    }

    #[test]
    fn signature_covers_every_block() {
        let data: Vec<u8> = (0..(2 * BLOCK_SIZE + 100)).map(|i| (i % 256) as u8).collect();
        let tmp = tree_with(&[("big.bin", data.clone())]);
        let container = Container::walk(tmp.path()).unwrap();

        let sig = compute_signature(
            &container,
            tmp.path(),
            &crate::progress::NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(sig.len(), 3);
        assert_eq!(sig[0], BlockHash::compute(&data[..BLOCK_SIZE]));
        assert_eq!(sig[2], BlockHash::compute(&data[2 * BLOCK_SIZE..]));
    }

    #[test]
    fn signature_of_empty_container_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let container = Container::walk(tmp.path()).unwrap();
        let sig = compute_signature(
            &container,
            tmp.path(),
            &crate::progress::NoProgress,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(sig.is_empty());
    }

    #[test]
    fn signature_streaming_matches_collected() {
        let data = vec![42u8; BLOCK_SIZE + 17];
        let tmp = tree_with(&[("a", data.clone()), ("b", b"tiny".to_vec())]);
        let container = Container::walk(tmp.path()).unwrap();

        let collected = compute_signature(
            &container,
            tmp.path(),
            &crate::progress::NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        let mut streamed = Vec::new();
        compute_signature_to(
            &container,
            tmp.path(),
            &crate::progress::NoProgress,
            &CancelToken::new(),
            &mut |h| {
                streamed.push(h);
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(collected, streamed);
    }

    #[test]
    fn cancellation_stops_hashing() {
        let tmp = tree_with(&[("a", vec![0u8; 100])]);
        let container = Container::walk(tmp.path()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = compute_signature(&container, tmp.path(), &crate::progress::NoProgress, &cancel)
            .unwrap_err();
        assert!(matches!(err, PatchError::Cancelled));
    }

    #[test]
    fn index_finds_full_blocks() {
        let block: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        let tmp = tree_with(&[("f", block.clone())]);
        let container = Container::walk(tmp.path()).unwrap();
        let sig = compute_signature(
            &container,
            tmp.path(),
            &crate::progress::NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        let index = HashIndex::build(&container, &sig);
        let weak = RollingChecksum::new(&block).digest();
        let found = index.find_full(weak, &block, None).unwrap();
        assert_eq!(found.file_index, 0);
        assert_eq!(found.block_index, 0);
        assert_eq!(found.len as usize, BLOCK_SIZE);
    }

    #[test]
    fn index_separates_short_blocks() {
        let data = vec![9u8; 1000]; // single short block
        let tmp = tree_with(&[("s", data.clone())]);
        let container = Container::walk(tmp.path()).unwrap();
        let sig = compute_signature(
            &container,
            tmp.path(),
            &crate::progress::NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        let index = HashIndex::build(&container, &sig);
        let weak = RollingChecksum::new(&data).digest();
        assert!(!index.has_full(weak));
        assert!(index.find_short(weak, &data, None).is_some());
        assert_eq!(index.short_lens(), &[1000]);
        // A different length must not match even with identical leading bytes
        assert!(index.find_short(weak, &data[..999], None).is_none());
    }

    #[test]
    fn saturated_weak_keys_are_skipped() {
        // 40 identical one-block files saturate one weak key
        let block = vec![0xabu8; BLOCK_SIZE];
        let files: Vec<(String, Vec<u8>)> = (0..40)
            .map(|i| (format!("f{i:02}"), block.clone()))
            .collect();
        let tmp = tempfile::tempdir().unwrap();
        for (name, contents) in &files {
            std::fs::write(tmp.path().join(name), contents).unwrap();
        }
        let container = Container::walk(tmp.path()).unwrap();
        let sig = compute_signature(
            &container,
            tmp.path(),
            &crate::progress::NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        let index = HashIndex::build(&container, &sig);
        let weak = RollingChecksum::new(&block).digest();
        assert!(!index.has_full(weak));
        assert!(index.find_full(weak, &block, None).is_none());
    }

    #[test]
    fn prefer_steers_candidate_choice() {
        // Two identical full blocks in two files
        let block = vec![0x55u8; BLOCK_SIZE];
        let tmp = tree_with(&[("a", block.clone()), ("b", block.clone())]);
        let container = Container::walk(tmp.path()).unwrap();
        let sig = compute_signature(
            &container,
            tmp.path(),
            &crate::progress::NoProgress,
            &CancelToken::new(),
        )
        .unwrap();
        let index = HashIndex::build(&container, &sig);
        let weak = RollingChecksum::new(&block).digest();

        let preferred = index.find_full(weak, &block, Some((1, 0))).unwrap();
        assert_eq!(preferred.file_index, 1);

        let first = index.find_full(weak, &block, None).unwrap();
        assert_eq!(first.file_index, 0);
    }
}
