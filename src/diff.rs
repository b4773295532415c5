//! Streaming diff engine: rolling-hash matching against a target signature.
//!
//! For each source file, a block-sized window slides byte-by-byte through
//! the file. The window's rolling checksum is probed against the target's
//! [`HashIndex`]; on a strong-hash confirmation a copy operation is
//! emitted and the window jumps a whole block, otherwise the leading byte
//! joins a literal run. The engine holds one window and one literal buffer
//! regardless of file size, and writes the fresh source signature in the
//! same pass.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::checksum::RollingChecksum;
use crate::container::Container;
use crate::error::{PatchError, Result};
use crate::progress::{CancelToken, Progress};
use crate::recipe::{Operation, PatchHeader, SignatureHeader};
use crate::signature::{BlockHash, CandidateBlock, HashIndex, BLOCK_SIZE};
use crate::wire::{
    CompressedWriter, CompressionSettings, WireWriter, PATCH_MAGIC, SIGNATURE_MAGIC,
};

/// Literal runs are flushed at this size even when nothing matches, to
/// bound peak memory on incompressible inputs.
const MAX_LITERAL_RUN: usize = 4 * 1024 * 1024;

/// Source files are read in slices of this size.
const READ_CHUNK: usize = 256 * 1024;

/// Outcome counters of a diff: every source byte is accounted to exactly
/// one of the two.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Bytes emitted as copies of target blocks.
    pub reused_bytes: u64,
    /// Bytes embedded literally in the patch.
    pub fresh_bytes: u64,
}

impl DiffStats {
    /// Total bytes processed; equals the source container size.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.reused_bytes + self.fresh_bytes
    }
}

/// Everything a diff needs: the two containers, where the source bytes
/// live, the target's signature, and the output compression.
#[derive(Debug)]
pub struct DiffContext<'a> {
    /// Container of the tree being encoded.
    pub source_container: &'a Container,
    /// Root path holding the source tree's bytes.
    pub source_root: &'a Path,
    /// Container the recipe will copy blocks from.
    pub target_container: &'a Container,
    /// Target signature in flat-stream order.
    pub target_signature: &'a [BlockHash],
    /// Compression for both output artifacts.
    pub compression: CompressionSettings,
}

impl DiffContext<'_> {
    /// Write the patch to `patch_out` and the fresh source signature to
    /// `sig_out`.
    ///
    /// Messages are emitted strictly in source file order; within a file,
    /// in offset order. Two runs over identical inputs produce identical
    /// uncompressed message streams.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a source file cannot be read or an output
    /// cannot be written, or [`PatchError::Cancelled`] if the token trips.
    pub fn write_patch<PW: Write, SW: Write>(
        &self,
        patch_out: PW,
        sig_out: SW,
        progress: &dyn Progress,
        cancel: &CancelToken,
    ) -> Result<DiffStats> {
        let index = HashIndex::build(self.target_container, self.target_signature);

        let mut patch_wire = WireWriter::new(patch_out);
        patch_wire.write_magic(&PATCH_MAGIC)?;
        patch_wire.write_message(&PatchHeader {
            compression: self.compression,
        })?;
        let mut patch_wire = patch_wire.compress(&self.compression)?;
        patch_wire.write_message(self.target_container)?;
        patch_wire.write_message(self.source_container)?;

        let mut sig_wire = WireWriter::new(sig_out);
        sig_wire.write_magic(&SIGNATURE_MAGIC)?;
        sig_wire.write_message(&SignatureHeader {
            compression: self.compression,
        })?;
        let mut sig_wire = sig_wire.compress(&self.compression)?;
        sig_wire.write_message(self.source_container)?;

        progress.begin(self.source_container.size);

        let mut stats = DiffStats::default();
        let mut matcher = Matcher::new(index);
        for entry in &self.source_container.files {
            let path = self.source_root.join(&entry.path);
            let file = File::open(&path).map_err(|e| PatchError::io(&path, e))?;
            matcher.diff_file(
                BufReader::with_capacity(READ_CHUNK, file),
                &mut patch_wire,
                &mut sig_wire,
                &mut stats,
                progress,
                cancel,
            )?;
            patch_wire.write_message(&Operation::End)?;
        }

        patch_wire.finish()?.flush()?;
        sig_wire.finish()?.flush()?;

        debug!(
            reused = stats.reused_bytes,
            fresh = stats.fresh_bytes,
            "diff complete"
        );
        Ok(stats)
    }
}

/// A copy run being extended, not yet written out.
#[derive(Debug, Clone, Copy)]
struct PendingRange {
    file_index: u32,
    start_block: u32,
    block_count: u32,
}

/// Per-invocation matcher state. Buffers are reused across files.
struct Matcher {
    index: HashIndex,
    /// Unconsumed source bytes; `buf[lit_start..pos]` is the literal run,
    /// `buf[pos..]` the unscanned remainder including the window.
    buf: Vec<u8>,
    /// Accumulator for the fresh source signature, one block at a time.
    sig_block: Vec<u8>,
    /// Copy run awaiting either extension or flushing.
    pending: Option<PendingRange>,
}

impl Matcher {
    fn new(index: HashIndex) -> Self {
        Self {
            index,
            buf: Vec::with_capacity(MAX_LITERAL_RUN + 2 * BLOCK_SIZE + READ_CHUNK),
            sig_block: Vec::with_capacity(BLOCK_SIZE),
            pending: None,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn diff_file<PW: Write, SW: Write>(
        &mut self,
        mut reader: impl Read,
        patch_wire: &mut WireWriter<CompressedWriter<PW>>,
        sig_wire: &mut WireWriter<CompressedWriter<SW>>,
        stats: &mut DiffStats,
        progress: &dyn Progress,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.buf.clear();
        self.sig_block.clear();
        self.pending = None;

        let mut pos = 0usize;
        let mut lit_start = 0usize;
        let mut eof = false;
        // Window checksum at `pos`, when at least a full block remains.
        let mut rolling: Option<RollingChecksum> = None;
        // Shrinking-window checksum once fewer than BLOCK_SIZE bytes remain.
        let mut tail: Option<RollingChecksum> = None;
        // True at operation boundaries: file start, or right after a copy.
        let mut aligned = true;

        loop {
            cancel.check()?;

            // Keep a window plus its entering byte available.
            while !eof && self.buf.len() - pos < 2 * BLOCK_SIZE {
                let old_len = self.buf.len();
                self.buf.resize(old_len + READ_CHUNK, 0);
                let n = read_some(&mut reader, &mut self.buf[old_len..])?;
                self.buf.truncate(old_len + n);
                if n == 0 {
                    eof = true;
                } else {
                    let (start, end) = (old_len, old_len + n);
                    emit_source_hashes(
                        &mut self.sig_block,
                        &self.buf[start..end],
                        sig_wire,
                        false,
                    )?;
                    progress.advance(n as u64);
                }
            }

            let remaining = self.buf.len() - pos;
            if remaining == 0 {
                break;
            }

            let matched = if remaining >= BLOCK_SIZE {
                let checksum = rolling.get_or_insert_with(|| {
                    RollingChecksum::new(&self.buf[pos..pos + BLOCK_SIZE])
                });
                let weak = checksum.digest();
                let prefer = next_in_run(self.pending.as_ref());
                let lit_empty = lit_start == pos;
                let window = &self.buf[pos..pos + BLOCK_SIZE];

                let mut hit = if self.index.has_full(weak) {
                    self.index
                        .find_full(weak, window, prefer.filter(|_| lit_empty))
                        .copied()
                } else {
                    None
                };
                if hit.is_none() && aligned {
                    hit = probe_short_prefix(&self.index, &self.buf[pos..], prefer);
                }
                hit
            } else {
                // Tail of the file: the window shrinks from the left.
                let checksum =
                    tail.get_or_insert_with(|| RollingChecksum::new(&self.buf[pos..]));
                let weak = checksum.digest();
                let prefer = next_in_run(self.pending.as_ref());

                let mut hit = self
                    .index
                    .find_short(weak, &self.buf[pos..], prefer)
                    .copied();
                if hit.is_none() && aligned {
                    hit = probe_short_prefix(&self.index, &self.buf[pos..], prefer);
                }
                hit
            };

            if let Some(candidate) = matched {
                self.emit_copy(patch_wire, &mut lit_start, pos, stats, candidate)?;
                pos += candidate.len as usize;
                lit_start = pos;
                rolling = None;
                tail = None;
                aligned = true;
            } else {
                // No match: the leading byte joins the literal run.
                if remaining >= BLOCK_SIZE {
                    if let Some(checksum) = rolling.as_mut() {
                        if pos + BLOCK_SIZE < self.buf.len() {
                            checksum.roll(self.buf[pos], self.buf[pos + BLOCK_SIZE]);
                        } else {
                            rolling = None;
                        }
                    }
                } else if let Some(checksum) = tail.as_mut() {
                    checksum.pop_front(self.buf[pos]);
                }
                pos += 1;
                aligned = false;

                if pos - lit_start >= MAX_LITERAL_RUN {
                    self.flush_ops(patch_wire, &mut lit_start, pos, stats)?;
                }
            }

            // Drop flushed bytes so the buffer stays bounded.
            if lit_start >= MAX_LITERAL_RUN {
                self.buf.drain(..lit_start);
                pos -= lit_start;
                lit_start = 0;
            }
        }

        self.flush_ops(patch_wire, &mut lit_start, pos, stats)?;
        emit_source_hashes(&mut self.sig_block, &[], sig_wire, true)?;
        Ok(())
    }

    /// Emit a confirmed copy, merging into the pending range when the
    /// blocks are consecutive and nothing literal intervened.
    fn emit_copy<W: Write>(
        &mut self,
        patch_wire: &mut WireWriter<CompressedWriter<W>>,
        lit_start: &mut usize,
        pos: usize,
        stats: &mut DiffStats,
        candidate: CandidateBlock,
    ) -> Result<()> {
        stats.reused_bytes += u64::from(candidate.len);

        if *lit_start == pos {
            if let Some(pending) = self.pending.as_mut() {
                if pending.file_index == candidate.file_index
                    && pending.start_block + pending.block_count == candidate.block_index
                {
                    pending.block_count += 1;
                    return Ok(());
                }
            }
        }

        self.flush_ops(patch_wire, lit_start, pos, stats)?;
        self.pending = Some(PendingRange {
            file_index: candidate.file_index,
            start_block: candidate.block_index,
            block_count: 1,
        });
        Ok(())
    }

    /// Write out the pending copy range, then the literal run
    /// `buf[lit_start..pos]`, in that order (which is their file order).
    fn flush_ops<W: Write>(
        &mut self,
        patch_wire: &mut WireWriter<CompressedWriter<W>>,
        lit_start: &mut usize,
        pos: usize,
        stats: &mut DiffStats,
    ) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            patch_wire.write_message(&Operation::BlockRange {
                file_index: pending.file_index,
                start_block: pending.start_block,
                block_count: pending.block_count,
            })?;
        }
        if *lit_start < pos {
            let bytes = self.buf[*lit_start..pos].to_vec();
            stats.fresh_bytes += bytes.len() as u64;
            patch_wire.write_message(&Operation::Data { bytes })?;
            *lit_start = pos;
        }
        Ok(())
    }
}

/// The `(file, block)` that would extend the pending run by one.
fn next_in_run(pending: Option<&PendingRange>) -> Option<(u32, u32)> {
    pending.map(|p| (p.file_index, p.start_block + p.block_count))
}

/// At an aligned position, probe each distinct short-block length against
/// the window prefix. This is how an unchanged short final block is reused
/// when more source bytes follow it (append-only edits).
fn probe_short_prefix(
    index: &HashIndex,
    window: &[u8],
    prefer: Option<(u32, u32)>,
) -> Option<CandidateBlock> {
    for &len in index.short_lens() {
        let len = len as usize;
        if len == 0 || len > window.len() {
            continue;
        }
        let prefix = &window[..len];
        let weak = RollingChecksum::new(prefix).digest();
        if let Some(candidate) = index.find_short(weak, prefix, prefer) {
            return Some(*candidate);
        }
    }
    None
}

/// Feed freshly read source bytes into the block hasher, emitting one
/// signature message per completed block. `finish` flushes the final short
/// block at end of file.
fn emit_source_hashes<W: Write>(
    sig_block: &mut Vec<u8>,
    mut bytes: &[u8],
    sig_wire: &mut WireWriter<CompressedWriter<W>>,
    finish: bool,
) -> Result<()> {
    while !bytes.is_empty() {
        let take = (BLOCK_SIZE - sig_block.len()).min(bytes.len());
        sig_block.extend_from_slice(&bytes[..take]);
        bytes = &bytes[take..];
        if sig_block.len() == BLOCK_SIZE {
            sig_wire.write_message(&BlockHash::compute(sig_block))?;
            sig_block.clear();
        }
    }
    if finish && !sig_block.is_empty() {
        sig_wire.write_message(&BlockHash::compute(sig_block))?;
        sig_block.clear();
    }
    Ok(())
}

fn read_some(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    loop {
        match reader.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(PatchError::Stream(e)),
        }
    }
}
