//! Apply engine: reconstructs a source tree from a recipe and a target tree.
//!
//! The target tree is only ever read; the output tree is created fresh.
//! Directories, symlinks and empty files are created up front from the
//! embedded source container, then each file's operation list is executed
//! in order.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::container::Container;
use crate::error::{PatchError, Result};
use crate::progress::{CancelToken, Progress};
use crate::recipe::{Operation, PatchHeader};
use crate::signature::BLOCK_SIZE;
use crate::wire::{WireReader, PATCH_MAGIC};

/// Everything an apply needs: where the target tree's bytes live and where
/// the output tree goes.
#[derive(Debug)]
pub struct ApplyContext<'a> {
    /// Root of the (read-only) target tree.
    pub target_root: &'a Path,
    /// Root under which the source tree is created.
    pub output_root: &'a Path,
}

impl ApplyContext<'_> {
    /// Execute the recipe read from `patch`.
    ///
    /// # Errors
    ///
    /// Returns wire errors for a malformed patch,
    /// [`PatchError::TargetFileMissing`] / [`PatchError::ShortData`] when
    /// the target tree does not satisfy the recipe's references,
    /// [`PatchError::OutputSizeMismatch`] when a reconstructed file does
    /// not reach its declared size, or [`PatchError::Cancelled`].
    pub fn apply(
        &self,
        patch: impl Read,
        progress: &dyn Progress,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut wire = WireReader::new(patch);
        wire.expect_magic(&PATCH_MAGIC)?;
        let header: PatchHeader = wire.read_message()?;
        let mut wire = wire.decompress(&header.compression)?;

        let target_container: Container = wire.read_message()?;
        let source_container: Container = wire.read_message()?;
        debug!(
            target = %target_container.summary(),
            source = %source_container.summary(),
            "applying recipe"
        );

        progress.begin(source_container.size);
        self.create_shell(&source_container)?;

        let mut targets = TargetReader::new(self.target_root, &target_container);
        let mut copy_buf = vec![0u8; BLOCK_SIZE];

        for entry in &source_container.files {
            cancel.check()?;
            let out_path = self.output_root.join(&entry.path);
            let file = File::create(&out_path).map_err(|e| PatchError::io(&out_path, e))?;
            let mut writer = BufWriter::new(file);
            let mut written: u64 = 0;

            loop {
                let op: Operation = wire.read_message().map_err(|e| match e {
                    PatchError::TruncatedStream => PatchError::UnexpectedEndOfRecipe,
                    other => other,
                })?;
                match op {
                    Operation::End => break,
                    Operation::Data { bytes } => {
                        writer
                            .write_all(&bytes)
                            .map_err(|e| PatchError::io(&out_path, e))?;
                        written += bytes.len() as u64;
                        progress.advance(bytes.len() as u64);
                    }
                    Operation::BlockRange {
                        file_index,
                        start_block,
                        block_count,
                    } => {
                        let copied = targets.copy_range(
                            file_index,
                            start_block,
                            block_count,
                            &mut writer,
                            &mut copy_buf,
                        )?;
                        written += copied;
                        progress.advance(copied);
                    }
                }
            }

            writer.flush().map_err(|e| PatchError::io(&out_path, e))?;
            if written != entry.size {
                return Err(PatchError::OutputSizeMismatch {
                    path: out_path,
                    got: written,
                    want: entry.size,
                });
            }
            set_file_mode(&out_path, entry.mode)?;
        }

        Ok(())
    }

    /// Create directories, symlinks and empty files from the container.
    fn create_shell(&self, container: &Container) -> Result<()> {
        fs::create_dir_all(self.output_root)
            .map_err(|e| PatchError::io(self.output_root, e))?;
        for dir in &container.dirs {
            let path = self.output_root.join(&dir.path);
            fs::create_dir_all(&path).map_err(|e| PatchError::io(&path, e))?;
        }
        for link in &container.symlinks {
            let path = self.output_root.join(&link.path);
            make_symlink(&link.dest, &path)?;
        }
        for file in &container.files {
            let path = self.output_root.join(&file.path);
            File::create(&path).map_err(|e| PatchError::io(&path, e))?;
        }
        Ok(())
    }
}

/// Reads block ranges out of target files, holding one file open at a time.
struct TargetReader<'a> {
    root: &'a Path,
    container: &'a Container,
    current: Option<(u32, BufReader<File>)>,
}

impl<'a> TargetReader<'a> {
    fn new(root: &'a Path, container: &'a Container) -> Self {
        Self {
            root,
            container,
            current: None,
        }
    }

    /// Copy `block_count` blocks starting at `start_block` of target file
    /// `file_index` into `out`, returning the byte count. The final block
    /// is clamped to the file's declared size.
    fn copy_range(
        &mut self,
        file_index: u32,
        start_block: u32,
        block_count: u32,
        out: &mut impl Write,
        buf: &mut [u8],
    ) -> Result<u64> {
        let entry = self
            .container
            .files
            .get(file_index as usize)
            .ok_or(PatchError::TargetFileMissing(u64::from(file_index)))?;
        let path = self.root.join(&entry.path);

        let start = u64::from(start_block) * BLOCK_SIZE as u64;
        let end = (u64::from(start_block) + u64::from(block_count)) * BLOCK_SIZE as u64;
        let end = end.min(entry.size);
        if start > end {
            return Err(PatchError::Decode(format!(
                "block range [{start_block}, +{block_count}) outside {path:?}"
            )));
        }
        let want = end - start;

        let reader = self.reader_for(file_index, &path)?;
        reader
            .seek(SeekFrom::Start(start))
            .map_err(|e| PatchError::io(&path, e))?;

        let mut copied: u64 = 0;
        while copied < want {
            let take = ((want - copied) as usize).min(buf.len());
            let n = reader
                .read(&mut buf[..take])
                .map_err(|e| PatchError::io(&path, e))?;
            if n == 0 {
                return Err(PatchError::ShortData {
                    path,
                    missing: want - copied,
                });
            }
            out.write_all(&buf[..n]).map_err(|e| PatchError::io(&path, e))?;
            copied += n as u64;
        }
        Ok(copied)
    }

    /// Open (or reuse) the handle for a target file. At most one target
    /// file is held open at a time.
    fn reader_for(&mut self, file_index: u32, path: &Path) -> Result<&mut BufReader<File>> {
        let cached = matches!(&self.current, Some((i, _)) if *i == file_index);
        if !cached {
            let file = File::open(path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PatchError::TargetFileMissing(u64::from(file_index))
                } else {
                    PatchError::io(path, e)
                }
            })?;
            self.current = Some((file_index, BufReader::new(file)));
        }
        match &mut self.current {
            Some((_, reader)) => Ok(reader),
            None => Err(PatchError::TargetFileMissing(u64::from(file_index))),
        }
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| PatchError::io(path, e))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(dest: &str, path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path).map_err(|e| PatchError::io(path, e))?;
    }
    std::os::unix::fs::symlink(dest, path).map_err(|e| PatchError::io(path, e))
}

#[cfg(not(unix))]
fn make_symlink(_dest: &str, path: &Path) -> Result<()> {
    Err(PatchError::Unreadable {
        path: path.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlinks not supported on this platform",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffContext;
    use crate::progress::NoProgress;
    use crate::signature::compute_signature;
    use crate::wire::CompressionSettings;

    fn diff_to_patch(target_root: &Path, source_root: &Path) -> Vec<u8> {
        let target_container = Container::walk(target_root).unwrap();
        let target_signature = compute_signature(
            &target_container,
            target_root,
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();
        let source_container = Container::walk(source_root).unwrap();

        let mut patch = Vec::new();
        let mut sig = Vec::new();
        DiffContext {
            source_container: &source_container,
            source_root,
            target_container: &target_container,
            target_signature: &target_signature,
            compression: CompressionSettings::default(),
        }
        .write_patch(&mut patch, &mut sig, &NoProgress, &CancelToken::new())
        .unwrap();
        patch
    }

    fn assert_trees_equal(a: &Path, b: &Path) {
        let ca = Container::walk(a).unwrap();
        let cb = Container::walk(b).unwrap();
        assert_eq!(ca.files.len(), cb.files.len());
        for (fa, fb) in ca.files.iter().zip(&cb.files) {
            assert_eq!(fa.path, fb.path);
            assert_eq!(
                fs::read(a.join(&fa.path)).unwrap(),
                fs::read(b.join(&fb.path)).unwrap(),
                "contents differ for {}",
                fa.path
            );
        }
        assert_eq!(ca.dirs, cb.dirs);
        assert_eq!(ca.symlinks, cb.symlinks);
    }

    #[test]
    fn apply_reconstructs_modified_tree() {
        let target = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        fs::write(target.path().join("big.bin"), &data).unwrap();
        fs::write(target.path().join("note.txt"), b"hello").unwrap();

        let source = tempfile::tempdir().unwrap();
        let mut modified = data.clone();
        modified[100_000] ^= 0xff;
        fs::write(source.path().join("big.bin"), &modified).unwrap();
        fs::write(source.path().join("note.txt"), b"hello world").unwrap();

        let patch = diff_to_patch(target.path(), source.path());

        let output = tempfile::tempdir().unwrap();
        ApplyContext {
            target_root: target.path(),
            output_root: output.path(),
        }
        .apply(
            std::io::Cursor::new(&patch),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        assert_trees_equal(source.path(), output.path());
    }

    #[test]
    fn apply_creates_dirs_for_empty_source() {
        let target = tempfile::tempdir().unwrap();
        fs::write(target.path().join("old.txt"), b"old").unwrap();

        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("a/b")).unwrap();

        let patch = diff_to_patch(target.path(), source.path());
        let output = tempfile::tempdir().unwrap();
        ApplyContext {
            target_root: target.path(),
            output_root: output.path(),
        }
        .apply(
            std::io::Cursor::new(&patch),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        assert!(output.path().join("a/b").is_dir());
        let produced = Container::walk(output.path()).unwrap();
        assert!(produced.files.is_empty());
    }

    #[test]
    fn apply_fails_when_target_file_vanishes() {
        let target = tempfile::tempdir().unwrap();
        let data = vec![5u8; 3 * BLOCK_SIZE];
        fs::write(target.path().join("payload"), &data).unwrap();

        let source = tempfile::tempdir().unwrap();
        fs::write(source.path().join("payload"), &data).unwrap();

        let patch = diff_to_patch(target.path(), source.path());
        fs::remove_file(target.path().join("payload")).unwrap();

        let output = tempfile::tempdir().unwrap();
        let err = ApplyContext {
            target_root: target.path(),
            output_root: output.path(),
        }
        .apply(
            std::io::Cursor::new(&patch),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::TargetFileMissing(0)));
    }

    #[test]
    fn apply_fails_on_truncated_recipe() {
        let target = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        fs::write(source.path().join("f"), vec![1u8; 1000]).unwrap();

        let mut patch = diff_to_patch(target.path(), source.path());
        patch.truncate(patch.len() / 2);

        let output = tempfile::tempdir().unwrap();
        let err = ApplyContext {
            target_root: target.path(),
            output_root: output.path(),
        }
        .apply(
            std::io::Cursor::new(&patch),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PatchError::UnexpectedEndOfRecipe
                | PatchError::TruncatedStream
                | PatchError::Decompression(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn apply_recreates_symlinks_and_modes() {
        use std::os::unix::fs::PermissionsExt;

        let target = tempfile::tempdir().unwrap();
        fs::write(target.path().join("bin.sh"), b"#!/bin/sh\n").unwrap();

        let source = tempfile::tempdir().unwrap();
        fs::write(source.path().join("bin.sh"), b"#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(
            source.path().join("bin.sh"),
            fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::os::unix::fs::symlink("bin.sh", source.path().join("run")).unwrap();

        let patch = diff_to_patch(target.path(), source.path());
        let output = tempfile::tempdir().unwrap();
        ApplyContext {
            target_root: target.path(),
            output_root: output.path(),
        }
        .apply(
            std::io::Cursor::new(&patch),
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();

        let link = output.path().join("run");
        assert_eq!(
            fs::read_link(&link).unwrap(),
            std::path::PathBuf::from("bin.sh")
        );
        let mode = fs::metadata(output.path().join("bin.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
