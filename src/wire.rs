//! Framed wire format for patch and signature artifacts.
//!
//! Every artifact starts with 4 magic bytes, then one uncompressed framed
//! header naming a compression algorithm, then the rest of the stream runs
//! through that compressor. A frame is a varint length prefix followed by a
//! bincode-encoded payload; the payload layout is stable across engine
//! versions.

use std::io::{BufReader, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};

/// Leading magic of a patch artifact.
pub const PATCH_MAGIC: [u8; 4] = *b"BPAT";

/// Leading magic of a signature artifact.
pub const SIGNATURE_MAGIC: [u8; 4] = *b"BSIG";

/// Upper bound on a single frame, to reject corrupted length prefixes
/// before allocating. Literal operations flush well below this; the largest
/// legitimate frames are containers of very large trees.
pub const MAX_FRAME_SIZE: u64 = 256 * 1024 * 1024;

/// Compression applied to everything after the header frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    /// Frames pass through unmodified.
    None = 0,
    /// Streaming brotli.
    Brotli = 1,
    /// Streaming zstd.
    Zstd = 2,
}

impl CompressionAlgorithm {
    /// Decode from the header's raw byte.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::UnknownCompression`] for values this build
    /// does not know.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Brotli),
            2 => Ok(Self::Zstd),
            other => Err(PatchError::UnknownCompression(other)),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Brotli => write!(f, "brotli"),
            Self::Zstd => write!(f, "zstd"),
        }
    }
}

impl std::str::FromStr for CompressionAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "brotli" => Ok(Self::Brotli),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!("unknown compression algorithm: {other}")),
        }
    }
}

/// Compression algorithm plus its quality parameter, as persisted in
/// artifact headers.
///
/// The algorithm travels as a raw byte so that a reader built without some
/// algorithm reports [`PatchError::UnknownCompression`] instead of a
/// generic decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    algorithm: u8,
    /// Quality level handed to the compressor; ignored for `none`.
    pub quality: i32,
}

impl CompressionSettings {
    /// Settings for a given algorithm and quality.
    #[must_use]
    pub fn new(algorithm: CompressionAlgorithm, quality: i32) -> Self {
        Self {
            algorithm: algorithm as u8,
            quality,
        }
    }

    /// Uncompressed streams.
    #[must_use]
    pub fn none() -> Self {
        Self::new(CompressionAlgorithm::None, 0)
    }

    /// The recorded algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::UnknownCompression`] if the header byte does
    /// not name a known algorithm.
    pub fn algorithm(&self) -> Result<CompressionAlgorithm> {
        CompressionAlgorithm::from_u8(self.algorithm)
    }
}

impl Default for CompressionSettings {
    /// Brotli at quality 1: fast, and still far smaller than raw recipes.
    fn default() -> Self {
        Self::new(CompressionAlgorithm::Brotli, 1)
    }
}

impl std::fmt::Display for CompressionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.algorithm() {
            Ok(CompressionAlgorithm::None) => write!(f, "none"),
            Ok(algo) => write!(f, "{algo}-q{}", self.quality),
            Err(_) => write!(f, "unknown({:#x})", self.algorithm),
        }
    }
}

fn write_varint(writer: &mut impl Write, mut value: u64) -> std::io::Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return writer.write_all(&[byte]);
        }
        writer.write_all(&[byte | 0x80])?;
    }
}

fn read_varint(reader: &mut impl Read) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).map_err(map_read_err)?;
        if shift >= 64 {
            return Err(PatchError::Decode("varint overflows u64".into()));
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn map_read_err(e: std::io::Error) -> PatchError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => PatchError::TruncatedStream,
        // Both codec crates surface corrupt input as InvalidData or Other
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::Other => {
            PatchError::Decompression(e.to_string())
        }
        _ => PatchError::Stream(e),
    }
}

/// Writes magic bytes and framed messages to a byte sink.
#[derive(Debug)]
pub struct WireWriter<W: Write> {
    inner: W,
}

impl<W: Write> WireWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write a 4-byte magic number, uncompressed and unframed.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_magic(&mut self, magic: &[u8; 4]) -> Result<()> {
        self.inner.write_all(magic)?;
        Ok(())
    }

    /// Write one framed message.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::Encode`] if serialization fails, or an I/O
    /// error if writing fails.
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let payload =
            bincode::serialize(message).map_err(|e| PatchError::Encode(e.to_string()))?;
        write_varint(&mut self.inner, payload.len() as u64)?;
        self.inner.write_all(&payload)?;
        Ok(())
    }

    /// Switch the remainder of the stream to compressed frames.
    ///
    /// Must be called exactly once, after the magic and header; the
    /// compression cannot change mid-stream.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::UnknownCompression`] for an unknown algorithm
    /// byte, or an error from compressor setup.
    pub fn compress(
        self,
        settings: &CompressionSettings,
    ) -> Result<WireWriter<CompressedWriter<W>>> {
        Ok(WireWriter::new(CompressedWriter::new(self.inner, settings)?))
    }

    /// Unwrap the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> WireWriter<CompressedWriter<W>> {
    /// Terminate the compressed stream and return the raw sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the compressor fails to flush its trailer.
    pub fn finish(self) -> Result<W> {
        self.inner.finish()
    }
}

/// Streaming compressor selected by [`CompressionSettings`].
pub enum CompressedWriter<W: Write> {
    /// Pass-through.
    Plain(W),
    /// Brotli encoder.
    Brotli(Box<brotli::CompressorWriter<W>>),
    /// Zstd encoder.
    Zstd(zstd::stream::Encoder<'static, W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Wrap `inner` with the compressor the settings name.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::UnknownCompression`] or a compressor setup
    /// error.
    #[allow(clippy::cast_sign_loss)]
    pub fn new(inner: W, settings: &CompressionSettings) -> Result<Self> {
        match settings.algorithm()? {
            CompressionAlgorithm::None => Ok(Self::Plain(inner)),
            CompressionAlgorithm::Brotli => {
                let quality = settings.quality.clamp(0, 11) as u32;
                Ok(Self::Brotli(Box::new(brotli::CompressorWriter::new(
                    inner, 4096, quality, 22,
                ))))
            }
            CompressionAlgorithm::Zstd => {
                let encoder = zstd::stream::Encoder::new(inner, settings.quality)
                    .map_err(|e| PatchError::Decompression(e.to_string()))?;
                Ok(Self::Zstd(encoder))
            }
        }
    }

    /// Write the compressor trailer and return the raw sink.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn finish(self) -> Result<W> {
        match self {
            Self::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Self::Brotli(mut w) => {
                w.flush()?;
                Ok(w.into_inner())
            }
            Self::Zstd(encoder) => Ok(encoder.finish()?),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Brotli(w) => w.write(buf),
            Self::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Brotli(w) => w.flush(),
            Self::Zstd(w) => w.flush(),
        }
    }
}

impl<W: Write> std::fmt::Debug for CompressedWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Plain(_) => "Plain",
            Self::Brotli(_) => "Brotli",
            Self::Zstd(_) => "Zstd",
        };
        write!(f, "CompressedWriter::{name}")
    }
}

/// Reads magic bytes and framed messages from a byte source.
///
/// The frame buffer is reused across messages.
#[derive(Debug)]
pub struct WireReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> WireReader<R> {
    /// Wrap a byte source.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Read 4 magic bytes and compare against the expected value.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::BadMagic`] on mismatch or
    /// [`PatchError::TruncatedStream`] if the stream is shorter than 4
    /// bytes.
    pub fn expect_magic(&mut self, expected: &[u8; 4]) -> Result<()> {
        let mut got = [0u8; 4];
        self.inner.read_exact(&mut got).map_err(map_read_err)?;
        if &got != expected {
            return Err(PatchError::BadMagic {
                expected: *expected,
                got,
            });
        }
        Ok(())
    }

    /// Read one framed message.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::TruncatedStream`] on EOF mid-frame,
    /// [`PatchError::Decompression`] if the codec rejects its input, or
    /// [`PatchError::Decode`] if the payload does not parse.
    pub fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        let len = read_varint(&mut self.inner)?;
        if len > MAX_FRAME_SIZE {
            return Err(PatchError::Decode(format!("frame of {len} bytes too large")));
        }
        self.buf.resize(len as usize, 0);
        self.inner.read_exact(&mut self.buf).map_err(map_read_err)?;
        bincode::deserialize(&self.buf).map_err(|e| PatchError::Decode(e.to_string()))
    }

    /// Switch the remainder of the stream to decompressed frames, per the
    /// header that was just read.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::UnknownCompression`] or a decompressor setup
    /// error.
    pub fn decompress(
        self,
        settings: &CompressionSettings,
    ) -> Result<WireReader<CompressedReader<R>>> {
        Ok(WireReader::new(CompressedReader::new(self.inner, settings)?))
    }
}

/// Streaming decompressor selected by [`CompressionSettings`].
pub enum CompressedReader<R: Read> {
    /// Pass-through.
    Plain(R),
    /// Brotli decoder.
    Brotli(Box<brotli::Decompressor<R>>),
    /// Zstd decoder.
    Zstd(zstd::stream::Decoder<'static, BufReader<R>>),
}

impl<R: Read> CompressedReader<R> {
    /// Wrap `inner` with the decompressor the settings name.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::UnknownCompression`] or a decompressor setup
    /// error.
    pub fn new(inner: R, settings: &CompressionSettings) -> Result<Self> {
        match settings.algorithm()? {
            CompressionAlgorithm::None => Ok(Self::Plain(inner)),
            CompressionAlgorithm::Brotli => {
                Ok(Self::Brotli(Box::new(brotli::Decompressor::new(inner, 4096))))
            }
            CompressionAlgorithm::Zstd => {
                let decoder = zstd::stream::Decoder::new(inner)
                    .map_err(|e| PatchError::Decompression(e.to_string()))?;
                Ok(Self::Zstd(decoder))
            }
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Brotli(r) => r.read(buf),
            Self::Zstd(r) => r.read(buf),
        }
    }
}

impl<R: Read> std::fmt::Debug for CompressedReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Plain(_) => "Plain",
            Self::Brotli(_) => "Brotli",
            Self::Zstd(_) => "Zstd",
        };
        write!(f, "CompressedReader::{name}")
    }
}

/// A writer that counts the bytes passing through it.
///
/// Wrapped around artifact outputs so callers can report recipe and
/// signature sizes without stat-ing files.
#[derive(Debug)]
pub struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    /// Wrap a sink with a byte counter at zero.
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Unwrap the underlying sink.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
