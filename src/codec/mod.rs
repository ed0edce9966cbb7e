//! Whole-blob compression.
//!
//! Compression wraps the finished blob as a single stream; it never reaches
//! inside individual blobettes.  A reader identifies a compressed blob by the
//! container's own magic bytes, so no flag is stored anywhere in the blob
//! format itself.
//!
//! A raw blob always starts with `0x42`, which collides with neither magic
//! below, so sniffing is unambiguous.

use std::io::{self, BufRead, Read};
use thiserror::Error;

/// xz container magic (`FD 37 7A 58 5A 00`).
pub const XZ_MAGIC:   [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];
/// Zstandard frame magic (`28 B5 2F FD`).
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default Zstd compression level.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

// ── Compression ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Xz,
    Zstd,
}

impl Compression {
    /// Human-readable name (for diagnostics and the CLI).
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Xz   => "xz",
            Compression::Zstd => "zstd",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Compression::None),
            "xz"   => Some(Compression::Xz),
            "zstd" => Some(Compression::Zstd),
            _      => None,
        }
    }

    /// Identify the compression of a stream from its leading bytes.
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.starts_with(&XZ_MAGIC) {
            Compression::Xz
        } else if prefix.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{codec} compression error: {msg}")]
    Compression { codec: Compression, msg: String },
    #[error("{codec} decompression error: {msg}")]
    Decompression { codec: Compression, msg: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct XzCodec;
impl Codec for XzCodec {
    // lzma-rs exposes no presets; `level` is ignored.
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::xz_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression { codec: Compression::Xz, msg: e.to_string() })?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::xz_decompress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression { codec: Compression::Xz, msg: e.to_string() })?;
        Ok(out)
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level)
            .map_err(|e| CodecError::Compression { codec: Compression::Zstd, msg: e.to_string() })
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data)
            .map_err(|e| CodecError::Decompression { codec: Compression::Zstd, msg: e.to_string() })
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Codec for a compressed blob; a raw blob has none.
pub fn get_codec(compression: Compression) -> Option<Box<dyn Codec>> {
    match compression {
        Compression::None => None,
        Compression::Xz   => Some(Box::new(XzCodec)),
        Compression::Zstd => Some(Box::new(ZstdCodec)),
    }
}

/// Peek at the head of `reader` without consuming it.
pub fn sniff<R: BufRead>(reader: &mut R) -> io::Result<Compression> {
    let prefix = reader.fill_buf()?;
    Ok(Compression::detect(prefix))
}

/// Turn a possibly compressed blob stream into a plain one.
///
/// Raw blobs are passed through untouched and still stream; compressed blobs
/// are inflated into memory first.
pub fn open_decompressed<'a, R: BufRead + 'a>(
    mut reader: R,
) -> Result<(Compression, Box<dyn Read + 'a>), CodecError> {
    let compression = sniff(&mut reader)?;
    let Some(codec) = get_codec(compression) else {
        return Ok((compression, Box::new(reader)));
    };
    let mut packed = Vec::new();
    reader.read_to_end(&mut packed)?;
    let plain = codec.decompress(&packed)?;
    Ok((compression, Box::new(io::Cursor::new(plain))))
}
