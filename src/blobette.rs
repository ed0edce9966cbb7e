//! Blobette record codec.
//!
//! # On-disk layout
//!
//! | Field             | Bytes | Encoding                    |
//! |-------------------|-------|-----------------------------|
//! | magic             | 1     | `0x42`                      |
//! | mode              | 3     | big-endian                  |
//! | pathname length   | 2     | big-endian                  |
//! | content length    | 6     | big-endian                  |
//! | pathname          | var   | raw bytes, no terminator    |
//! | content           | var   | raw bytes                   |
//! | checksum          | 1     | Pearson hash of all of the above |
//!
//! A blob is nothing but blobettes laid end to end.  There is no header, no
//! index and no count, so a reader discovers records by walking the length
//! fields one record at a time.
//!
//! # Checksums
//! Encoder and decoder both route every record byte through a
//! [`HashingWriter`]/[`HashingReader`], so the checksum is computed in the
//! same pass as the I/O.  The accumulator restarts at 0 for every record.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::borrow::Cow;
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;
use tracing::warn;

use crate::checksum::{HashingReader, HashingWriter, Pearson};

/// First byte of every blobette.
pub const BLOBETTE_MAGIC: u8 = 0x42;

pub const MAGIC_BYTES:           usize = 1;
pub const MODE_BYTES:            usize = 3;
pub const PATHNAME_LENGTH_BYTES: usize = 2;
pub const CONTENT_LENGTH_BYTES:  usize = 6;
pub const CHECKSUM_BYTES:        usize = 1;

/// Fixed bytes in every record: everything except pathname and content.
pub const RECORD_OVERHEAD: u64 = (MAGIC_BYTES
    + MODE_BYTES
    + PATHNAME_LENGTH_BYTES
    + CONTENT_LENGTH_BYTES
    + CHECKSUM_BYTES) as u64;

pub const MAX_MODE:            u64 = (1 << (MODE_BYTES * 8)) - 1;
pub const MAX_PATHNAME_LENGTH: u64 = (1 << (PATHNAME_LENGTH_BYTES * 8)) - 1;
pub const MAX_CONTENT_LENGTH:  u64 = (1 << (CONTENT_LENGTH_BYTES * 8)) - 1;

/// Permission bits applied to extracted files.
pub const PERMISSION_MASK: u32 = 0o7777;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BlobetteError {
    /// A record start did not carry the magic byte.  The blob is corrupt or
    /// the reader has lost alignment; nothing after this point can be trusted.
    #[error("bad magic byte 0x{found:02x} at record start (expected 0x{:02x})", BLOBETTE_MAGIC)]
    Framing { found: u8 },
    #[error("blob truncated while reading {field}")]
    Truncated { field: &'static str },
    #[error("checksum mismatch: stored 0x{stored:02x}, computed 0x{computed:02x}")]
    Checksum { stored: u8, computed: u8 },
    #[error("{field} {value} does not fit its field (max {max})")]
    FieldOverflow { field: &'static str, value: u64, max: u64 },
    #[error("content source ended after {actual} of {declared} declared bytes")]
    ContentLengthMismatch { declared: u64, actual: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BlobetteError {
    /// True for errors that mean the blob itself is damaged, as opposed to
    /// an I/O failure or a rejected input.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BlobetteError::Framing { .. }
                | BlobetteError::Truncated { .. }
                | BlobetteError::Checksum { .. }
        )
    }
}

fn eof_as_truncated(field: &'static str) -> impl FnOnce(io::Error) -> BlobetteError {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            BlobetteError::Truncated { field }
        } else {
            BlobetteError::Io(e)
        }
    }
}

fn check_width(field: &'static str, value: u64, max: u64) -> Result<(), BlobetteError> {
    if value > max {
        return Err(BlobetteError::FieldOverflow { field, value, max });
    }
    Ok(())
}

// ── Header ───────────────────────────────────────────────────────────────────

/// Everything in a blobette ahead of the content bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobetteHeader {
    pub mode:           u32,
    pub pathname:       Vec<u8>,
    pub content_length: u64,
}

impl BlobetteHeader {
    /// Build a header, rejecting any value that would not fit its field.
    pub fn new(
        mode: u32,
        pathname: impl Into<Vec<u8>>,
        content_length: u64,
    ) -> Result<Self, BlobetteError> {
        let header = Self { mode, pathname: pathname.into(), content_length };
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<(), BlobetteError> {
        check_width("mode", self.mode as u64, MAX_MODE)?;
        check_width("pathname length", self.pathname.len() as u64, MAX_PATHNAME_LENGTH)?;
        check_width("content length", self.content_length, MAX_CONTENT_LENGTH)?;
        Ok(())
    }

    /// Size of the whole record on disk, checksum byte included.
    pub fn encoded_len(&self) -> u64 {
        RECORD_OVERHEAD + self.pathname.len() as u64 + self.content_length
    }

    /// Permission bits only, file type bits stripped.
    pub fn permissions(&self) -> u32 {
        self.mode & PERMISSION_MASK
    }

    pub fn pathname_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.pathname)
    }

    /// Write magic through pathname.  Caller must have validated.
    pub(crate) fn write_fields<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(BLOBETTE_MAGIC)?;
        writer.write_uint::<BigEndian>(self.mode as u64, MODE_BYTES)?;
        writer.write_uint::<BigEndian>(self.pathname.len() as u64, PATHNAME_LENGTH_BYTES)?;
        writer.write_uint::<BigEndian>(self.content_length, CONTENT_LENGTH_BYTES)?;
        writer.write_all(&self.pathname)?;
        Ok(())
    }

    /// Read mode through pathname; the magic byte has already been consumed.
    pub(crate) fn read_fields<R: Read>(mut reader: R) -> Result<Self, BlobetteError> {
        let mode = reader
            .read_uint::<BigEndian>(MODE_BYTES)
            .map_err(eof_as_truncated("mode"))? as u32;
        let pathname_length = reader
            .read_uint::<BigEndian>(PATHNAME_LENGTH_BYTES)
            .map_err(eof_as_truncated("pathname length"))? as usize;
        let content_length = reader
            .read_uint::<BigEndian>(CONTENT_LENGTH_BYTES)
            .map_err(eof_as_truncated("content length"))?;
        // Bounded by the 2-byte field, so at most 64 KiB.
        let mut pathname = vec![0u8; pathname_length];
        reader
            .read_exact(&mut pathname)
            .map_err(eof_as_truncated("pathname"))?;
        Ok(Self { mode, pathname, content_length })
    }
}

// ── Encode ───────────────────────────────────────────────────────────────────

/// Write one blobette: header, `header.content_length` bytes from `content`,
/// then the checksum byte.  Returns the number of bytes written.
///
/// Field widths are checked before anything is written.  If `content` runs
/// dry early the partial record stays in `writer` and
/// [`BlobetteError::ContentLengthMismatch`] is returned.  Bytes past the
/// declared length are ignored.
pub fn write_blobette<W: Write, R: Read>(
    writer: &mut W,
    header: &BlobetteHeader,
    mut content: R,
) -> Result<u64, BlobetteError> {
    header.validate()?;

    let mut hw = HashingWriter::new(&mut *writer);
    header.write_fields(&mut hw)?;

    let declared = header.content_length;
    let copied = io::copy(&mut (&mut content).take(declared), &mut hw)?;
    if copied < declared {
        return Err(BlobetteError::ContentLengthMismatch { declared, actual: copied });
    }

    let mut probe = [0u8; 1];
    if content.read(&mut probe)? != 0 {
        warn!(
            pathname = %header.pathname_lossy(),
            declared,
            "content source is longer than declared; extra bytes not archived"
        );
    }

    let sum = hw.checksum();
    writer.write_u8(sum)?;
    Ok(header.encoded_len())
}

/// Encode a complete blobette into memory.
pub fn encode(mode: u32, pathname: &[u8], content: &[u8]) -> Result<Vec<u8>, BlobetteError> {
    let header = BlobetteHeader::new(mode, pathname, content.len() as u64)?;
    let mut out = Vec::with_capacity(header.encoded_len() as usize);
    write_blobette(&mut out, &header, content)?;
    Ok(out)
}

// ── Decode ───────────────────────────────────────────────────────────────────

/// What to do with the content bytes of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    /// Materialize the content.
    Read,
    /// Consume the content without keeping it.
    Skip,
}

/// Decode behaviour: content handling plus whether a checksum mismatch is
/// fatal.
///
/// With `ContentMode::Skip` and `verify == false` the skipped bytes are not
/// hashed at all and the result is [`ChecksumStatus::Unchecked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeMode {
    pub content: ContentMode,
    pub verify:  bool,
}

impl DecodeMode {
    /// Metadata only, no integrity check.
    pub const LIST: Self = Self { content: ContentMode::Skip, verify: false };
    /// Metadata only, but every byte is hashed and checked.
    pub const LIST_VERIFIED: Self = Self { content: ContentMode::Skip, verify: true };
    /// Full content, checksum enforced.
    pub const EXTRACT: Self = Self { content: ContentMode::Read, verify: true };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    Valid,
    /// Computed but not enforced.
    Mismatch { stored: u8, computed: u8 },
    /// Content was skipped without hashing.
    Unchecked,
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blobette {
    pub header:   BlobetteHeader,
    /// Present only when decoded with [`ContentMode::Read`] into memory.
    pub content:  Option<Vec<u8>>,
    /// Checksum byte as stored in the record.
    pub checksum: u8,
    pub status:   ChecksumStatus,
}

impl Blobette {
    pub fn mode(&self) -> u32 { self.header.mode }

    pub fn pathname(&self) -> &[u8] { &self.header.pathname }

    pub fn content_length(&self) -> u64 { self.header.content_length }
}

/// Consume the magic byte of the next record.  `false` means a clean end of
/// blob.
fn read_record_start<R: Read>(reader: &mut R) -> Result<bool, BlobetteError> {
    let mut b = [0u8; 1];
    loop {
        match reader.read(&mut b) {
            Ok(0) => return Ok(false),
            Ok(_) if b[0] == BLOBETTE_MAGIC => return Ok(true),
            Ok(_) => return Err(BlobetteError::Framing { found: b[0] }),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn copy_exact<R: Read, W: Write + ?Sized>(
    reader: R,
    sink: &mut W,
    len: u64,
) -> Result<(), BlobetteError> {
    let copied = io::copy(&mut reader.take(len), sink)?;
    if copied < len {
        return Err(BlobetteError::Truncated { field: "content" });
    }
    Ok(())
}

/// Outcome of one record decode, before it is shaped for the caller.
struct Decoded<W> {
    header:   BlobetteHeader,
    checksum: u8,
    status:   ChecksumStatus,
    sink:     Option<W>,
}

/// Shared decode routine.
///
/// `open_sink` runs once the header is known.  `Some(w)` streams the content
/// into `w`; `None` skips it, hashing the skipped bytes only when `verify` is
/// set.
fn decode_record<R, W, E, F>(
    reader: &mut R,
    verify: bool,
    open_sink: F,
) -> Result<Option<Decoded<W>>, E>
where
    R: Read,
    W: Write,
    E: From<BlobetteError>,
    F: FnOnce(&BlobetteHeader) -> Result<Option<W>, E>,
{
    if !read_record_start(reader)? {
        return Ok(None);
    }

    let mut seed = Pearson::new();
    seed.update(&[BLOBETTE_MAGIC]);
    let mut hr = HashingReader::with_state(&mut *reader, seed);

    let header = BlobetteHeader::read_fields(&mut hr)?;
    let len = header.content_length;

    let mut sink = open_sink(&header)?;
    let hashed = match sink.as_mut() {
        Some(w) => {
            copy_exact(&mut hr, w, len)?;
            true
        }
        None if verify => {
            copy_exact(&mut hr, &mut io::sink(), len)?;
            true
        }
        None => {
            copy_exact(hr.get_mut(), &mut io::sink(), len)?;
            false
        }
    };

    let computed = hr.checksum();
    let stored = hr
        .into_inner()
        .read_u8()
        .map_err(eof_as_truncated("checksum"))?;

    let status = if !hashed {
        ChecksumStatus::Unchecked
    } else if stored == computed {
        ChecksumStatus::Valid
    } else if verify {
        return Err(BlobetteError::Checksum { stored, computed }.into());
    } else {
        ChecksumStatus::Mismatch { stored, computed }
    };

    Ok(Some(Decoded { header, checksum: stored, status, sink }))
}

/// Decode the next blobette from `reader`.
///
/// Returns `Ok(None)` when the stream ends exactly at a record boundary.
/// End of stream anywhere after the magic byte is
/// [`BlobetteError::Truncated`].
pub fn read_blobette<R: Read>(
    reader: &mut R,
    mode: DecodeMode,
) -> Result<Option<Blobette>, BlobetteError> {
    let decoded = decode_record(reader, mode.verify, |header| {
        Ok::<_, BlobetteError>(match mode.content {
            // Capped so a corrupt length field cannot force a huge allocation
            // before the data is actually there.
            ContentMode::Read => Some(Vec::with_capacity(header.content_length.min(1 << 20) as usize)),
            ContentMode::Skip => None,
        })
    })?;
    Ok(decoded.map(|d| Blobette {
        header:   d.header,
        content:  d.sink,
        checksum: d.checksum,
        status:   d.status,
    }))
}

/// Decode the next blobette's metadata, seeking over its content.
///
/// Equivalent to [`read_blobette`] with [`DecodeMode::LIST`], but the
/// content bytes are never read.
pub fn seek_blobette<R: Read + Seek>(reader: &mut R) -> Result<Option<Blobette>, BlobetteError> {
    if !read_record_start(reader)? {
        return Ok(None);
    }
    let header = BlobetteHeader::read_fields(&mut *reader)?;
    // At most 2^48 - 1, so it fits an i64.
    reader.seek(SeekFrom::Current(header.content_length as i64))?;
    // A seek past the end succeeds; short content surfaces as a missing
    // checksum byte.
    let checksum = reader.read_u8().map_err(eof_as_truncated("content"))?;
    Ok(Some(Blobette { header, content: None, checksum, status: ChecksumStatus::Unchecked }))
}

/// Decode the next blobette, streaming its content into `sink`.
///
/// Content reaches `sink` before the checksum is known; callers that must
/// not expose corrupt data should use [`read_blobette_with`] and stage the
/// output.
pub fn read_blobette_into<R: Read, W: Write>(
    reader: &mut R,
    sink: &mut W,
    verify: bool,
) -> Result<Option<Blobette>, BlobetteError> {
    let decoded = decode_record(reader, verify, |_| Ok::<_, BlobetteError>(Some(sink)))?;
    Ok(decoded.map(|d| Blobette {
        header:   d.header,
        content:  None,
        checksum: d.checksum,
        status:   d.status,
    }))
}

/// Decode the next blobette into a sink chosen from its header.
///
/// `open_sink` sees the decoded header before any content is read, which
/// lets the caller pick a destination by pathname.  The sink is handed back
/// only if the whole record decoded (and, with `verify`, checked out);
/// on error it is dropped.
pub fn read_blobette_with<R, W, E, F>(
    reader: &mut R,
    verify: bool,
    open_sink: F,
) -> Result<Option<(Blobette, W)>, E>
where
    R: Read,
    W: Write,
    E: From<BlobetteError>,
    F: FnOnce(&BlobetteHeader) -> Result<W, E>,
{
    let decoded = decode_record(reader, verify, |header| open_sink(header).map(Some))?;
    Ok(decoded.and_then(|d| {
        let blobette = Blobette {
            header:   d.header,
            content:  None,
            checksum: d.checksum,
            status:   d.status,
        };
        d.sink.map(|w| (blobette, w))
    }))
}
