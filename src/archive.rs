//! Blob-level operations: list, extract and create.
//!
//! A blob is scanned strictly front to back.  [`BlobReader`] walks records
//! one at a time, [`BlobWriter`] appends them; the three user-facing
//! operations are thin loops over those two.
//!
//! ```no_run
//! use blobby::archive::{create_blob, list_blob, CreateOptions, ListOptions};
//! use std::path::PathBuf;
//!
//! let members = vec![PathBuf::from("notes.txt")];
//! create_blob("out.blob", &members, &CreateOptions::default(), &mut std::io::stdout())?;
//! list_blob("out.blob", &ListOptions::default(), &mut std::io::stdout())?;
//! # Ok::<(), blobby::archive::ArchiveError>(())
//! ```
//!
//! # Failure policy
//! Every operation stops at the first failing member.  Whatever was already
//! appended (create) or extracted (extract) stays on disk; there is no
//! rollback.  A single extracted member is staged in a temporary file and
//! only moved into place once its checksum has been verified.

use std::ffi::OsStr;
use std::fs::{self, File, Permissions};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blobette::{
    read_blobette, read_blobette_with, seek_blobette, write_blobette, Blobette, BlobetteError,
    BlobetteHeader, ChecksumStatus, DecodeMode,
};
use crate::codec::{get_codec, open_decompressed, sniff, CodecError, Compression, DEFAULT_ZSTD_LEVEL};

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The blob or a member file could not be opened or stat'd.
    #[error("{}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("{}: not a regular file", .0.display())]
    NotAFile(PathBuf),
    /// A record failed to decode; `offset` is where the record starts.
    #[error("record at byte {offset}: {source}")]
    Record { offset: u64, source: BlobetteError },
    /// A member could not be encoded (field overflow, short read).
    #[error("{}: {source}", path.display())]
    Member { path: PathBuf, source: BlobetteError },
    #[error("refusing to extract unsafe pathname {0:?}")]
    UnsafePath(String),
    #[error(transparent)]
    Blobette(#[from] BlobetteError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    fn at_offset(self, offset: u64) -> Self {
        match self {
            ArchiveError::Blobette(source) => ArchiveError::Record { offset, source },
            other => other,
        }
    }

    /// The underlying codec error, if this failure came from the blob format.
    pub fn blobette_error(&self) -> Option<&BlobetteError> {
        match self {
            ArchiveError::Record { source, .. }
            | ArchiveError::Member { source, .. }
            | ArchiveError::Blobette(source) => Some(source),
            _ => None,
        }
    }
}

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFormat {
    /// `mode size pathname`, one member per line.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Hash skipped content and fail on a checksum mismatch.
    pub verify: bool,
    pub format: ListFormat,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Directory member pathnames are resolved against.
    pub output_dir: PathBuf,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { output_dir: PathBuf::from(".") }
    }
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub compression: Compression,
    /// Compression level; only zstd honours it.
    pub level: i32,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self { compression: Compression::None, level: DEFAULT_ZSTD_LEVEL }
    }
}

// ── EntryInfo ────────────────────────────────────────────────────────────────

/// Listing view of one member, as serialized for `--json`.  Non-UTF-8
/// pathname bytes are replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub mode:     u32,
    pub size:     u64,
    pub pathname: String,
    pub checksum: u8,
    /// `None` when the content was skipped without hashing.
    pub verified: Option<bool>,
}

impl From<&Blobette> for EntryInfo {
    fn from(b: &Blobette) -> Self {
        EntryInfo {
            mode:     b.header.mode,
            size:     b.header.content_length,
            pathname: b.header.pathname_lossy().into_owned(),
            checksum: b.checksum,
            verified: match b.status {
                ChecksumStatus::Valid             => Some(true),
                ChecksumStatus::Mismatch { .. }   => Some(false),
                ChecksumStatus::Unchecked         => None,
            },
        }
    }
}

/// `000644     0 a`: octal mode, right-aligned size, then the pathname bytes
/// as stored.
pub fn write_listing_line<W: Write + ?Sized>(out: &mut W, header: &BlobetteHeader) -> io::Result<()> {
    write!(out, "{:06o} {:5} ", header.mode, header.content_length)?;
    out.write_all(&header.pathname)?;
    out.write_all(b"\n")
}

// ── BlobReader ───────────────────────────────────────────────────────────────

/// Sequential scanner over the records of a blob.
///
/// The iterator yields records until a clean end of stream, or a single
/// error after which it is exhausted.
pub struct BlobReader<R> {
    reader: R,
    mode:   DecodeMode,
    offset: u64,
    failed: bool,
}

impl<R: Read> BlobReader<R> {
    pub fn new(reader: R, mode: DecodeMode) -> Self {
        Self { reader, mode, offset: 0, failed: false }
    }

    /// Byte offset of the next record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next_blobette(&mut self) -> Result<Option<Blobette>, ArchiveError> {
        let decoded = read_blobette(&mut self.reader, self.mode);
        self.advance(decoded)
    }

    fn advance(
        &mut self,
        decoded: Result<Option<Blobette>, BlobetteError>,
    ) -> Result<Option<Blobette>, ArchiveError> {
        let start = self.offset;
        match decoded {
            Ok(Some(b)) => {
                self.offset += b.header.encoded_len();
                debug!(offset = start, pathname = %b.header.pathname_lossy(), size = b.header.content_length, "decoded record");
                Ok(Some(b))
            }
            Ok(None) => Ok(None),
            Err(source) => Err(ArchiveError::Record { offset: start, source }),
        }
    }

    /// Decode the next record into a sink picked from its header.  The
    /// checksum is always enforced here.
    pub fn next_with<W, F>(&mut self, open_sink: F) -> Result<Option<(Blobette, W)>, ArchiveError>
    where
        W: Write,
        F: FnOnce(&BlobetteHeader) -> Result<W, ArchiveError>,
    {
        let start = self.offset;
        let next = read_blobette_with(&mut self.reader, true, open_sink)
            .map_err(|e: ArchiveError| e.at_offset(start))?;
        if let Some((b, _)) = &next {
            self.offset += b.header.encoded_len();
            debug!(offset = start, pathname = %b.header.pathname_lossy(), size = b.header.content_length, "decoded record");
        }
        Ok(next)
    }
}

impl<R: Read + Seek> BlobReader<R> {
    /// Same as [`next_blobette`](Self::next_blobette), except that in
    /// [`DecodeMode::LIST`] the content is seeked over rather than read.
    pub fn next_seeking(&mut self) -> Result<Option<Blobette>, ArchiveError> {
        let decoded = if self.mode == DecodeMode::LIST {
            seek_blobette(&mut self.reader)
        } else {
            read_blobette(&mut self.reader, self.mode)
        };
        self.advance(decoded)
    }
}

impl<R: Read> Iterator for BlobReader<R> {
    type Item = Result<Blobette, ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_blobette() {
            Ok(Some(b)) => Some(Ok(b)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

// ── BlobWriter ───────────────────────────────────────────────────────────────

/// Appends records to a blob stream.
pub struct BlobWriter<W: Write> {
    writer:  W,
    records: usize,
    bytes:   u64,
}

impl<W: Write> BlobWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, records: 0, bytes: 0 }
    }

    pub fn records(&self) -> usize { self.records }

    pub fn bytes_written(&self) -> u64 { self.bytes }

    /// Append a record whose content is streamed from `content`.
    pub fn add<R: Read>(&mut self, header: &BlobetteHeader, content: R) -> Result<u64, BlobetteError> {
        let n = write_blobette(&mut self.writer, header, content)?;
        self.records += 1;
        self.bytes += n;
        Ok(n)
    }

    pub fn add_bytes(&mut self, mode: u32, pathname: &[u8], content: &[u8]) -> Result<u64, BlobetteError> {
        let header = BlobetteHeader::new(mode, pathname, content.len() as u64)?;
        self.add(&header, content)
    }

    /// Append the file at `path`, stored under `path` exactly as given.
    pub fn add_path(&mut self, path: &Path) -> Result<u64, ArchiveError> {
        let open_err = |source| ArchiveError::Open { path: path.to_owned(), source };
        let file = File::open(path).map_err(open_err)?;
        let meta = file.metadata().map_err(open_err)?;
        if !meta.is_file() {
            return Err(ArchiveError::NotAFile(path.to_owned()));
        }

        let header = BlobetteHeader::new(
            meta.permissions().mode(),
            path.as_os_str().as_bytes(),
            meta.len(),
        )
        .map_err(|source| ArchiveError::Member { path: path.to_owned(), source })?;

        let n = self
            .add(&header, BufReader::new(file))
            .map_err(|source| ArchiveError::Member { path: path.to_owned(), source })?;
        debug!(path = %path.display(), mode = format_args!("{:o}", header.mode), size = header.content_length, "appended record");
        Ok(n)
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

// ── Operations on streams ────────────────────────────────────────────────────

fn list_mode(opts: &ListOptions) -> DecodeMode {
    if opts.verify { DecodeMode::LIST_VERIFIED } else { DecodeMode::LIST }
}

fn write_entry<O: Write>(out: &mut O, blobette: &Blobette, format: ListFormat) -> io::Result<()> {
    match format {
        ListFormat::Text => write_listing_line(out, &blobette.header),
        ListFormat::Json => {
            serde_json::to_writer(&mut *out, &EntryInfo::from(blobette))?;
            writeln!(out)
        }
    }
}

/// Print one line (or JSON object) per member of the blob in `reader`.
pub fn list_from<R: Read, O: Write>(
    reader: R,
    opts: &ListOptions,
    out: &mut O,
) -> Result<usize, ArchiveError> {
    let mut count = 0;
    for blobette in BlobReader::new(reader, list_mode(opts)) {
        write_entry(out, &blobette?, opts.format)?;
        count += 1;
    }
    Ok(count)
}

/// [`list_from`] for a raw blob that can seek; unverified listing skips
/// content without reading it.
pub fn list_seekable<R: Read + Seek, O: Write>(
    reader: R,
    opts: &ListOptions,
    out: &mut O,
) -> Result<usize, ArchiveError> {
    let mut blobs = BlobReader::new(reader, list_mode(opts));
    let mut count = 0;
    while let Some(blobette) = blobs.next_seeking()? {
        write_entry(out, &blobette, opts.format)?;
        count += 1;
    }
    Ok(count)
}

/// Collect the listing of a blob without printing it.
pub fn entries<R: Read>(reader: R, verify: bool) -> Result<Vec<EntryInfo>, ArchiveError> {
    let opts = ListOptions { verify, ..Default::default() };
    BlobReader::new(reader, list_mode(&opts))
        .map(|b| b.map(|b| EntryInfo::from(&b)))
        .collect()
}

/// A member being written next to its destination, committed only after the
/// record's checksum has been verified.
struct StagedFile {
    file:   BufWriter<NamedTempFile>,
    target: PathBuf,
}

impl StagedFile {
    fn commit(self, permissions: u32) -> Result<(), ArchiveError> {
        let staged = self.file.into_inner().map_err(|e| e.into_error())?;
        staged
            .as_file()
            .set_permissions(Permissions::from_mode(permissions))?;
        staged.persist(&self.target).map_err(|e| e.error)?;
        Ok(())
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.file.write(buf) }
    fn flush(&mut self) -> io::Result<()> { self.file.flush() }
}

/// Map a stored pathname onto `root`.
///
/// Leading `/` is dropped so absolute pathnames land inside `root`; `..`
/// components are refused outright.
pub fn member_destination(root: &Path, pathname: &[u8]) -> Result<PathBuf, ArchiveError> {
    let unsafe_path = || ArchiveError::UnsafePath(String::from_utf8_lossy(pathname).into_owned());
    let mut dest = root.to_path_buf();
    let mut pushed = false;
    for component in Path::new(OsStr::from_bytes(pathname)).components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => return Err(unsafe_path()),
            Component::Normal(part) => {
                dest.push(part);
                pushed = true;
            }
        }
    }
    if !pushed {
        return Err(unsafe_path());
    }
    Ok(dest)
}

fn stage_member<O: Write>(
    root: &Path,
    header: &BlobetteHeader,
    out: &mut O,
) -> Result<StagedFile, ArchiveError> {
    let target = member_destination(root, &header.pathname)?;
    out.write_all(b"Extracting: ")?;
    out.write_all(&header.pathname)?;
    out.write_all(b"\n")?;
    let parent = target.parent().unwrap_or(root);
    fs::create_dir_all(parent)?;
    let file = NamedTempFile::new_in(parent)?;
    Ok(StagedFile { file: BufWriter::new(file), target })
}

/// Extract every member of the blob in `reader` below `root`.
pub fn extract_from<R: Read, O: Write>(
    reader: R,
    root: &Path,
    out: &mut O,
) -> Result<usize, ArchiveError> {
    let mut blobs = BlobReader::new(reader, DecodeMode::EXTRACT);
    let mut count = 0;
    while let Some((blobette, staged)) = blobs.next_with(|header| stage_member(root, header, out))? {
        let target = staged.target.clone();
        staged.commit(blobette.header.permissions())?;
        debug!(path = %target.display(), mode = format_args!("{:o}", blobette.header.permissions()), "extracted");
        count += 1;
    }
    Ok(count)
}

/// Append one record per member path, in order, to `writer`.
pub fn create_into<W: Write, O: Write>(
    writer: W,
    members: &[PathBuf],
    out: &mut O,
) -> Result<W, ArchiveError> {
    let mut blob = BlobWriter::new(writer);
    for member in members {
        out.write_all(b"Adding: ")?;
        out.write_all(member.as_os_str().as_bytes())?;
        out.write_all(b"\n")?;
        blob.add_path(member)?;
    }
    info!(records = blob.records(), bytes = blob.bytes_written(), "blob written");
    Ok(blob.finish()?)
}

// ── Operations on paths ──────────────────────────────────────────────────────

fn open_blob(path: &Path) -> Result<BufReader<File>, ArchiveError> {
    let file = File::open(path)
        .map_err(|source| ArchiveError::Open { path: path.to_owned(), source })?;
    Ok(BufReader::new(file))
}

fn decompressed(blob: BufReader<File>) -> Result<Box<dyn Read>, ArchiveError> {
    let (compression, reader) = open_decompressed(blob)?;
    if compression != Compression::None {
        info!(%compression, "decompressed blob");
    }
    Ok(reader)
}

/// List the blob at `path`.
pub fn list_blob<P: AsRef<Path>, O: Write>(
    path: P,
    opts: &ListOptions,
    out: &mut O,
) -> Result<usize, ArchiveError> {
    let path = path.as_ref();
    info!(blob = %path.display(), verify = opts.verify, "listing");
    let mut blob = open_blob(path)?;
    if opts.verify || sniff(&mut blob)? != Compression::None {
        return list_from(decompressed(blob)?, opts, out);
    }
    debug!("checksums not verified while listing");
    list_seekable(blob, opts, out)
}

/// Extract the blob at `path` into `opts.output_dir`.
pub fn extract_blob<P: AsRef<Path>, O: Write>(
    path: P,
    opts: &ExtractOptions,
    out: &mut O,
) -> Result<usize, ArchiveError> {
    let path = path.as_ref();
    info!(blob = %path.display(), dest = %opts.output_dir.display(), "extracting");
    extract_from(decompressed(open_blob(path)?)?, &opts.output_dir, out)
}

/// Create the blob at `path` from `members`.
///
/// Uncompressed blobs stream straight to disk.  Compressed blobs are built in
/// memory and compressed as a whole once every member is in.
pub fn create_blob<P: AsRef<Path>, O: Write>(
    path: P,
    members: &[PathBuf],
    opts: &CreateOptions,
    out: &mut O,
) -> Result<usize, ArchiveError> {
    let path = path.as_ref();
    info!(blob = %path.display(), members = members.len(), compression = %opts.compression, "creating");
    let file = File::create(path)
        .map_err(|source| ArchiveError::Open { path: path.to_owned(), source })?;

    match get_codec(opts.compression) {
        None => {
            create_into(BufWriter::new(file), members, out)?;
        }
        Some(codec) => {
            let raw = create_into(Vec::new(), members, out)?;
            let packed = codec.compress(&raw, opts.level)?;
            if packed.len() > raw.len() {
                warn!(raw = raw.len(), packed = packed.len(), "compression grew the blob");
            }
            let mut file = BufWriter::new(file);
            file.write_all(&packed)?;
            file.flush()?;
        }
    }
    Ok(members.len())
}
