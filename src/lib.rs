pub mod checksum;
pub mod blobette;
pub mod codec;
pub mod archive;

pub use checksum::{absorb, Pearson, HASH_TABLE};
pub use blobette::{
    encode, read_blobette, write_blobette, Blobette, BlobetteError, BlobetteHeader, ChecksumStatus,
    DecodeMode, BLOBETTE_MAGIC,
};
pub use codec::Compression;
pub use archive::{ArchiveError, BlobReader, BlobWriter, EntryInfo};
