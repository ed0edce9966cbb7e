//! Blobette checksum: an 8-bit Pearson hash.
//!
//! The accumulator starts at 0 for every record and absorbs each record byte
//! in stream order, magic byte through the last content byte.  The trailing
//! checksum byte itself is never absorbed.
//!
//! [`HashingReader`] and [`HashingWriter`] thread the accumulator through
//! ordinary `Read`/`Write` traffic, so encode and decode never need a second
//! pass over the record.

use std::io::{self, Read, Write};

/// Pearson substitution table: a fixed permutation of 0..=255.
///
/// Must match the reference archiver byte-for-byte, otherwise checksums stop
/// being portable between implementations.
pub static HASH_TABLE: [u8; 256] = [
    241, 18,  181, 164, 92,  237, 100, 216, 183, 107, 2,   12,  43,  246, 90,
    143, 251, 49,  228, 134, 215, 20,  193, 172, 140, 227, 148, 118, 57,  72,
    119, 174, 78,  14,  97,  3,   208, 252, 11,  195, 31,  28,  121, 206, 149,
    23,  83,  154, 223, 109, 89,  10,  178, 243, 42,  194, 221, 131, 212, 94,
    205, 240, 161, 7,   62,  214, 222, 219, 1,   84,  95,  58,  103, 60,  33,
    111, 188, 218, 186, 166, 146, 189, 201, 155, 68,  145, 44,  163, 69,  196,
    115, 231, 61,  157, 165, 213, 139, 112, 173, 191, 142, 88,  106, 250, 8,
    127, 26,  126, 0,   96,  52,  182, 113, 38,  242, 48,  204, 160, 15,  54,
    158, 192, 81,  125, 245, 239, 101, 17,  136, 110, 24,  53,  132, 117, 102,
    153, 226, 4,   203, 199, 16,  249, 211, 167, 55,  255, 254, 116, 122, 13,
    236, 93,  144, 86,  59,  76,  150, 162, 207, 77,  176, 32,  124, 171, 29,
    45,  30,  67,  184, 51,  22,  105, 170, 253, 180, 187, 130, 156, 98,  159,
    220, 40,  133, 135, 114, 147, 75,  73,  210, 21,  129, 39,  138, 91,  41,
    235, 47,  185, 9,   82,  64,  87,  244, 50,  74,  233, 175, 247, 120, 6,
    169, 85,  66,  104, 80,  71,  230, 152, 225, 34,  248, 198, 63,  168, 179,
    141, 137, 5,   19,  79,  232, 128, 202, 46,  70,  37,  209, 217, 123, 27,
    177, 25,  56,  65,  229, 36,  197, 234, 108, 35,  151, 238, 200, 224, 99,
    190,
];

/// Fold one byte into the accumulator.
#[inline]
pub fn absorb(acc: u8, byte: u8) -> u8 {
    HASH_TABLE[(acc ^ byte) as usize]
}

/// Running Pearson accumulator for one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pearson {
    acc: u8,
}

impl Pearson {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.acc = data.iter().fold(self.acc, |acc, &b| absorb(acc, b));
    }

    #[inline]
    pub fn value(&self) -> u8 {
        self.acc
    }

    pub fn reset(&mut self) {
        self.acc = 0;
    }
}

/// Pearson checksum of a whole byte slice, starting from 0.
pub fn checksum(data: &[u8]) -> u8 {
    let mut p = Pearson::new();
    p.update(data);
    p.value()
}

// ── Stream adapters ──────────────────────────────────────────────────────────

/// Reader that absorbs every byte it hands out.
pub struct HashingReader<R> {
    inner: R,
    hash:  Pearson,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_state(inner, Pearson::new())
    }

    /// Continue an accumulator that has already absorbed earlier bytes.
    pub fn with_state(inner: R, hash: Pearson) -> Self {
        Self { inner, hash, count: 0 }
    }

    pub fn checksum(&self) -> u8 { self.hash.value() }

    /// Bytes read (and absorbed) so far.
    pub fn bytes_read(&self) -> u64 { self.count }

    pub fn get_mut(&mut self) -> &mut R { &mut self.inner }

    pub fn into_inner(self) -> R { self.inner }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hash.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// Writer that absorbs every byte accepted by the inner writer.
pub struct HashingWriter<W> {
    inner: W,
    hash:  Pearson,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, hash: Pearson::new(), count: 0 }
    }

    pub fn checksum(&self) -> u8 { self.hash.value() }

    pub fn bytes_written(&self) -> u64 { self.count }

    pub fn get_mut(&mut self) -> &mut W { &mut self.inner }

    pub fn into_inner(self) -> W { self.inner }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Only the accepted prefix is absorbed; a short write must not skew
        // the accumulator.
        let n = self.inner.write(buf)?;
        self.hash.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
