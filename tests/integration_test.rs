use blobby::archive::{
    create_blob, create_into, entries, extract_blob, extract_from, list_blob, list_from,
    CreateOptions, ExtractOptions, ListOptions,
};
use blobby::blobette::{encode, BlobetteError};
use blobby::codec::{Compression, XZ_MAGIC, ZSTD_MAGIC};
use blobby::{ArchiveError, BLOBETTE_MAGIC};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_member(dir: &Path, name: &str, data: &[u8], mode: u32) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    path
}

/// Where an absolute member pathname lands below an extraction root.
fn extracted(root: &Path, member: &Path) -> PathBuf {
    root.join(member.strip_prefix("/").unwrap())
}

fn listing(blob: &Path, opts: &ListOptions) -> String {
    let mut out = Vec::new();
    list_blob(blob, opts, &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_create_list_extract_roundtrip() {
    let src = TempDir::new().unwrap();
    let a = write_member(src.path(), "hello.txt", b"Hello, blob!\n", 0o644);
    let b = write_member(src.path(), "run.sh", b"#!/bin/sh\necho hi\n", 0o755);
    let c = write_member(src.path(), "empty", b"", 0o600);

    let work = TempDir::new().unwrap();
    let blob = work.path().join("test.blob");
    let members = vec![a.clone(), b.clone(), c.clone()];

    let mut progress = Vec::new();
    create_blob(&blob, &members, &CreateOptions::default(), &mut progress).unwrap();
    let progress = String::from_utf8(progress).unwrap();
    assert_eq!(
        progress,
        format!("Adding: {}\nAdding: {}\nAdding: {}\n", a.display(), b.display(), c.display())
    );

    let raw = fs::read(&blob).unwrap();
    assert_eq!(raw[0], BLOBETTE_MAGIC);

    let listed = listing(&blob, &ListOptions::default());
    let lines: Vec<&str> = listed.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], format!("100644    13 {}", a.display()));
    assert_eq!(lines[1], format!("100755    18 {}", b.display()));
    assert_eq!(lines[2], format!("100600     0 {}", c.display()));

    let dest = TempDir::new().unwrap();
    let opts = ExtractOptions { output_dir: dest.path().to_path_buf() };
    let n = extract_blob(&blob, &opts, &mut io::sink()).unwrap();
    assert_eq!(n, 3);

    for (member, data, mode) in [
        (&a, &b"Hello, blob!\n"[..], 0o644),
        (&b, &b"#!/bin/sh\necho hi\n"[..], 0o755),
        (&c, &b""[..], 0o600),
    ] {
        let out = extracted(dest.path(), member);
        assert_eq!(fs::read(&out).unwrap(), data);
        assert_eq!(fs::metadata(&out).unwrap().permissions().mode() & 0o7777, mode);
    }
}

#[test]
fn test_single_empty_member_listing() {
    let blob = encode(0o644, b"a", b"").unwrap();
    let mut out = Vec::new();
    list_from(&blob[..], &ListOptions::default(), &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "000644     0 a\n");

    let listed = entries(&blob[..], true).unwrap();
    assert_eq!(listed[0].mode, 0o644);
    assert_eq!(listed[0].size, 0);
    assert_eq!(listed[0].pathname, "a");
    assert_eq!(listed[0].verified, Some(true));
}

#[test]
fn test_zero_members_make_an_empty_blob() {
    let blob = create_into(Vec::new(), &[], &mut io::sink()).unwrap();
    assert!(blob.is_empty());

    let mut out = Vec::new();
    assert_eq!(list_from(&blob[..], &ListOptions::default(), &mut out).unwrap(), 0);
    assert!(out.is_empty());

    let dest = TempDir::new().unwrap();
    assert_eq!(extract_from(&blob[..], dest.path(), &mut out).unwrap(), 0);
    assert!(out.is_empty());
    assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[test]
fn test_concatenated_blobs_are_a_valid_blob() {
    let mut blob = encode(0o640, b"first", b"1st").unwrap();
    blob.extend(encode(0o604, b"second", b"2nd member").unwrap());

    let listed = entries(&blob[..], true).unwrap();
    let names: Vec<&str> = listed.iter().map(|e| e.pathname.as_str()).collect();
    assert_eq!(names, ["first", "second"]);

    let dest = TempDir::new().unwrap();
    let mut out = Vec::new();
    extract_from(&blob[..], dest.path(), &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "Extracting: first\nExtracting: second\n");
    assert_eq!(fs::read(dest.path().join("first")).unwrap(), b"1st");
    assert_eq!(fs::read(dest.path().join("second")).unwrap(), b"2nd member");
}

#[test]
fn test_corrupt_magic_is_fatal() {
    let mut blob = encode(0o644, b"a", b"abc").unwrap();
    blob[0] = b'C';
    let err = list_from(&blob[..], &ListOptions::default(), &mut io::sink()).unwrap_err();
    assert!(matches!(
        err,
        ArchiveError::Record { offset: 0, source: BlobetteError::Framing { found: b'C' } }
    ));
}

#[test]
fn test_corrupt_content_fails_extract_but_not_list() {
    let mut blob = encode(0o644, b"data.bin", b"0123456789").unwrap();
    blob[12 + 8 + 5] = b'X';

    let mut out = Vec::new();
    list_from(&blob[..], &ListOptions::default(), &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "000644    10 data.bin\n");

    let strict = ListOptions { verify: true, ..Default::default() };
    assert!(list_from(&blob[..], &strict, &mut io::sink()).is_err());

    let dest = TempDir::new().unwrap();
    let err = extract_from(&blob[..], dest.path(), &mut io::sink()).unwrap_err();
    assert!(matches!(err.blobette_error(), Some(BlobetteError::Checksum { .. })));
    assert!(!dest.path().join("data.bin").exists());
}

#[test]
fn test_truncated_blob_is_an_error() {
    let mut blob = encode(0o644, b"a", b"abc").unwrap();
    blob.extend(encode(0o644, b"b", b"def").unwrap());
    blob.truncate(blob.len() - 3);

    let err = entries(&blob[..], false).unwrap_err();
    assert!(matches!(
        err,
        ArchiveError::Record { offset: 17, source: BlobetteError::Truncated { .. } }
    ));
}

#[test]
fn test_compressed_blob_roundtrip() {
    let src = TempDir::new().unwrap();
    let body: Vec<u8> = b"compressible ".iter().copied().cycle().take(64 * 1024).collect();
    let member = write_member(src.path(), "big.txt", &body, 0o640);

    for (compression, magic) in [(Compression::Xz, &XZ_MAGIC[..]), (Compression::Zstd, &ZSTD_MAGIC[..])] {
        let work = TempDir::new().unwrap();
        let blob = work.path().join("packed.blob");
        let opts = CreateOptions { compression, ..Default::default() };
        create_blob(&blob, &[member.clone()], &opts, &mut io::sink()).unwrap();

        let raw = fs::read(&blob).unwrap();
        assert!(raw.starts_with(magic), "{compression} magic missing");
        assert!(raw.len() < body.len());

        let listed = listing(&blob, &ListOptions::default());
        assert_eq!(listed, format!("100640 65536 {}\n", member.display()));

        let dest = TempDir::new().unwrap();
        let opts = ExtractOptions { output_dir: dest.path().to_path_buf() };
        extract_blob(&blob, &opts, &mut io::sink()).unwrap();
        assert_eq!(fs::read(extracted(dest.path(), &member)).unwrap(), body);
    }
}

#[test]
fn test_create_stops_at_missing_member() {
    let src = TempDir::new().unwrap();
    let good = write_member(src.path(), "good", b"kept", 0o644);
    let missing = src.path().join("missing");

    let work = TempDir::new().unwrap();
    let blob = work.path().join("partial.blob");
    let err = create_blob(&blob, &[good.clone(), missing.clone()], &CreateOptions::default(), &mut io::sink())
        .unwrap_err();
    match err {
        ArchiveError::Open { path, .. } => assert_eq!(path, missing),
        other => panic!("expected open failure, got {other:?}"),
    }

    // No rollback: the first member is already in the blob.
    let listed = entries(fs::File::open(&blob).unwrap(), true).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(Path::new(&listed[0].pathname), good);
}

#[test]
fn test_missing_blob_is_open_error() {
    let work = TempDir::new().unwrap();
    let err = list_blob(work.path().join("nope.blob"), &ListOptions::default(), &mut io::sink())
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Open { .. }));
}

#[test]
fn test_extract_overwrites_existing_file() {
    let dest = TempDir::new().unwrap();
    fs::write(dest.path().join("f"), b"old contents, longer").unwrap();
    let blob = encode(0o600, b"f", b"new").unwrap();
    extract_from(&blob[..], dest.path(), &mut io::sink()).unwrap();
    assert_eq!(fs::read(dest.path().join("f")).unwrap(), b"new");
}
