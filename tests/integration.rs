//! End-to-end tests against `Archive`, exercising the seven operations and
//! the invariant properties through the public API only.

use blockarc::{Archive, ArchiveError, ByteSink, ByteSource};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

struct MemSource(Cursor<Vec<u8>>);

impl MemSource {
    fn new(data: Vec<u8>) -> MemSource {
        MemSource(Cursor::new(data))
    }
}

impl ByteSource for MemSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.0.read(&mut buf[total..])? {
                0 => break,
                n => total += n,
            }
        }
        Ok(total)
    }
}

struct MemSink(Vec<u8>);

impl ByteSink for MemSink {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.extend_from_slice(data);
        Ok(())
    }
}

fn source(name: &str, data: &[u8]) -> (String, Box<dyn ByteSource>) {
    (name.to_string(), Box::new(MemSource::new(data.to_vec())))
}

fn disk_prep_path(test_name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("fs-tests");
    std::fs::create_dir_all(&path).unwrap();
    path.push(format!("{}.tar", test_name));
    let _ = std::fs::remove_file(&path);
    path
}

fn disk_destruct(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Extracts into a scratch directory and reads each member back, returning
/// `(name, content)` pairs in directory order.
fn extract_all(archive: &Archive) -> Vec<(String, Vec<u8>)> {
    let dir = tempfile::tempdir().unwrap();
    let mut names = Vec::new();
    archive
        .extract(|name| {
            names.push(name.to_string());
            let file = std::fs::File::create(dir.path().join(name))?;
            Ok(Box::new(file) as Box<dyn ByteSink>)
        })
        .unwrap();
    names
        .into_iter()
        .map(|name| {
            let content = std::fs::read(dir.path().join(&name)).unwrap();
            (name, content)
        })
        .collect()
}

#[test]
fn create_list_extract_roundtrip_is_byte_exact() {
    let path = disk_prep_path("roundtrip");
    let sources = vec![
        source("greeting.txt", b"hello, archive"),
        source("empty.txt", b""),
    ];
    let (archive, diagnostics) = Archive::create(&path, sources).unwrap();
    assert!(diagnostics.is_empty());

    let listing = archive.list().unwrap();
    assert_eq!(listing.len(), 2);
    assert_eq!(listing[0].size, 14);
    assert_eq!(listing[1].size, 0);

    let extracted = extract_all(&archive);
    assert_eq!(extracted[0].1, b"hello, archive");
    assert_eq!(extracted[1].1, Vec::<u8>::new());

    disk_destruct(&path);
}

#[test]
fn append_merges_into_existing_entry_of_the_same_name() {
    let path = disk_prep_path("append_merge");
    let (mut archive, _) = Archive::create(&path, vec![source("stdin", b"first ")]).unwrap();
    archive
        .append(vec![source("stdin", b"second")])
        .unwrap();

    let listing = archive.list().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].size, 12);

    let extracted = extract_all(&archive);
    assert_eq!(extracted[0].1, b"first second");

    disk_destruct(&path);
}

#[test]
fn delete_then_reopen_shows_member_gone() {
    let path = disk_prep_path("delete_reopen");
    let (mut archive, _) =
        Archive::create(&path, vec![source("a.txt", b"aaa"), source("b.txt", b"bbb")]).unwrap();
    let diagnostics = archive.delete(&["a.txt".to_string()]).unwrap();
    assert!(diagnostics.is_empty());
    drop(archive);

    let reopened = Archive::open(&path).unwrap();
    let listing = reopened.list().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "b.txt");

    disk_destruct(&path);
}

#[test]
fn delete_unknown_member_reports_a_diagnostic_not_an_error() {
    let path = disk_prep_path("delete_unknown");
    let (mut archive, _) = Archive::create(&path, vec![source("a.txt", b"aaa")]).unwrap();
    let diagnostics = archive.delete(&["nope.txt".to_string()]).unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].member, "nope.txt");

    // the archive itself is untouched by the failed delete
    let listing = archive.list().unwrap();
    assert_eq!(listing.len(), 1);

    disk_destruct(&path);
}

#[test]
fn update_replaces_content_and_releases_old_blocks() {
    let path = disk_prep_path("update_replace");
    let big = vec![9u8; 512 * 1024];
    let (mut archive, _) = Archive::create(&path, vec![source("a.bin", &big)]).unwrap();
    let before = archive.list().unwrap();
    assert_eq!(before[0].block_count, 2);

    archive.update(vec![source("a.bin", b"tiny")]).unwrap();
    let after = archive.list().unwrap();
    assert_eq!(after[0].size, 4);
    assert_eq!(after[0].block_count, 1);

    disk_destruct(&path);
}

#[test]
fn pack_shrinks_the_backing_file_after_deleting_a_large_member() {
    let path = disk_prep_path("pack_shrinks");
    let big = vec![1u8; 3 * 256 * 1024];
    let (mut archive, _) = Archive::create(
        &path,
        vec![source("keep.txt", b"keep me"), source("drop.bin", &big)],
    )
    .unwrap();

    let len_before = std::fs::metadata(&path).unwrap().len();
    archive.delete(&["drop.bin".to_string()]).unwrap();
    archive.pack().unwrap();
    let len_after = std::fs::metadata(&path).unwrap().len();

    assert!(len_after < len_before);

    let listing = archive.list().unwrap();
    assert_eq!(listing.len(), 1);
    let extracted = extract_all(&archive);
    assert_eq!(extracted[0].1, b"keep me");

    disk_destruct(&path);
}

#[test]
fn opening_a_foreign_file_fails_with_corrupt_header() {
    let path = disk_prep_path("foreign_file");
    std::fs::write(&path, b"not an archive, just some bytes").unwrap();
    let err = Archive::open(&path).unwrap_err();
    assert!(matches!(err, ArchiveError::CorruptHeader(_)));
    disk_destruct(&path);
}

#[test]
fn directory_full_is_a_fatal_error_not_a_diagnostic() {
    let path = disk_prep_path("directory_full");
    let sources: Vec<_> = (0..100)
        .map(|i| source(&format!("f{}.txt", i), b"x"))
        .collect();
    let (mut archive, diagnostics) = Archive::create(&path, sources).unwrap();
    assert!(diagnostics.is_empty());

    let err = archive
        .append(vec![source("one-too-many.txt", b"x")])
        .unwrap_err();
    assert!(matches!(err, ArchiveError::TableFull));

    disk_destruct(&path);
}
