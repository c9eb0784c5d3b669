use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::UNIX_EPOCH;

use zipdirfs::CancelToken;
use zipdirfs::FileType;
use zipdirfs::FsError;
use zipdirfs::Node;
use zipdirfs::OpenedFile;
use zipdirfs::Options;
use zipdirfs::ROOT_INO;
use zipdirfs::StreamHandle;
use zipdirfs::ZipFs;

fn write_zip(path: &Path, build: impl FnOnce(&mut zip::ZipWriter<File>)) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    build(&mut writer);
    writer.finish().unwrap();
}

fn stored() -> zip::write::SimpleFileOptions {
    zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored)
}

fn deflated() -> zip::write::SimpleFileOptions {
    zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated)
}

fn lookup(node: &Node, name: &str) -> Node {
    node.lookup(name, &CancelToken::new()).unwrap()
}

fn readdir(node: &Node) -> Vec<(String, FileType)> {
    node.readdir(&CancelToken::new())
        .unwrap()
        .into_iter()
        .map(|entry| (entry.name, entry.kind))
        .collect()
}

fn open_stream(node: &Node) -> Arc<StreamHandle> {
    match node.open().unwrap() {
        (OpenedFile::Streaming(handle), _) => handle,
        (OpenedFile::InMemory, _) => panic!("expected a streaming open"),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn real_directory_wins_over_same_stemmed_zip() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("foo")).unwrap();
    write_zip(&dir.path().join("foo.zip"), |zip| {
        zip.start_file("inside.txt", stored()).unwrap();
        zip.write_all(b"hidden by the real directory").unwrap();
    });

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let root = fs.root();

    let listing = readdir(&root);
    assert_eq!(listing, vec![("foo".to_owned(), FileType::Directory)]);

    let foo = lookup(&root, "foo");
    assert!(matches!(foo, Node::MirrorDir(_)));
    fs.shutdown();
}

#[test]
fn mirror_directories_filter_plain_files() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("loose.txt"), b"not shown").unwrap();
    std::fs::write(dir.path().join(".zip"), b"no stem, not shown").unwrap();
    write_zip(&dir.path().join("bundle.zip"), |zip| {
        zip.start_file("x", stored()).unwrap();
    });

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let listing = readdir(&fs.root());
    assert_eq!(
        listing,
        vec![
            ("bundle".to_owned(), FileType::Directory),
            ("sub".to_owned(), FileType::Directory),
        ]
    );

    assert!(matches!(
        fs.root().lookup("loose.txt", &CancelToken::new()),
        Err(FsError::NotFound(_))
    ));
    fs.shutdown();
}

#[test]
fn nested_traversal_orders_entries_and_times() {
    let dir = tempfile::TempDir::new().unwrap();
    let zip_path = dir.path().join("tree.zip");
    let logo_time = zip::DateTime::from_date_and_time(2021, 1, 2, 3, 4, 6).unwrap();
    write_zip(&zip_path, |zip| {
        zip.start_file("readme.txt", stored()).unwrap();
        zip.write_all(b"read me").unwrap();
        zip.add_directory("docs", stored()).unwrap();
        zip.start_file("docs/a.txt", stored()).unwrap();
        zip.write_all(b"a").unwrap();
        zip.start_file("docs/images/logo.png", deflated().last_modified_time(logo_time))
            .unwrap();
        zip.write_all(b"png bytes").unwrap();
        zip.start_file("src/main.go", stored()).unwrap();
        zip.write_all(b"package main").unwrap();
    });
    let archive_mtime = std::fs::metadata(&zip_path).unwrap().modified().unwrap();

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let tree = lookup(&fs.root(), "tree");

    assert_eq!(
        readdir(&tree),
        vec![
            ("docs".to_owned(), FileType::Directory),
            ("src".to_owned(), FileType::Directory),
            ("readme.txt".to_owned(), FileType::RegularFile),
        ]
    );

    let docs = lookup(&tree, "docs");
    assert!(matches!(docs, Node::ZipDir(_)));
    assert_eq!(docs.attr().mtime, archive_mtime);
    assert_eq!(
        readdir(&docs),
        vec![
            ("images".to_owned(), FileType::Directory),
            ("a.txt".to_owned(), FileType::RegularFile),
        ]
    );

    let images = lookup(&docs, "images");
    assert_eq!(images.attr().mtime, archive_mtime);

    let logo = lookup(&images, "logo.png");
    let attr = logo.attr();
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.perm, 0o444);
    assert_eq!(attr.size, 9);
    assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_secs(1_609_556_646));

    assert!(matches!(
        docs.lookup("missing", &CancelToken::new()),
        Err(FsError::NotFound(_))
    ));
    fs.shutdown();
}

#[test]
fn flat_presentation_names_and_variants() {
    let dir = tempfile::TempDir::new().unwrap();
    write_zip(&dir.path().join("flat.zip"), |zip| {
        zip.start_file("dir/a.txt", stored()).unwrap();
        zip.start_file("dir/b.txt", stored()).unwrap();
        zip.write_all(b"twelve bytes").unwrap();
    });

    let mut options = Options::default();
    options.flatten_zips = true;
    options.set_stream_threshold(1);
    let fs = ZipFs::new(dir.path(), options).unwrap();
    let flat = lookup(&fs.root(), "flat");

    assert_eq!(
        readdir(&flat),
        vec![
            ("a(1).txt".to_owned(), FileType::RegularFile),
            ("b(2).txt".to_owned(), FileType::RegularFile),
        ]
    );

    let a = lookup(&flat, "a(1).txt");
    assert!(matches!(a, Node::MemFile(_)));
    assert_eq!(a.read_all().unwrap(), b"");

    let b = lookup(&flat, "b(2).txt");
    assert!(matches!(b, Node::StreamFile(_)));
    let handle = open_stream(&b);
    assert_eq!(handle.read(0, 64).unwrap(), b"twelve bytes");
    handle.release();
    fs.shutdown();
}

#[test]
fn in_memory_reads_return_full_contents() {
    let dir = tempfile::TempDir::new().unwrap();
    let data = pattern(4096);
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("blob.bin", deflated()).unwrap();
        zip.write_all(&data).unwrap();
    });

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let node = lookup(&lookup(&fs.root(), "a"), "blob.bin");
    assert!(matches!(node, Node::MemFile(_)));
    assert_eq!(node.read_all().unwrap(), data);
    assert!(fs.metrics().snapshot().extract_bytes >= 4096);
    fs.shutdown();
}

#[test]
fn forward_only_replay_reopens_compressed_entries() {
    let dir = tempfile::TempDir::new().unwrap();
    let data: Vec<u8> = (0..36).collect();
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("entry.bin", deflated()).unwrap();
        zip.write_all(&data).unwrap();
    });

    let options = Options::default();
    options.set_stream_threshold(0);
    options.set_must_crc32(true);
    let fs = ZipFs::new(dir.path(), options).unwrap();
    let node = lookup(&lookup(&fs.root(), "a"), "entry.bin");
    let handle = open_stream(&node);

    assert_eq!(handle.read(5, 10).unwrap(), data[5..15]);
    assert_eq!(fs.metrics().snapshot().entries_reopened, 0);

    assert_eq!(handle.read(1, 10).unwrap(), data[1..11]);
    assert_eq!(fs.metrics().snapshot().entries_reopened, 1);

    handle.release();
    fs.shutdown();
}

#[test]
fn backward_seeks_on_stored_entries_do_not_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let data = pattern(1000);
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("raw.bin", stored()).unwrap();
        zip.write_all(&data).unwrap();
    });

    let options = Options::default();
    options.set_stream_threshold(0);
    let fs = ZipFs::new(dir.path(), options).unwrap();
    let node = lookup(&lookup(&fs.root(), "a"), "raw.bin");
    let handle = open_stream(&node);

    assert_eq!(handle.read(900, 50).unwrap(), data[900..950]);
    assert_eq!(handle.read(10, 50).unwrap(), data[10..60]);
    assert_eq!(fs.metrics().snapshot().entries_reopened, 0);

    handle.release();
    fs.shutdown();
}

#[test]
fn read_ranges_are_exact() {
    let dir = tempfile::TempDir::new().unwrap();
    let data = pattern(1000);
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("entry.bin", deflated()).unwrap();
        zip.write_all(&data).unwrap();
    });

    let options = Options::default();
    options.set_stream_threshold(0);
    let fs = ZipFs::new(dir.path(), options).unwrap();
    let node = lookup(&lookup(&fs.root(), "a"), "entry.bin");
    let handle = open_stream(&node);

    for offset in [0usize, 1, 499, 999, 1000] {
        for size in [0usize, 1, 37, 1000, 2000] {
            let expected = &data[offset..(offset + size).min(data.len())];
            let got = handle.read(offset as u64, size).unwrap();
            assert_eq!(got, expected, "offset {offset} size {size}");
        }
    }

    handle.release();
    fs.shutdown();
}

#[test]
fn concurrent_reads_on_one_handle_stay_consistent() {
    let dir = tempfile::TempDir::new().unwrap();
    let data = pattern(200_000);
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("big.bin", deflated()).unwrap();
        zip.write_all(&data).unwrap();
    });

    let options = Options::default();
    options.set_stream_threshold(0);
    let fs = ZipFs::new(dir.path(), options).unwrap();
    let node = lookup(&lookup(&fs.root(), "a"), "big.bin");
    let handle = open_stream(&node);

    let data = Arc::new(data);
    let mut workers = Vec::new();
    for worker in 0..8 {
        let handle = Arc::clone(&handle);
        let data = Arc::clone(&data);
        workers.push(thread::spawn(move || {
            for round in 0..16 {
                let offset = (worker * 31 + round * 17) * 997 % (data.len() - 1024);
                let got = handle.read(offset as u64, 1024).unwrap();
                assert_eq!(got, data[offset..offset + 1024], "offset {offset}");
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    handle.release();
    fs.shutdown();
}

#[test]
fn inode_assignment_is_deterministic_and_preserved() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();
    write_zip(&dir.path().join("nested").join("inner.zip"), |zip| {
        zip.start_file("docs/a.txt", stored()).unwrap();
        zip.start_file("top.txt", deflated()).unwrap();
        zip.write_all(b"top").unwrap();
    });
    write_zip(&dir.path().join("outer.zip"), |zip| {
        zip.start_file("one.txt", stored()).unwrap();
    });

    let collect = |fs: &ZipFs| {
        let mut seen: Vec<(PathBuf, u64)> = Vec::new();
        fs.walk(&CancelToken::new(), &mut |path, entry, node, attr| {
            assert_eq!(node.ino(), attr.ino);
            if let Some(entry) = entry {
                // the inode in the producing directory entry matches the node
                assert_eq!(entry.ino, attr.ino);
            } else {
                assert_eq!(attr.ino, ROOT_INO);
            }
            seen.push((path.to_path_buf(), attr.ino));
            Ok(())
        })
        .unwrap();
        seen
    };

    let first = ZipFs::new(dir.path(), Options::default()).unwrap();
    let second = ZipFs::new(dir.path(), Options::default()).unwrap();
    let walk_one = collect(&first);
    let walk_two = collect(&second);
    assert_eq!(walk_one, walk_two);
    assert!(walk_one.len() >= 7, "walk visited {walk_one:?}");

    first.shutdown();
    second.shutdown();
}

#[test]
fn walks_are_cancellable() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = fs.walk(&cancel, &mut |_, _, _, _| Ok(())).unwrap_err();
    assert!(matches!(err.source, FsError::Aborted));
    fs.shutdown();
}

#[test]
fn walk_errors_carry_the_failing_path() {
    let dir = tempfile::TempDir::new().unwrap();
    write_zip(&dir.path().join("ok.zip"), |zip| {
        zip.start_file("fine.txt", stored()).unwrap();
    });

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let err = fs
        .walk(&CancelToken::new(), &mut |path, _, _, _| {
            if path == Path::new("ok/fine.txt") {
                Err(FsError::Io(std::io::Error::other("visit failed")))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
    assert_eq!(err.path, Path::new("ok/fine.txt"));
    fs.shutdown();
}

#[test]
fn ttl_eviction_reopens_archives() {
    let dir = tempfile::TempDir::new().unwrap();
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("x.txt", stored()).unwrap();
    });

    let mut options = Options::default();
    options.fd_cache_ttl = Duration::from_millis(100);
    let fs = ZipFs::new(dir.path(), options).unwrap();
    let node = lookup(&fs.root(), "a");

    node.readdir(&CancelToken::new()).unwrap();
    assert_eq!(fs.metrics().snapshot().archives_opened, 1);

    thread::sleep(Duration::from_millis(250));

    node.readdir(&CancelToken::new()).unwrap();
    let snap = fs.metrics().snapshot();
    assert_eq!(snap.archives_opened, 2);
    assert_eq!(snap.archives_closed, 1);
    fs.shutdown();
}

#[test]
fn repeated_listings_hit_the_descriptor_cache() {
    let dir = tempfile::TempDir::new().unwrap();
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("x.txt", stored()).unwrap();
    });

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let node = lookup(&fs.root(), "a");
    for _ in 0..5 {
        node.readdir(&CancelToken::new()).unwrap();
    }
    let snap = fs.metrics().snapshot();
    assert_eq!(snap.archives_opened, 1);
    assert_eq!(snap.fd_cache_hits, 4);
    assert_eq!(snap.fd_cache_misses, 1);
    fs.shutdown();
}

#[test]
fn prepare_unmount_purges_and_bypasses() {
    let dir = tempfile::TempDir::new().unwrap();
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("x.txt", stored()).unwrap();
    });

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let node = lookup(&fs.root(), "a");
    node.readdir(&CancelToken::new()).unwrap();
    assert_eq!(fs.metrics().snapshot().archives_open, 1);

    let was_bypassing = fs.prepare_unmount();
    assert!(!was_bypassing);
    assert_eq!(fs.metrics().snapshot().archives_open, 0);

    // opens still work but are no longer cached
    node.readdir(&CancelToken::new()).unwrap();
    node.readdir(&CancelToken::new()).unwrap();
    let snap = fs.metrics().snapshot();
    assert_eq!(snap.archives_opened, 3);
    assert_eq!(snap.archives_open, 0);

    // an abandoned unmount restores the previous state
    fs.options().set_fd_cache_bypass(was_bypassing);
    fs.shutdown();
}

#[test]
fn corrupt_archives_surface_einval() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("bad.zip"), b"definitely not a zip file").unwrap();

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let node = lookup(&fs.root(), "bad");
    let err = node.readdir(&CancelToken::new()).unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
    assert!(fs.metrics().snapshot().errors >= 1);
    fs.shutdown();
}

#[test]
fn empty_archives_list_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    write_zip(&dir.path().join("empty.zip"), |_| {});

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let node = lookup(&fs.root(), "empty");
    assert!(readdir(&node).is_empty());
    fs.shutdown();
}

#[test]
fn strict_cache_suppresses_keep_cache_hints() {
    let dir = tempfile::TempDir::new().unwrap();
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("x.txt", stored()).unwrap();
        zip.write_all(b"x").unwrap();
    });

    let mut options = Options::default();
    options.strict_cache = true;
    let fs = ZipFs::new(dir.path(), options).unwrap();
    let zip_node = lookup(&fs.root(), "a");
    assert!(zip_node.opendir_flags().is_empty());
    let file = lookup(&zip_node, "x.txt");
    let (_, flags) = file.open().unwrap();
    assert!(flags.is_empty());
    fs.shutdown();

    let relaxed = ZipFs::new(dir.path(), Options::default()).unwrap();
    let zip_node = lookup(&relaxed.root(), "a");
    assert!(zip_node.opendir_flags().contains(zipdirfs::OpenFlags::CACHE_DIR));
    relaxed.shutdown();
}

#[test]
fn runtime_threshold_changes_apply_to_later_lookups() {
    let dir = tempfile::TempDir::new().unwrap();
    write_zip(&dir.path().join("a.zip"), |zip| {
        zip.start_file("f.bin", stored()).unwrap();
        zip.write_all(&pattern(100)).unwrap();
    });

    let fs = ZipFs::new(dir.path(), Options::default()).unwrap();
    let zip_node = lookup(&fs.root(), "a");
    assert!(matches!(lookup(&zip_node, "f.bin"), Node::MemFile(_)));

    fs.options().set_stream_threshold(10);
    assert!(matches!(lookup(&zip_node, "f.bin"), Node::StreamFile(_)));
    fs.shutdown();
}
