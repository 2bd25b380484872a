use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use anyhow::Result;
use futures_lite::{
    io::{AsyncRead, AsyncReadExt, Cursor},
    StreamExt,
};
use tarstream::{
    BoxedReader, EntryOptions, EntryType, Error, FileStat, FileSystem, TarBuilder, TarMeta,
    TarReader, BLOCK_SIZE,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name)
}

async fn archive(builder: TarBuilder<'_>) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    builder.into_reader().read_to_end(&mut out).await?;
    Ok(out)
}

/// Hands out at most `chunk` bytes per read.
struct ChunkedReader {
    inner: Cursor<Vec<u8>>,
    chunk: usize,
}

impl ChunkedReader {
    fn new(data: Vec<u8>, chunk: usize) -> Self {
        Self {
            inner: Cursor::new(data),
            chunk,
        }
    }
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let len = buf.len().min(this.chunk);
        Pin::new(&mut this.inner).poll_read(cx, &mut buf[..len])
    }
}

fn file_meta(name: &str, mode: u32, size: u64, mtime: u64, id: u32, user: &str) -> TarMeta {
    TarMeta {
        file_mode: Some(mode),
        mtime: Some(mtime),
        uid: Some(id),
        gid: Some(id),
        owner: Some(user.to_string()),
        group: Some(user.to_string()),
        file_size: Some(size),
        ..TarMeta::new(name, EntryType::File)
    }
}

#[test]
fn write_and_read_two_entries() -> Result<()> {
    smol::block_on(async {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("tar.ts");
        let source_data = b"deno!".repeat(250);
        std::fs::write(&source, &source_data)?;

        let first = b"hello tar world!".repeat(100);
        let mut builder = TarBuilder::new();
        builder.append("output.txt", EntryOptions::bytes(first.clone()))?;
        builder.append("dir/tar.ts", EntryOptions::path(&source))?;
        let data = archive(builder).await?;
        assert_eq!(data.len() % BLOCK_SIZE, 0);

        let mut stream = Box::pin(TarReader::new(Cursor::new(data)));

        let mut entry = stream.next().await.expect("first entry")?;
        assert_eq!(entry.file_name, "output.txt");
        assert_eq!(entry.file_size, Some(first.len() as u64));
        assert!(!entry.consumed());
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).await?;
        assert_eq!(buf, first);
        assert!(entry.consumed());

        let mut entry = stream.next().await.expect("second entry")?;
        assert_eq!(entry.file_name, "dir/tar.ts");
        assert_eq!(entry.entry_type, EntryType::File);
        assert_eq!(entry.file_size, Some(source_data.len() as u64));
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).await?;
        assert_eq!(buf, source_data);

        assert!(stream.next().await.is_none());
        Ok(())
    })
}

#[test]
fn unread_entries_are_skipped() -> Result<()> {
    smol::block_on(async {
        let mut builder = TarBuilder::new();
        builder.append("a.txt", EntryOptions::bytes(b"a".repeat(70_000)))?;
        builder.append("b.txt", EntryOptions::bytes("second"))?;
        builder.append("c.txt", EntryOptions::bytes(b"c".repeat(600)))?;
        let data = archive(builder).await?;

        let mut stream = Box::pin(TarReader::new(Cursor::new(data)));
        let mut first = stream.next().await.expect("a.txt")?;
        assert!(!first.consumed());

        // partially read, then superseded
        let mut head = [0u8; 10];
        first.read_exact(&mut head).await?;
        assert_eq!(&head, b"aaaaaaaaaa");

        let mut second = stream.next().await.expect("b.txt")?;
        assert!(first.consumed());
        assert_eq!(first.read(&mut head).await?, 0);
        assert_eq!(second.file_name, "b.txt");
        let mut buf = String::new();
        second.read_to_string(&mut buf).await?;
        assert_eq!(buf, "second");

        let third = stream.next().await.expect("c.txt")?;
        assert_eq!(third.file_name, "c.txt");
        assert!(stream.next().await.is_none());
        assert!(third.consumed());
        Ok(())
    })
}

#[test]
fn list_without_reading_bodies() -> Result<()> {
    smol::block_on(async {
        let mut builder = TarBuilder::new();
        builder.append("docs/", EntryOptions::directory())?;
        for i in 0..5 {
            builder.append(
                format!("docs/{}.txt", i),
                EntryOptions::bytes(vec![b'x'; i * 300]),
            )?;
        }
        let data = archive(builder).await?;
        let names = TarReader::new(Cursor::new(data))
            .map(|entry| entry.map(|entry| entry.file_name.clone()))
            .try_collect::<_, _, Vec<_>>()
            .await?;
        assert_eq!(
            names,
            vec![
                "docs/",
                "docs/0.txt",
                "docs/1.txt",
                "docs/2.txt",
                "docs/3.txt",
                "docs/4.txt"
            ]
        );
        Ok(())
    })
}

#[test]
fn short_reads_and_small_buffers() -> Result<()> {
    smol::block_on(async {
        let first = b"hello tar world!".repeat(100);
        let second = b"deno!".repeat(250);
        let mut builder = TarBuilder::new();
        builder.append("first.txt", EntryOptions::bytes(first.clone()))?;
        builder.append("second.txt", EntryOptions::bytes(second.clone()))?;
        let data = archive(builder).await?;

        for chunk in [1, 53, 256, 511, 512, 4096] {
            let mut stream = Box::pin(TarReader::new(ChunkedReader::new(data.clone(), chunk)));
            for expected in [&first, &second] {
                let mut entry = stream.next().await.expect("entry")?;
                let mut got = Vec::new();
                let mut buf = vec![0u8; chunk];
                loop {
                    let n = entry.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    got.extend_from_slice(&buf[..n]);
                }
                assert_eq!(&got, expected, "chunk size {}", chunk);
            }
            assert!(stream.next().await.is_none());
        }
        Ok(())
    })
}

#[test]
fn write_to_file_and_read_back() -> Result<()> {
    smol::block_on(async {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.tar");
        let long_name = format!("{}/{}", "nested".repeat(20), "file.txt");

        let mut builder = TarBuilder::new();
        builder.append(
            long_name.as_str(),
            EntryOptions::bytes("long")
                .mode(0o600)
                .mtime(1_700_000_000)
                .uid(1000)
                .gid(100)
                .owner("user")
                .group("users"),
        )?;
        builder.append("link", EntryOptions::symlink("nested/file.txt"))?;
        builder.append("hard", EntryOptions::hard_link("link"))?;
        let file = smol::fs::File::create(&path).await?;
        let written = builder.write_to(file).await?;
        assert_eq!(written, std::fs::metadata(&path)?.len());
        assert_eq!(written, 6 * BLOCK_SIZE as u64);

        let file = smol::fs::File::open(&path).await?;
        let mut stream = Box::pin(TarReader::new(file));

        let mut entry = stream.next().await.expect("file")?;
        assert_eq!(
            *entry,
            TarMeta {
                file_mode: Some(0o600),
                mtime: Some(1_700_000_000),
                uid: Some(1000),
                gid: Some(100),
                owner: Some("user".into()),
                group: Some("users".into()),
                file_size: Some(4),
                ..TarMeta::new(long_name.as_str(), EntryType::File)
            }
        );
        assert_eq!(entry.discard().await?, 4);
        assert_eq!(entry.discard().await?, 0);

        let entry = stream.next().await.expect("symlink")?;
        assert_eq!(entry.entry_type, EntryType::Symlink);
        assert_eq!(entry.link_name.as_deref(), Some("nested/file.txt"));
        assert_eq!(entry.file_mode, Some(0o777));
        assert_eq!(entry.file_size, Some(0));
        assert!(entry.consumed());

        let entry = stream.next().await.expect("hard link")?;
        assert_eq!(entry.entry_type, EntryType::Link);
        assert_eq!(entry.link_name.as_deref(), Some("link"));

        assert!(stream.next().await.is_none());
        Ok(())
    })
}

#[test]
fn read_deno_fixture() -> Result<()> {
    smol::block_on(async {
        let file = smol::fs::File::open(fixture("deno.tar")).await?;
        let mut stream = Box::pin(TarReader::new(file));
        let dir = |name: &str, mtime| TarMeta {
            entry_type: EntryType::Directory,
            file_size: Some(0),
            ..file_meta(name, 509, 0, mtime, 1001, "deno")
        };
        let expected = [
            (dir("archive/", 1591800767), None),
            (dir("archive/deno/", 1591799635), None),
            (dir("archive/deno/land/", 1591799660), None),
            (
                file_meta("archive/deno/land/land.txt", 436, 5, 1591799660, 1001, "deno"),
                Some("land\n"),
            ),
            (
                file_meta("archive/file.txt", 436, 5, 1591799626, 1001, "deno"),
                Some("file\n"),
            ),
            (
                file_meta("archive/deno.txt", 436, 5, 1591799642, 1001, "deno"),
                Some("deno\n"),
            ),
        ];
        for (meta, content) in expected {
            let mut entry = stream.next().await.expect("entry")?;
            assert_eq!(*entry, meta);
            let mut buf = String::new();
            entry.read_to_string(&mut buf).await?;
            assert_eq!(buf, content.unwrap_or(""));
        }
        assert!(stream.next().await.is_none());
        Ok(())
    })
}

#[test]
fn read_symlink_fixture() -> Result<()> {
    smol::block_on(async {
        let file = smol::fs::File::open(fixture("with_link.tar")).await?;
        let mut stream = Box::pin(TarReader::new(file));

        let mut entry = stream.next().await.expect("hello.txt")?;
        assert_eq!(
            *entry,
            file_meta("hello.txt", 436, 14, 1696384910, 1000, "user")
        );
        let mut buf = String::new();
        entry.read_to_string(&mut buf).await?;
        assert_eq!(buf, "Hello World!\n\n");

        let entry = stream.next().await.expect("link_to_hello.txt")?;
        assert_eq!(
            entry.meta(),
            &TarMeta {
                entry_type: EntryType::Symlink,
                link_name: Some("./hello.txt".into()),
                ..file_meta("link_to_hello.txt", 511, 0, 1696384945, 1000, "user")
            }
        );
        assert!(stream.next().await.is_none());
        Ok(())
    })
}

#[test]
fn checksum_error_ends_iteration() -> Result<()> {
    smol::block_on(async {
        let mut builder = TarBuilder::new();
        builder.append("a", EntryOptions::bytes("first"))?;
        builder.append("b", EntryOptions::bytes("second"))?;
        builder.append("c", EntryOptions::bytes("third"))?;
        let mut data = archive(builder).await?;
        // name of the second header
        data[2 * BLOCK_SIZE] = b'x';

        let mut stream = Box::pin(TarReader::new(Cursor::new(data)));
        let entry = stream.next().await.expect("a")?;
        assert_eq!(entry.file_name, "a");
        match stream.next().await {
            Some(Err(Error::ChecksumMismatch { .. })) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
        Ok(())
    })
}

#[test]
fn truncated_archives() -> Result<()> {
    smol::block_on(async {
        let mut builder = TarBuilder::new();
        builder.append("a", EntryOptions::bytes("first"))?;
        builder.append("b", EntryOptions::bytes("second"))?;
        let data = archive(builder).await?;

        // no trailer at all
        let names = TarReader::new(Cursor::new(data[..4 * BLOCK_SIZE].to_vec()))
            .map(|entry| entry.map(|entry| entry.file_name.clone()))
            .try_collect::<_, _, Vec<_>>()
            .await?;
        assert_eq!(names, vec!["a", "b"]);

        // partial header
        let mut stream = Box::pin(TarReader::new(Cursor::new(
            data[..2 * BLOCK_SIZE + 100].to_vec(),
        )));
        stream.next().await.expect("a")?;
        match stream.next().await {
            Some(Err(Error::TruncatedHeader(100))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(stream.next().await.is_none());

        // cut inside the trailer: the partial record is all zeros
        let mut stream = Box::pin(TarReader::new(Cursor::new(
            data[..4 * BLOCK_SIZE + 100].to_vec(),
        )));
        stream.next().await.expect("a")?;
        stream.next().await.expect("b")?;
        match stream.next().await {
            Some(Err(Error::TruncatedHeader(100))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(stream.next().await.is_none());

        // data cut short
        let mut stream = Box::pin(TarReader::new(Cursor::new(data[..BLOCK_SIZE + 3].to_vec())));
        let mut entry = stream.next().await.expect("a")?;
        let mut buf = Vec::new();
        let err = entry.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(stream.next().await.is_none());
        Ok(())
    })
}

#[test]
fn non_utf8_name_does_not_stop_iteration() -> Result<()> {
    smol::block_on(async {
        let mut builder = TarBuilder::new();
        builder.append("caf-.txt", EntryOptions::bytes("latin-1"))?;
        builder.append("next.txt", EntryOptions::bytes("next"))?;
        let mut data = archive(builder).await?;
        // rewrite the name as a Latin-1 "café.txt" and fix up the checksum
        data[3] = 0xe9;
        data[148..156].copy_from_slice(b"        ");
        let mut record = [0u8; BLOCK_SIZE];
        record.copy_from_slice(&data[..BLOCK_SIZE]);
        let checksum = tarstream::Header::from_bytes(record).computed_checksum();
        data[148..156].copy_from_slice(format!("{:06o}\0 ", checksum).as_bytes());

        let mut stream = Box::pin(TarReader::new(Cursor::new(data)));
        let mut entry = stream.next().await.expect("latin-1 entry")?;
        assert_eq!(entry.file_name, "caf\u{fffd}.txt");
        let mut buf = String::new();
        entry.read_to_string(&mut buf).await?;
        assert_eq!(buf, "latin-1");

        let mut entry = stream.next().await.expect("next.txt")?;
        assert_eq!(entry.file_name, "next.txt");
        let mut buf = String::new();
        entry.read_to_string(&mut buf).await?;
        assert_eq!(buf, "next");
        assert!(stream.next().await.is_none());
        Ok(())
    })
}

#[test]
fn truncated_data_while_skipping() -> Result<()> {
    smol::block_on(async {
        let mut builder = TarBuilder::new();
        builder.append("big", EntryOptions::bytes(vec![1u8; 3 * BLOCK_SIZE]))?;
        let data = archive(builder).await?;
        let mut stream = Box::pin(TarReader::new(Cursor::new(data[..2 * BLOCK_SIZE].to_vec())));
        stream.next().await.expect("big")?;
        match stream.next().await {
            Some(Err(Error::Io(err))) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(stream.next().await.is_none());
        Ok(())
    })
}

#[derive(Default)]
struct MemFileSystem {
    files: HashMap<PathBuf, (FileStat, Vec<u8>)>,
    stats: AtomicUsize,
}

impl MemFileSystem {
    fn insert(&mut self, path: &str, stat: FileStat, data: &[u8]) {
        self.files.insert(PathBuf::from(path), (stat, data.to_vec()));
    }
    fn lookup(&self, path: &Path) -> io::Result<&(FileStat, Vec<u8>)> {
        self.files
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}

#[async_trait::async_trait]
impl FileSystem for MemFileSystem {
    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        self.lookup(path).map(|(stat, _)| *stat)
    }
    async fn open(&self, path: &Path) -> io::Result<BoxedReader<'static>> {
        let (_, data) = self.lookup(path)?;
        Ok(Box::new(Cursor::new(data.clone())))
    }
}

#[test]
fn path_entries_take_metadata_from_file_system() -> Result<()> {
    smol::block_on(async {
        let mut fs = MemFileSystem::default();
        fs.insert(
            "/src/main.rs",
            FileStat {
                size: 12,
                mtime: 1_600_000_000,
                mode: 0o640,
                uid: 42,
                gid: 43,
                is_dir: false,
            },
            b"fn main() {}",
        );
        fs.insert(
            "/src",
            FileStat {
                size: 4096,
                mtime: 1_600_000_001,
                mode: 0o750,
                uid: 42,
                gid: 43,
                is_dir: true,
            },
            b"",
        );
        let fs = Arc::new(fs);

        let mut builder = TarBuilder::with_file_system(fs.clone());
        builder.append("src/", EntryOptions::path("/src"))?;
        builder.append("src/main.rs", EntryOptions::path("/src/main.rs").mode(0o600).uid(7))?;
        assert_eq!(fs.stats.load(Ordering::SeqCst), 0);

        let data = archive(builder).await?;
        assert_eq!(fs.stats.load(Ordering::SeqCst), 2);

        let mut stream = Box::pin(TarReader::new(Cursor::new(data)));
        let entry = stream.next().await.expect("src/")?;
        assert_eq!(
            *entry,
            TarMeta {
                file_mode: Some(0o750),
                mtime: Some(1_600_000_001),
                uid: Some(42),
                gid: Some(43),
                file_size: Some(0),
                ..TarMeta::new("src/", EntryType::Directory)
            }
        );
        let mut entry = stream.next().await.expect("src/main.rs")?;
        assert_eq!(
            *entry,
            TarMeta {
                file_mode: Some(0o600),
                mtime: Some(1_600_000_000),
                uid: Some(7),
                gid: Some(43),
                file_size: Some(12),
                ..TarMeta::new("src/main.rs", EntryType::File)
            }
        );
        let mut buf = String::new();
        entry.read_to_string(&mut buf).await?;
        assert_eq!(buf, "fn main() {}");
        assert!(stream.next().await.is_none());
        Ok(())
    })
}

#[test]
fn missing_path_fails_the_stream() -> Result<()> {
    smol::block_on(async {
        let mut builder = TarBuilder::with_file_system(Arc::new(MemFileSystem::default()));
        builder.append("present", EntryOptions::bytes("here"))?;
        builder.append("missing", EntryOptions::path("/nowhere"))?;
        let err = archive(builder).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        Ok(())
    })
}

#[test]
fn header_accessor_exposes_raw_record() -> Result<()> {
    smol::block_on(async {
        let mut builder = TarBuilder::new();
        builder.append("raw", EntryOptions::bytes("x").mtime(0))?;
        let data = archive(builder).await?;
        let mut stream = Box::pin(TarReader::new(Cursor::new(data.clone())));
        let entry = stream.next().await.expect("raw")?;
        assert_eq!(&entry.header().as_bytes()[..], &data[..BLOCK_SIZE]);
        assert_eq!(entry.header().flavor(), tarstream::Flavor::Ustar);
        Ok(())
    })
}
