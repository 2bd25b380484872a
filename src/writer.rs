//! Lazy tar writer.
//!
//! [`TarBuilder`] only queues entries. The archive itself is produced by
//! [`TarStream`], an `AsyncRead` that emits, for each entry in append order,
//! the header record, the entry data and the zero padding up to the next record
//! boundary, and finally the two all-zero trailer records. Path-backed entries
//! are stat'ed and opened only when the stream reaches them.
use {
    crate::{
        error::{Error, Result},
        fs::{BoxedReader, FileStat, FileSystem, LocalFileSystem},
        header::{padded_size, EntryType, Header, TarMeta, BLOCK_SIZE},
    },
    futures::future::BoxFuture,
    futures_lite::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, Cursor},
    std::{
        collections::VecDeque,
        path::PathBuf,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
        time::{SystemTime, UNIX_EPOCH},
    },
};

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;
const DEFAULT_LINK_MODE: u32 = 0o777;

enum Source<'a> {
    Reader { reader: BoxedReader<'a>, size: u64 },
    Path(PathBuf),
    Empty,
}

/// How to build one entry: where its data comes from plus metadata overrides.
///
/// Unset metadata is taken from the filesystem for path-backed entries and
/// otherwise defaults to mode 0644 (0755 for directories, 0777 for links),
/// the current time, and uid/gid 0.
pub struct EntryOptions<'a> {
    source: Source<'a>,
    entry_type: Option<EntryType>,
    link_name: Option<String>,
    file_mode: Option<u32>,
    mtime: Option<u64>,
    uid: Option<u32>,
    gid: Option<u32>,
    owner: Option<String>,
    group: Option<String>,
    device: Option<(u32, u32)>,
}

impl<'a> EntryOptions<'a> {
    fn with_source(source: Source<'a>) -> Self {
        Self {
            source,
            entry_type: None,
            link_name: None,
            file_mode: None,
            mtime: None,
            uid: None,
            gid: None,
            owner: None,
            group: None,
            device: None,
        }
    }
    /// Regular file whose `size` bytes are read from `reader`.
    pub fn reader<R: AsyncRead + Unpin + Send + 'a>(reader: R, size: u64) -> Self {
        Self::with_source(Source::Reader {
            reader: Box::new(reader),
            size,
        })
    }
    /// Regular file with in-memory content.
    pub fn bytes<B: Into<Vec<u8>>>(data: B) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::reader(Cursor::new(data), size)
    }
    /// File or directory read from the [`FileSystem`] when the archive is streamed.
    pub fn path<P: Into<PathBuf>>(path: P) -> Self {
        Self::with_source(Source::Path(path.into()))
    }
    pub fn directory() -> Self {
        Self::with_source(Source::Empty).entry_type(EntryType::Directory)
    }
    pub fn symlink<L: Into<String>>(target: L) -> Self {
        let mut opts = Self::with_source(Source::Empty).entry_type(EntryType::Symlink);
        opts.link_name = Some(target.into());
        opts
    }
    pub fn hard_link<L: Into<String>>(target: L) -> Self {
        let mut opts = Self::with_source(Source::Empty).entry_type(EntryType::Link);
        opts.link_name = Some(target.into());
        opts
    }
    pub fn entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }
    pub fn mode(mut self, mode: u32) -> Self {
        self.file_mode = Some(mode);
        self
    }
    /// Modification time in seconds since the Unix epoch.
    pub fn mtime(mut self, mtime: u64) -> Self {
        self.mtime = Some(mtime);
        self
    }
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }
    pub fn owner<S: Into<String>>(mut self, owner: S) -> Self {
        self.owner = Some(owner.into());
        self
    }
    pub fn group<S: Into<String>>(mut self, group: S) -> Self {
        self.group = Some(group.into());
        self
    }
    /// Device numbers, for character and block device entries.
    pub fn device(mut self, major: u32, minor: u32) -> Self {
        self.device = Some((major, minor));
        self
    }
}

struct QueuedEntry<'a> {
    meta: TarMeta,
    source: Source<'a>,
}

/// Collects entries for a tar archive.
pub struct TarBuilder<'a> {
    entries: VecDeque<QueuedEntry<'a>>,
    fs: Arc<dyn FileSystem>,
}

impl Default for TarBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> TarBuilder<'a> {
    /// Builder reading path-backed entries from the host filesystem.
    pub fn new() -> Self {
        Self::with_file_system(Arc::new(LocalFileSystem))
    }
    pub fn with_file_system(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            entries: VecDeque::new(),
            fs,
        }
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// Queues an entry named `name`.
    ///
    /// Everything that can be checked without touching the filesystem is
    /// checked here: a rejected entry leaves the builder unchanged.
    pub fn append<N: Into<String>>(&mut self, name: N, options: EntryOptions<'a>) -> Result<()> {
        let EntryOptions {
            source,
            entry_type,
            link_name,
            file_mode,
            mtime,
            uid,
            gid,
            owner,
            group,
            device,
        } = options;
        let entry_type = entry_type.unwrap_or(EntryType::File);
        let file_size = match &source {
            Source::Reader { size, .. } => Some(*size),
            Source::Path(_) => None,
            Source::Empty => Some(0),
        };
        if !entry_type.has_data() && file_size.is_some_and(|size| size > 0) {
            return Err(Error::InvalidEntry(format!(
                "{} entries cannot carry data",
                entry_type
            )));
        }
        if entry_type.is_link() && link_name.is_none() {
            return Err(Error::InvalidEntry(format!(
                "{} entry without a link target",
                entry_type
            )));
        }
        let mut meta = TarMeta {
            file_mode,
            mtime,
            uid,
            gid,
            owner,
            group,
            file_size,
            link_name,
            device,
            ..TarMeta::new(name, entry_type)
        };
        if !matches!(source, Source::Path(_)) {
            apply_defaults(&mut meta, None);
        }
        Header::encode(&meta)?;
        tracing::debug!(
            target: "tar",
            "append {:?} type={} size={:?}",
            meta.file_name,
            meta.entry_type,
            meta.file_size
        );
        self.entries.push_back(QueuedEntry { meta, source });
        Ok(())
    }
    /// The archive as a lazy byte stream.
    pub fn into_reader(self) -> TarStream<'a> {
        TarStream {
            entries: self.entries,
            fs: self.fs,
            stage: Stage::Next,
        }
    }
    /// Streams the archive into `writer` and returns the number of bytes
    /// written. The writer is flushed but not closed.
    pub async fn write_to<W: AsyncWrite + Unpin>(self, mut writer: W) -> io::Result<u64> {
        let written = io::copy(self.into_reader(), &mut writer).await?;
        writer.flush().await?;
        Ok(written)
    }
}

fn apply_defaults(meta: &mut TarMeta, stat: Option<&FileStat>) {
    if let Some(stat) = stat {
        if stat.is_dir && meta.entry_type == EntryType::File {
            meta.entry_type = EntryType::Directory;
        }
        meta.file_size = Some(if meta.entry_type.has_data() {
            stat.size
        } else {
            0
        });
        meta.file_mode.get_or_insert(stat.mode);
        meta.mtime.get_or_insert(stat.mtime);
        meta.uid.get_or_insert(stat.uid);
        meta.gid.get_or_insert(stat.gid);
    }
    meta.file_mode.get_or_insert(match meta.entry_type {
        EntryType::Directory => DEFAULT_DIR_MODE,
        EntryType::Link | EntryType::Symlink => DEFAULT_LINK_MODE,
        _ => DEFAULT_FILE_MODE,
    });
    meta.mtime.get_or_insert_with(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    });
    meta.uid.get_or_insert(0);
    meta.gid.get_or_insert(0);
}

type OpenFuture = BoxFuture<'static, io::Result<(FileStat, Option<BoxedReader<'static>>)>>;

enum Stage<'a> {
    Next,
    Opening {
        meta: TarMeta,
        fut: OpenFuture,
    },
    Header {
        header: Box<Header>,
        pos: usize,
        body: Option<(BoxedReader<'a>, u64)>,
    },
    Body {
        reader: BoxedReader<'a>,
        remaining: u64,
        size: u64,
    },
    Zeros {
        left: u64,
        last: bool,
    },
    Done,
}

impl<'a> Stage<'a> {
    fn header(meta: &TarMeta, body: Option<BoxedReader<'a>>) -> Result<Self> {
        let header = Header::encode(meta)?;
        let size = meta.data_len();
        tracing::trace!(
            target: "tar",
            "tar_stream: header {:?} type={} size={}",
            meta.file_name,
            meta.entry_type,
            size
        );
        Ok(Stage::Header {
            header: Box::new(header),
            pos: 0,
            body: body.map(|reader| (reader, size)),
        })
    }
}

/// The archive bytes of a [`TarBuilder`], produced on demand.
///
/// Single pass: once drained, further reads return 0. An error from an entry
/// source is returned as is and ends the stream.
pub struct TarStream<'a> {
    entries: VecDeque<QueuedEntry<'a>>,
    fs: Arc<dyn FileSystem>,
    stage: Stage<'a>,
}

impl<'a> TarStream<'a> {
    fn open(&self, path: PathBuf) -> OpenFuture {
        let fs = Arc::clone(&self.fs);
        Box::pin(async move {
            let stat = fs.stat(&path).await?;
            let reader = if stat.is_dir {
                None
            } else {
                Some(fs.open(&path).await?)
            };
            Ok((stat, reader))
        })
    }
}

impl<'a> AsyncRead for TarStream<'a> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        loop {
            this.stage = match std::mem::replace(&mut this.stage, Stage::Done) {
                Stage::Next => match this.entries.pop_front() {
                    Some(QueuedEntry {
                        meta,
                        source: Source::Path(path),
                    }) => Stage::Opening {
                        fut: this.open(path),
                        meta,
                    },
                    Some(QueuedEntry {
                        meta,
                        source: Source::Reader { reader, .. },
                    }) => Stage::header(&meta, Some(reader))?,
                    Some(QueuedEntry {
                        meta,
                        source: Source::Empty,
                    }) => Stage::header(&meta, None)?,
                    None => {
                        tracing::trace!(target: "tar", "tar_stream: writing trailer");
                        Stage::Zeros {
                            left: 2 * BLOCK_SIZE as u64,
                            last: true,
                        }
                    }
                },
                Stage::Opening { mut meta, mut fut } => match fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.stage = Stage::Opening { meta, fut };
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Ready(Ok((stat, reader))) => {
                        apply_defaults(&mut meta, Some(&stat));
                        Stage::header(&meta, reader.map(|r| r as BoxedReader<'a>))?
                    }
                },
                Stage::Header {
                    header,
                    mut pos,
                    body,
                } => {
                    let n = std::cmp::min(buf.len(), BLOCK_SIZE - pos);
                    buf[..n].copy_from_slice(&header.as_bytes()[pos..pos + n]);
                    pos += n;
                    this.stage = if pos < BLOCK_SIZE {
                        Stage::Header { header, pos, body }
                    } else if let Some((reader, size)) = body {
                        Stage::Body {
                            reader,
                            remaining: size,
                            size,
                        }
                    } else {
                        Stage::Next
                    };
                    return Poll::Ready(Ok(n));
                }
                Stage::Body {
                    mut reader,
                    remaining,
                    size,
                } => {
                    if remaining == 0 {
                        tracing::trace!(
                            target: "tar",
                            "tar_stream: padding {} bytes",
                            padded_size(size) - size
                        );
                        Stage::Zeros {
                            left: padded_size(size) - size,
                            last: false,
                        }
                    } else {
                        let len = std::cmp::min(remaining, buf.len() as u64) as usize;
                        match Pin::new(&mut reader).poll_read(cx, &mut buf[..len]) {
                            Poll::Pending => {
                                this.stage = Stage::Body {
                                    reader,
                                    remaining,
                                    size,
                                };
                                return Poll::Pending;
                            }
                            Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                            Poll::Ready(Ok(0)) => {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "entry source ended before its declared size",
                                )))
                            }
                            Poll::Ready(Ok(n)) => {
                                this.stage = Stage::Body {
                                    reader,
                                    remaining: remaining - n as u64,
                                    size,
                                };
                                return Poll::Ready(Ok(n));
                            }
                        }
                    }
                }
                Stage::Zeros { left: 0, last } => {
                    if last {
                        return Poll::Ready(Ok(0));
                    }
                    Stage::Next
                }
                Stage::Zeros { left, last } => {
                    let n = std::cmp::min(left, buf.len() as u64) as usize;
                    buf[..n].fill(0);
                    this.stage = Stage::Zeros {
                        left: left - n as u64,
                        last,
                    };
                    return Poll::Ready(Ok(n));
                }
                Stage::Done => return Poll::Ready(Ok(0)),
            };
        }
    }
}
