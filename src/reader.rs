//! Streaming tar reader.
//!
//! [`TarReader`] is a [`Stream`] of [`TarEntry`] values pulled one header at a
//! time from an [`AsyncRead`] source; nothing is read ahead. Every entry keeps
//! a handle to the reader state it came from and reads its data straight from
//! the underlying stream, capped at the size declared in its header.
//!
//! Entries do not have to be drained. Asking the stream for the next entry
//! skips whatever is left of the current one, padding included, and from then
//! on the superseded entry reports end of file.
use {
    crate::{
        error::{Error, Result},
        header::{padded_size, Header, TarMeta, BLOCK_SIZE},
    },
    async_lock::Mutex,
    futures_lite::{
        io::{self, AsyncRead},
        Stream,
    },
    pin_project_lite::pin_project,
    std::{
        future::Future,
        ops::Deref,
        pin::{pin, Pin},
        sync::Arc,
        task::{self, Context, Poll},
    },
};

const SKIP_BUFFER_SIZE: usize = 64 * 1024;

macro_rules! ready {
    ($e:expr $(,)?) => {
        match $e {
            Poll::Ready(Ok(t)) => t,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
            Poll::Pending => return Poll::Pending,
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadHeader,
    Entry,
    SkipEntry,
    Done,
}
use State::*;

pin_project! {
    /// Cursor shared between the reader and the entries it hands out.
    ///
    /// `pos` counts the bytes consumed from the stream. While an entry is
    /// current, `eof` is where its data ends and `end` is where its padding
    /// ends, i.e. where the next header starts.
    struct TarReaderInner<R> {
        pos: u64,
        eof: u64,
        end: u64,
        // bytes of the next header received so far
        filled: usize,
        state: State,
        header: Header,
        skip: Option<Box<[u8]>>,
        #[pin]
        reader: R,
    }
}

impl<R: AsyncRead> TarReaderInner<R> {
    fn new(reader: R) -> Self {
        Self {
            pos: 0,
            eof: 0,
            end: 0,
            filled: 0,
            state: ReadHeader,
            header: Header::new(),
            skip: None,
            reader,
        }
    }

    /// Advances to the next header, failing the whole stream on error.
    fn poll_next_entry(
        mut self: Pin<&mut Self>,
        ctx: &mut Context<'_>,
    ) -> Poll<Result<Option<(TarMeta, Header, u64)>>> {
        let res = task::ready!(self.as_mut().poll_advance(ctx));
        if res.is_err() {
            *self.project().state = Done;
        }
        Poll::Ready(res)
    }

    fn poll_advance(
        self: Pin<&mut Self>,
        ctx: &mut Context<'_>,
    ) -> Poll<Result<Option<(TarMeta, Header, u64)>>> {
        let mut this = self.project();
        loop {
            tracing::trace!(
                target: "tar",
                "tar.poll_advance: state={:?} pos={} end={}",
                *this.state,
                *this.pos,
                *this.end
            );
            match *this.state {
                ReadHeader => {
                    let filled = *this.filled;
                    let n = ready!(this
                        .reader
                        .as_mut()
                        .poll_read(ctx, &mut this.header.as_mut_bytes()[filled..]));
                    if n == 0 {
                        if filled > 0 {
                            return Poll::Ready(Err(Error::TruncatedHeader(filled)));
                        }
                        tracing::trace!(
                            target: "tar",
                            "tar.poll_advance: stream ended without trailer at pos={}",
                            *this.pos
                        );
                        *this.state = Done;
                        return Poll::Ready(Ok(None));
                    }
                    *this.pos += n as u64;
                    *this.filled += n;
                    if *this.filled < BLOCK_SIZE {
                        continue;
                    }
                    *this.filled = 0;
                    let meta = match this.header.decode()? {
                        Some(meta) => meta,
                        None => {
                            tracing::trace!(
                                target: "tar",
                                "tar.poll_advance: end of archive at pos={}",
                                *this.pos
                            );
                            *this.state = Done;
                            return Poll::Ready(Ok(None));
                        }
                    };
                    let size = meta.data_len();
                    *this.eof = *this.pos + size;
                    *this.end = *this.pos + padded_size(size);
                    *this.state = if size == 0 { ReadHeader } else { Entry };
                    tracing::trace!(
                        target: "tar",
                        "tar.poll_advance: entry {:?} type={} size={}",
                        meta.file_name,
                        meta.entry_type,
                        size
                    );
                    return Poll::Ready(Ok(Some((meta, this.header.clone(), *this.eof))));
                }
                Entry => {
                    // the current entry was not drained by its reader
                    tracing::trace!(
                        target: "tar",
                        "tar.poll_advance: skipping {} unread bytes",
                        *this.end - *this.pos
                    );
                    *this.state = SkipEntry;
                }
                SkipEntry => {
                    let remaining = *this.end - *this.pos;
                    if remaining == 0 {
                        this.skip.take();
                        *this.state = ReadHeader;
                        continue;
                    }
                    // padding fits the header buffer, which is about to be
                    // overwritten anyway
                    let buf: &mut [u8] = if remaining <= BLOCK_SIZE as u64 {
                        &mut this.header.as_mut_bytes()[..]
                    } else {
                        &mut this
                            .skip
                            .get_or_insert_with(|| vec![0u8; SKIP_BUFFER_SIZE].into_boxed_slice())[..]
                    };
                    let len = std::cmp::min(remaining, buf.len() as u64) as usize;
                    let n = ready!(this.reader.as_mut().poll_read(ctx, &mut buf[..len]));
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "unexpected end of archive while skipping entry",
                        )
                        .into()));
                    }
                    *this.pos += n as u64;
                }
                Done => return Poll::Ready(Ok(None)),
            }
        }
    }

    /// Reads data of the entry ending at `eof`.
    fn poll_read_data(
        self: Pin<&mut Self>,
        ctx: &mut Context<'_>,
        eof: u64,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        tracing::trace!(
            target: "tar",
            "entry.poll_read: buf.len={} pos={} eof={}",
            buf.len(),
            *this.pos,
            eof
        );
        if *this.state != Entry || *this.pos >= eof {
            return Poll::Ready(Ok(0));
        }
        let len = std::cmp::min(eof - *this.pos, buf.len() as u64) as usize;
        if len == 0 {
            return Poll::Ready(Ok(0));
        }
        let n = ready!(this.reader.as_mut().poll_read(ctx, &mut buf[..len]));
        if n == 0 {
            *this.state = Done;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of archive while reading entry",
            )));
        }
        *this.pos += n as u64;
        if *this.pos == eof {
            *this.state = if *this.pos == *this.end {
                ReadHeader
            } else {
                SkipEntry
            };
        }
        Poll::Ready(Ok(n))
    }
}

/// Stream tar entries from an `AsyncRead` source.
///
/// The source is borrowed for the lifetime of the reader and never closed by
/// it. Iteration ends at the first all-zero record or when the source runs
/// dry at a record boundary; after an error the stream yields nothing more.
pub struct TarReader<R> {
    inner: Arc<Mutex<Pin<Box<TarReaderInner<R>>>>>,
}

impl<R: AsyncRead> TarReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::pin(TarReaderInner::new(reader)))),
        }
    }
}

impl<R: AsyncRead> Stream for TarReader<R> {
    type Item = Result<TarEntry<R>>;
    fn poll_next(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let fut = this.inner.lock();
        let mut g = task::ready!(pin!(fut).poll(ctx));
        Poll::Ready(match task::ready!(g.as_mut().poll_next_entry(ctx)) {
            Ok(Some((meta, header, eof))) => Some(Ok(TarEntry {
                meta,
                header: Box::new(header),
                eof,
                inner: Arc::clone(&this.inner),
            })),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        })
    }
}

/// A single archive entry: decoded metadata plus an `AsyncRead` over its data.
///
/// Dereferences to [`TarMeta`], so `entry.file_name` and friends read like
/// plain fields.
pub struct TarEntry<R> {
    meta: TarMeta,
    header: Box<Header>,
    // stream position where the entry data ends
    eof: u64,
    inner: Arc<Mutex<Pin<Box<TarReaderInner<R>>>>>,
}

impl<R> TarEntry<R> {
    pub fn meta(&self) -> &TarMeta {
        &self.meta
    }
    pub fn into_meta(self) -> TarMeta {
        self.meta
    }
    /// The raw header record the entry was decoded from.
    pub fn header(&self) -> &Header {
        &self.header
    }
    /// Whether the entry data has been read to the end or skipped over.
    pub fn consumed(&self) -> bool {
        self.inner.lock_blocking().pos >= self.eof
    }
}

impl<R: AsyncRead> TarEntry<R> {
    /// Reads and drops whatever is left of the entry data.
    pub async fn discard(&mut self) -> io::Result<u64> {
        io::copy(self, io::sink()).await
    }
}

impl<R> Deref for TarEntry<R> {
    type Target = TarMeta;
    fn deref(&self) -> &TarMeta {
        &self.meta
    }
}

impl<R: AsyncRead> AsyncRead for TarEntry<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let fut = this.inner.lock();
        let mut g = task::ready!(pin!(fut).poll(ctx));
        g.as_mut().poll_read_data(ctx, this.eof, buf)
    }
}

impl<R> std::fmt::Debug for TarEntry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarEntry")
            .field("meta", &self.meta)
            .field("eof", &self.eof)
            .finish()
    }
}
