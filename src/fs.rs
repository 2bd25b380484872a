//! Filesystem access for entries appended by path.
use {
    futures_lite::io::AsyncRead,
    smol::fs,
    std::{io, path::Path, time::UNIX_EPOCH},
};

/// Owned, type-erased byte source.
pub type BoxedReader<'a> = Box<dyn AsyncRead + Unpin + Send + 'a>;

/// The subset of file metadata that goes into a tar header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: u64,
    /// Permission bits only, without the file type.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub is_dir: bool,
}

/// Source of metadata and content for path-backed entries.
///
/// [`crate::TarBuilder`] calls `stat` and then `open` only when its output
/// stream reaches the entry.
#[async_trait::async_trait]
pub trait FileSystem: Send + Sync {
    async fn stat(&self, path: &Path) -> io::Result<FileStat>;
    async fn open(&self, path: &Path) -> io::Result<BoxedReader<'static>>;
}

/// [`FileSystem`] backed by the host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

#[async_trait::async_trait]
impl FileSystem for LocalFileSystem {
    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let md = fs::metadata(path).await?;
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        #[cfg(unix)]
        let (mode, uid, gid) = {
            use std::os::unix::fs::MetadataExt;
            (md.mode() & 0o7777, md.uid(), md.gid())
        };
        #[cfg(not(unix))]
        let (mode, uid, gid) = (if md.is_dir() { 0o755 } else { 0o644 }, 0, 0);
        Ok(FileStat {
            size: if md.is_dir() { 0 } else { md.len() },
            mtime,
            mode,
            uid,
            gid,
            is_dir: md.is_dir(),
        })
    }
    async fn open(&self, path: &Path) -> io::Result<BoxedReader<'static>> {
        tracing::trace!(target: "tar", "opening {}", path.display());
        Ok(Box::new(fs::File::open(path).await?))
    }
}
