//! Streaming ustar archives over async I/O.
//!
//! [`TarReader`] turns any `AsyncRead` into a stream of [`TarEntry`] values,
//! each readable for its own data. [`TarBuilder`] queues entries and produces
//! the archive lazily through [`TarStream`]. [`Header`] is the 512-byte record
//! codec both sides share.

pub mod fs;
mod error;
mod header;
mod reader;
mod writer;

pub use {
    error::{Error, Result},
    fs::{BoxedReader, FileStat, FileSystem, LocalFileSystem},
    header::{EntryType, Flavor, Header, TarMeta, BLOCK_SIZE},
    reader::{TarEntry, TarReader},
    writer::{EntryOptions, TarBuilder, TarStream},
};
