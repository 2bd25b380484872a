//! Codec for the fixed 512-byte tar header record.
//!
//! [`Header`] is the raw record exactly as it travels on the wire, [`TarMeta`]
//! is the decoded view of it. Field offsets are spelled out once, in the
//! `#[repr(C)]` overlay below; every accessor goes through that overlay.
//!
//! Numbers are stored as NUL-terminated, zero-padded octal ASCII. The
//! checksum is the unsigned byte sum of the record with the checksum field
//! itself read as eight spaces, stored as six octal digits, NUL and a space.
//! Base-256 numbers (GNU extension for sizes over 8 GiB) are not supported.
use {
    crate::error::{Error, Result},
    std::fmt,
};

/// Size of every header and of the data alignment unit.
pub const BLOCK_SIZE: usize = 512;

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;
const OWNER_LEN: usize = 32;
const CKSUM_RANGE: std::ops::Range<usize> = 148..156;

/// Raw tar header record.
#[repr(C)]
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    record: [u8; BLOCK_SIZE],
}

#[repr(C)]
#[allow(missing_docs, dead_code)]
struct UstarHeader {
    name: [u8; NAME_LEN],
    mode: [u8; 8],
    uid: [u8; 8],
    gid: [u8; 8],
    size: [u8; 12],
    mtime: [u8; 12],
    cksum: [u8; 8],
    typeflag: [u8; 1],
    linkname: [u8; NAME_LEN],
    magic: [u8; 6],
    version: [u8; 2],
    uname: [u8; OWNER_LEN],
    gname: [u8; OWNER_LEN],
    dev_major: [u8; 8],
    dev_minor: [u8; 8],
    prefix: [u8; PREFIX_LEN],
    pad: [u8; 12],
}

/// Header dialect, as told by the magic and version fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// POSIX ustar: `"ustar\0"` followed by `"00"`.
    Ustar,
    /// GNU tar: `"ustar "` followed by `" \0"`. The prefix area holds GNU
    /// specific fields and is not part of the name.
    Gnu,
    /// Pre-POSIX (V7) header: only the fields up to the link name are meaningful.
    V7,
}

/// Entry kind stored in the type flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    File,
    Link,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
    Contiguous,
    /// Any flag this crate does not interpret (PAX and GNU extension records
    /// among others). The entry is passed through with its data intact.
    Other(u8),
}

impl EntryType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'0' | b'\0' => Self::File,
            b'1' => Self::Link,
            b'2' => Self::Symlink,
            b'3' => Self::CharDevice,
            b'4' => Self::BlockDevice,
            b'5' => Self::Directory,
            b'6' => Self::Fifo,
            b'7' => Self::Contiguous,
            b => Self::Other(b),
        }
    }
    pub fn byte(self) -> u8 {
        match self {
            Self::File => b'0',
            Self::Link => b'1',
            Self::Symlink => b'2',
            Self::CharDevice => b'3',
            Self::BlockDevice => b'4',
            Self::Directory => b'5',
            Self::Fifo => b'6',
            Self::Contiguous => b'7',
            Self::Other(b) => b,
        }
    }
    /// Whether the entry is followed by `size` bytes of data records.
    pub fn has_data(self) -> bool {
        matches!(self, Self::File | Self::Contiguous | Self::Other(_))
    }
    pub fn is_link(self) -> bool {
        matches!(self, Self::Link | Self::Symlink)
    }
    pub fn is_device(self) -> bool {
        matches!(self, Self::CharDevice | Self::BlockDevice)
    }
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Link => "link",
            Self::Symlink => "symlink",
            Self::CharDevice => "character-device",
            Self::BlockDevice => "block-device",
            Self::Directory => "directory",
            Self::Fifo => "fifo",
            Self::Contiguous => "contiguous-file",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(b) => write!(f, "other({})", b.escape_ascii()),
            kind => f.write_str(kind.as_str()),
        }
    }
}

/// Decoded header fields.
///
/// Optional fields are `None` when the corresponding header field is blank.
/// `link_name` is only set for links and `device` only for device nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarMeta {
    pub file_name: String,
    pub file_mode: Option<u32>,
    pub mtime: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub entry_type: EntryType,
    pub file_size: Option<u64>,
    pub link_name: Option<String>,
    pub device: Option<(u32, u32)>,
}

impl TarMeta {
    pub fn new<N: Into<String>>(file_name: N, entry_type: EntryType) -> Self {
        Self {
            file_name: file_name.into(),
            file_mode: None,
            mtime: None,
            uid: None,
            gid: None,
            owner: None,
            group: None,
            entry_type,
            file_size: None,
            link_name: None,
            device: None,
        }
    }
    /// Number of data bytes following the header in the archive.
    pub fn data_len(&self) -> u64 {
        if self.entry_type.has_data() {
            self.file_size.unwrap_or(0)
        } else {
            0
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hdr = self.ustar();
        f.debug_struct("Header")
            .field("flavor", &self.flavor())
            .field("type", &self.entry_type())
            .field("name", &String::from_utf8_lossy(null_terminated(&hdr.name)))
            .field("size", &String::from_utf8_lossy(null_terminated(&hdr.size)))
            .finish()
    }
}

impl Header {
    /// An all-zero record, which doubles as the end-of-archive marker.
    pub fn new() -> Self {
        Self {
            record: [0u8; BLOCK_SIZE],
        }
    }
    pub fn from_bytes(record: [u8; BLOCK_SIZE]) -> Self {
        Self { record }
    }
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.record
    }
    pub(crate) fn as_mut_bytes(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.record
    }
    fn ustar(&self) -> &UstarHeader {
        // SAFETY: UstarHeader is repr(C), 512 bytes long and made only of byte
        // arrays, so it has alignment 1 and any bit pattern is valid.
        unsafe { &*(self.record.as_ptr() as *const UstarHeader) }
    }
    fn ustar_mut(&mut self) -> &mut UstarHeader {
        // SAFETY: see `ustar`.
        unsafe { &mut *(self.record.as_mut_ptr() as *mut UstarHeader) }
    }
    pub fn is_zero(&self) -> bool {
        self.record.iter().all(|b| *b == 0)
    }
    pub fn flavor(&self) -> Flavor {
        let hdr = self.ustar();
        if hdr.magic == *b"ustar\0" && hdr.version == *b"00" {
            Flavor::Ustar
        } else if hdr.magic == *b"ustar " && hdr.version == *b" \0" {
            Flavor::Gnu
        } else {
            Flavor::V7
        }
    }
    pub fn entry_type(&self) -> EntryType {
        EntryType::from_byte(self.ustar().typeflag[0])
    }
    /// Checksum as recorded in the header.
    pub fn stored_checksum(&self) -> Result<u32> {
        octal(&self.ustar().cksum, "checksum").map(|v| v.unwrap_or(0) as u32)
    }
    /// Checksum of the record contents, with the checksum field read as spaces.
    pub fn computed_checksum(&self) -> u32 {
        self.record[..CKSUM_RANGE.start]
            .iter()
            .chain(&self.record[CKSUM_RANGE.end..])
            .map(|b| *b as u32)
            .sum::<u32>()
            + (b' ' as u32) * CKSUM_RANGE.len() as u32
    }
    /// Decode the record.
    ///
    /// Returns `Ok(None)` for the all-zero end-of-archive marker. The checksum
    /// is verified before any other field is looked at.
    pub fn decode(&self) -> Result<Option<TarMeta>> {
        if self.is_zero() {
            return Ok(None);
        }
        let stored = self.stored_checksum()?;
        let computed = self.computed_checksum();
        if stored != computed {
            return Err(Error::ChecksumMismatch { stored, computed });
        }
        let hdr = self.ustar();
        let flavor = self.flavor();
        let file_name = match flavor {
            Flavor::Ustar => ustar_path_name(&hdr.name, &hdr.prefix),
            Flavor::Gnu | Flavor::V7 => text(&hdr.name),
        };
        if file_name.is_empty() {
            return Err(Error::EmptyName);
        }
        let entry_type = match self.entry_type() {
            // V7 archives mark directories with a trailing slash only
            EntryType::File if flavor == Flavor::V7 && file_name.ends_with('/') => {
                EntryType::Directory
            }
            kind => kind,
        };
        let mut meta = TarMeta {
            file_mode: octal(&hdr.mode, "mode")?.map(|v| v as u32),
            mtime: octal(&hdr.mtime, "mtime")?,
            uid: octal(&hdr.uid, "uid")?.map(|v| v as u32),
            gid: octal(&hdr.gid, "gid")?.map(|v| v as u32),
            file_size: octal(&hdr.size, "size")?,
            ..TarMeta::new(file_name, entry_type)
        };
        if entry_type.is_link() {
            meta.link_name = Some(text(&hdr.linkname));
        }
        if flavor != Flavor::V7 {
            meta.owner = text_opt(&hdr.uname);
            meta.group = text_opt(&hdr.gname);
            if entry_type.is_device() {
                meta.device = Some((
                    octal(&hdr.dev_major, "device major")?.unwrap_or(0) as u32,
                    octal(&hdr.dev_minor, "device minor")?.unwrap_or(0) as u32,
                ));
            }
        }
        Ok(Some(meta))
    }
    /// Encode `meta` as a POSIX ustar header.
    ///
    /// Names longer than 100 bytes are split at a `/` into the prefix field;
    /// a name that cannot be split to fit is rejected rather than truncated.
    pub fn encode(meta: &TarMeta) -> Result<Self> {
        if meta.file_name.is_empty() {
            return Err(Error::EmptyName);
        }
        let mut header = Self::new();
        let hdr = header.ustar_mut();
        hdr.magic = *b"ustar\0";
        hdr.version = *b"00";
        let (prefix, name) = split_path(&meta.file_name)?;
        copy_text(&mut hdr.prefix, prefix, "file name prefix")?;
        copy_text(&mut hdr.name, name, "file name")?;
        format_octal(meta.file_mode.unwrap_or(0) as u64, &mut hdr.mode, "mode")?;
        format_octal(meta.uid.unwrap_or(0) as u64, &mut hdr.uid, "uid")?;
        format_octal(meta.gid.unwrap_or(0) as u64, &mut hdr.gid, "gid")?;
        format_octal(meta.file_size.unwrap_or(0), &mut hdr.size, "size")?;
        format_octal(meta.mtime.unwrap_or(0), &mut hdr.mtime, "mtime")?;
        hdr.typeflag[0] = meta.entry_type.byte();
        if let Some(link_name) = meta.link_name.as_deref() {
            copy_text(&mut hdr.linkname, link_name, "link name")?;
        }
        // owner and group must stay NUL-terminated
        if let Some(owner) = meta.owner.as_deref() {
            copy_text(&mut hdr.uname[..OWNER_LEN - 1], owner, "owner")?;
        }
        if let Some(group) = meta.group.as_deref() {
            copy_text(&mut hdr.gname[..OWNER_LEN - 1], group, "group")?;
        }
        let (major, minor) = meta.device.unwrap_or((0, 0));
        format_octal(major as u64, &mut hdr.dev_major, "device major")?;
        format_octal(minor as u64, &mut hdr.dev_minor, "device minor")?;
        header.finalize();
        Ok(header)
    }
    fn finalize(&mut self) {
        let checksum = self.computed_checksum();
        let hdr = self.ustar_mut();
        hdr.cksum = *b"      \0 ";
        let mut value = checksum;
        for slot in hdr.cksum[..6].iter_mut().rev() {
            *slot = b'0' + (value & 0o7) as u8;
            value >>= 3;
        }
    }
}

/// Rounds `n` up to the next multiple of [`BLOCK_SIZE`].
pub(crate) const fn padded_size(n: u64) -> u64 {
    n.saturating_add(BLOCK_SIZE as u64 - 1) & !(BLOCK_SIZE as u64 - 1)
}

fn null_terminated(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes
        .iter()
        .position(|b| *b == b'\0')
        .unwrap_or(bytes.len())]
}

/// Text field up to the first NUL. Bytes that are not UTF-8 are replaced
/// with U+FFFD.
fn text(field: &[u8]) -> String {
    String::from_utf8_lossy(null_terminated(field)).into_owned()
}

fn text_opt(field: &[u8]) -> Option<String> {
    Some(text(field)).filter(|s| !s.is_empty())
}

fn ustar_path_name(name: &[u8; NAME_LEN], prefix: &[u8; PREFIX_LEN]) -> String {
    let name = text(name);
    match text_opt(prefix) {
        Some(prefix) => format!("{}/{}", prefix, name),
        None => name,
    }
}

/// Splits `path` into the ustar `(prefix, name)` pair.
///
/// The split happens at the rightmost `/` that keeps the prefix within 155
/// bytes and leaves a non-empty name; the name must then fit in 100 bytes.
fn split_path(path: &str) -> Result<(&str, &str)> {
    if path.len() <= NAME_LEN {
        return Ok(("", path));
    }
    let too_long = || {
        Error::InvalidEntry(format!(
            "file name {:?} does not fit the ustar name and prefix fields",
            path
        ))
    };
    let pos = path
        .bytes()
        .enumerate()
        .filter(|(i, b)| *b == b'/' && *i > 0 && *i <= PREFIX_LEN && i + 1 < path.len())
        .map(|(i, _)| i)
        .last()
        .ok_or_else(too_long)?;
    let (prefix, name) = (&path[..pos], &path[pos + 1..]);
    if name.len() > NAME_LEN {
        return Err(too_long());
    }
    Ok((prefix, name))
}

fn copy_text(field: &mut [u8], value: &str, name: &'static str) -> Result<()> {
    if value.len() > field.len() {
        Err(Error::InvalidEntry(format!(
            "{} {:?} exceeds {} bytes",
            name,
            value,
            field.len()
        )))
    } else if value.bytes().any(|b| b == 0) {
        Err(Error::InvalidEntry(format!(
            "{} {:?} contains a NUL byte",
            name, value
        )))
    } else {
        field[..value.len()].copy_from_slice(value.as_bytes());
        Ok(())
    }
}

/// Parses an octal field. Leading spaces are skipped, the number ends at the
/// first NUL or space, and a blank field yields `None`.
fn parse_octal(field: &[u8]) -> std::result::Result<Option<u64>, &[u8]> {
    let start = field
        .iter()
        .position(|b| *b != b' ')
        .unwrap_or(field.len());
    let digits = null_terminated(&field[start..]);
    let digits = &digits[..digits
        .iter()
        .position(|b| *b == b' ')
        .unwrap_or(digits.len())];
    if digits.is_empty() {
        return Ok(None);
    }
    digits
        .iter()
        .try_fold(0u64, |n, d| match d {
            b'0'..=b'7' => n.checked_mul(8).map(|n| n | u64::from(d - b'0')),
            _ => None,
        })
        .map(Some)
        .ok_or(field)
}

fn octal(field: &[u8], name: &'static str) -> Result<Option<u64>> {
    parse_octal(field).map_err(|value| Error::InvalidNumber {
        field: name,
        value: String::from_utf8_lossy(value).into_owned(),
    })
}

/// Writes `val` as `field.len() - 1` zero-padded octal digits and a NUL.
fn format_octal(val: u64, field: &mut [u8], name: &'static str) -> Result<()> {
    let mut value = val;
    let mut len = field.len() - 1;
    field[len] = 0;
    while len > 0 {
        len -= 1;
        field[len] = b'0' + (value & 0o7) as u8;
        value >>= 3;
    }
    if value != 0 {
        return Err(Error::InvalidEntry(format!(
            "{} {} does not fit in {} octal digits",
            name,
            val,
            field.len() - 1
        )));
    }
    Ok(())
}
