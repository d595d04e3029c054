//! Container access
//!
//! A [`Container`] offers read-only, repeatable access to the entries of a publication by
//! name. Packed publications are read through [`ZipContainer`], exploded ones through
//! [`DirectoryContainer`]. Entry names always use `/` separators and are relative to the
//! container root.

use std::{
    fmt,
    fs::File,
    io::{BufReader, Cursor, Read, Seek, SeekFrom},
    path::{Component, Path, PathBuf},
    sync::Mutex,
};

use walkdir::WalkDir;
use zip::{ZipArchive, result::ZipError};

use crate::error::PublicationError;

/// Read-only access to the entries of a publication container
pub trait Container: fmt::Debug + Send + Sync {
    /// Names of every file entry, in enumeration order
    fn entries(&self) -> Result<Vec<String>, PublicationError>;

    /// Opens an entry as a stream with known length
    fn read_entry(&self, name: &str) -> Result<ResourceStream, PublicationError>;

    fn entry_exists(&self, name: &str) -> bool;

    fn has_entries(&self) -> bool {
        self.entries()
            .map(|entries| !entries.is_empty())
            .unwrap_or(false)
    }

    /// Reads a whole entry into memory
    fn read_bytes(&self, name: &str) -> Result<Vec<u8>, PublicationError> {
        self.read_entry(name)?.read_to_vec()
    }
}

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// A byte stream with a known length
///
/// Every call to [`Container::read_entry`] returns a new instance, so concurrent readers of
/// the same entry never share a position.
pub struct ResourceStream {
    reader: Box<dyn ReadSeek>,
    length: u64,
}

impl fmt::Debug for ResourceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStream")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl ResourceStream {
    pub fn new(reader: Box<dyn ReadSeek>, length: u64) -> Self {
        Self { reader, length }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let length = bytes.len() as u64;
        Self::new(Box::new(Cursor::new(bytes)), length)
    }

    /// Declared length of the stream in bytes
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Reads the whole stream from its start
    pub fn read_to_vec(mut self) -> Result<Vec<u8>, PublicationError> {
        self.reader.seek(SeekFrom::Start(0))?;
        let mut data = Vec::with_capacity(self.length as usize);
        self.reader.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Reads up to `len` bytes starting at `offset`
    ///
    /// Fewer bytes are returned when the stream ends first.
    pub fn read_at(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, PublicationError> {
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity(len as usize);
        (&mut self.reader).take(len).read_to_end(&mut data)?;
        Ok(data)
    }

    /// Restricts the stream to `range`, clamped to the stream length
    pub fn restrict(mut self, range: ByteRange) -> Result<Self, PublicationError> {
        let range = range.clamp(self.length)?;
        let data = self.read_at(range.begin, range.len())?;
        Ok(Self::from_bytes(data))
    }
}

impl Read for ResourceStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

/// An inclusive byte range, as in an HTTP `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub begin: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// From `begin` to the end of the resource
    pub fn from_offset(begin: u64) -> Self {
        Self {
            begin,
            end: u64::MAX,
        }
    }

    /// Number of bytes covered by the range
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin).saturating_add(1)
    }

    /// Clamps the end to a resource of `length` bytes
    ///
    /// ## Return
    /// - `Err(PublicationError::InvalidRange)`: the range is reversed or starts past the
    ///   end of the resource
    pub fn clamp(&self, length: u64) -> Result<ByteRange, PublicationError> {
        if self.begin > self.end || self.begin >= length {
            return Err(PublicationError::InvalidRange {
                begin: self.begin,
                end: self.end,
                length,
            });
        }

        Ok(ByteRange {
            begin: self.begin,
            end: self.end.min(length - 1),
        })
    }
}

/// A packed publication
///
/// The archive is guarded by a mutex; entries are inflated into owned buffers so the
/// returned streams do not hold the lock.
pub struct ZipContainer<R: Read + Seek> {
    archive: Mutex<ZipArchive<R>>,
    entries: Vec<String>,
}

impl<R: Read + Seek> fmt::Debug for ZipContainer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipContainer")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl<R: Read + Seek> ZipContainer<R> {
    /// Opens an archive and records its entry names in central-directory order
    pub fn new(reader: R) -> Result<Self, PublicationError> {
        let mut archive = ZipArchive::new(reader)?;

        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let file = archive.by_index_raw(index)?;
            if !file.is_dir() {
                entries.push(file.name().to_string());
            }
        }

        Ok(Self {
            archive: Mutex::new(archive),
            entries,
        })
    }
}

impl ZipContainer<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PublicationError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek + Send> Container for ZipContainer<R> {
    fn entries(&self) -> Result<Vec<String>, PublicationError> {
        Ok(self.entries.clone())
    }

    fn read_entry(&self, name: &str) -> Result<ResourceStream, PublicationError> {
        let mut archive = self.archive.lock()?;
        let mut file = match archive.by_name(name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => {
                return Err(PublicationError::ResourceNotFound {
                    resource: name.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        Ok(ResourceStream::from_bytes(data))
    }

    fn entry_exists(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry == name)
    }
}

/// An exploded publication on the local filesystem
#[derive(Debug, Clone)]
pub struct DirectoryContainer {
    root: PathBuf,
}

impl DirectoryContainer {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an entry name to a filesystem path below the root
    fn entry_path(&self, name: &str) -> Result<PathBuf, PublicationError> {
        let relative = Path::new(name);
        let escapes = relative.components().any(|component| {
            matches!(
                component,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(PublicationError::RelativeLinkLeakage {
                path: name.to_string(),
            });
        }

        Ok(self.root.join(relative))
    }
}

impl Container for DirectoryContainer {
    fn entries(&self) -> Result<Vec<String>, PublicationError> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                let name = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push(name);
            }
        }
        Ok(entries)
    }

    fn read_entry(&self, name: &str) -> Result<ResourceStream, PublicationError> {
        let path = self.entry_path(name)?;
        if !path.is_file() {
            return Err(PublicationError::ResourceNotFound {
                resource: name.to_string(),
            });
        }

        let file = File::open(&path)?;
        let length = file.metadata()?.len();
        Ok(ResourceStream::new(Box::new(BufReader::new(file)), length))
    }

    fn entry_exists(&self, name: &str) -> bool {
        self.entry_path(name).is_ok_and(|path| path.is_file())
    }
}
