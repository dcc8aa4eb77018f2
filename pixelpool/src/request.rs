//! Request keys: resource identity and byte-source access.
//!
//! A [`RequestKey`] names a decodable resource. It is the unit of identity
//! throughout the crate: the cache key, the aggregator's ordering token, and
//! the value a binding slot compares against on rebind. Two keys for the
//! same underlying resource must compare equal, so equality and hashing are
//! part of the contract (expressed as `Eq + Hash` bounds).
//!
//! Keys also know how to open their resource for decoding. A key that can
//! hand out a real file handle should do so ([`ByteSource::Handle`]); the
//! decode worker prefers that path over a generic byte stream to avoid an
//! extra copy.

use std::fmt;
use std::fs::File;
use std::hash::Hash;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Error opening the byte source behind a request key.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The resource cannot be located or opened.
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Input to a decode: either a direct file handle or a generic byte stream.
///
/// Decode workers check for [`ByteSource::Handle`] first. The stream form
/// exists for sources that have no file representation (network bodies,
/// in-memory blobs).
pub enum ByteSource {
    /// A local file, opened and ready to read.
    Handle(File),
    /// An arbitrary byte stream.
    Stream(Box<dyn Read + Send>),
}

impl ByteSource {
    /// Wraps an in-memory byte vector as a stream source.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::Stream(Box::new(std::io::Cursor::new(bytes)))
    }

    /// Returns true if this source is a direct file handle.
    pub fn is_direct_handle(&self) -> bool {
        matches!(self, Self::Handle(_))
    }

    /// Reads the entire source into a byte vector.
    pub fn read_all(self) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        match self {
            Self::Handle(mut file) => {
                file.read_to_end(&mut bytes)?;
            }
            Self::Stream(mut reader) => {
                reader.read_to_end(&mut bytes)?;
            }
        }
        Ok(bytes)
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(_) => write!(f, "ByteSource::Handle"),
            Self::Stream(_) => write!(f, "ByteSource::Stream"),
        }
    }
}

/// Identity of a decodable resource.
///
/// Implementations must derive equality and hashing purely from the
/// identifying content (a path, a URL, an asset id) so that independent
/// binding slots requesting the same resource share one cache entry.
///
/// `open_source` is called on a decode worker, never on the caller's
/// context, so it may perform blocking I/O.
pub trait RequestKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Opens the resource for reading.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unavailable`] if the resource cannot be
    /// located or opened. The failure surfaces to observers as the `Failed`
    /// load state; it is never propagated out of `bind`.
    fn open_source(&self) -> Result<ByteSource, SourceError>;

    /// Returns true if [`open_source`](Self::open_source) can produce a
    /// direct file handle.
    ///
    /// Callers use this to prefer the cheaper handle path before falling
    /// back to a generic stream.
    fn supports_direct_handle(&self) -> bool {
        false
    }
}

/// A request key backed by a file on the local filesystem.
///
/// Identity is the path. Two `FileKey`s for the same path compare equal and
/// hash identically, regardless of which slot created them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    path: PathBuf,
}

impl FileKey {
    /// Creates a key for the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path this key identifies.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RequestKey for FileKey {
    fn open_source(&self) -> Result<ByteSource, SourceError> {
        let file = File::open(&self.path)
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", self.path.display(), e)))?;
        Ok(ByteSource::Handle(file))
    }

    fn supports_direct_handle(&self) -> bool {
        true
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;
    use std::io::Write;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_file_key_equality_is_path_based() {
        let a = FileKey::new("/tmp/picture.jpg");
        let b = FileKey::new("/tmp/picture.jpg");
        let c = FileKey::new("/tmp/other.jpg");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_file_key_hash_consistent_with_equality() {
        let a = FileKey::new("/tmp/picture.jpg");
        let b = FileKey::new("/tmp/picture.jpg");

        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_file_key_supports_direct_handle() {
        let key = FileKey::new("/tmp/picture.jpg");
        assert!(key.supports_direct_handle());
    }

    #[test]
    fn test_file_key_opens_existing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"pixels").unwrap();

        let key = FileKey::new(file.path());
        let source = key.open_source().unwrap();
        assert!(source.is_direct_handle());
        assert_eq!(source.read_all().unwrap(), b"pixels");
    }

    #[test]
    fn test_file_key_missing_file_is_unavailable() {
        let key = FileKey::new("/nonexistent/path/to/picture.jpg");
        let err = key.open_source().unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[test]
    fn test_byte_source_from_bytes_reads_back() {
        let source = ByteSource::from_bytes(vec![1, 2, 3]);
        assert!(!source.is_direct_handle());
        assert_eq!(source.read_all().unwrap(), vec![1, 2, 3]);
    }
}
