//! Memory-mapped file I/O for zero-copy artifact parsing.
//!
//! The GGUF header, metadata and tensor data are read straight out of the
//! mapped pages; only dequantized weights are copied.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use scout_engine::LoadError;

/// A memory-mapped file handle.
///
/// The mapped region remains valid for the lifetime of this struct.
/// Dropping it unmaps the file.
pub struct MappedFile {
    mmap: Mmap,
    size: usize,
}

impl MappedFile {
    /// Map a file into memory.
    ///
    /// # Safety
    /// The file must not be modified while mapped. Model artifacts are
    /// treated as read-only.
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let io_err = |source| LoadError::Io {
            path: path.display().to_string(),
            source,
        };

        let file = File::open(path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len() as usize;

        // Safety: we treat the file as read-only and it won't be modified externally.
        let mmap = unsafe { Mmap::map(&file).map_err(io_err)? };

        Ok(MappedFile { mmap, size })
    }

    /// Get the full mapped data as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Get a subslice at the given offset and length.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8], LoadError> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                LoadError::Malformed(format!(
                    "slice [{offset}..+{len}] exceeds file size {}",
                    self.size
                ))
            })?;
        Ok(&self.mmap[offset..end])
    }

    /// Total file size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF1234").unwrap();
        let mapped = MappedFile::open(file.path()).unwrap();
        assert_eq!(mapped.size(), 8);
        assert_eq!(mapped.slice(4, 4).unwrap(), b"1234");
        assert!(matches!(mapped.slice(6, 4), Err(LoadError::Malformed(_))));
        assert!(mapped.slice(usize::MAX, 2).is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = MappedFile::open(Path::new("/nonexistent/model.gguf")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/model.gguf"));
    }
}
