//! Kernel source loading.
//!
//! Sources are read in full and handed to the driver untouched. A file that
//! yields fewer bytes than its reported size is treated as an error rather
//! than compiled half-read.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads kernel sources and binaries relative to a root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoader {
    root: PathBuf,
}

impl SourceLoader {
    /// A loader resolving names against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory names are resolved against.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a name resolves to. Absolute names are returned as-is.
    #[must_use]
    pub fn resolve(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root.join(name)
    }

    /// Reads a source file as UTF-8 text.
    ///
    /// # Errors
    ///
    /// [`Error::SourceNotFound`], [`Error::SourceRead`],
    /// [`Error::SourceTruncated`] or [`Error::SourceEncoding`].
    pub fn load_source(&self, name: impl AsRef<Path>) -> Result<String> {
        read_source(self.resolve(name))
    }

    /// Reads a program binary.
    ///
    /// # Errors
    ///
    /// [`Error::SourceNotFound`], [`Error::SourceRead`] or
    /// [`Error::SourceTruncated`].
    pub fn load_binary(&self, name: impl AsRef<Path>) -> Result<Vec<u8>> {
        read_bytes(&self.resolve(name))
    }
}

impl Default for SourceLoader {
    fn default() -> Self {
        Self::new("kernels")
    }
}

/// Reads a whole kernel source file.
///
/// # Errors
///
/// See [`SourceLoader::load_source`].
pub fn read_source(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let bytes = read_bytes(path)?;
    String::from_utf8(bytes).map_err(|_| Error::SourceEncoding(path.to_path_buf()))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let io_err = |source: io::Error| {
        if source.kind() == io::ErrorKind::NotFound {
            Error::SourceNotFound(path.to_path_buf())
        } else {
            Error::SourceRead {
                path: path.to_path_buf(),
                source,
            }
        }
    };

    let mut file = File::open(path).map_err(io_err)?;
    let expected = file.metadata().map_err(io_err)?.len() as usize;
    let mut bytes = Vec::with_capacity(expected);
    file.read_to_end(&mut bytes).map_err(io_err)?;
    if bytes.len() < expected {
        return Err(Error::SourceTruncated {
            path: path.to_path_buf(),
            read: bytes.len(),
            expected,
        });
    }
    debug!(path = %path.display(), bytes = bytes.len(), "kernel source loaded");
    Ok(bytes)
}
