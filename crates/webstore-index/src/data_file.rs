//! Data files backing index entries

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// File operations the index needs. Engines that keep data files
/// somewhere other than the plain file system provide their own.
pub trait DataFiles: Send + Sync {
    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Size in bytes, `None` when the file does not exist.
    fn file_size(&self, path: &Path) -> io::Result<Option<u64>>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Data files below `dir`, recursively.
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    /// Removes the empty folders below `dir`, keeping `dir` itself.
    fn remove_empty_dirs(&self, dir: &Path) -> io::Result<()> {
        prune_dirs(dir).map(|_| ())
    }
}

/// Returns whether `dir` is empty afterwards.
fn prune_dirs(dir: &Path) -> io::Result<bool> {
    let items = match std::fs::read_dir(dir) {
        Ok(items) => items,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    let mut empty = true;
    for item in items {
        let path = item?.path();
        if path.is_dir() && prune_dirs(&path)? {
            std::fs::remove_dir(&path)?;
        } else {
            empty = false;
        }
    }
    Ok(empty)
}

/// Every file below `dir`. A missing `dir` holds nothing.
fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    let items = match std::fs::read_dir(dir) {
        Ok(items) => items,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for item in items {
        let path = item?.path();
        if path.is_dir() {
            walk(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFiles;

impl DataFiles for DiskFiles {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn file_size(&self, path: &Path) -> io::Result<Option<u64>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        walk(dir, &mut files)?;
        files.sort();
        Ok(files)
    }
}

struct HandleInner {
    /// Relative to the context root; `None` for memory-only objects.
    relative: Option<PathBuf>,
    absolute: Option<PathBuf>,
    bogus: AtomicBool,
    will_be_deleted: AtomicBool,
    files: Arc<dyn DataFiles>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if !self.will_be_deleted.load(Ordering::Acquire) {
            return;
        }
        let Some(path) = self.absolute.as_deref() else {
            return;
        };
        match self.files.remove(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed data file"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove data file"),
        }
    }
}

/// Shared handle to the file behind an index entry. The entry and every
/// transaction using the file hold a clone; a file flagged for deletion is
/// removed when the last clone goes away.
#[derive(Clone)]
pub struct DataFileHandle {
    inner: Arc<HandleInner>,
}

impl DataFileHandle {
    pub fn on_disk(root: &Path, relative: PathBuf, files: Arc<dyn DataFiles>) -> Self {
        let absolute = root.join(&relative);
        Self {
            inner: Arc::new(HandleInner {
                relative: Some(relative),
                absolute: Some(absolute),
                bogus: AtomicBool::new(false),
                will_be_deleted: AtomicBool::new(false),
                files,
            }),
        }
    }

    pub fn memory(files: Arc<dyn DataFiles>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                relative: None,
                absolute: None,
                bogus: AtomicBool::new(false),
                will_be_deleted: AtomicBool::new(false),
                files,
            }),
        }
    }

    /// Handle for a file that could not be allocated.
    pub(crate) fn bogus(files: Arc<dyn DataFiles>) -> Self {
        let handle = Self::memory(files);
        handle.inner.bogus.store(true, Ordering::Release);
        handle
    }

    pub fn is_memory(&self) -> bool {
        self.inner.absolute.is_none() && !self.is_bogus()
    }

    pub fn relative_path(&self) -> Option<&Path> {
        self.inner.relative.as_deref()
    }

    pub fn absolute_path(&self) -> Option<&Path> {
        self.inner.absolute.as_deref()
    }

    pub fn is_bogus(&self) -> bool {
        self.inner.bogus.load(Ordering::Acquire)
    }

    pub fn will_be_deleted(&self) -> bool {
        self.inner.will_be_deleted.load(Ordering::Acquire)
    }

    pub fn set_will_be_deleted(&self) {
        self.inner.will_be_deleted.store(true, Ordering::Release);
    }

    pub fn exists(&self) -> io::Result<bool> {
        match self.absolute_path() {
            Some(path) => self.inner.files.exists(path),
            None => Ok(false),
        }
    }

    pub fn file_size(&self) -> io::Result<Option<u64>> {
        match self.absolute_path() {
            Some(path) => self.inner.files.file_size(path),
            None => Ok(None),
        }
    }

    /// Number of live clones, the entry's own included.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_file(&self, other: &DataFileHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DataFileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFileHandle")
            .field("relative", &self.inner.relative)
            .field("bogus", &self.is_bogus())
            .field("will_be_deleted", &self.will_be_deleted())
            .field("holders", &self.holders())
            .finish()
    }
}
