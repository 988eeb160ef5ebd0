//! Local file storage with cached append handles.

use super::chunk::StreamOwner;
use super::PipelineError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

struct OpenFile {
    owner: Option<StreamOwner>,
    file: Arc<Mutex<File>>,
}

/// File handles are opened lazily and kept until closed.
#[derive(Default)]
pub struct LocalStorage {
    files: Mutex<HashMap<PathBuf, OpenFile>>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_dir(&self, path: &Path) -> Result<(), PipelineError> {
        fs::create_dir_all(path).map_err(io_err(path))
    }

    fn handle(
        &self,
        owner: Option<&StreamOwner>,
        path: &Path,
    ) -> Result<Arc<Mutex<File>>, PipelineError> {
        let mut files = self.files.lock();
        if let Some(open) = files.get(path) {
            return Ok(Arc::clone(&open.file));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err(path))?;
        debug!(path = %path.display(), "Opened output file");
        let file = Arc::new(Mutex::new(file));
        files.insert(
            path.to_path_buf(),
            OpenFile {
                owner: owner.cloned(),
                file: Arc::clone(&file),
            },
        );
        Ok(file)
    }

    /// Append `data`, opening (and caching) the file on first use.
    pub fn append(
        &self,
        owner: Option<&StreamOwner>,
        path: &Path,
        data: &[u8],
    ) -> Result<(), PipelineError> {
        let file = self.handle(owner, path)?;
        let mut file = file.lock();
        file.write_all(data).map_err(io_err(path))
    }

    pub fn close(&self, path: &Path) -> bool {
        let removed = self.files.lock().remove(path);
        if let Some(open) = &removed {
            let _ = open.file.lock().flush();
        }
        removed.is_some()
    }

    /// Close every file opened on behalf of `owner`.
    pub fn close_owner(&self, owner: &StreamOwner) -> usize {
        let mut files = self.files.lock();
        let before = files.len();
        files.retain(|_, open| open.owner.as_ref() != Some(owner));
        before - files.len()
    }

    pub fn close_all(&self) -> usize {
        let mut files = self.files.lock();
        let n = files.len();
        files.clear();
        n
    }

    pub fn open_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Replace the contents of `path` in one write.
    pub fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::write(path, contents).map_err(io_err(path))
    }

    pub fn read_to_string(&self, path: &Path) -> Result<String, PipelineError> {
        fs::read_to_string(path).map_err(io_err(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_caches_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        let owner = StreamOwner::new("job", 1);
        let path = dir.path().join("job/1/trace.bin");

        storage.append(Some(&owner), &path, b"abc").unwrap();
        storage.append(Some(&owner), &path, b"def").unwrap();
        assert_eq!(storage.open_count(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");

        assert_eq!(storage.close_owner(&StreamOwner::new("job", 2)), 0);
        assert_eq!(storage.close_owner(&owner), 1);
        assert_eq!(storage.open_count(), 0);
        assert!(!storage.close(&path));
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        let path = dir.path().join("a/b/status");
        storage.write_file(&path, b"one").unwrap();
        storage.write_file(&path, b"two").unwrap();
        assert_eq!(storage.read_to_string(&path).unwrap(), "two");
        assert!(matches!(
            storage.read_to_string(&dir.path().join("missing")),
            Err(PipelineError::Io { .. })
        ));
    }
}
