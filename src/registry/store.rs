use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::Result;

/// One small JSON record shared between every process on the host.
///
/// Mutations are read-modify-write under two locks: an in-process mutex and
/// an exclusive `flock` on a sibling `.lock` file. The new contents are
/// written to a temp file in the same directory, fsynced, then renamed over
/// the record, so a reader always sees either the old or the new snapshot.
#[derive(Debug)]
pub struct RecordStore<T> {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
    _record: PhantomData<fn() -> T>,
}

impl<T> RecordStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Open (creating the directory if needed) the record `<dir>/<name>.json`.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(format!("{name}.json")),
            lock_path: dir.join(format!("{name}.lock")),
            guard: Mutex::new(()),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the record, as reported by directory change events.
    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.path.file_name()
    }

    /// Read a consistent snapshot. A missing record reads as the default.
    pub fn load(&self) -> Result<T> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(T::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically apply `f` to the record and persist the result.
    ///
    /// `f` runs with both locks held; keep it free of I/O.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let _local = self.guard.lock();
        let lock_file = self.lock_file()?;
        lock_file.lock_exclusive()?;

        let mut record = self.load()?;
        let out = f(&mut record);
        self.persist(&record)?;

        // flock is released when lock_file drops
        drop(lock_file);
        Ok(out)
    }

    fn lock_file(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?)
    }

    fn persist(&self, record: &T) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let body = serde_json::to_vec_pretty(record)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
