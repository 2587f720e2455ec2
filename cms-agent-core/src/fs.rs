use std::{
    fs::{File, OpenOptions, TryLockError},
    io::{self, Write},
    path::{Path, PathBuf},
};

use tracing::warn;

/// Contents written and synced next to their destination but not yet
/// visible there. Dropping an uncommitted file removes it.
#[derive(Debug)]
pub(crate) struct StagedFile {
    tmp: Option<PathBuf>,
    dest: PathBuf,
}

impl StagedFile {
    pub(crate) fn write(dest: &Path, bytes: &[u8]) -> io::Result<Self> {
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let tmp =
            dest.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        let staged = Self {
            tmp: Some(tmp.clone()),
            dest: dest.to_path_buf(),
        };
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        Ok(staged)
    }

    /// Renames the staged contents over the destination in one step, so
    /// readers see either the old or the new contents.
    pub(crate) fn commit(mut self) -> io::Result<()> {
        let Some(tmp) = self.tmp.take() else {
            return Ok(());
        };
        if let Err(err) = std::fs::rename(&tmp, &self.dest) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(tmp) = self.tmp.take() {
            let _ = std::fs::remove_file(tmp);
        }
    }
}

/// The contents `path` held before a replacement, kept so the replacement
/// can be undone.
#[derive(Debug)]
pub(crate) struct Previous {
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl Previous {
    /// Links (or copies) the current contents of `path` aside. A missing
    /// file is remembered as absent.
    pub(crate) fn keep(path: &Path) -> io::Result<Self> {
        let backup = path.with_extension("prev");
        match std::fs::remove_file(&backup) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let kept = match std::fs::hard_link(path, &backup) {
            Ok(()) => Some(backup),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(_) => match std::fs::copy(path, &backup) {
                Ok(_) => Some(backup),
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => return Err(err),
            },
        };
        Ok(Self {
            path: path.to_path_buf(),
            backup: kept,
        })
    }

    /// Puts the kept contents back, or removes `path` if there were none.
    pub(crate) fn restore(mut self) {
        let result = match self.backup.take() {
            Some(backup) => std::fs::rename(&backup, &self.path),
            None => std::fs::remove_file(&self.path),
        };
        if let Err(err) = result {
            warn!(
                path = %self.path.display(),
                error = %err,
                "could not roll back replaced file"
            );
        }
    }

    pub(crate) fn discard(mut self) {
        if let Some(backup) = self.backup.take() {
            let _ = std::fs::remove_file(backup);
        }
    }
}

impl Drop for Previous {
    fn drop(&mut self) {
        if let Some(backup) = self.backup.take() {
            let _ = std::fs::remove_file(backup);
        }
    }
}

/// Exclusive advisory lock on a file, held until dropped. Processes sharing
/// an output directory contend on the same file.
#[derive(Debug)]
pub(crate) struct RunLock {
    file: File,
}

impl RunLock {
    /// Returns `None` while another holder has the lock.
    pub(crate) fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Some(Self { file })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(err)) => Err(err),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Best-effort fsync of the directory holding `path` to persist renames.
pub(crate) fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}
