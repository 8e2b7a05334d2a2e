use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use nix::fcntl::{Flock, FlockArg};

use crate::core::error::{RTError, Result};

/// Reads `path`, treating a missing file as "no state yet".
pub fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RTError::storage_error(
            &format!("failed to read {}", path.display()),
            Some(Box::new(e)),
        )),
    }
}

/// Replaces `path` with `contents` through a uniquely named temporary
/// sibling and a rename, so readers only ever see the old or the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut prefix = OsString::from(".");
    prefix.push(path.file_name().unwrap_or_default());
    prefix.push(".");

    // Removed on drop unless persisted.
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    tmp.persist(path).map_err(|e| {
        RTError::storage_error(
            &format!("failed to replace {}", path.display()),
            Some(Box::new(e.error)),
        )
    })?;

    Ok(())
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Exclusive advisory lock on a `.<name>.lock` sibling of a state file,
/// held until dropped.
#[derive(Debug)]
pub struct StateLock {
    _lock: Flock<File>,
}

impl StateLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(sibling(path, "lock"))?;

        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno)?;

        Ok(Self { _lock: lock })
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(".");
    name.push(suffix);

    path.with_file_name(name)
}
