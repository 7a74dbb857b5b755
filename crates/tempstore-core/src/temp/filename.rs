//! Unique hex-named temp files in a controlled directory.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{IoContext, StorageError};

/// Hands out collision-free temp-file names of the form
/// `<prefix><16-hex-digits>` under a single directory.
///
/// IDs are non-negative; `-1` is reserved as an error sentinel in
/// serialization records and is never produced.
pub struct FilenameGenerator {
    dir: PathBuf,
    prefix: String,
}

impl FilenameGenerator {
    /// Create the generator, making `dir` if it does not exist.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| StorageError::io(e, IoContext::new("mkdir").with_path(&dir)))?;
        Ok(FilenameGenerator {
            dir,
            prefix: prefix.into(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The canonical path for a previously issued ID.
    #[must_use]
    pub fn path_for(&self, id: i64) -> PathBuf {
        debug_assert!(id >= 0, "-1 is the error sentinel, not a file ID");
        self.dir
            .join(format!("{}{}", self.prefix, hex::encode(id.to_be_bytes())))
    }

    /// Draw a fresh random ID and create its file exclusively. Redraws on
    /// collision.
    pub fn make_random_filename(&self) -> Result<(i64, PathBuf), StorageError> {
        loop {
            // Top bit clear: IDs stay non-negative, -1 stays reserved.
            let id = (rand::rng().random::<u64>() >> 1) as i64;
            let path = self.path_for(id);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok((id, path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(path = %path.display(), "filename collision, redrawing");
                }
                Err(e) => {
                    return Err(StorageError::io(
                        e,
                        IoContext::new("create").with_path(&path),
                    ));
                }
            }
        }
    }

    /// If `old` is not where the generator now expects the file for `id`,
    /// move it there. Returns the canonical path.
    pub fn maybe_move(&self, old: &Path, id: i64) -> io::Result<PathBuf> {
        let canonical = self.path_for(id);
        if old != canonical && old.exists() {
            debug!(from = %old.display(), to = %canonical.display(), "re-homing temp file");
            fs::rename(old, &canonical)?;
        }
        Ok(canonical)
    }

    /// Delete every leftover file in the directory whose name starts with
    /// the prefix. Called on startup, before any file is handed out.
    pub fn wipe_existing_files(&self) -> Result<usize, StorageError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StorageError::io(e, IoContext::new("readdir").with_path(&self.dir)))?;
        let mut wiped = 0;
        for entry in entries {
            let entry =
                entry.map_err(|e| StorageError::io(e, IoContext::new("readdir").with_path(&self.dir)))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&self.prefix) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => wiped += 1,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to wipe stale temp file");
                }
            }
        }
        debug!(wiped, dir = %self.dir.display(), "wiped stale temp files");
        Ok(wiped)
    }
}
