//! On-disk storage for CouchDB config documents.
//!
//! Documents live as `<dir>/<name>.ini`. Writes replace the whole file via a
//! temporary sibling and a rename; the previous contents are kept as
//! `<dir>/<name>.ini.bak` by [`ConfigStore::backup`].

pub mod document;

pub use document::{ConfigDocument, Section};

use crate::error::{AppError, AppResult};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extension of every managed document
pub const DOCUMENT_EXTENSION: &str = "ini";

/// A document read from the store, remembering whether a file backed it.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub document: ConfigDocument,
    pub existed: bool,
}

/// Reads and writes config documents in one directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn document_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, DOCUMENT_EXTENSION))
    }

    /// Load and parse a document, or `None` if its file does not exist.
    pub fn load(&self, name: &str) -> AppResult<Option<ConfigDocument>> {
        let path = self.document_path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::config_io(path, e)),
        };
        ConfigDocument::parse(name, path, &text).map(Some)
    }

    /// Load a document, starting from an empty one when no file exists.
    pub fn load_or_empty(&self, name: &str) -> AppResult<LoadedDocument> {
        match self.load(name)? {
            Some(document) => Ok(LoadedDocument {
                document,
                existed: true,
            }),
            None => Ok(LoadedDocument {
                document: ConfigDocument::empty(name, self.document_path(name)),
                existed: false,
            }),
        }
    }

    /// Copy the document's current file to its `.bak` sibling.
    ///
    /// Overwrites any earlier backup. Returns `None` when there is no file
    /// to back up.
    pub fn backup(&self, document: &ConfigDocument) -> AppResult<Option<PathBuf>> {
        let path = document.path();
        if !path.exists() {
            return Ok(None);
        }
        let backup = backup_path(path);
        fs::copy(path, &backup).map_err(|e| AppError::config_io(&backup, e))?;
        debug!("Backed up {} to {}", path.display(), backup.display());
        Ok(Some(backup))
    }

    /// Write the complete rendering of `document` over its file.
    ///
    /// The directory must already exist.
    pub fn persist(&self, document: &ConfigDocument) -> AppResult<()> {
        let path = document.path();
        let tmp = sibling_with_suffix(path, ".tmp");

        fs::write(&tmp, document.render()).map_err(|e| AppError::config_io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(AppError::config_io(path, e));
        }
        debug!("Wrote {}", path.display());
        Ok(())
    }

    /// Put the `.bak` copy of a document back in place.
    pub fn restore(&self, name: &str) -> AppResult<PathBuf> {
        let path = self.document_path(name);
        let backup = backup_path(&path);
        fs::copy(&backup, &path).map_err(|e| AppError::config_io(&backup, e))?;
        Ok(path)
    }
}

/// `<file>.bak` next to `<file>`.
pub fn backup_path(path: &Path) -> PathBuf {
    sibling_with_suffix(path, ".bak")
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
