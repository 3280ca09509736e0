//! Merges desired settings into the on-disk config documents.
//!
//! Reconciliation is a merge: entries overwrite only the keys they name,
//! everything else in the file is left as it was. Running the same targets
//! twice produces the same file contents.

use crate::error::{AppError, AppResult};
use crate::store::{ConfigStore, LoadedDocument};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One desired setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub section: String,
    pub key: String,
    pub value: String,
}

impl Entry {
    /// Numbers and booleans are stringified here.
    pub fn new(section: impl Into<String>, key: impl Into<String>, value: impl ToString) -> Self {
        Self {
            section: section.into(),
            key: key.into(),
            value: value.to_string(),
        }
    }
}

/// A named document and the entries it should contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTarget {
    pub name: String,
    pub entries: Vec<Entry>,
}

impl DocumentTarget {
    pub fn new(name: impl Into<String>, entries: Vec<Entry>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }
}

/// What happened to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub path: PathBuf,
    /// Backup written before the change, if the file existed
    pub backup: Option<PathBuf>,
    /// Whether the document content differs from what was on disk
    pub changed: bool,
}

#[derive(Debug)]
pub struct DocumentOutcome {
    pub name: String,
    pub result: AppResult<Applied>,
}

/// Per-document results of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub outcomes: Vec<DocumentOutcome>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn changed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(&o.result, Ok(applied) if applied.changed))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &AppError)> {
        self.outcomes.iter().filter_map(|o| match &o.result {
            Err(e) => Some((o.name.as_str(), e)),
            Ok(_) => None,
        })
    }

    /// Collapse into the first failure, if any.
    pub fn into_result(self) -> AppResult<Vec<Applied>> {
        self.outcomes.into_iter().map(|o| o.result).collect()
    }
}

/// Applies document targets to a config directory.
#[derive(Debug, Clone)]
pub struct ConfigReconciler {
    store: ConfigStore,
}

impl ConfigReconciler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: ConfigStore::new(dir),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Reconcile every target. A failing document does not stop the others
    /// and nothing is rolled back.
    pub fn reconcile(&self, targets: &[DocumentTarget]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for target in targets {
            let result = self.reconcile_document(target);
            match &result {
                Ok(applied) if applied.changed => {
                    info!("Reconciled {}", applied.path.display())
                }
                Ok(applied) => debug!("{} already up to date", applied.path.display()),
                Err(e) => warn!("Failed to reconcile '{}': {}", target.name, e),
            }
            report.outcomes.push(DocumentOutcome {
                name: target.name.clone(),
                result,
            });
        }
        report
    }

    fn reconcile_document(&self, target: &DocumentTarget) -> AppResult<Applied> {
        if !self.store.dir().is_dir() {
            return Err(AppError::config_io(
                self.store.dir(),
                io::Error::new(io::ErrorKind::NotFound, "config directory does not exist"),
            ));
        }

        let LoadedDocument {
            mut document,
            existed,
        } = self.store.load_or_empty(&target.name)?;

        // Apply in memory first; a rejected entry leaves the file and its
        // backup alone.
        let mut changed = !existed;
        for entry in &target.entries {
            changed |= document.set(&entry.section, &entry.key, &entry.value)?;
        }

        let backup = if existed {
            self.store.backup(&document)?
        } else {
            None
        };
        self.store.persist(&document)?;

        Ok(Applied {
            path: document.path().to_path_buf(),
            backup,
            changed,
        })
    }
}

/// Reconcile `targets` into the documents under `dir`.
pub fn reconcile(targets: &[DocumentTarget], dir: &Path) -> ReconcileReport {
    ConfigReconciler::new(dir).reconcile(targets)
}
