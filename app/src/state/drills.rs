//! The drill library: built-in drills overlaid with `drills.json`.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use novadrill::{DrillError, DrillLibrary};

pub struct DrillStore {
    path: PathBuf,
    inner: RwLock<DrillLibrary>,
}

/// Built-ins merged with whatever `path` holds. A missing or unreadable file
/// leaves the built-ins alone.
pub fn load(path: &Path) -> DrillLibrary {
    let mut library = DrillLibrary::builtin();
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<DrillLibrary>(&contents) {
            Ok(stored) => {
                tracing::info!(
                    "loaded {} stored drills from {}",
                    stored.drills.len(),
                    path.display()
                );
                library.merge(stored);
            }
            Err(e) => tracing::warn!("failed to parse {}: {e}", path.display()),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("failed to read {}: {e}", path.display()),
    }
    library
}

impl DrillStore {
    pub fn new(path: PathBuf) -> Self {
        let library = load(&path);
        Self {
            path,
            inner: RwLock::new(library),
        }
    }

    /// Run `f` against the library under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&DrillLibrary) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Create an empty user drill and persist the user part of the library.
    pub fn create(&self, category: &str, name: &str) -> Result<String, DrillError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let key = guard.create_user_drill(category, name, chrono::Utc::now().timestamp_millis())?;
        self.persist(&guard);
        tracing::info!("created drill '{key}' in {category}");
        Ok(key)
    }

    fn persist(&self, library: &DrillLibrary) {
        if let Some(dir) = self.path.parent()
            && let Err(e) = std::fs::create_dir_all(dir)
        {
            tracing::warn!("failed to create drill dir {}: {e}", dir.display());
            return;
        }
        match serde_json::to_string_pretty(&library.user_only()) {
            Ok(contents) => {
                if let Err(e) = std::fs::write(&self.path, contents) {
                    tracing::warn!("failed to write {}: {e}", self.path.display());
                }
            }
            Err(e) => tracing::warn!("failed to serialize drills: {e}"),
        }
    }
}
