//! Durable metadata store: one JSON document holding every image's edit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use darkroom_pipeline::{MetadataStore, PersistedEdit, StoreError};
use tracing::debug;

/// Edits for many images kept in a single JSON file.
///
/// Every save rewrites the whole file through a sibling temporary file
/// so a crash mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    edits: BTreeMap<String, PersistedEdit>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file exists but cannot be read or
    /// parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let edits = match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), images = edits.len(), "opened session store");
        Ok(Self { path, edits })
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetadataStore for JsonFileStore {
    fn load(&self, image: &str) -> Result<Option<PersistedEdit>, StoreError> {
        Ok(self.edits.get(image).cloned())
    }

    fn save(&mut self, edit: &PersistedEdit) -> Result<(), StoreError> {
        self.edits.insert(edit.image.clone(), edit.clone());
        let json = serde_json::to_string_pretty(&self.edits)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
