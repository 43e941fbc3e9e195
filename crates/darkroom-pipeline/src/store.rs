//! Persisted edit state and the metadata store interface.
//!
//! The core only defines the serialized form and the [`MetadataStore`]
//! trait. [`MemoryStore`] keeps serialized JSON in memory; durable
//! backends live with whatever owns the filesystem.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::history::HistoryItem;
use crate::instance::InstanceId;
use crate::operation::ParamBlock;

/// One module instance in serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedInstance {
    /// Instance identifier.
    pub id: InstanceId,
    /// Module name.
    pub module: String,
    /// Current parameters.
    pub params: ParamBlock,
    /// Enabled flag.
    pub enabled: bool,
    /// Priority.
    pub priority: i32,
    /// Insertion order.
    pub position: u32,
}

/// Everything persisted for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEdit {
    /// Image identity.
    pub image: String,
    /// Instances in insertion order.
    pub instances: Vec<PersistedInstance>,
    /// Full history, including any redo tail.
    pub history: Vec<HistoryItem>,
    /// Number of applied history items.
    pub cursor: usize,
    /// Position the next added instance receives. Identifiers of
    /// removed instances are never handed out again.
    #[serde(default)]
    pub next_position: u32,
}

/// Errors from a metadata store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A thread panicked while holding the store lock.
    #[error("metadata store lock is poisoned")]
    Poisoned,

    /// Reading or writing the backing storage failed.
    #[error("metadata store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be (de)serialized.
    #[error("metadata store serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-image edit storage.
pub trait MetadataStore: Send {
    /// The edit stored for `image`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the stored data cannot be read.
    fn load(&self, image: &str) -> Result<Option<PersistedEdit>, StoreError>;

    /// Replace the edit stored for `edit.image`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the edit cannot be written.
    fn save(&mut self, edit: &PersistedEdit) -> Result<(), StoreError>;
}

/// In-memory store holding serialized JSON per image.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    edits: HashMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of images with stored edits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

impl MetadataStore for MemoryStore {
    fn load(&self, image: &str) -> Result<Option<PersistedEdit>, StoreError> {
        self.edits
            .get(image)
            .map(|json| serde_json::from_str(json))
            .transpose()
            .map_err(StoreError::from)
    }

    fn save(&mut self, edit: &PersistedEdit) -> Result<(), StoreError> {
        let json = serde_json::to_string(edit)?;
        self.edits.insert(edit.image.clone(), json);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_image_loads_as_none() {
        let store = MemoryStore::new();
        assert!(store.load("nope.raw").unwrap().is_none());
    }

    #[test]
    fn save_replaces_previous_edit() {
        let mut store = MemoryStore::new();
        let mut edit = PersistedEdit {
            image: "a.raw".to_string(),
            instances: vec![PersistedInstance {
                id: InstanceId(0),
                module: "exposure".to_string(),
                params: ParamBlock::new(vec![1.0, 0.0]),
                enabled: true,
                priority: 250,
                position: 0,
            }],
            history: Vec::new(),
            cursor: 0,
            next_position: 1,
        };
        store.save(&edit).unwrap();
        edit.instances.clear();
        store.save(&edit).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.load("a.raw").unwrap().unwrap().instances.is_empty());
    }
}
