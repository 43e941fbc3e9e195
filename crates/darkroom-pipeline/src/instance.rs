//! Module instances and the edit stack that holds them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::operation::ParamBlock;
use crate::registry::{ModuleDefinition, ModuleRegistry};
use crate::types::RegistryError;

/// Identifier of one instance within an edit stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One configured occurrence of an operation kind in an edit stack.
#[derive(Debug, Clone)]
pub struct ModuleInstance {
    id: InstanceId,
    definition: Arc<ModuleDefinition>,
    params: ParamBlock,
    enabled: bool,
    priority: i32,
    position: u32,
    version: u64,
}

impl ModuleInstance {
    pub(crate) fn new(id: InstanceId, definition: Arc<ModuleDefinition>, position: u32) -> Self {
        let params = definition.operation().init();
        Self {
            id,
            params,
            enabled: definition.default_enabled(),
            priority: definition.default_priority(),
            position,
            version: 0,
            definition,
        }
    }

    /// Identifier within the stack.
    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.id
    }

    /// The operation kind.
    #[must_use]
    pub const fn definition(&self) -> &Arc<ModuleDefinition> {
        &self.definition
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.definition.name()
    }

    /// Current parameters.
    #[must_use]
    pub const fn params(&self) -> &ParamBlock {
        &self.params
    }

    /// Default parameters of the operation kind.
    #[must_use]
    pub fn default_params(&self) -> &ParamBlock {
        self.definition.default_params()
    }

    /// Whether the instance takes part in pipelines.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Sort key within the stack.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Insertion order within the stack.
    #[must_use]
    pub const fn position(&self) -> u32 {
        self.position
    }

    /// Bumped on every change to parameters or the enabled flag.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Replace parameters and enabled flag. Returns `true` if anything
    /// changed.
    pub fn set_state(&mut self, params: ParamBlock, enabled: bool) -> bool {
        if self.params == params && self.enabled == enabled {
            return false;
        }
        self.params = params;
        self.enabled = enabled;
        self.version += 1;
        true
    }

    /// Override the priority.
    pub const fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    fn release(&mut self) {
        self.definition.operation().cleanup(&mut self.params);
    }
}

/// The ordered set of module instances for one image.
#[derive(Debug, Default)]
pub struct EditStack {
    instances: Vec<ModuleInstance>,
    next_position: u32,
}

impl EditStack {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate `name` and append it to the stack.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownModule`] if `name` is not
    /// registered.
    pub fn add(
        &mut self,
        registry: &ModuleRegistry,
        name: &str,
    ) -> Result<InstanceId, RegistryError> {
        let instance = registry.instantiate(name, self.next_position)?;
        self.next_position += 1;
        let id = instance.id();
        self.instances.push(instance);
        Ok(id)
    }

    /// Append an already-built instance, keeping positions unique.
    pub(crate) fn insert(&mut self, instance: ModuleInstance) {
        self.next_position = self.next_position.max(instance.position() + 1);
        self.instances.push(instance);
    }

    /// Never hand out a position below `position` again.
    pub(crate) fn reserve(&mut self, position: u32) {
        self.next_position = self.next_position.max(position);
    }

    /// Position (and identifier) the next added instance receives.
    #[must_use]
    pub const fn next_position(&self) -> u32 {
        self.next_position
    }

    /// Remove an instance, releasing its parameter block.
    pub fn remove(&mut self, id: InstanceId) -> Option<ModuleInstance> {
        let index = self.instances.iter().position(|i| i.id() == id)?;
        let mut instance = self.instances.remove(index);
        instance.release();
        Some(instance)
    }

    /// The instance with `id`.
    #[must_use]
    pub fn get(&self, id: InstanceId) -> Option<&ModuleInstance> {
        self.instances.iter().find(|i| i.id() == id)
    }

    /// Mutable access to the instance with `id`.
    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut ModuleInstance> {
        self.instances.iter_mut().find(|i| i.id() == id)
    }

    /// Instances in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleInstance> {
        self.instances.iter()
    }

    /// Instances in execution order: ascending priority, ties broken by
    /// insertion order.
    #[must_use]
    pub fn ordered(&self) -> Vec<&ModuleInstance> {
        let mut ordered: Vec<&ModuleInstance> = self.instances.iter().collect();
        ordered.sort_by_key(|i| i.priority());
        ordered
    }

    /// Number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns `true` if the stack holds no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Drop for EditStack {
    fn drop(&mut self) {
        for instance in &mut self.instances {
            instance.release();
        }
    }
}

/// One instance as captured by a [`StackSnapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// Instance the entry was taken from.
    pub instance: InstanceId,
    /// Operation kind.
    pub definition: Arc<ModuleDefinition>,
    /// Parameters at capture time.
    pub params: ParamBlock,
    /// Enabled flag at capture time.
    pub enabled: bool,
    /// Instance version at capture time.
    pub version: u64,
}

/// An immutable copy of an edit stack in execution order.
///
/// Pipelines are assembled from snapshots, so edits made after the
/// snapshot was taken never reach a pipeline that is already running.
#[derive(Debug, Clone, Default)]
pub struct StackSnapshot {
    entries: Vec<SnapshotEntry>,
}

impl StackSnapshot {
    /// Capture `stack`.
    #[must_use]
    pub fn capture(stack: &EditStack) -> Self {
        let entries = stack
            .ordered()
            .into_iter()
            .map(|i| SnapshotEntry {
                instance: i.id(),
                definition: Arc::clone(i.definition()),
                params: i.params().clone(),
                enabled: i.enabled(),
                version: i.version(),
            })
            .collect();
        Self { entries }
    }

    /// Entries in execution order.
    #[must_use]
    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// The entry for `instance`.
    #[must_use]
    pub fn get(&self, instance: InstanceId) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.instance == instance)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the snapshot holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
