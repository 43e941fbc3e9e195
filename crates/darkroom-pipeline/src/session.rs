//! The edit session for one image: edit stack, history, and change
//! notifications.
//!
//! Edits arrive as [`EditEvent`]s. Each accepted edit is appended to the
//! history, applied to the instance, and announced on every subscribed
//! channel as a [`SessionEvent`]. Pipelines never read the session
//! directly; they are assembled from a [`StackSnapshot`].

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::debug;

use crate::history::HistoryStack;
use crate::instance::{EditStack, InstanceId, ModuleInstance, StackSnapshot};
use crate::operation::ParamBlock;
use crate::registry::ModuleRegistry;
use crate::store::{PersistedEdit, PersistedInstance};
use crate::types::RegistryError;

/// An edit made by the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum EditEvent {
    /// Replace an instance's parameter block.
    ParameterChanged {
        /// Instance being edited.
        instance: InstanceId,
        /// The whole new parameter block.
        new_value: ParamBlock,
    },
    /// Turn an instance on or off.
    EnabledChanged {
        /// Instance being edited.
        instance: InstanceId,
        /// New enabled flag.
        enabled: bool,
    },
}

/// Notification sent to subscribers after the session changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Parameters or enabled flag of an instance changed.
    ParametersChanged(InstanceId),
    /// Instances were added or removed.
    StackChanged,
}

/// Errors from edit session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Module lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// No instance with this identifier exists in the stack.
    #[error("no instance {0} in the edit stack")]
    UnknownInstance(InstanceId),

    /// The module has no parameter with this name.
    #[error("module `{module}` has no parameter `{name}`")]
    UnknownParameter {
        /// Module name.
        module: String,
        /// Requested parameter name.
        name: String,
    },

    /// The parameter block has the wrong number of values.
    #[error("module `{module}` expects {expected} parameters, got {actual}")]
    ParamSize {
        /// Module name.
        module: String,
        /// Size declared by the module definition.
        expected: usize,
        /// Size of the block that was passed.
        actual: usize,
    },
}

/// Develop state for one image.
#[derive(Debug)]
pub struct EditSession {
    image: String,
    registry: Arc<ModuleRegistry>,
    stack: EditStack,
    history: HistoryStack,
    listeners: Vec<Sender<SessionEvent>>,
}

impl EditSession {
    /// Start an empty session for `image`.
    #[must_use]
    pub fn new(image: impl Into<String>, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            image: image.into(),
            registry,
            stack: EditStack::new(),
            history: HistoryStack::new(),
            listeners: Vec::new(),
        }
    }

    /// Restore a session from its persisted form.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Registry`] if a persisted module is not
    /// registered, or [`SessionError::ParamSize`] if its stored
    /// parameters no longer match the module's layout.
    pub fn from_persisted(
        registry: Arc<ModuleRegistry>,
        edit: PersistedEdit,
    ) -> Result<Self, SessionError> {
        let mut stack = EditStack::new();
        let recorded = edit.history.iter().map(|item| item.instance.0.saturating_add(1)).max();
        stack.reserve(edit.next_position.max(recorded.unwrap_or(0)));
        for persisted in edit.instances {
            let definition = registry.lookup(&persisted.module)?;
            check_size(&persisted.module, definition.param_size(), &persisted.params)?;
            let mut instance =
                ModuleInstance::new(persisted.id, Arc::clone(definition), persisted.position);
            instance.set_state(persisted.params, persisted.enabled);
            instance.set_priority(persisted.priority);
            stack.insert(instance);
        }
        debug!(
            image = %edit.image,
            instances = stack.len(),
            history = edit.history.len(),
            "restored edit session",
        );
        Ok(Self {
            image: edit.image,
            registry,
            stack,
            history: HistoryStack::from_parts(edit.history, edit.cursor),
            listeners: Vec::new(),
        })
    }

    /// Serialized form for the metadata store.
    #[must_use]
    pub fn to_persisted(&self) -> PersistedEdit {
        PersistedEdit {
            image: self.image.clone(),
            instances: self
                .stack
                .iter()
                .map(|i| PersistedInstance {
                    id: i.id(),
                    module: i.name().to_string(),
                    params: i.params().clone(),
                    enabled: i.enabled(),
                    priority: i.priority(),
                    position: i.position(),
                })
                .collect(),
            history: self.history.items().to_vec(),
            cursor: self.history.cursor(),
            next_position: self.stack.next_position(),
        }
    }

    /// Image identity.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Registry instances are created from.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// The edit stack.
    #[must_use]
    pub const fn stack(&self) -> &EditStack {
        &self.stack
    }

    /// The edit history.
    #[must_use]
    pub const fn history(&self) -> &HistoryStack {
        &self.history
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.push(tx);
        rx
    }

    /// Immutable copy of the stack for pipeline assembly.
    #[must_use]
    pub fn snapshot(&self) -> StackSnapshot {
        StackSnapshot::capture(&self.stack)
    }

    /// Add an instance of `module` to the stack.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Registry`] if `module` is not registered.
    pub fn add_module(&mut self, module: &str) -> Result<InstanceId, SessionError> {
        let id = self.stack.add(&self.registry, module)?;
        debug!(image = %self.image, module, instance = %id, "added module");
        self.notify(SessionEvent::StackChanged);
        Ok(id)
    }

    /// Remove an instance from the stack.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownInstance`] if it does not exist.
    pub fn remove_module(&mut self, id: InstanceId) -> Result<(), SessionError> {
        self.stack
            .remove(id)
            .ok_or(SessionError::UnknownInstance(id))?;
        debug!(image = %self.image, instance = %id, "removed module");
        self.notify(SessionEvent::StackChanged);
        Ok(())
    }

    /// Apply an edit, record it in history, and notify subscribers.
    /// Returns the history sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownInstance`] or
    /// [`SessionError::ParamSize`] if the edit cannot apply.
    pub fn apply(&mut self, event: EditEvent) -> Result<u64, SessionError> {
        let (id, params, enabled) = match event {
            EditEvent::ParameterChanged {
                instance,
                new_value,
            } => {
                let current = self.instance(instance)?;
                check_size(current.name(), current.params().len(), &new_value)?;
                (instance, new_value, current.enabled())
            }
            EditEvent::EnabledChanged { instance, enabled } => {
                let current = self.instance(instance)?;
                (instance, current.params().clone(), enabled)
            }
        };
        let instance = self
            .stack
            .get_mut(id)
            .ok_or(SessionError::UnknownInstance(id))?;
        let seq = self.history.append(instance, params.clone(), enabled);
        instance.set_state(params, enabled);
        debug!(image = %self.image, instance = %id, seq, "applied edit");
        self.notify(SessionEvent::ParametersChanged(id));
        Ok(seq)
    }

    /// Set one named parameter of an instance.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownInstance`] or
    /// [`SessionError::UnknownParameter`].
    pub fn set_param(
        &mut self,
        id: InstanceId,
        name: &str,
        value: f32,
    ) -> Result<u64, SessionError> {
        let instance = self.instance(id)?;
        let definition = instance.definition();
        let index = definition
            .param_index(name)
            .ok_or_else(|| SessionError::UnknownParameter {
                module: definition.name().to_string(),
                name: name.to_string(),
            })?;
        let mut new_value = instance.params().clone();
        new_value.set(index, value);
        self.apply(EditEvent::ParameterChanged {
            instance: id,
            new_value,
        })
    }

    /// Turn an instance on or off.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownInstance`] if it does not exist.
    pub fn set_enabled(&mut self, id: InstanceId, enabled: bool) -> Result<u64, SessionError> {
        self.apply(EditEvent::EnabledChanged {
            instance: id,
            enabled,
        })
    }

    /// Undo the most recent applied edit. Returns the affected instance.
    pub fn undo(&mut self) -> Option<InstanceId> {
        let id = self.history.undo()?;
        self.restore(id);
        Some(id)
    }

    /// Redo the next undone edit. Returns the affected instance.
    pub fn redo(&mut self) -> Option<InstanceId> {
        let id = self.history.redo()?;
        self.restore(id);
        Some(id)
    }

    fn restore(&mut self, id: InstanceId) {
        let Some(instance) = self.stack.get(id) else {
            return;
        };
        let state = self.history.current(instance);
        if let Some(instance) = self.stack.get_mut(id)
            && instance.set_state(state.params, state.enabled)
        {
            self.notify(SessionEvent::ParametersChanged(id));
        }
    }

    fn instance(&self, id: InstanceId) -> Result<&ModuleInstance, SessionError> {
        self.stack.get(id).ok_or(SessionError::UnknownInstance(id))
    }

    fn notify(&mut self, event: SessionEvent) {
        self.listeners.retain(|tx| tx.send(event).is_ok());
    }
}

fn check_size(module: &str, expected: usize, params: &ParamBlock) -> Result<(), SessionError> {
    if params.len() == expected {
        Ok(())
    } else {
        Err(SessionError::ParamSize {
            module: module.to_string(),
            expected,
            actual: params.len(),
        })
    }
}
