//! The module registry: a catalog of operation kinds.
//!
//! Each registered [`Operation`] is captured as a [`ModuleDefinition`]
//! holding the static facts the rest of the pipeline needs (name,
//! default priority, default-enabled, parameter layout). Definitions are
//! shared by `Arc` and live as long as any instance refers to them.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::instance::{InstanceId, ModuleInstance};
use crate::operation::{Operation, ParamBlock};
use crate::ops;
use crate::types::RegistryError;

/// Static facts about one operation kind.
pub struct ModuleDefinition {
    name: &'static str,
    default_priority: i32,
    default_enabled: bool,
    default_params: ParamBlock,
    param_names: &'static [&'static str],
    operation: Arc<dyn Operation>,
}

impl ModuleDefinition {
    /// Capture the static facts of `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidDefinition`] if the default
    /// parameter block does not have one value per parameter name.
    pub fn new(operation: Arc<dyn Operation>) -> Result<Self, RegistryError> {
        let default_params = operation.default_params();
        let param_names = operation.param_names();
        if default_params.len() != param_names.len() {
            return Err(RegistryError::InvalidDefinition {
                module: operation.name().to_string(),
                names: param_names.len(),
                values: default_params.len(),
            });
        }
        Ok(Self {
            name: operation.name(),
            default_priority: operation.default_priority(),
            default_enabled: operation.default_enabled(),
            default_params,
            param_names,
            operation,
        })
    }

    /// Module name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Default priority.
    #[must_use]
    pub const fn default_priority(&self) -> i32 {
        self.default_priority
    }

    /// Whether instances start enabled.
    #[must_use]
    pub const fn default_enabled(&self) -> bool {
        self.default_enabled
    }

    /// Default parameter block.
    #[must_use]
    pub const fn default_params(&self) -> &ParamBlock {
        &self.default_params
    }

    /// Parameter names, in block order.
    #[must_use]
    pub const fn param_names(&self) -> &'static [&'static str] {
        self.param_names
    }

    /// Number of values in the parameter block.
    #[must_use]
    pub fn param_size(&self) -> usize {
        self.default_params.len()
    }

    /// Index of the parameter called `name`.
    #[must_use]
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.param_names.iter().position(|n| *n == name)
    }

    /// The operation implementation.
    #[must_use]
    pub fn operation(&self) -> &dyn Operation {
        self.operation.as_ref()
    }
}

impl std::fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("name", &self.name)
            .field("default_priority", &self.default_priority)
            .field("default_enabled", &self.default_enabled)
            .field("param_names", &self.param_names)
            .finish_non_exhaustive()
    }
}

/// Catalog of registered operation kinds, in registration order.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    definitions: Vec<Arc<ModuleDefinition>>,
    by_name: HashMap<&'static str, usize>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the shipped operations.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if a shipped operation is malformed.
    pub fn with_builtins() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for operation in ops::builtins() {
            registry.register(operation)?;
        }
        Ok(registry)
    }

    /// Add an operation kind.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateModule`] if the name is taken,
    /// or [`RegistryError::InvalidDefinition`] if the operation's
    /// parameter layout is inconsistent.
    pub fn register(
        &mut self,
        operation: Arc<dyn Operation>,
    ) -> Result<Arc<ModuleDefinition>, RegistryError> {
        let name = operation.name();
        if self.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateModule(name.to_string()));
        }
        let definition = Arc::new(ModuleDefinition::new(operation)?);
        self.by_name.insert(name, self.definitions.len());
        self.definitions.push(Arc::clone(&definition));
        debug!(
            module = name,
            priority = definition.default_priority(),
            params = definition.param_size(),
            "registered module",
        );
        Ok(definition)
    }

    /// The definition called `name`, if registered.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<ModuleDefinition>> {
        self.by_name
            .get(name)
            .and_then(|&index| self.definitions.get(index))
    }

    /// The definition called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownModule`] if it is not registered.
    pub fn lookup(&self, name: &str) -> Result<&Arc<ModuleDefinition>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::UnknownModule(name.to_string()))
    }

    /// Create an instance of `name` with default parameters and enabled
    /// flag. `position` is the instance's insertion order in its stack
    /// and doubles as its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownModule`] if `name` is not
    /// registered.
    pub fn instantiate(&self, name: &str, position: u32) -> Result<ModuleInstance, RegistryError> {
        let definition = self.lookup(name)?;
        Ok(ModuleInstance::new(
            InstanceId(position),
            Arc::clone(definition),
            position,
        ))
    }

    /// All definitions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModuleDefinition>> {
        self.definitions.iter()
    }

    /// Number of registered definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ops::{Exposure, SplitToning};

    #[test]
    fn builtins_are_registered_in_order() {
        let registry = ModuleRegistry::with_builtins().unwrap();
        let names: Vec<_> = registry.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["exposure", "crop", "blur", "splittoning"]);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(Exposure)).unwrap();
        let err = registry.register(Arc::new(Exposure)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateModule("exposure".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_module_fails_to_instantiate() {
        let registry = ModuleRegistry::with_builtins().unwrap();
        let err = registry.instantiate("vignette", 0).unwrap_err();
        assert_eq!(err, RegistryError::UnknownModule("vignette".to_string()));
    }

    #[test]
    fn instantiate_copies_defaults() {
        let registry = ModuleRegistry::with_builtins().unwrap();
        let instance = registry.instantiate("splittoning", 3).unwrap();
        assert_eq!(instance.id(), InstanceId(3));
        assert!(!instance.enabled());
        assert_eq!(instance.priority(), 970);
        assert_eq!(instance.params(), instance.definition().default_params());
        assert_eq!(instance.params().len(), 9);
    }

    #[test]
    fn param_index_by_name() {
        let mut registry = ModuleRegistry::new();
        let def = registry.register(Arc::new(SplitToning)).unwrap();
        assert_eq!(def.param_index("balance"), Some(8));
        assert_eq!(def.param_index("shadow_saturation"), Some(3));
        assert_eq!(def.param_index("nope"), None);
    }
}
