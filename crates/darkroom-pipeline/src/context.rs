//! The develop context: every long-lived component for one image.
//!
//! [`ContextBuilder::build`] brings components up in dependency order
//! (configuration, metadata store, registry, executor, session) and
//! [`DevelopContext`] tears them down in reverse when dropped. Nothing
//! here is global; callers hold the context and pass pieces of it on.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::buffer::PixelBuffer;
use crate::diagnostics::SystemClock;
use crate::pipeline::{CancelToken, Pipeline, PipelineOutput, PipelineRequest};
use crate::registry::ModuleRegistry;
use crate::session::{EditSession, SessionError};
use crate::store::{MemoryStore, MetadataStore, StoreError};
use crate::tile::TileExecutor;
use crate::types::{Dimensions, EngineConfig, PipelineError, RegistryError};

/// Metadata store shared behind a single coarse lock.
pub type SharedStore = Arc<Mutex<Box<dyn MetadataStore>>>;

/// Errors from building or using a [`DevelopContext`].
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Configuration, executor, or pipeline failure.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Registry setup failed.
    #[error("module registry: {0}")]
    Registry(#[from] RegistryError),

    /// An edit was rejected.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The metadata store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Builds a [`DevelopContext`].
pub struct ContextBuilder {
    image: String,
    config: EngineConfig,
    store: Option<Box<dyn MetadataStore>>,
    registry: Option<ModuleRegistry>,
}

impl ContextBuilder {
    /// Start building a context for `image`.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            config: EngineConfig::default(),
            store: None,
            registry: None,
        }
    }

    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `store` instead of an in-memory store.
    #[must_use]
    pub fn store(mut self, store: impl MetadataStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Use `registry` instead of the shipped operations.
    #[must_use]
    pub fn registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bring every component up in order.
    ///
    /// # Errors
    ///
    /// Returns the first component's failure; components already built
    /// are dropped in reverse order.
    pub fn build(self) -> Result<DevelopContext, ContextError> {
        self.config.validate()?;
        debug!(config = ?self.config, "configuration ok");

        let store: Box<dyn MetadataStore> = match self.store {
            Some(store) => store,
            None => Box::new(MemoryStore::new()),
        };
        let store: SharedStore = Arc::new(Mutex::new(store));

        let registry = match self.registry {
            Some(registry) => registry,
            None => ModuleRegistry::with_builtins()?,
        };
        let registry = Arc::new(registry);
        debug!(modules = registry.len(), "registry ready");

        let executor = TileExecutor::from_config(&self.config)?;
        debug!(threads = executor.threads(), "executor ready");

        let persisted = store
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .load(&self.image)?;
        let session = match persisted {
            Some(edit) => EditSession::from_persisted(Arc::clone(&registry), edit)?,
            None => EditSession::new(self.image, Arc::clone(&registry)),
        };
        info!(
            image = session.image(),
            instances = session.stack().len(),
            "develop context ready",
        );

        Ok(DevelopContext {
            session,
            executor,
            registry,
            store,
            config: self.config,
        })
    }
}

/// Long-lived components for developing one image.
// Fields drop in declaration order, the reverse of construction.
pub struct DevelopContext {
    session: EditSession,
    executor: TileExecutor,
    registry: Arc<ModuleRegistry>,
    store: SharedStore,
    config: EngineConfig,
}

impl DevelopContext {
    /// The edit session.
    #[must_use]
    pub const fn session(&self) -> &EditSession {
        &self.session
    }

    /// The tile executor.
    #[must_use]
    pub const fn executor(&self) -> &TileExecutor {
        &self.executor
    }

    /// The module registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// The shared metadata store.
    #[must_use]
    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `f` against the session, then durably save the result.
    ///
    /// # Errors
    ///
    /// Returns the session error from `f`, or [`ContextError::Store`] if
    /// saving fails.
    pub fn edit<T>(
        &mut self,
        f: impl FnOnce(&mut EditSession) -> Result<T, SessionError>,
    ) -> Result<T, ContextError> {
        let value = f(&mut self.session)?;
        self.persist()?;
        Ok(value)
    }

    /// Save the session to the metadata store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the lock is poisoned or the write fails.
    pub fn persist(&self) -> Result<(), StoreError> {
        let edit = self.session.to_persisted();
        let mut store = self.store.lock().map_err(|_| StoreError::Poisoned)?;
        store.save(&edit)?;
        debug!(
            image = %edit.image,
            history = edit.history.len(),
            "saved edit",
        );
        Ok(())
    }

    /// Preview request from the configuration.
    #[must_use]
    pub const fn preview_request(&self) -> PipelineRequest {
        PipelineRequest::preview(&self.config)
    }

    /// Thumbnail request for a source of `source` pixels.
    #[must_use]
    pub fn thumbnail_request(&self, source: Dimensions) -> PipelineRequest {
        PipelineRequest::thumbnail(&self.config, source)
    }

    /// Assemble a pipeline for `request` from the current stack.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RegionMismatch`] if regions do not line
    /// up.
    pub fn assemble(
        &self,
        request: PipelineRequest,
        source: Dimensions,
    ) -> Result<Pipeline, PipelineError> {
        Pipeline::assemble(&self.session.snapshot(), request, source, self.config.backend)
    }

    /// Assemble and run a pipeline for `request` on `source`.
    ///
    /// # Errors
    ///
    /// Returns any assembly or run error.
    pub fn develop(
        &self,
        source: &PixelBuffer,
        request: PipelineRequest,
        cancel: &CancelToken,
    ) -> Result<PipelineOutput, PipelineError> {
        let pipeline = self.assemble(request, source.dimensions())?;
        pipeline.run(source, &self.executor, cancel, &SystemClock)
    }
}

impl Drop for DevelopContext {
    fn drop(&mut self) {
        debug!(image = self.session.image(), "tearing down develop context");
    }
}

impl std::fmt::Debug for DevelopContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevelopContext")
            .field("session", &self.session)
            .field("executor", &self.executor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commit::PipelineKind;

    #[test]
    fn invalid_config_fails_build() {
        let config = EngineConfig {
            tile_rows: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            ContextBuilder::new("a").config(config).build(),
            Err(ContextError::Pipeline(PipelineError::InvalidConfig(_)))
        ));
    }

    #[test]
    fn edits_are_saved_and_reloaded() {
        let mut ctx = ContextBuilder::new("a.raw").build().unwrap();
        let id = ctx.edit(|s| s.add_module("exposure")).unwrap();
        ctx.edit(|s| s.set_param(id, "ev", 0.5)).unwrap();

        let store = ctx.store();
        let saved = store.lock().unwrap().load("a.raw").unwrap().unwrap();
        assert_eq!(saved.history.len(), 1);
        drop(ctx);

        let mut memory = MemoryStore::new();
        memory.save(&saved).unwrap();
        let reloaded = ContextBuilder::new("a.raw").store(memory).build().unwrap();
        assert_eq!(
            reloaded.session().stack().get(id).unwrap().params().as_slice(),
            &[0.5, 0.0]
        );
    }

    #[test]
    fn rejected_edit_is_not_saved() {
        let mut ctx = ContextBuilder::new("b.raw").build().unwrap();
        assert!(ctx.edit(|s| s.add_module("vignette")).is_err());
        let store = ctx.store();
        assert!(store.lock().unwrap().load("b.raw").unwrap().is_none());
    }

    #[test]
    fn develop_preview_uses_configured_scale() {
        let config = EngineConfig {
            preview_scale: 0.5,
            threads: 1,
            ..EngineConfig::default()
        };
        let ctx = ContextBuilder::new("c.raw").config(config).build().unwrap();
        let source = PixelBuffer::new(8, 6);
        let out = ctx
            .develop(&source, ctx.preview_request(), &CancelToken::new())
            .unwrap();
        assert_eq!(out.buffer.dimensions(), Dimensions::new(4, 3));
        assert_eq!(out.diagnostics.kind, PipelineKind::Preview);
    }
}
