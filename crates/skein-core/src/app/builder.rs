//! ManagerBuilder - TaskQueueManager の構築とワイヤリング
//!
//! - handler 登録・shared store・clock / id 生成器の差し替え
//! - 起動時検証（Fail-fast）: `expect_tasks` に挙げた名前が未登録なら build 失敗

use std::sync::Arc;

use super::manager::TaskQueueManager;
use crate::config::ManagerConfig;
use crate::domain::RegistryError;
use crate::ports::{Clock, IdGenerator, SharedBackend, SystemClock, UlidGenerator};
use crate::queue::SharedQueueStore;
use crate::typed::{Handler, TaskHandler, TaskRegistry, TypedTask};

/// ```ignore
/// let manager = ManagerBuilder::new()
///     .config(ManagerConfig::load("skein.toml")?)
///     .shared_backend(backend)
///     .register_typed::<Resize, _>(ResizeHandler)?
///     .expect_tasks(&["images.resize.v1"])
///     .build()?;
/// ```
pub struct ManagerBuilder {
    config: ManagerConfig,
    registry: TaskRegistry,
    backend: Option<Arc<dyn SharedBackend>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    expected_tasks: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            registry: TaskRegistry::new(),
            backend: None,
            clock: None,
            ids: None,
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable distributed mode. Keys are prefixed with `config.namespace`.
    pub fn shared_backend(mut self, backend: Arc<dyn SharedBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn register(
        self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(name, handler)?;
        Ok(self)
    }

    pub fn register_typed<T: TypedTask, H: Handler<T> + 'static>(
        self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// Names that must be registered by the time `build` runs.
    pub fn expect_tasks(mut self, names: &[&str]) -> Self {
        self.expected_tasks = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<TaskQueueManager, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let store = self
            .backend
            .map(|backend| SharedQueueStore::new(backend, self.config.namespace.clone()));

        Ok(TaskQueueManager::new(
            self.config,
            Arc::new(self.registry),
            store,
            clock,
            ids,
        ))
    }
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
