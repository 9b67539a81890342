//! TaskRegistry - func_name から handler を引く
//!
//! - `HashMap<String, Arc<dyn TaskHandler>>` を `RwLock` で保護
//! - worker は read、登録時のみ write
//! - 同名の再登録は上書き（warn ログを出す）

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use super::handler::{Handler, TaskHandler, TypedHandler};
use super::task::TypedTask;
use crate::domain::RegistryError;

#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. Last write wins.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.insert(name.clone(), handler).is_some() {
            warn!(task = %name, "task handler overwritten");
        } else {
            debug!(task = %name, "task handler registered");
        }
        Ok(())
    }

    /// Register a typed handler under `T::NAME`.
    pub fn register_typed<T, H>(&self, handler: H) -> Result<(), RegistryError>
    where
        T: TypedTask,
        H: Handler<T> + 'static,
    {
        self.register(T::NAME, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
