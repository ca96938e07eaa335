//! Closure registry: host-side callbacks the engine can invoke by target id.
//!
//! A registration lives exactly as long as its [`ClosureHandle`]. Whoever owns
//! the handle (a recorder, the engine handle's log slot) bounds the lifetime;
//! dropping it deregisters, after which inbound calls get "not found".

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;

use crate::bridge::protocol::TargetId;

/// Handler signature: JSON params in, optional JSON result out.
pub type ClosureHandler = Arc<dyn Fn(Value) -> anyhow::Result<Option<Value>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("target not found: {0}")]
    NotFound(TargetId),
    #[error("closure {target} failed: {message}")]
    Failed {
        target: TargetId,
        message: String,
        cause: Option<String>,
    },
}

#[derive(Default)]
pub struct ClosureRegistry {
    handlers: DashMap<TargetId, ClosureHandler>,
}

impl ClosureRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` under a fresh `<prefix>_<uuid>` id.
    pub fn register<F>(self: &Arc<Self>, prefix: &str, handler: F) -> ClosureHandle
    where
        F: Fn(Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        let target = TargetId::generate(prefix);
        self.handlers.insert(target.clone(), Arc::new(handler));
        tracing::debug!(%target, "Registered closure");

        ClosureHandle {
            target,
            registry: Arc::downgrade(self),
        }
    }

    /// Call the handler for `target` synchronously.
    ///
    /// Errors and panics from the handler are contained here and reported as
    /// [`InvokeError::Failed`].
    pub fn invoke(&self, target: &TargetId, params: Value) -> Result<Option<Value>, InvokeError> {
        // Clone out so the shard lock is not held while user code runs.
        let handler = match self.handlers.get(target) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Err(InvokeError::NotFound(target.clone())),
        };

        match catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(InvokeError::Failed {
                target: target.clone(),
                message: e.to_string(),
                cause: Some(format!("{:#}", e)),
            }),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "closure panicked".to_string());
                tracing::error!(%target, %message, "Closure panicked");
                Err(InvokeError::Failed {
                    target: target.clone(),
                    message,
                    cause: Some("panic".to_string()),
                })
            }
        }
    }

    pub fn remove(&self, target: &TargetId) -> bool {
        let removed = self.handlers.remove(target).is_some();
        if removed {
            tracing::debug!(%target, "Removed closure");
        }
        removed
    }

    pub fn contains(&self, target: &TargetId) -> bool {
        self.handlers.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Owner of a closure registration. Deregisters on drop.
#[must_use = "dropping the handle deregisters the closure immediately"]
pub struct ClosureHandle {
    target: TargetId,
    registry: Weak<ClosureRegistry>,
}

impl ClosureHandle {
    pub fn target(&self) -> &TargetId {
        &self.target
    }

    /// The id as a JSON string, for embedding in request params.
    pub fn to_value(&self) -> Value {
        Value::String(self.target.as_str().to_string())
    }
}

impl std::fmt::Debug for ClosureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClosureHandle").field(&self.target).finish()
    }
}

impl Drop for ClosureHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.target);
        }
    }
}
