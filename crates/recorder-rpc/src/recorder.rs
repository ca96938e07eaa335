//! Recorder proxy: a host handle for one engine-side recorder.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::bridge::protocol::TargetId;
use crate::closures::ClosureHandle;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::lifecycle::ReleaseGuard;

pub const RECORDER_TYPE: &str = "Recorder";

/// Handle to a remote recorder.
///
/// Dropping it schedules an automatic `release` and deregisters every closure
/// it owns. [`Recorder::cancel`] releases immediately instead.
pub struct Recorder {
    dispatcher: Arc<Dispatcher>,
    release: ReleaseGuard,
    abort: Option<ClosureHandle>,
    callbacks: Vec<ClosureHandle>,
}

impl Recorder {
    /// Create a recorder under a fresh `Recorder_<uuid>` target.
    pub async fn create(dispatcher: Arc<Dispatcher>, schema: Value) -> Result<Self, RpcError> {
        Self::init(dispatcher, None, schema, None, Vec::new()).await
    }

    /// Create a recorder under a caller-chosen target id.
    pub async fn create_with_target(
        dispatcher: Arc<Dispatcher>,
        target: TargetId,
        schema: Value,
    ) -> Result<Self, RpcError> {
        Self::init(dispatcher, Some(target), schema, None, Vec::new()).await
    }

    /// Create a recorder with an abort callback.
    ///
    /// `callbacks` are closure handles already embedded in `schema` (segment or
    /// stream callbacks); they stay registered for as long as the recorder lives.
    pub async fn create_with_callbacks<F>(
        dispatcher: Arc<Dispatcher>,
        schema: Value,
        on_abort: F,
        callbacks: Vec<ClosureHandle>,
    ) -> Result<Self, RpcError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let abort = dispatcher.register_closure("RecorderAbort", move |params| {
            on_abort(params);
            Ok(None)
        });
        Self::init(dispatcher, None, schema, Some(abort), callbacks).await
    }

    async fn init(
        dispatcher: Arc<Dispatcher>,
        target: Option<TargetId>,
        schema: Value,
        abort: Option<ClosureHandle>,
        callbacks: Vec<ClosureHandle>,
    ) -> Result<Self, RpcError> {
        let mut params = Map::new();
        params.insert("schema".to_string(), schema);
        if let Some(abort) = &abort {
            params.insert("abortCallback".to_string(), abort.to_value());
        }

        let params = Value::Object(params);
        let release = match target {
            Some(target) => {
                dispatcher
                    .initialize_with_target(target, RECORDER_TYPE, params)
                    .await?
            }
            None => {
                dispatcher
                    .initialize_remote_object(RECORDER_TYPE, params)
                    .await?
            }
        };
        tracing::debug!(target = %release.target(), "Recorder created");

        Ok(Self {
            dispatcher,
            release,
            abort,
            callbacks,
        })
    }

    pub fn target(&self) -> &TargetId {
        self.release.target()
    }

    pub fn abort_callback(&self) -> Option<&TargetId> {
        self.abort.as_ref().map(ClosureHandle::target)
    }

    pub fn callbacks(&self) -> &[ClosureHandle] {
        &self.callbacks
    }

    /// Call `action` on this recorder.
    pub async fn perform(
        &self,
        action: &str,
        params: Option<Value>,
    ) -> Result<Option<Value>, RpcError> {
        self.dispatcher
            .perform_on_target(self.target(), action, params)
            .await
    }

    pub async fn prepare(&self) -> Result<(), RpcError> {
        self.perform("prepare", None).await.map(|_| ())
    }

    pub async fn start(&self) -> Result<(), RpcError> {
        self.perform("start", None).await.map(|_| ())
    }

    /// Stop recording. Returns whatever summary the engine reports.
    pub async fn stop(&self) -> Result<Option<Value>, RpcError> {
        self.perform("stop", None).await
    }

    /// Release the recorder now with `manual-release`.
    ///
    /// The automatic release is disarmed first, so the target is released once.
    pub async fn cancel(mut self) -> Result<(), RpcError> {
        self.release.disarm();
        let target = self.target().clone();
        tracing::debug!(%target, "Cancelling recorder");
        let reply = self.dispatcher.manual_release(&target)?;
        drop(self);
        reply.await.map(|_| ())
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("target", self.target())
            .field("abort", &self.abort)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Schema for a recording item with an optional segment callback.
pub fn item_schema(kind: &str, segment_callback: Option<&ClosureHandle>) -> Value {
    let mut item = json!({ "type": kind });
    if let (Some(handle), Value::Object(map)) = (segment_callback, &mut item) {
        map.insert("onSegment".to_string(), handle.to_value());
    }
    item
}
