//! Engine handle: owns the connection to one recording engine.
//!
//! Flow:
//! 1. Spawn the engine (or attach to existing streams)
//! 2. Writer task drains the outbound queue onto the engine's stdin
//! 3. Reader task decodes the engine's stdout and hands envelopes to the dispatcher
//! 4. Release task sends `release` for owners that were dropped
//! 5. On stdout EOF: fail everything in flight, refuse new requests

use std::process::ExitStatus;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::LineJsonCodec;
use crate::bridge::protocol::Envelope;
use crate::bridge::transport::{EngineProcess, SpawnError};
use crate::closures::ClosureHandle;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::lifecycle::{Lifecycle, run_release_queue};
use crate::logging::{EngineLogLine, emit_engine_log};
use crate::recorder::Recorder;
use crate::version::VersionInfo;

pub const LOGGING_TYPE: &str = "Logging";

/// How long `shutdown` waits for the engine to exit after its stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(5);

pub struct Engine {
    dispatcher: Arc<Dispatcher>,
    process: Option<EngineProcess>,
    writer: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    log_callback: Mutex<Option<ClosureHandle>>,
}

impl Engine {
    /// Spawn the engine binary and connect to its standard streams.
    pub async fn start(config: EngineConfig) -> Result<Self, SpawnError> {
        let (process, streams) = EngineProcess::start(&config)?;
        let mut engine = Self::attach(streams.stdout, streams.stdin, config.verbose_logging);
        engine.process = Some(process);
        Ok(engine)
    }

    /// Connect to an engine over arbitrary streams.
    ///
    /// `reader` carries the engine's output, `writer` its input. Must be called
    /// from within a tokio runtime.
    pub fn attach<R, W>(reader: R, writer: W, verbose: bool) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (lifecycle, release_rx) = Lifecycle::new();
        let dispatcher = Arc::new(Dispatcher::new(outbound_tx, lifecycle, verbose));
        let shutdown = CancellationToken::new();

        let writer = tokio::spawn(run_writer(
            outbound_rx,
            writer,
            shutdown.clone(),
            Arc::downgrade(&dispatcher),
        ));
        tokio::spawn(run_reader(reader, Arc::clone(&dispatcher)));
        tokio::spawn(run_release_queue(release_rx, Arc::downgrade(&dispatcher)));

        Self {
            dispatcher,
            process: None,
            writer: Some(writer),
            shutdown,
            log_callback: Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Engine process id, when this handle spawned the engine.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(EngineProcess::id)
    }

    pub fn version_info(&self) -> VersionInfo {
        VersionInfo::new()
    }

    pub async fn create_recorder(&self, schema: Value) -> Result<Recorder, RpcError> {
        Recorder::create(Arc::clone(&self.dispatcher), schema).await
    }

    pub async fn create_recorder_with_callbacks<F>(
        &self,
        schema: Value,
        on_abort: F,
        callbacks: Vec<ClosureHandle>,
    ) -> Result<Recorder, RpcError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        Recorder::create_with_callbacks(Arc::clone(&self.dispatcher), schema, on_abort, callbacks)
            .await
    }

    /// Discovery and permission queries addressed to a type rather than an object.
    pub async fn perform_static(
        &self,
        type_name: &str,
        action: &str,
        params: Option<Value>,
    ) -> Result<Option<Value>, RpcError> {
        self.dispatcher
            .perform_static(type_name, action, params)
            .await
    }

    /// Register a host callback for embedding in recording schemas.
    pub fn register_closure<F>(&self, prefix: &str, handler: F) -> ClosureHandle
    where
        F: Fn(Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.dispatcher.register_closure(prefix, handler)
    }

    /// Route engine log lines to `handler`, replacing any previous callback.
    ///
    /// Lines are also re-emitted through tracing under `recorder_rpc::engine`.
    pub async fn set_log_callback<F>(&self, handler: F) -> Result<(), RpcError>
    where
        F: Fn(&EngineLogLine) + Send + Sync + 'static,
    {
        let handle = self.dispatcher.register_closure("LogCallback", move |params| {
            match EngineLogLine::from_params(&params) {
                Some(line) => {
                    emit_engine_log(&line);
                    handler(&line);
                }
                None => tracing::debug!(?params, "Ignoring log payload with unexpected shape"),
            }
            Ok(None)
        });

        let mut slot = self.log_callback.lock().await;
        self.dispatcher
            .perform_static(
                LOGGING_TYPE,
                "setLogCallback",
                Some(json!({ "callback": handle.to_value() })),
            )
            .await?;

        if let Some(previous) = slot.replace(handle) {
            tracing::debug!(target = %previous.target(), "Replaced log callback");
        }
        Ok(())
    }

    /// Stop routing engine log lines to the host.
    pub async fn clear_log_callback(&self) -> Result<(), RpcError> {
        let mut slot = self.log_callback.lock().await;
        if slot.is_none() {
            return Ok(());
        }
        self.dispatcher
            .perform_static(
                LOGGING_TYPE,
                "setLogCallback",
                Some(json!({ "callback": Value::Null })),
            )
            .await?;
        slot.take();
        Ok(())
    }

    /// Close the engine's input and wait for it to exit.
    ///
    /// Queued messages are flushed first. Returns the exit status when this
    /// handle spawned the engine. Requests still in flight when the engine's
    /// output ends fail with [`RpcError::EngineExited`].
    pub async fn shutdown(mut self) -> Result<Option<ExitStatus>, RpcError> {
        tracing::info!("Shutting down engine connection");
        self.log_callback.get_mut().take();
        self.shutdown.cancel();

        if let Some(writer) = self.writer.take()
            && let Err(e) = writer.await
        {
            tracing::warn!(error = %e, "Writer task failed");
        }

        let status = match self.process.take() {
            Some(mut process) => match tokio::time::timeout(EXIT_GRACE, process.wait()).await {
                Ok(status) => Some(status?),
                Err(_) => {
                    tracing::warn!("Engine did not exit after its input closed, killing");
                    process.kill().await?;
                    Some(process.wait().await?)
                }
            },
            None => None,
        };

        self.dispatcher.connection_lost();
        Ok(status)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_writer<W>(
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    writer: W,
    shutdown: CancellationToken,
    dispatcher: Weak<Dispatcher>,
) where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, LineJsonCodec::new());

    loop {
        tokio::select! {
            biased;

            envelope = outbound_rx.recv() => {
                let Some(envelope) = envelope else { break };
                if let Err(e) = framed.send(envelope).await {
                    tracing::error!(error = %e, "Failed to write to engine");
                    if let Some(dispatcher) = dispatcher.upgrade() {
                        dispatcher.connection_lost();
                    }
                    return;
                }
            }
            _ = shutdown.cancelled() => {
                while let Ok(envelope) = outbound_rx.try_recv() {
                    if let Err(e) = framed.send(envelope).await {
                        tracing::warn!(error = %e, "Failed to flush queued message during shutdown");
                        break;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = framed.close().await {
        tracing::debug!(error = %e, "Closing engine input failed");
    }
    tracing::debug!("Writer task exiting");
}

async fn run_reader<R>(reader: R, dispatcher: Arc<Dispatcher>)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(reader, LineJsonCodec::new());

    loop {
        match framed.next().await {
            Some(Ok(decoded)) => dispatcher.dispatch_decoded(decoded),
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to read from engine");
                break;
            }
            None => {
                tracing::info!("Engine closed its output");
                break;
            }
        }
    }

    dispatcher.connection_lost();
    tracing::debug!("Reader task exiting");
}
