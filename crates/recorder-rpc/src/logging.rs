//! Tracing setup and re-emission of engine log lines.

use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Target under which engine output is re-emitted.
pub const ENGINE_LOG_TARGET: &str = "recorder_rpc::engine";

/// Initialize tracing with RECORDER_LOG and LOG_FORMAT support.
///
/// `RUST_LOG` wins when set. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("RECORDER_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("recorder_rpc={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl EngineLogLevel {
    pub fn parse(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "trace" | "verbose" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" | "fault" | "critical" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// One log line delivered by the engine through the log callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLogLine {
    pub level: EngineLogLevel,
    pub message: String,
}

impl EngineLogLine {
    /// Accepts either a bare string or `{"message": ..., "level"?: ...}`.
    pub fn from_params(params: &Value) -> Option<Self> {
        match params {
            Value::String(message) => Some(Self {
                level: EngineLogLevel::Info,
                message: message.clone(),
            }),
            Value::Object(map) => {
                let message = map.get("message")?.as_str()?.to_string();
                let level = map
                    .get("level")
                    .and_then(Value::as_str)
                    .map(EngineLogLevel::parse)
                    .unwrap_or(EngineLogLevel::Info);
                Some(Self { level, message })
            }
            _ => None,
        }
    }
}

/// Re-emit an engine log line into the host's tracing pipeline.
pub fn emit_engine_log(line: &EngineLogLine) {
    let message = line.message.trim_end();
    match line.level {
        EngineLogLevel::Trace => tracing::trace!(target: ENGINE_LOG_TARGET, "{}", message),
        EngineLogLevel::Debug => tracing::debug!(target: ENGINE_LOG_TARGET, "{}", message),
        EngineLogLevel::Info => tracing::info!(target: ENGINE_LOG_TARGET, "{}", message),
        EngineLogLevel::Warn => tracing::warn!(target: ENGINE_LOG_TARGET, "{}", message),
        EngineLogLevel::Error => tracing::error!(target: ENGINE_LOG_TARGET, "{}", message),
    }
}
