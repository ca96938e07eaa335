//! Engine launch configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::transport::{BinarySpawner, EngineSpawner};

/// Environment variable naming the engine binary.
pub const ENGINE_PATH_ENV: &str = "RECORDER_ENGINE_PATH";
/// Environment variable enabling verbose engine logging (`1` or `true`).
pub const ENGINE_VERBOSE_ENV: &str = "RECORDER_ENGINE_VERBOSE";

pub struct EngineConfig {
    pub binary_path: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Log dropped lines loudly and forward engine stderr.
    pub verbose_logging: bool,
    pub spawner: Arc<dyn EngineSpawner>,
}

impl EngineConfig {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            envs: Vec::new(),
            verbose_logging: false,
            spawner: Arc::new(BinarySpawner),
        }
    }

    /// Build from `RECORDER_ENGINE_PATH` / `RECORDER_ENGINE_VERBOSE`.
    ///
    /// Returns `None` when no engine path is set.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let path = lookup(ENGINE_PATH_ENV).filter(|p| !p.trim().is_empty())?;
        let verbose = matches!(
            lookup(ENGINE_VERBOSE_ENV).as_deref().map(str::trim),
            Some("1") | Some("true") | Some("TRUE") | Some("yes")
        );
        Some(Self::new(path).with_verbose_logging(verbose))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.verbose_logging = verbose;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn EngineSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("binary_path", &self.binary_path)
            .field("args", &self.args)
            .field("envs", &self.envs)
            .field("verbose_logging", &self.verbose_logging)
            .finish_non_exhaustive()
    }
}
