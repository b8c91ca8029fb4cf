//! Crate-wide error type.
//!
//! Every component reports failures through [`ZergError`]. Variants roughly
//! mirror the component list in the design doc so a caller can match on
//! `ZergError::Merge { .. }` etc. without downcasting.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZergError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("state store error: {message}")]
    State {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("task graph error: {0:?}")]
    Graph(Vec<String>),

    #[error("port allocator error: {message}")]
    Port { message: String },

    #[error("worktree error: {message}")]
    Worktree {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("launcher error [worker {worker_id}]: {message}")]
    Launcher {
        worker_id: u32,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("verification error [task {task_id}]: {message}")]
    Verification { task_id: String, message: String },

    #[error("merge error [level {level}]: {message}")]
    Merge { level: u32, message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type Result<T> = std::result::Result<T, ZergError>;

impl ZergError {
    pub fn state<S: Into<String>>(message: S) -> Self {
        Self::State {
            message: message.into(),
            source: None,
        }
    }

    pub fn worktree<S: Into<String>>(message: S) -> Self {
        Self::Worktree {
            message: message.into(),
            source: None,
        }
    }

    pub fn launcher<S: Into<String>>(worker_id: u32, message: S) -> Self {
        Self::Launcher {
            worker_id,
            message: message.into(),
            source: None,
        }
    }

    pub fn merge<S: Into<String>>(level: u32, message: S) -> Self {
        Self::Merge {
            level,
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(mut self, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match &mut self {
            Self::State { source, .. }
            | Self::Worktree { source, .. }
            | Self::Launcher { source, .. }
            | Self::Other { source, .. } => *source = Some(Box::new(err)),
            _ => {}
        }
        self
    }

    /// Classifies the error per the design doc's recoverable/fatal split:
    /// configuration and state-corruption errors are fatal (process exit),
    /// everything else (task failures, crashes, merge failures, infra
    /// outages) is recoverable and routes through `pause_for_intervention`.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config { .. } | Self::State { .. })
    }
}

impl From<String> for ZergError {
    fn from(message: String) -> Self {
        Self::other(message)
    }
}

impl From<&str> for ZergError {
    fn from(message: &str) -> Self {
        Self::other(message)
    }
}
