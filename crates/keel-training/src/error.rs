use std::path::PathBuf;
use thiserror::Error;

pub type LaunchResult<T> = std::result::Result<T, LaunchError>;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("distributed coordination error: {0}")]
    DistributedCoordination(String),

    #[error("failed to set up {}: {source}", path.display())]
    ResourceSetup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("trainer error: {0}")]
    Trainer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LaunchError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn dist(message: impl Into<String>) -> Self {
        Self::DistributedCoordination(message.into())
    }

    pub(crate) fn setup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ResourceSetup { path: path.into(), source }
    }
}
