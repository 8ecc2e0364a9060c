// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("plugin template error: {0}")]
    Template(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("persister busy: {0}")]
    PersisterBusy(String),

    #[error("field error: {0}")]
    Field(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("send to operator '{0}' failed: channel closed")]
    ChannelSend(String),

    #[error("{stage}: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with the name of the lifecycle stage it occurred in.
    pub fn in_stage(self, stage: impl Into<String>) -> Error {
        Error::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
