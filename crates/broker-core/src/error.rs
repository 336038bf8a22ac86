//! Error types for the broker operator core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Malformed grant record: {0}")]
    MalformedGrant(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) | Error::ConfigRead { .. } | Error::ConfigParse(_) => {
                "InvalidConfig"
            }
            Error::InvalidNodeId(_) => "InvalidNodeId",
            Error::InvalidRole(_) => "InvalidRole",
            Error::MalformedGrant(_) => "MalformedGrant",
            Error::Io(_) | Error::Other(_) => "InternalError",
        }
    }
}
