use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Resource is already being written: {0}")]
    Conflict(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource {path} was aborted: {reason}")]
    Aborted { path: String, reason: String },

    #[error("Resource is closed: {0}")]
    Closed(String),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ConfigParse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
