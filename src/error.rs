use std::path::PathBuf;
use thiserror::Error;

/// Failures raised while deciding on a recipient or a message.
///
/// None of these ever escape a stage: they are logged and turned into a
/// temporary failure for the remote sender.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("policy endpoint unreachable: {0}")]
    Network(String),

    #[error("malformed policy response: {0}")]
    Protocol(String),

    #[error("incomplete policy response: {0}")]
    DataContract(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("end of message reached without an accepted recipient")]
    InternalOrdering,

    #[error("message stream already consumed")]
    StreamConsumed,
}

impl From<reqwest::Error> for FilterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FilterError::Protocol(err.to_string())
        } else {
            FilterError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is not defined")]
    MissingUrl(&'static str),

    #[error("{key} is not a valid http(s) URL: {value}")]
    InvalidUrl { key: &'static str, value: String },
}
