use thiserror::Error;

/// Raised while reading required configuration from the environment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvVarError {
    #[error("unable to access environment variable: {0}")]
    Missing(&'static str),
    #[error("unable to convert environment variable: {0}")]
    Invalid(&'static str),
}
