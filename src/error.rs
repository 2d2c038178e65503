use thiserror::Error as ThisError;

pub type OpaqueError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("host `{0}` could not be resolved")]
    UnresolvableHost(String),
    #[error("refresh was aborted before a value was produced")]
    RefreshAborted,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Opaque(#[from] OpaqueError),
}
pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("target host must not be empty")]
    EmptyHost,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
