use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container runtime: {0}")]
    Runtime(String),

    #[error("no builder master key available: {0}")]
    MasterKey(String),

    #[error("unknown builder {0:?}")]
    UnknownBuilder(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
