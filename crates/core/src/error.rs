use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown phase: {0}")]
    InvalidPhase(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
