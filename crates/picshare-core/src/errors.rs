use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("picture not found")]
    PictureNotFound,
    #[error("user not found")]
    UserNotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
