use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("conflict")]
    Conflict,
    #[error("storage failure: {0}")]
    Storage(String),
}
