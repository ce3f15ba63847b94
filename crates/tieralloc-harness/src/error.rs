use thiserror::Error;

use tieralloc_core::AllocError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
}
