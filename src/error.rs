//! Crate-level error taxonomy. Internal storage/transport code uses the
//! boxed `Result<T, Box<dyn Error + Send + Sync>>` shape; `KernelError`
//! is the typed surface the kernel itself returns, and the shape every
//! error kind converts into a synthetic `error` completion from (errors
//! are data, not control flow).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("transport error invoking {concept}/{action}: {message}")]
    Transport {
        concept: String,
        action: String,
        message: String,
    },

    #[error("no such concept: {uri}")]
    UnknownConcept { uri: String },

    #[error("quiescence reached without a responder for flow {flow}")]
    Quiescence { flow: String },

    #[error("storage error: {0}")]
    Storage(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl KernelError {
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::Validation { .. } => "validation-error",
            KernelError::Transport { .. } => "transport-error",
            KernelError::UnknownConcept { .. } => "no-such-concept",
            KernelError::Quiescence { .. } => "no-responder",
            KernelError::Storage(_) => "storage-error",
        }
    }
}
