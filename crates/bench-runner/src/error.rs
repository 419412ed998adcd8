use thiserror::Error;

/// Failure of a benchmark operation. The `Display` text is what ends up in the
/// operation's `error` field and in the envelope warnings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BenchError {
    #[error("{0}")]
    MissingDependency(String),
    #[error("accelerator device not available")]
    DeviceUnavailable,
    #[error("{0}")]
    UnsupportedConfiguration(String),
    #[error("distributed init failed: {0}")]
    DistributedInitFailure(String),
    #[error("{0}")]
    IoFailure(String),
    #[error("backend failure: {0}")]
    BackendFailure(String),
}

impl BenchError {
    pub fn missing_backend() -> Self {
        BenchError::MissingDependency("compute backend not available".to_string())
    }

    pub fn unsupported_dtype(name: &str) -> Self {
        BenchError::UnsupportedConfiguration(format!("unsupported dtype: {}", name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("no compute device available")]
    NoDevice,
    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("process group not initialized")]
    GroupNotInitialized,
    #[error("process group already initialized")]
    GroupAlreadyInitialized,
    #[error("unknown collective backend: {0}")]
    UnknownCollective(String),
    #[error("collective transport: {0}")]
    Transport(String),
}

impl From<BackendError> for BenchError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NoDevice => BenchError::DeviceUnavailable,
            BackendError::UnsupportedDtype(name) => BenchError::unsupported_dtype(&name),
            other => BenchError::BackendFailure(other.to_string()),
        }
    }
}
