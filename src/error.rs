use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Authentication required: {0}")]
    Unauthorized(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Blockchain transaction failed: {0}")]
    BlockchainError(String),
    #[error("Storage operation failed: {0}")]
    StorageError(String),
    #[error("Security check failed: {0}")]
    SecurityError(String),
    #[error("Failed to process document: {0}")]
    DocumentProcessingError(String),
    #[error("Payment error: {0}")]
    PaymentError(String),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl MarketError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(Box::new(std::io::Error::other(msg.into())))
    }

    /// Short machine-readable category, used as the `error` field of API responses.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ValidationError(_) | Self::CsvError(_) | Self::JsonError(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Conflict(_) => "conflict",
            Self::BlockchainError(_) => "blockchain_error",
            Self::StorageError(_) => "storage_error",
            Self::SecurityError(_) => "security_error",
            Self::DocumentProcessingError(_) => "document_processing_error",
            Self::PaymentError(_) => "payment_error",
            #[cfg(feature = "storage-rocksdb")]
            Self::RocksDbError(_) => "internal_error",
            Self::IoError(_) | Self::InternalError(_) => "internal_error",
        }
    }

    /// Whether retrying the same external call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BlockchainError(_) | Self::StorageError(_))
    }
}

pub type Result<T> = std::result::Result<T, MarketError>;
