use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockError {
    /// Locator unknown, out of range, or already freed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Checksum mismatch, decompression failure or authentication failure
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Underlying storage failure, or a block file cannot be created/extended
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl BlockError {
    /// True for [`BlockError::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlockError::NotFound(_))
    }

    /// True for [`BlockError::CorruptData`]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, BlockError::CorruptData(_))
    }

    /// Suggested HTTP status for the request layer
    pub fn http_status(&self) -> u16 {
        match self {
            BlockError::NotFound(_) => 404,
            BlockError::CorruptData(_) => 422,
            BlockError::AllocationFailure(_) | BlockError::ConfigError(_) => 500,
        }
    }
}

impl From<std::io::Error> for BlockError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            // A short read means the file no longer holds what the index promised
            std::io::ErrorKind::UnexpectedEof => {
                BlockError::CorruptData(format!("short read: {}", err))
            }
            _ => BlockError::AllocationFailure(format!("I/O error: {}", err)),
        }
    }
}

impl From<toml::de::Error> for BlockError {
    fn from(err: toml::de::Error) -> Self {
        BlockError::ConfigError(format!("invalid TOML: {}", err))
    }
}

impl From<validator::ValidationErrors> for BlockError {
    fn from(err: validator::ValidationErrors) -> Self {
        BlockError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for BlockError {
    fn from(err: serde_json::Error) -> Self {
        BlockError::CorruptData(format!("Serialization error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, BlockError>;
