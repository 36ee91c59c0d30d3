//! Error types for the lsmkv storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("File not found: {0}")]
    FileNotFound(std::path::PathBuf),

    #[error("Corrupted file: {0}")]
    CorruptedFile(std::path::PathBuf),

    /// A durability failure happened earlier; the engine refuses further work.
    #[error("Engine halted after a fatal error: {0}")]
    Halted(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
