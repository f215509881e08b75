use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MultiplexError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("genesis doc missing for scope hash {0}")]
    GenesisMissing(String),
    #[error("invalid genesis doc: {0}")]
    GenesisInvalid(String),
    #[error("genesis doc hash mismatch: {0}")]
    GenesisHashMismatch(String),
    #[error("scope {scope}: failed to start {step}: {reason}")]
    ListenerStart {
        scope: String,
        step: &'static str,
        reason: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type MultiplexResult<T> = Result<T, MultiplexError>;
