use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed segment encountered during compaction: {detail}")]
    Corruption { detail: String },

    #[error("key/value must not contain a newline byte ({context})")]
    InvalidInput { context: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
