use std::io;

use thiserror::Error;

use crate::term::TermError;

pub type Result<T> = std::result::Result<T, DriftError>;

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("term decode error: {0}")]
    Decode(#[from] TermError),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(&'static str),
}
