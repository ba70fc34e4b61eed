//! Rule loading and validation errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rules: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse rules: {0}")]
    Parse(String),

    #[error("invalid rule {id}: {reason}")]
    Invalid { id: u64, reason: String },

    #[error("duplicate rule id: {0}")]
    Duplicate(u64),
}

pub type RulesResult<T> = Result<T, RulesError>;
