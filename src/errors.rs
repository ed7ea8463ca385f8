use thiserror::Error;

#[derive(Error, Debug)]
pub enum LimbraError {
    #[error("Invalid control parameter {key}: {reason}")]
    Config { key: String, reason: String },

    #[error("Missing mandatory control parameter: {0}")]
    MissingKey(String),

    #[error("Unable to perform file operation: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed input {file}: {reason}")]
    Malformed { file: String, reason: String },

    #[error("Numerical failure in {context}: {reason}")]
    Numerical { context: String, reason: String },
}

impl LimbraError {
    pub fn malformed(file: impl Into<String>, reason: impl Into<String>) -> Self {
        LimbraError::Malformed {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub fn numerical(context: impl Into<String>, reason: impl Into<String>) -> Self {
        LimbraError::Numerical {
            context: context.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LimbraError>;
