use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("Insufficient data for standardized filename")]
    InsufficientData,

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("File name too long: {0} characters")]
    NameTooLong(usize),

    #[error("Invalid file name")]
    InvalidName,
}

pub type NamingResult<T> = Result<T, NamingError>;
