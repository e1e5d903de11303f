use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid listen address {addr}: {reason}")]
    InvalidListenAddr { addr: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
