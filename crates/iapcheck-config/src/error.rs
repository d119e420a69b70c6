use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {var} is not set")]
    Missing { var: &'static str },

    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}
