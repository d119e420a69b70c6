mod settings;
pub mod error;

pub use error::ConfigError;
pub use settings::{Settings, DEFAULT_REGION};
