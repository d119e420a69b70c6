pub mod error;
pub mod file_server;
pub mod scenario;

pub use error::ScenarioError;
pub use file_server::StaticFileServer;
pub use scenario::{ConnectivityScenario, ScenarioSettings};
