use iapcheck_driver::{ExecError, ForwardError, HelperError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Helper(#[from] HelperError),

    #[error("remote command failed: {0}")]
    Remote(#[from] ExecError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error("local file server: {0}")]
    Serve(#[source] std::io::Error),

    #[error("prepare page content: {0}")]
    Content(#[source] std::io::Error),

    #[error("{step}: expected response containing '{expected}', got '{body}'")]
    UnexpectedBody {
        step: &'static str,
        expected: &'static str,
        body: String,
    },
}
