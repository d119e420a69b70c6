use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("wait {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("`{command}` timed out after {secs}s")]
    TimedOut { command: String, secs: u64 },
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("terraform {step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: ExecError,
    },

    #[error("terraform output '{key}' is not declared or could not be read: {source}")]
    Output {
        key: String,
        #[source]
        source: ExecError,
    },

    #[error("terraform output '{0}' is empty")]
    EmptyOutput(String),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no ambient credentials found: {0}")]
    NoCredentials(String),

    #[error("read credentials file {path}: {source}")]
    CredentialsFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported credentials type '{0}'")]
    UnsupportedCredentials(String),

    #[error("sign assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("token endpoint {endpoint}: {message}")]
    Endpoint { endpoint: String, message: String },
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("GCP auth failed: {0}")]
    Auth(String),

    #[error("GET {url}: {message}")]
    Request { url: String, message: String },

    #[error("{0}")]
    Api(String),

    #[error("unexpected response from {url}: missing '{field}'")]
    MissingField { url: String, field: &'static str },

    #[error("managed instance group '{0}' has no instances")]
    NoInstances(String),
}

/// Outcome of a single request attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Connect failure, attempt timeout, or an HTTP error status. Retried.
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// Anything that another attempt would not fix.
    #[error("request failed: {0}")]
    Fatal(String),
}

impl AttemptError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error(transparent)]
    Attempt(#[from] AttemptError),
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("install relay on {instance}: {source}")]
    Install {
        instance: String,
        #[source]
        source: ExecError,
    },

    #[error("start tunnel to {instance}: {source}")]
    Tunnel {
        instance: String,
        #[source]
        source: ExecError,
    },

    #[error("restart {instance}: {source}")]
    Restart {
        instance: String,
        #[source]
        source: ExecError,
    },

    #[error("port forward to {0} is already open")]
    AlreadyOpen(String),
}

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("provision error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("request error: {0}")]
    Request(#[from] RequestError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("invalid load balancer address '{0}'")]
    InvalidAddress(String),
}
