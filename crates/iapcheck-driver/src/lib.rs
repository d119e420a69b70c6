pub mod error;
pub mod exec;
pub mod forward;
pub mod helper;
pub mod inventory;
pub mod request;
pub mod retry;
pub mod ssh;
pub mod terraform;
pub mod token;

pub use error::{
    AttemptError, ExecError, ForwardError, HelperError, InventoryError, ProvisionError,
    RequestError, TokenError,
};
pub use exec::{CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use forward::{ForwardState, ProcessState, RemotePortForwarder, TunnelProcess};
pub use helper::{IapHelper, IapHelperParts, DEFAULT_REQUEST_TIMEOUT};
pub use inventory::{GcpInventory, Inventory};
pub use request::{AuthorizedClient, AuthorizedGet, IapTarget, ReqwestTransport, Transport};
pub use retry::RetryPolicy;
pub use ssh::IapSsh;
pub use terraform::TerraformDeployer;
pub use token::{AdcIdTokenProvider, IdTokenProvider, StaticIdToken};

#[cfg(any(test, feature = "test-util"))]
pub use exec::ScriptedRunner;
