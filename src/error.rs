//! Error types for vsbmc

use thiserror::Error;

/// Result type alias using the vsbmc Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the supervisor, listener, and hypervisor
/// adapter.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors: missing directory, unparseable file, missing
    /// required field.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A BMC already exists for this virtual machine.
    #[error("VM {0} already exists")]
    AlreadyExists(String),

    /// No virtual machine with a matching name.
    #[error("No VM with matching name {0} was found")]
    VmNotFound(String),

    /// No virtual machine with a matching UUID.
    #[error("No VM with matching UUID {0} was found")]
    VmNotFoundByUuid(String),

    /// Failed to open a connection with the VI server.
    #[error("Failed to establish a connection with VI server {server}: {message}")]
    HypervisorConnect { server: String, message: String },

    /// A hypervisor API call failed after the connection was established.
    #[error("Hypervisor operation failed: {0}")]
    HypervisorOp(String),

    /// Malformed datagram, unknown command, bad cipher suite. Never fatal
    /// inside a listener.
    #[error("Protocol error: {0}")]
    Protocol(#[from] vsbmc_protocol::ProtocolError),

    /// An in-session packet that cannot be accepted: wrong session state
    /// or a stale sequence number. The datagram is dropped.
    #[error("Session error: {0}")]
    Session(String),

    /// RPC transport errors between the CLI and the supervisor.
    #[error("Control channel error: {0}")]
    Control(String),

    /// Child process management errors in the supervisor.
    #[error("Process error: {0}")]
    Process(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
