//! jvm-agent-ipc library
//!
//! Command channel between monitoring tools and a JVM monitoring agent:
//! - Endpoint naming and transport selection from an IPC properties file
//! - TCP, UNIX-domain socket and Windows named-pipe transports behind one
//!   [`transport::Channel`] abstraction
//! - A request/response protocol with named receivers and a client-side
//!   request queue
//! - The agent host with its built-in receivers

pub mod agent;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod pool;
pub mod properties;
pub mod protocol;
pub mod transport;

pub use endpoint::EndpointName;
pub use error::IpcError;
