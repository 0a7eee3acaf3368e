//! Client side of the transports.

use std::sync::Arc;

use tracing::debug;

use super::Channel;
use crate::endpoint::EndpointName;
use crate::error::IpcError;
use crate::properties::IpcProperties;

/// Opens channels to named endpoints using one configured transport.
///
/// There is no fallback: if the configured transport cannot reach the
/// endpoint, `connect` fails with the reason.
#[derive(Debug, Clone)]
pub struct ClientTransport {
    properties: Arc<IpcProperties>,
}

impl ClientTransport {
    pub fn new(properties: IpcProperties) -> Self {
        Self {
            properties: Arc::new(properties),
        }
    }

    pub const fn from_shared(properties: Arc<IpcProperties>) -> Self {
        Self { properties }
    }

    pub fn properties(&self) -> &IpcProperties {
        &self.properties
    }

    /// Open a channel to `endpoint`.
    ///
    /// Fails with [`IpcError::RendezvousMissing`], [`IpcError::EndpointMissing`]
    /// or [`IpcError::OwnershipMismatch`] when the endpoint cannot be trusted
    /// or reached.
    pub async fn connect(&self, endpoint: &EndpointName) -> Result<Box<dyn Channel>, IpcError> {
        debug!(endpoint = %endpoint, ipc_type = %self.properties.ipc_type(), "Connecting");
        match &*self.properties {
            IpcProperties::Tcp(tcp) => Ok(Box::new(super::tcp::connect(tcp, endpoint).await?)),
            IpcProperties::UnixSocket(unix) => super::unix::connect(unix, endpoint).await,
            IpcProperties::WinPipe(pipe) => super::pipe::connect(pipe, endpoint).await,
        }
    }
}
