//! Server-side lifecycle shared by all backends.
//!
//! [`listen`] picks the backend from the resolved properties. Every accepted
//! peer runs [`serve_channel`]: read a framed request, dispatch it to the
//! named receiver, write the response back unless the request was
//! fire-and-forget. A failing peer only ever takes down its own channel.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{recv_message, send_message, Channel};
use crate::endpoint::EndpointName;
use crate::error::IpcError;
use crate::properties::IpcProperties;
use crate::protocol::receiver::ReceiverRegistry;
use crate::protocol::{self, DeliveryMode, Response};

/// Where a listener is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
    Pipe(String),
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Pipe(name) => f.write_str(name),
        }
    }
}

/// A running listener.
///
/// Dropping the handle signals the listener to stop; [`ServerHandle::close`]
/// additionally waits until every peer channel has been closed.
pub struct ServerHandle {
    endpoint: EndpointName,
    address: ListenAddress,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub(crate) fn new(
        endpoint: EndpointName,
        address: ListenAddress,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            endpoint,
            address,
            shutdown,
            task: Some(task),
        }
    }

    pub fn endpoint(&self) -> &EndpointName {
        &self.endpoint
    }

    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    /// Stop accepting, close every peer channel, then release the listener.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(endpoint = %self.endpoint, error = %e, "Listener task ended abnormally");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Start listening on `endpoint` with the transport `props` describes.
///
/// Configuration problems (no port for the endpoint, unsupported transport,
/// a rendezvous directory owned by someone else) surface here, before the
/// accept loop starts.
pub async fn listen(
    props: &IpcProperties,
    endpoint: &EndpointName,
    registry: Arc<ReceiverRegistry>,
) -> Result<ServerHandle, IpcError> {
    match props {
        IpcProperties::Tcp(tcp) => super::tcp::bind(tcp, endpoint, registry).await,
        IpcProperties::UnixSocket(unix) => super::unix::bind(unix, endpoint, registry).await,
        IpcProperties::WinPipe(pipe) => super::pipe::bind(pipe, endpoint, registry).await,
    }
}

/// Serve one peer until it disconnects, fails, or the listener shuts down.
pub(crate) async fn serve_channel<C: Channel>(
    mut channel: C,
    endpoint: EndpointName,
    registry: Arc<ReceiverRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let keep_going = tokio::select! {
            keep_going = serve_one(&mut channel, &endpoint, &registry) => keep_going,
            _ = shutdown.changed() => false,
        };
        if !keep_going {
            break;
        }
    }
    channel.close().await;
}

/// Read and answer one request. Returns `false` once the peer is done.
async fn serve_one<C: Channel>(channel: &mut C, endpoint: &EndpointName, registry: &ReceiverRegistry) -> bool {
    match recv_message(channel).await {
        Ok(Some(bytes)) => match handle_frame(channel, &bytes, endpoint, registry).await {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %channel.name(), error = %e, "Failed to answer request");
                false
            }
        },
        Ok(None) => {
            debug!(channel = %channel.name(), "Peer disconnected");
            false
        }
        Err(e) => {
            warn!(channel = %channel.name(), error = %e, "Dropping peer after read failure");
            false
        }
    }
}

async fn handle_frame<C: Channel>(
    channel: &mut C,
    bytes: &[u8],
    endpoint: &EndpointName,
    registry: &ReceiverRegistry,
) -> Result<(), IpcError> {
    let request = match protocol::decode_request(bytes, endpoint.clone()) {
        Ok(request) => request,
        Err(e) => {
            // Framing is intact, so the connection stays usable.
            warn!(channel = %channel.name(), error = %e, "Malformed request frame");
            let response = Response::error(format!("malformed request: {e}"));
            return send_message(channel, &protocol::encode_response(&response)?).await;
        }
    };

    let response = registry.dispatch(&request).await;
    if request.mode() == DeliveryMode::ResponseExpected {
        send_message(channel, &protocol::encode_response(&response)?).await?;
    }
    Ok(())
}
