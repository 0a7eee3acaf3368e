//! Windows named pipe backend.
//!
//! Pipe paths are derived from the validated endpoint name and the current
//! user (see [`PipeProperties::pipe_path`]). The first pipe instance is
//! created with `first_pipe_instance`, so binding fails if another process
//! already owns the name, and remote clients are rejected.
//!
//! Unlike the UNIX socket backend, the client does not verify which account
//! owns the pipe server it connects to. Reading the server's owner SID needs
//! raw Win32 calls and this crate forbids `unsafe` code. A client can only
//! rely on the server-side exclusivity above: whoever created the first
//! instance of the name is the server.

use std::sync::Arc;

use crate::endpoint::EndpointName;
use crate::error::IpcError;
use crate::properties::PipeProperties;
use crate::protocol::receiver::ReceiverRegistry;

use super::{Channel, ServerHandle};

#[cfg(windows)]
pub(crate) async fn bind(
    props: &PipeProperties,
    endpoint: &EndpointName,
    registry: Arc<ReceiverRegistry>,
) -> Result<ServerHandle, IpcError> {
    imp::bind(props, endpoint, registry)
}

#[cfg(not(windows))]
pub(crate) async fn bind(
    _props: &PipeProperties,
    _endpoint: &EndpointName,
    _registry: Arc<ReceiverRegistry>,
) -> Result<ServerHandle, IpcError> {
    Err(IpcError::Unsupported(crate::properties::IpcType::WinPipe))
}

#[cfg(windows)]
pub(crate) async fn connect(
    props: &PipeProperties,
    endpoint: &EndpointName,
) -> Result<Box<dyn Channel>, IpcError> {
    let channel = imp::connect(props, endpoint).await?;
    Ok(Box::new(channel))
}

#[cfg(not(windows))]
pub(crate) async fn connect(
    _props: &PipeProperties,
    _endpoint: &EndpointName,
) -> Result<Box<dyn Channel>, IpcError> {
    Err(IpcError::Unsupported(crate::properties::IpcType::WinPipe))
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};
    use tokio::sync::watch;
    use tokio::task::JoinSet;
    use tracing::{debug, info, warn};

    use crate::endpoint::EndpointName;
    use crate::error::IpcError;
    use crate::identity::current_user;
    use crate::properties::PipeProperties;
    use crate::protocol::receiver::ReceiverRegistry;
    use crate::transport::server::{serve_channel, ListenAddress, ServerHandle};
    use crate::transport::StreamChannel;

    const ERROR_ACCESS_DENIED: i32 = 5;
    const ERROR_PIPE_BUSY: i32 = 231;
    const BUSY_RETRIES: u32 = 20;
    const BUSY_BACKOFF: Duration = Duration::from_millis(50);

    pub(super) fn bind(
        props: &PipeProperties,
        endpoint: &EndpointName,
        registry: Arc<ReceiverRegistry>,
    ) -> Result<ServerHandle, IpcError> {
        let path = props.pipe_path(&current_user(), endpoint);
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .reject_remote_clients(true)
            .create(&path)
            .map_err(|e| {
                if e.raw_os_error() == Some(ERROR_ACCESS_DENIED) {
                    IpcError::Io(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("pipe {path} is already owned by another process"),
                    ))
                } else {
                    IpcError::Io(e)
                }
            })?;
        info!(endpoint = %endpoint, pipe = %path, "Named pipe listener created");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            first,
            path.clone(),
            endpoint.clone(),
            registry,
            shutdown_rx,
        ));
        Ok(ServerHandle::new(
            endpoint.clone(),
            ListenAddress::Pipe(path),
            shutdown_tx,
            task,
        ))
    }

    fn next_instance(path: &str) -> io::Result<NamedPipeServer> {
        ServerOptions::new().reject_remote_clients(true).create(path)
    }

    async fn accept_loop(
        mut server: NamedPipeServer,
        path: String,
        endpoint: EndpointName,
        registry: Arc<ReceiverRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();
        let mut accepted_count: u64 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                connected = server.connect() => {
                    // A fresh instance must exist before the connected one is handed off.
                    let next = match next_instance(&path) {
                        Ok(next) => next,
                        Err(e) => {
                            warn!(pipe = %path, error = %e, "Cannot create next pipe instance, stopping listener");
                            break;
                        }
                    };
                    let connected_pipe = std::mem::replace(&mut server, next);
                    match connected {
                        Ok(()) => {
                            accepted_count += 1;
                            let name = format!("{endpoint}#{accepted_count}");
                            debug!(channel = %name, "Accepted named pipe client");
                            connections.spawn(serve_channel(
                                StreamChannel::new(name, connected_pipe),
                                endpoint.clone(),
                                Arc::clone(&registry),
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => warn!(pipe = %path, error = %e, "Named pipe connect failed"),
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(endpoint = %endpoint, error = %e, "Connection task failed");
                    }
                }
            }
        }

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!(endpoint = %endpoint, error = %e, "Connection task failed");
            }
        }
        drop(server);
        info!(endpoint = %endpoint, "Named pipe listener closed");
    }

    pub(super) async fn connect(
        props: &PipeProperties,
        endpoint: &EndpointName,
    ) -> Result<StreamChannel<NamedPipeClient>, IpcError> {
        let path = props.pipe_path(&current_user(), endpoint);
        let mut attempts = 0;
        loop {
            match ClientOptions::new().open(&path) {
                Ok(client) => {
                    debug!(endpoint = %endpoint, pipe = %path, "Connected to named pipe");
                    return Ok(StreamChannel::new(endpoint.to_string(), client));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(IpcError::EndpointMissing {
                        name: endpoint.to_string(),
                        location: path,
                    });
                }
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) && attempts < BUSY_RETRIES => {
                    attempts += 1;
                    tokio::time::sleep(BUSY_BACKOFF).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
