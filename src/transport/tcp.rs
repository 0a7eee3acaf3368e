//! TCP socket backend.
//!
//! The listener is a single task: it owns the listening socket and drives
//! every accepted peer from the same loop through `FuturesUnordered`, so no
//! peer gets a task of its own. Each peer holds a [`SelectionKey`] in the
//! loop's key set until its channel closes.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::server::{serve_channel, ListenAddress, ServerHandle};
use super::{StreamChannel, ACCEPT_BACKOFF};
use crate::endpoint::EndpointName;
use crate::error::IpcError;
use crate::properties::TcpProperties;
use crate::protocol::receiver::ReceiverRegistry;

/// Peers currently registered with an accept loop.
#[derive(Clone, Default)]
pub(crate) struct KeySet {
    inner: Arc<KeySetInner>,
}

#[derive(Default)]
struct KeySetInner {
    next_id: AtomicU64,
    peers: Mutex<HashMap<u64, SocketAddr>>,
}

impl KeySet {
    fn register(&self, peer: SocketAddr) -> SelectionKey {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, peer);
        SelectionKey {
            id,
            keys: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Registration of one accepted peer. Cancelled when its channel closes
/// (or is dropped), always before the peer's socket is released.
pub struct SelectionKey {
    id: u64,
    keys: Arc<KeySetInner>,
}

impl SelectionKey {
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for SelectionKey {
    fn drop(&mut self) {
        let removed = self
            .keys
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        if let Some(peer) = removed {
            debug!(key = self.id, peer = %peer, "Selection key cancelled");
        }
    }
}

/// Bind the endpoint's configured port and start the accept loop.
pub(crate) async fn bind(
    props: &TcpProperties,
    endpoint: &EndpointName,
    registry: Arc<ReceiverRegistry>,
) -> Result<ServerHandle, IpcError> {
    let port = props.port(endpoint).ok_or_else(|| IpcError::EndpointMissing {
        name: endpoint.to_string(),
        location: format!("tcp properties (no tcp.port.{endpoint} entry)"),
    })?;

    let listener = TcpListener::bind((props.host(), port)).await?;
    let local = listener.local_addr()?;
    info!(endpoint = %endpoint, addr = %local, "TCP listener bound");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(accept_loop(listener, endpoint.clone(), registry, shutdown_rx));
    Ok(ServerHandle::new(
        endpoint.clone(),
        ListenAddress::Tcp(local),
        shutdown_tx,
        task,
    ))
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: EndpointName,
    registry: Arc<ReceiverRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let keys = KeySet::default();
    let mut peers = FuturesUnordered::new();
    let backoff = sleep(ACCEPT_BACKOFF);
    tokio::pin!(backoff);
    let mut paused = false;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            () = &mut backoff, if paused => paused = false,
            accepted = listener.accept(), if !paused => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let key = keys.register(peer);
                    let channel = StreamChannel::new(format!("{endpoint}@{peer}"), stream).with_key(key);
                    debug!(endpoint = %endpoint, peer = %peer, "Accepted TCP peer");
                    peers.push(serve_channel(
                        channel,
                        endpoint.clone(),
                        Arc::clone(&registry),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    // Persistent failures such as EMFILE would otherwise spin.
                    warn!(endpoint = %endpoint, error = %e, "TCP accept failed, backing off");
                    backoff.as_mut().reset(Instant::now() + ACCEPT_BACKOFF);
                    paused = true;
                }
            },
            Some(()) = peers.next(), if !peers.is_empty() => {}
        }
    }

    // Peers see the shutdown signal, cancel their keys and close their sockets.
    while peers.next().await.is_some() {}
    let leftover = keys.len();
    if leftover > 0 {
        warn!(endpoint = %endpoint, leftover, "Selection keys still registered at shutdown");
    }
    drop(listener);
    info!(endpoint = %endpoint, "TCP listener closed");
}

/// Connect to the endpoint's configured port.
pub(crate) async fn connect(
    props: &TcpProperties,
    endpoint: &EndpointName,
) -> Result<StreamChannel<TcpStream>, IpcError> {
    let port = props.port(endpoint).ok_or_else(|| IpcError::EndpointMissing {
        name: endpoint.to_string(),
        location: format!("tcp properties (no tcp.port.{endpoint} entry)"),
    })?;

    let stream = match TcpStream::connect((props.host(), port)).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(IpcError::EndpointMissing {
                name: endpoint.to_string(),
                location: format!("{}:{port}", props.host()),
            });
        }
        Err(e) => return Err(e.into()),
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(endpoint = %endpoint, error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(StreamChannel::new(format!("{endpoint}@{}:{port}", props.host()), stream))
}
