//! UNIX domain socket backend.
//!
//! Sockets live under a per-user directory (`<dir>/<username>/<endpoint>`)
//! created with mode `0700`. Both sides check that the directory and the
//! socket file belong to the current user before trusting them, and the
//! listener refuses peers running as a different uid.

use std::sync::Arc;

use crate::endpoint::EndpointName;
use crate::error::IpcError;
use crate::properties::UnixSocketProperties;
use crate::protocol::receiver::ReceiverRegistry;

use super::{Channel, ServerHandle};

#[cfg(unix)]
pub(crate) async fn bind(
    props: &UnixSocketProperties,
    endpoint: &EndpointName,
    registry: Arc<ReceiverRegistry>,
) -> Result<ServerHandle, IpcError> {
    imp::bind(props, endpoint, registry).await
}

#[cfg(not(unix))]
pub(crate) async fn bind(
    _props: &UnixSocketProperties,
    _endpoint: &EndpointName,
    _registry: Arc<ReceiverRegistry>,
) -> Result<ServerHandle, IpcError> {
    Err(IpcError::Unsupported(crate::properties::IpcType::UnixSocket))
}

#[cfg(unix)]
pub(crate) async fn connect(
    props: &UnixSocketProperties,
    endpoint: &EndpointName,
) -> Result<Box<dyn Channel>, IpcError> {
    let channel = imp::connect(props, endpoint).await?;
    Ok(Box::new(channel))
}

#[cfg(not(unix))]
pub(crate) async fn connect(
    _props: &UnixSocketProperties,
    _endpoint: &EndpointName,
) -> Result<Box<dyn Channel>, IpcError> {
    Err(IpcError::Unsupported(crate::properties::IpcType::UnixSocket))
}

#[cfg(unix)]
mod imp {
    use std::fs::{self, DirBuilder, Metadata, Permissions};
    use std::io;
    use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use nix::unistd::Uid;
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::watch;
    use tokio::task::JoinSet;
    use tokio::time::{sleep, Instant};
    use tracing::{debug, info, warn};

    use crate::endpoint::EndpointName;
    use crate::error::IpcError;
    use crate::identity::current_user;
    use crate::properties::UnixSocketProperties;
    use crate::protocol::receiver::ReceiverRegistry;
    use crate::transport::server::{serve_channel, ListenAddress, ServerHandle};
    use crate::transport::{StreamChannel, ACCEPT_BACKOFF};

    pub(super) async fn bind(
        props: &UnixSocketProperties,
        endpoint: &EndpointName,
        registry: Arc<ReceiverRegistry>,
    ) -> Result<ServerHandle, IpcError> {
        let user = current_user();
        let uid = Uid::effective().as_raw();

        fs::create_dir_all(props.socket_dir())?;
        prepare_user_dir(&props.user_dir(&user), uid)?;

        let path = props.socket_path(&user, endpoint);
        remove_stale_socket(&path, uid)?;

        let listener = UnixListener::bind(&path)?;
        info!(endpoint = %endpoint, path = %path.display(), "UNIX socket listener bound");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            path.clone(),
            uid,
            endpoint.clone(),
            registry,
            shutdown_rx,
        ));
        Ok(ServerHandle::new(
            endpoint.clone(),
            ListenAddress::Unix(path),
            shutdown_tx,
            task,
        ))
    }

    async fn accept_loop(
        listener: UnixListener,
        path: PathBuf,
        uid: u32,
        endpoint: EndpointName,
        registry: Arc<ReceiverRegistry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();
        let mut accepted_count: u64 = 0;
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
                    Ok((stream, _)) => {
                        match stream.peer_cred() {
                            Ok(cred) if cred.uid() == uid => {
                                accepted_count += 1;
                                let name = format!("{endpoint}#{accepted_count}");
                                debug!(channel = %name, pid = ?cred.pid(), "Accepted UNIX socket peer");
                                connections.spawn(serve_channel(
                                    StreamChannel::new(name, stream),
                                    endpoint.clone(),
                                    Arc::clone(&registry),
                                    shutdown.clone(),
                                ));
                            }
                            Ok(cred) => {
                                warn!(endpoint = %endpoint, peer_uid = cred.uid(), expected = uid, "Refusing peer owned by another user");
                            }
                            Err(e) => {
                                warn!(endpoint = %endpoint, error = %e, "Cannot read peer credentials, refusing peer");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "UNIX socket accept failed, backing off");
                        backoff.as_mut().reset(Instant::now() + ACCEPT_BACKOFF);
                        paused = true;
                    }
                },
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
        drop(listener);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
        info!(endpoint = %endpoint, "UNIX socket listener closed");
    }

    pub(super) async fn connect(
        props: &UnixSocketProperties,
        endpoint: &EndpointName,
    ) -> Result<StreamChannel<UnixStream>, IpcError> {
        let user = current_user();
        let uid = Uid::effective().as_raw();

        let dir = props.user_dir(&user);
        let dir_meta = match fs::symlink_metadata(&dir) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(IpcError::RendezvousMissing(dir));
            }
            Err(e) => return Err(e.into()),
        };
        if !dir_meta.is_dir() {
            return Err(IpcError::RendezvousMissing(dir));
        }
        check_owner(&dir, &dir_meta, uid)?;

        let path = props.socket_path(&user, endpoint);
        let missing = || IpcError::EndpointMissing {
            name: endpoint.to_string(),
            location: dir.display().to_string(),
        };
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(missing()),
            Err(e) => return Err(e.into()),
        };
        check_owner(&path, &meta, uid)?;
        if !meta.file_type().is_socket() {
            return Err(missing());
        }

        let stream = match UnixStream::connect(&path).await {
            Ok(stream) => stream,
            // A socket file nobody listens on any more.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => return Err(missing()),
            Err(e) => return Err(e.into()),
        };
        debug!(endpoint = %endpoint, path = %path.display(), "Connected to UNIX socket");
        Ok(StreamChannel::new(endpoint.to_string(), stream))
    }

    /// Create the per-user directory if needed and make sure it is ours and private.
    fn prepare_user_dir(dir: &Path, uid: u32) -> Result<(), IpcError> {
        match fs::symlink_metadata(dir) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(IpcError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists and is not a directory", dir.display()),
                    )));
                }
                check_owner(dir, &meta, uid)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new().mode(0o700).create(dir)?;
                debug!(dir = %dir.display(), "Created socket directory");
            }
            Err(e) => return Err(e.into()),
        }
        fs::set_permissions(dir, Permissions::from_mode(0o700))?;
        Ok(())
    }

    fn remove_stale_socket(path: &Path, uid: u32) -> Result<(), IpcError> {
        match fs::symlink_metadata(path) {
            Ok(meta) => {
                check_owner(path, &meta, uid)?;
                fs::remove_file(path)?;
                debug!(path = %path.display(), "Removed stale socket file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(super) fn check_owner(path: &Path, meta: &Metadata, expected: u32) -> Result<(), IpcError> {
        let actual = meta.uid();
        if actual == expected {
            Ok(())
        } else {
            Err(IpcError::OwnershipMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
            })
        }
    }
}
