//! Client-side request queue.
//!
//! Requests are handed to a single worker task in FIFO order. The worker
//! keeps one channel per destination, writes each request, and for
//! response-expected requests holds that channel until the response frame
//! arrives. Every request ends in exactly one listener notification: the
//! response, `None` for delivered fire-and-forget requests, or a synthesised
//! `EXCEPTION`/`ERROR` when anything goes wrong on the way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DeliveryMode, Request, RequestState, Response};
use crate::endpoint::EndpointName;
use crate::error::IpcError;
use crate::protocol;
use crate::transport::{recv_message, send_message, Channel, ClientTransport, ReadStatus};

/// Serialises outbound requests and routes responses to their listeners.
pub struct RequestQueue {
    requests: mpsc::UnboundedSender<Request>,
    control: mpsc::UnboundedSender<CloseCommand>,
    close_seq: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

/// A `close_channel` call. `seq` orders it against requests going in flight.
struct CloseCommand {
    endpoint: EndpointName,
    seq: u64,
}

impl RequestQueue {
    /// Start the queue worker. Must be called inside a tokio runtime.
    pub fn new(transport: ClientTransport) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();
        let close_seq = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            transport,
            requests: request_rx,
            control: control_rx,
            close_seq: Arc::clone(&close_seq),
            channels: HashMap::new(),
        };
        Self {
            requests,
            control,
            close_seq,
            worker: tokio::spawn(worker.run()),
        }
    }

    /// Enqueue `request`. Listeners must already be attached.
    pub fn put_request(&self, mut request: Request) {
        request.set_state(RequestState::Enqueued);
        if let Err(mpsc::error::SendError(request)) = self.requests.send(request) {
            warn!(receiver = %request.receiver(), "Request queue is stopped, failing request");
            request.fail(&Response::exception("request queue is stopped"));
        }
    }

    /// Enqueue `request` and wait for its outcome.
    ///
    /// Returns `None` once a fire-and-forget request has been written.
    pub async fn submit(&self, mut request: Request) -> Option<Response> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        request.add_listener(Arc::new(move |_: &Request, response: Option<&Response>| {
            if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(response.cloned());
            }
        }));
        self.put_request(request);
        rx.await
            .unwrap_or_else(|_| Some(Response::exception("request abandoned by the queue worker")))
    }

    /// Close the channel to `destination`.
    ///
    /// A request in flight on that channel fails immediately with an
    /// `EXCEPTION` response. This is how callers impose their own deadlines.
    pub fn close_channel(&self, destination: &EndpointName) {
        let seq = self.close_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.control.send(CloseCommand {
            endpoint: destination.clone(),
            seq,
        });
    }

    /// Finish every queued request, then close all cached channels.
    pub async fn shutdown(self) {
        let Self {
            requests,
            control,
            worker,
            ..
        } = self;
        drop(requests);
        drop(control);
        if let Err(e) = worker.await {
            warn!(error = %e, "Request queue worker ended abnormally");
        }
    }
}

struct Worker {
    transport: ClientTransport,
    requests: mpsc::UnboundedReceiver<Request>,
    control: mpsc::UnboundedReceiver<CloseCommand>,
    close_seq: Arc<AtomicU64>,
    channels: HashMap<EndpointName, Box<dyn Channel>>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                request = self.requests.recv() => match request {
                    Some(request) => self.process(request).await,
                    None => break,
                },
                Some(close) = self.control.recv() => {
                    close_cached(&mut self.channels, &close.endpoint).await;
                }
            }
        }

        for (_, mut channel) in self.channels.drain() {
            channel.close().await;
        }
        debug!("Request queue stopped");
    }

    async fn process(&mut self, mut request: Request) {
        request.set_state(RequestState::InFlight);
        let endpoint = request.destination().clone();

        // Closes issued up to now predate this request: they apply to the
        // cached channels, never to the request itself.
        let in_flight_since = self.close_seq.load(Ordering::SeqCst);
        while let Ok(close) = self.control.try_recv() {
            close_cached(&mut self.channels, &close.endpoint).await;
        }

        let payload = match protocol::encode_request(&request) {
            Ok(payload) => payload,
            Err(e) => {
                request.fail(&Response::error(format!("cannot encode request: {e}")));
                return;
            }
        };

        let mut channel = match self.checkout(&endpoint).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(endpoint = %endpoint, receiver = %request.receiver(), error = %e, "Cannot reach endpoint");
                request.fail(&Response::exception(e.to_string()));
                return;
            }
        };

        if let Err(e) = send_message(&mut channel, &payload).await {
            warn!(channel = %channel.name(), error = %e, "Failed to send request");
            channel.close().await;
            request.fail(&Response::exception(e.to_string()));
            return;
        }

        if request.mode() == DeliveryMode::NoResponseExpected {
            self.channels.insert(endpoint, channel);
            request.complete(None);
            return;
        }

        let reply = tokio::select! {
            reply = recv_message(&mut channel) => Some(reply),
            () = wait_for_close(&mut self.control, &mut self.channels, &endpoint, in_flight_since) => None,
        };

        match reply {
            Some(Ok(Some(bytes))) => match protocol::decode_response(&bytes) {
                Ok(response) => {
                    self.channels.insert(endpoint, channel);
                    request.complete(Some(response));
                }
                Err(e) => {
                    warn!(channel = %channel.name(), error = %e, "Malformed response frame");
                    channel.close().await;
                    request.fail(&Response::error(format!("malformed response: {e}")));
                }
            },
            Some(Ok(None)) => {
                channel.close().await;
                request.fail(&Response::exception("peer closed the channel before responding"));
            }
            Some(Err(e)) => {
                warn!(channel = %channel.name(), error = %e, "Failed to read response");
                channel.close().await;
                request.fail(&Response::exception(e.to_string()));
            }
            None => {
                info!(channel = %channel.name(), receiver = %request.receiver(), "Channel closed with request in flight");
                channel.close().await;
                request.fail(&Response::exception("channel closed while the request was in flight"));
            }
        }
    }

    /// Reuse the cached channel for `endpoint` if its peer is still there,
    /// otherwise connect afresh.
    async fn checkout(&mut self, endpoint: &EndpointName) -> Result<Box<dyn Channel>, IpcError> {
        if let Some(mut channel) = self.channels.remove(endpoint) {
            let mut probe = [0u8; 1];
            match channel.try_read(&mut probe) {
                Ok(ReadStatus::Empty) if channel.is_open() => return Ok(channel),
                Ok(status) => debug!(channel = %channel.name(), ?status, "Cached channel is stale, reconnecting"),
                Err(e) => debug!(channel = %channel.name(), error = %e, "Cached channel failed, reconnecting"),
            }
            channel.close().await;
        }
        self.transport.connect(endpoint).await
    }
}

/// Resolves when `in_flight` is asked to close by a `close_channel` call
/// numbered after `since`. Close requests for other endpoints are served on
/// the way.
async fn wait_for_close(
    control: &mut mpsc::UnboundedReceiver<CloseCommand>,
    channels: &mut HashMap<EndpointName, Box<dyn Channel>>,
    in_flight: &EndpointName,
    since: u64,
) {
    loop {
        match control.recv().await {
            Some(close) if &close.endpoint == in_flight => {
                if close.seq > since {
                    return;
                }
                debug!(endpoint = %in_flight, seq = close.seq, "Ignoring close issued before the request went in flight");
            }
            Some(close) => close_cached(channels, &close.endpoint).await,
            None => std::future::pending::<()>().await,
        }
    }
}

async fn close_cached(channels: &mut HashMap<EndpointName, Box<dyn Channel>>, endpoint: &EndpointName) {
    if let Some(mut channel) = channels.remove(endpoint) {
        channel.close().await;
        debug!(endpoint = %endpoint, "Closed cached channel");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::properties::{IpcProperties, TcpProperties};
    use crate::protocol::receiver::{Receiver, ReceiverRegistry};
    use crate::protocol::ResponseType;
    use crate::transport::{listen, ListenAddress, ServerHandle};

    /// Records the `vm-pid` of every request it sees.
    struct RecordingKillVm(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Receiver for RecordingKillVm {
        fn name(&self) -> &str {
            "KillVmReceiver"
        }

        async fn receive(&self, request: &Request) -> Result<Response> {
            let pid = request.parameter("vm-pid").unwrap_or_default().to_string();
            let _ = self.0.send(pid);
            Ok(Response::ok())
        }
    }

    struct Echo;

    #[async_trait]
    impl Receiver for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        async fn receive(&self, request: &Request) -> Result<Response> {
            Ok(Response::ok().with_message(request.action()))
        }
    }

    /// Reports that it was reached, then never answers.
    struct Stuck(mpsc::UnboundedSender<()>);

    #[async_trait]
    impl Receiver for Stuck {
        fn name(&self) -> &str {
            "Stuck"
        }

        async fn receive(&self, _request: &Request) -> Result<Response> {
            let _ = self.0.send(());
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Response::ok())
        }
    }

    async fn start_tcp(registry: ReceiverRegistry) -> (ServerHandle, ClientTransport, EndpointName) {
        let endpoint = EndpointName::new("agent").unwrap();
        let props = IpcProperties::Tcp(TcpProperties::new("127.0.0.1").with_port(endpoint.clone(), 0));
        let server = listen(&props, &endpoint, Arc::new(registry)).await.unwrap();
        let ListenAddress::Tcp(addr) = *server.address() else {
            panic!("expected a tcp address");
        };
        let client = ClientTransport::new(IpcProperties::Tcp(
            TcpProperties::new("127.0.0.1").with_port(endpoint.clone(), addr.port()),
        ));
        (server, client, endpoint)
    }

    fn counting_listener(calls: &Arc<AtomicUsize>) -> Arc<dyn protocol::RequestResponseListener> {
        let calls = Arc::clone(calls);
        Arc::new(move |_: &Request, _: Option<&Response>| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn fire_and_forget_kill_reaches_receiver() {
        let (pid_tx, mut pid_rx) = mpsc::unbounded_channel();
        let mut registry = ReceiverRegistry::new();
        registry.register(Arc::new(RecordingKillVm(pid_tx))).unwrap();
        let (server, client, endpoint) = start_tcp(registry).await;
        let queue = RequestQueue::new(client);

        let (state_tx, state_rx) = oneshot::channel();
        let state_tx = Mutex::new(Some(state_tx));
        let mut request = Request::new(endpoint, "KillVmReceiver", "killvm")
            .with_mode(DeliveryMode::NoResponseExpected)
            .with_parameter("vm-pid", "123456");
        request.add_listener(Arc::new(move |req: &Request, resp: Option<&Response>| {
            if let Some(tx) = state_tx.lock().unwrap().take() {
                let _ = tx.send((req.state(), resp.cloned()));
            }
        }));
        queue.put_request(request);

        let (state, response) = state_rx.await.unwrap();
        assert_eq!(state, RequestState::Completed);
        assert!(response.is_none());

        let pid = tokio::time::timeout(Duration::from_secs(5), pid_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pid, "123456");

        queue.shutdown().await;
        server.close().await;
    }

    #[tokio::test]
    async fn unknown_receiver_yields_error() {
        let (server, client, endpoint) = start_tcp(ReceiverRegistry::new()).await;
        let queue = RequestQueue::new(client);

        let response = queue
            .submit(Request::new(endpoint, "NoSuchReceiver", "anything"))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Error);

        queue.shutdown().await;
        server.close().await;
    }

    #[tokio::test]
    async fn responses_reuse_the_cached_channel() {
        let mut registry = ReceiverRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let (server, client, endpoint) = start_tcp(registry).await;
        let queue = RequestQueue::new(client);

        for action in ["first", "second", "third"] {
            let response = queue
                .submit(Request::new(endpoint.clone(), "Echo", action))
                .await
                .unwrap();
            assert_eq!(response.response_type(), ResponseType::Ok);
            assert_eq!(response.message(), Some(action));
        }

        queue.shutdown().await;
        server.close().await;
    }

    #[tokio::test]
    async fn every_listener_fires_once_for_every_outcome() {
        const LISTENERS: usize = 4;
        let mut registry = ReceiverRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let (server, client, endpoint) = start_tcp(registry).await;
        let queue = RequestQueue::new(client);
        let calls = Arc::new(AtomicUsize::new(0));

        let unreachable = EndpointName::new("unconfigured").unwrap();
        let requests = [
            Request::new(endpoint.clone(), "Echo", "ok"),
            Request::new(endpoint.clone(), "Unknown", "error"),
            Request::new(unreachable, "Echo", "transport-failure"),
        ];
        for mut request in requests {
            for _ in 0..LISTENERS {
                request.add_listener(counting_listener(&calls));
            }
            queue.put_request(request);
        }

        queue.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3 * LISTENERS);
        server.close().await;
    }

    #[tokio::test]
    async fn connect_failure_becomes_exception() {
        let base = tempfile::tempdir().unwrap();
        let client = ClientTransport::new(IpcProperties::UnixSocket(
            crate::properties::UnixSocketProperties::new(base.path().join("absent")),
        ));
        let queue = RequestQueue::new(client);

        let response = queue
            .submit(Request::new(EndpointName::new("agent").unwrap(), "Echo", "x"))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Exception);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn closing_channel_fails_in_flight_request() {
        let mut registry = ReceiverRegistry::new();
        let (reached_tx, mut reached_rx) = mpsc::unbounded_channel();
        registry.register(Arc::new(Stuck(reached_tx))).unwrap();
        let (server, client, endpoint) = start_tcp(registry).await;
        let queue = RequestQueue::new(client);

        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));
        let mut request = Request::new(endpoint.clone(), "Stuck", "wait");
        request.add_listener(Arc::new(move |req: &Request, resp: Option<&Response>| {
            if let Some(tx) = done_tx.lock().unwrap().take() {
                let _ = tx.send((req.state(), resp.map(Response::response_type)));
            }
        }));
        queue.put_request(request);
        tokio::time::timeout(Duration::from_secs(5), reached_rx.recv())
            .await
            .unwrap()
            .unwrap();
        queue.close_channel(&endpoint);

        let (state, response_type) = tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, RequestState::Failed);
        assert_eq!(response_type, Some(ResponseType::Exception));

        queue.shutdown().await;
        server.close().await;
    }

    #[tokio::test]
    async fn close_between_requests_spares_the_next_request() {
        let mut registry = ReceiverRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let (server, client, endpoint) = start_tcp(registry).await;
        let queue = RequestQueue::new(client);

        let first = queue
            .submit(Request::new(endpoint.clone(), "Echo", "first"))
            .await
            .unwrap();
        assert_eq!(first.response_type(), ResponseType::Ok);

        // Nothing is in flight: only the cached channel goes away.
        queue.close_channel(&endpoint);
        let second = tokio::time::timeout(
            Duration::from_secs(5),
            queue.submit(Request::new(endpoint.clone(), "Echo", "second")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(second.response_type(), ResponseType::Ok);
        assert_eq!(second.message(), Some("second"));

        queue.shutdown().await;
        server.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reconnects_after_agent_restart() {
        let base = tempfile::tempdir().unwrap();
        let props = IpcProperties::UnixSocket(crate::properties::UnixSocketProperties::new(base.path()));
        let endpoint = EndpointName::new("agent").unwrap();
        let registry = || {
            let mut registry = ReceiverRegistry::new();
            registry.register(Arc::new(Echo)).unwrap();
            Arc::new(registry)
        };

        let queue = RequestQueue::new(ClientTransport::new(props.clone()));

        let server = listen(&props, &endpoint, registry()).await.unwrap();
        let first = queue.submit(Request::new(endpoint.clone(), "Echo", "before")).await;
        assert_eq!(first.unwrap().response_type(), ResponseType::Ok);
        server.close().await;

        let server = listen(&props, &endpoint, registry()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = queue.submit(Request::new(endpoint.clone(), "Echo", "after")).await;
        assert_eq!(second.unwrap().message(), Some("after"));

        queue.shutdown().await;
        server.close().await;
    }
}
