//! Request/response command protocol.
//!
//! A [`Request`] names a receiver on the agent, an action and string
//! parameters. Requests are encoded as JSON and carried in length-prefixed
//! frames (see [`crate::transport::send_message`]):
//!
//! ```text
//! request:  {"receiver":"KillVmReceiver","action":"killvm","params":{"vm-pid":"42"},"mode":"RESPONSE_EXPECTED"}
//! response: {"type":"OK","message":"..."}
//! ```

pub mod queue;
pub mod receiver;

pub use queue::RequestQueue;
pub use receiver::{Receiver, ReceiverRegistry};

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::endpoint::EndpointName;
use crate::error::IpcError;

/// Whether the sender waits for a [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    NoResponseExpected,
    #[default]
    ResponseExpected,
}

/// Result classification carried by a [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    Ok,
    Error,
    Nok,
    Noop,
    AuthFailed,
    Exception,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Nok => "NOK",
            Self::Noop => "NOOP",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Exception => "EXCEPTION",
        })
    }
}

/// Outcome of a request, produced by a receiver (or synthesised on failure).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl Response {
    pub const fn new(response_type: ResponseType) -> Self {
        Self {
            response_type,
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub const fn ok() -> Self {
        Self::new(ResponseType::Ok)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Error).with_message(message)
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self::new(ResponseType::Exception).with_message(message)
    }

    pub const fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.response_type),
            None => write!(f, "{}", self.response_type),
        }
    }
}

/// Lifecycle of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Enqueued,
    InFlight,
    Completed,
    Failed,
}

/// Notified once when a request reaches a terminal state.
///
/// `response` is `None` for fire-and-forget requests that were delivered.
/// Transport failures arrive as a synthesised [`ResponseType::Exception`].
pub trait RequestResponseListener: Send + Sync {
    fn fire_complete(&self, request: &Request, response: Option<&Response>);
}

impl<F> RequestResponseListener for F
where
    F: Fn(&Request, Option<&Response>) + Send + Sync,
{
    fn fire_complete(&self, request: &Request, response: Option<&Response>) {
        self(request, response);
    }
}

/// A command for a named receiver.
pub struct Request {
    receiver: String,
    action: String,
    params: BTreeMap<String, String>,
    destination: EndpointName,
    mode: DeliveryMode,
    state: RequestState,
    listeners: Vec<Arc<dyn RequestResponseListener>>,
}

impl Request {
    /// New response-expected request for `receiver` at `destination`.
    pub fn new(destination: EndpointName, receiver: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            receiver: receiver.into(),
            action: action.into(),
            params: BTreeMap::new(),
            destination,
            mode: DeliveryMode::default(),
            state: RequestState::Created,
            listeners: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_parameter(name, value);
        self
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub const fn parameters(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub const fn destination(&self) -> &EndpointName {
        &self.destination
    }

    pub const fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub const fn state(&self) -> RequestState {
        self.state
    }

    pub fn add_listener(&mut self, listener: Arc<dyn RequestResponseListener>) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn set_state(&mut self, state: RequestState) {
        self.state = state;
    }

    /// Terminal success: notify every listener and consume the request.
    pub(crate) fn complete(self, response: Option<Response>) {
        self.finish(RequestState::Completed, response.as_ref());
    }

    /// Terminal failure with a synthesised response.
    pub(crate) fn fail(self, response: &Response) {
        self.finish(RequestState::Failed, Some(response));
    }

    fn finish(mut self, state: RequestState, response: Option<&Response>) {
        self.state = state;
        let listeners = std::mem::take(&mut self.listeners);
        for listener in listeners {
            // One panicking listener must not starve the rest.
            let fired = catch_unwind(AssertUnwindSafe(|| listener.fire_complete(&self, response)));
            if fired.is_err() {
                warn!(receiver = %self.receiver, action = %self.action, "Request listener panicked");
            }
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("receiver", &self.receiver)
            .field("action", &self.action)
            .field("params", &self.params)
            .field("destination", &self.destination)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Wire form of a request.
#[derive(Debug, Serialize, Deserialize)]
struct RequestFrame {
    receiver: String,
    action: String,
    #[serde(default)]
    params: BTreeMap<String, String>,
    #[serde(default)]
    mode: DeliveryMode,
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, IpcError> {
    let frame = RequestFrame {
        receiver: request.receiver.clone(),
        action: request.action.clone(),
        params: request.params.clone(),
        mode: request.mode,
    };
    Ok(serde_json::to_vec(&frame)?)
}

/// Decode a request received on `destination`.
pub fn decode_request(bytes: &[u8], destination: EndpointName) -> Result<Request, IpcError> {
    let frame: RequestFrame = serde_json::from_slice(bytes)?;
    Ok(Request {
        receiver: frame.receiver,
        action: frame.action,
        params: frame.params,
        destination,
        mode: frame.mode,
        state: RequestState::InFlight,
        listeners: Vec::new(),
    })
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, IpcError> {
    Ok(serde_json::to_vec(response)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, IpcError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::transport::{recv_message, send_message, StreamChannel};

    fn endpoint() -> EndpointName {
        EndpointName::new("agent").unwrap()
    }

    #[tokio::test]
    async fn request_survives_the_wire() {
        let (a, b) = tokio::io::duplex(256);
        let mut tx = StreamChannel::new("tx", a);
        let mut rx = StreamChannel::new("rx", b);

        let request = Request::new(endpoint(), "R", "A").with_parameter("k", "v");
        send_message(&mut tx, &encode_request(&request).unwrap()).await.unwrap();

        let bytes = recv_message(&mut rx).await.unwrap().unwrap();
        let decoded = decode_request(&bytes, endpoint()).unwrap();
        assert_eq!(decoded.receiver(), "R");
        assert_eq!(decoded.action(), "A");
        assert_eq!(decoded.parameters(), request.parameters());
        assert_eq!(decoded.mode(), DeliveryMode::ResponseExpected);
    }

    #[test]
    fn wire_names_match_protocol_constants() {
        let request = Request::new(endpoint(), "KillVmReceiver", "killvm")
            .with_mode(DeliveryMode::NoResponseExpected)
            .with_parameter("vm-pid", "123456");
        let json = String::from_utf8(encode_request(&request).unwrap()).unwrap();
        assert!(json.contains(r#""mode":"NO_RESPONSE_EXPECTED""#));
        assert!(json.contains(r#""vm-pid":"123456""#));

        let json = String::from_utf8(encode_response(&Response::new(ResponseType::AuthFailed)).unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"AUTH_FAILED"}"#);
    }

    #[test]
    fn decode_defaults_mode_and_params() {
        let request = decode_request(br#"{"receiver":"R","action":"A"}"#, endpoint()).unwrap();
        assert_eq!(request.mode(), DeliveryMode::ResponseExpected);
        assert!(request.parameters().is_empty());

        assert!(decode_request(br#"{"action":"A"}"#, endpoint()).is_err());
        assert!(decode_response(br#"{"type":"MAYBE"}"#).is_err());
    }

    #[test]
    fn each_listener_fires_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut request = Request::new(endpoint(), "R", "A");
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            request.add_listener(Arc::new(move |req: &Request, resp: Option<&Response>| {
                assert_eq!(req.state(), RequestState::Failed);
                assert_eq!(resp.map(Response::response_type), Some(ResponseType::Exception));
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        request.fail(&Response::exception("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut request = Request::new(endpoint(), "R", "A");
        request.add_listener(Arc::new(|_: &Request, _: Option<&Response>| panic!("listener bug")));
        let counter = Arc::clone(&calls);
        request.add_listener(Arc::new(move |_: &Request, _: Option<&Response>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        request.complete(Some(Response::ok()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn response_display_includes_message() {
        assert_eq!(Response::ok().to_string(), "OK");
        assert_eq!(Response::error("no such receiver").to_string(), "ERROR: no such receiver");
    }
}
