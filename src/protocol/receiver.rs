//! Agent-side receivers and the dispatch boundary.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, warn};

use super::{Request, Response};
use crate::error::IpcError;

/// A named command handler on the agent.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Name clients address this receiver by. Unique within a registry.
    fn name(&self) -> &str;

    /// Handle one request.
    ///
    /// Returning `Err` (or panicking) yields an `EXCEPTION` response; it never
    /// reaches the transport.
    async fn receive(&self, request: &Request) -> Result<Response>;
}

/// Receivers by name.
#[derive(Default)]
pub struct ReceiverRegistry {
    receivers: HashMap<String, Arc<dyn Receiver>>,
}

impl ReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a receiver. Names must be unique.
    pub fn register(&mut self, receiver: Arc<dyn Receiver>) -> Result<(), IpcError> {
        let name = receiver.name().to_string();
        if self.receivers.contains_key(&name) {
            return Err(IpcError::DuplicateReceiver(name));
        }
        debug!(receiver = %name, "Registered receiver");
        self.receivers.insert(name, receiver);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Receiver>> {
        self.receivers.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.receivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Route `request` to its receiver and turn every failure into a response.
    pub async fn dispatch(&self, request: &Request) -> Response {
        let Some(receiver) = self.receivers.get(request.receiver()) else {
            warn!(receiver = %request.receiver(), action = %request.action(), "Unknown receiver");
            return Response::error(format!("unknown receiver '{}'", request.receiver()));
        };

        debug!(receiver = %request.receiver(), action = %request.action(), "Dispatching request");
        match AssertUnwindSafe(receiver.receive(request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(receiver = %request.receiver(), action = %request.action(), error = %e, "Receiver failed");
                Response::exception(format!("{e:#}"))
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(receiver = %request.receiver(), action = %request.action(), panic = %reason, "Receiver panicked");
                Response::exception(format!("receiver panicked: {reason}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointName;
    use crate::protocol::ResponseType;

    struct Fixed(&'static str, ResponseType);

    #[async_trait]
    impl Receiver for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn receive(&self, _request: &Request) -> Result<Response> {
            Ok(Response::new(self.1))
        }
    }

    struct Failing;

    #[async_trait]
    impl Receiver for Failing {
        fn name(&self) -> &str {
            "Failing"
        }

        async fn receive(&self, _request: &Request) -> Result<Response> {
            anyhow::bail!("disk full")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Receiver for Panicking {
        fn name(&self) -> &str {
            "Panicking"
        }

        async fn receive(&self, _request: &Request) -> Result<Response> {
            panic!("receiver bug")
        }
    }

    fn request(receiver: &str) -> Request {
        Request::new(EndpointName::new("agent").unwrap(), receiver, "act")
    }

    fn registry() -> ReceiverRegistry {
        let mut registry = ReceiverRegistry::new();
        registry.register(Arc::new(Fixed("Nok", ResponseType::Nok))).unwrap();
        registry.register(Arc::new(Failing)).unwrap();
        registry.register(Arc::new(Panicking)).unwrap();
        registry
    }

    #[tokio::test]
    async fn dispatches_by_name() {
        let response = registry().dispatch(&request("Nok")).await;
        assert_eq!(response.response_type(), ResponseType::Nok);
    }

    #[tokio::test]
    async fn unknown_receiver_is_an_error_response() {
        let response = registry().dispatch(&request("Nobody")).await;
        assert_eq!(response.response_type(), ResponseType::Error);
        assert!(response.message().unwrap().contains("Nobody"));
    }

    #[tokio::test]
    async fn receiver_errors_and_panics_become_exceptions() {
        let registry = registry();

        let failed = registry.dispatch(&request("Failing")).await;
        assert_eq!(failed.response_type(), ResponseType::Exception);
        assert!(failed.message().unwrap().contains("disk full"));

        let panicked = registry.dispatch(&request("Panicking")).await;
        assert_eq!(panicked.response_type(), ResponseType::Exception);
        assert!(panicked.message().unwrap().contains("receiver bug"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = registry();
        let err = registry.register(Arc::new(Failing)).unwrap_err();
        assert!(matches!(err, IpcError::DuplicateReceiver(ref n) if n == "Failing"));
        assert_eq!(registry.names(), vec!["Failing", "Nok", "Panicking"]);
    }
}
