//! The monitoring agent: built-in receivers behind one listening endpoint.

pub mod helper;
pub mod receivers;

use std::sync::Arc;

use tracing::info;

pub use helper::{HelperConnector, ToolOutput, VmSession};
pub use receivers::{GcReceiver, HeapDumpReceiver, KillVmReceiver, PingReceiver, VmPool, VM_PID};

use crate::config::AgentConfig;
use crate::endpoint::EndpointName;
use crate::error::IpcError;
use crate::pool::ConnectionPool;
use crate::properties::IpcProperties;
use crate::protocol::{Receiver, ReceiverRegistry};
use crate::transport::{listen, ServerHandle};

/// Receivers plus the endpoint they are served on.
pub struct Agent {
    endpoint: EndpointName,
    registry: Arc<ReceiverRegistry>,
}

impl Agent {
    /// Agent with the built-in receivers only.
    pub fn new(config: &AgentConfig) -> Result<Self, IpcError> {
        Self::with_receivers(config, Vec::new())
    }

    /// Agent with the built-in receivers plus `extra`.
    ///
    /// Fails with [`IpcError::DuplicateReceiver`] if a name is taken twice.
    pub fn with_receivers(
        config: &AgentConfig,
        extra: impl IntoIterator<Item = Arc<dyn Receiver>>,
    ) -> Result<Self, IpcError> {
        let pool = Arc::new(ConnectionPool::new(HelperConnector::new(config.helper.clone())));

        let mut registry = ReceiverRegistry::new();
        registry.register(Arc::new(PingReceiver))?;
        registry.register(Arc::new(KillVmReceiver))?;
        registry.register(Arc::new(GcReceiver::new(Arc::clone(&pool))))?;
        registry.register(Arc::new(HeapDumpReceiver::new(
            pool,
            config.helper.heap_dump_dir.clone(),
        )))?;
        for receiver in extra {
            registry.register(receiver)?;
        }
        info!(receivers = ?registry.names(), "Agent receivers ready");

        Ok(Self {
            endpoint: config.endpoint.clone(),
            registry: Arc::new(registry),
        })
    }

    pub const fn endpoint(&self) -> &EndpointName {
        &self.endpoint
    }

    pub fn registry(&self) -> &ReceiverRegistry {
        &self.registry
    }

    /// Start serving on the transport described by `properties`.
    pub async fn start(&self, properties: &IpcProperties) -> Result<ServerHandle, IpcError> {
        let handle = listen(properties, &self.endpoint, Arc::clone(&self.registry)).await?;
        info!(endpoint = %self.endpoint, address = %handle.address(), "Agent listening");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;
    use crate::properties::TcpProperties;
    use crate::protocol::{Request, RequestQueue, Response, ResponseType};
    use crate::transport::{ClientTransport, ListenAddress};

    fn config() -> AgentConfig {
        AgentConfig::from_json(r#"{"endpoint": "agent", "properties_file": "ipc.json"}"#).unwrap()
    }

    struct Custom(&'static str);

    #[async_trait]
    impl Receiver for Custom {
        fn name(&self) -> &str {
            self.0
        }

        async fn receive(&self, _request: &Request) -> Result<Response> {
            Ok(Response::ok())
        }
    }

    #[test]
    fn builtin_receivers_are_registered() {
        let agent = Agent::new(&config()).unwrap();
        assert_eq!(
            agent.registry().names(),
            vec!["GcReceiver", "HeapDumpReceiver", "KillVmReceiver", "PingReceiver"]
        );
    }

    #[test]
    fn extra_receivers_cannot_shadow_builtins() {
        let err = Agent::with_receivers(&config(), [Arc::new(Custom("PingReceiver")) as Arc<dyn Receiver>])
            .err()
            .unwrap();
        assert!(matches!(err, IpcError::DuplicateReceiver(_)));

        let agent = Agent::with_receivers(&config(), [Arc::new(Custom("Extra")) as Arc<dyn Receiver>]).unwrap();
        assert!(agent.registry().get("Extra").is_some());
    }

    #[tokio::test]
    async fn ping_over_tcp() {
        let agent = Agent::new(&config()).unwrap();
        let endpoint = agent.endpoint().clone();
        let server = agent
            .start(&IpcProperties::Tcp(TcpProperties::new("127.0.0.1").with_port(endpoint.clone(), 0)))
            .await
            .unwrap();
        let ListenAddress::Tcp(addr) = *server.address() else {
            panic!("expected a tcp address");
        };

        let queue = RequestQueue::new(ClientTransport::new(IpcProperties::Tcp(
            TcpProperties::new("127.0.0.1").with_port(endpoint.clone(), addr.port()),
        )));
        let response = queue
            .submit(Request::new(endpoint.clone(), "PingReceiver", "ping"))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Ok);

        let response = queue
            .submit(Request::new(endpoint, "KillVmReceiver", "killvm").with_parameter(VM_PID, "1"))
            .await
            .unwrap();
        assert_eq!(response.response_type(), ResponseType::Error);

        queue.shutdown().await;
        server.close().await;
    }
}
