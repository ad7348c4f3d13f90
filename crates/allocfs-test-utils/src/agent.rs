//! Agent test helpers.
//!
//! [`TestAgent`] runs a real [`Agent`] on an ephemeral localhost port for
//! end-to-end tests through [`AgentClient`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use allocfs_config::AppConfig;
use allocfs_core::rpc::StreamingRpc;
use allocfs_core::{Agent, AgentClient, AgentError, AllocFsProvider};

/// A running agent bound to `127.0.0.1:0`.
pub struct TestAgent {
    pub agent: Arc<Agent>,
    pub addr: SocketAddr,
    handle: JoinHandle<Result<(), AgentError>>,
}

impl TestAgent {
    /// Start an agent with its default handlers.
    pub async fn start(config: AppConfig) -> Self {
        Self::spawn(Agent::new(config)).await
    }

    /// Start an agent with an explicit filesystem provider and handlers.
    pub async fn start_with(
        config: AppConfig,
        allocs: Arc<dyn AllocFsProvider>,
        rpc: StreamingRpc,
    ) -> Self {
        Self::spawn(Agent::with_parts(config, allocs, rpc)).await
    }

    async fn spawn(agent: Agent) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("listener has no address");
        let agent = Arc::new(agent);
        let handle = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.serve(listener).await }
        });
        Self {
            agent,
            addr,
            handle,
        }
    }

    /// A client pointed at this agent.
    pub fn client(&self) -> AgentClient {
        AgentClient::new(self.addr.to_string())
    }

    /// Shut the agent down and wait for it to stop.
    pub async fn stop(self) {
        self.agent.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("agent did not stop in time")
            .expect("agent task panicked")
            .expect("agent returned an error");
    }
}
