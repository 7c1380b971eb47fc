//! In-process transport
//!
//! Routes requests between "nodes" living in one process. Backs embedded
//! single-node deployments and every protocol test; nodes can be made
//! unreachable to simulate partitions.

use super::{Transport, TransportAction};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

type RawHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Vec<u8>> + Send + Sync>;

/// Transport connecting nodes within one process
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<(String, String), RawHandler>>,
    unreachable: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of `action` on `node_id`
    pub fn register<A, F, Fut>(&self, node_id: &str, handler: F)
    where
        A: TransportAction + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A::Response>> + Send + 'static,
    {
        self.register_action::<A, F, Fut>(node_id, A::NAME, handler);
    }

    /// Register a handler working on raw payloads; the handler must encode
    /// a `Result<Response, ClusterError>` itself
    pub fn register_raw(
        &self,
        node_id: &str,
        action: &str,
        handler: impl Fn(Vec<u8>) -> BoxFuture<'static, Vec<u8>> + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .insert((node_id.to_string(), action.to_string()), Arc::new(handler));
    }

    /// Register under an explicit action name (broadcast `[n]` handlers)
    pub fn register_action<A, F, Fut>(&self, node_id: &str, action: &str, handler: F)
    where
        A: TransportAction + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A::Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let raw: RawHandler = Arc::new(move |payload: Vec<u8>| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let reply: std::result::Result<A::Response, ClusterError> =
                    match serde_json::from_slice::<A>(&payload) {
                        Ok(request) => handler(request).await,
                        Err(e) => Err(ClusterError::Serialization(e.to_string())),
                    };
                // a reply that cannot be encoded is a programming error on
                // the handler side; surface it as a serialization failure
                serde_json::to_vec(&reply).unwrap_or_else(|e| {
                    let fallback: std::result::Result<A::Response, ClusterError> =
                        Err(ClusterError::Serialization(e.to_string()));
                    serde_json::to_vec(&fallback).unwrap_or_default()
                })
            })
        });
        self.handlers
            .write()
            .insert((node_id.to_string(), action.to_string()), raw);
    }

    /// Simulate a partition: requests to this node fail with a connection
    /// error until cleared
    pub fn set_unreachable(&self, node_id: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.write().insert(node_id.to_string());
        } else {
            self.unreachable.write().remove(node_id);
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_raw(&self, node_id: &str, action: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        if self.unreachable.read().contains(node_id) {
            return Err(ClusterError::Connection(format!(
                "node {node_id} is unreachable"
            )));
        }
        let handler = self
            .handlers
            .read()
            .get(&(node_id.to_string(), action.to_string()))
            .cloned()
            .ok_or_else(|| {
                ClusterError::NodeUnavailable(format!("no handler for {action} on {node_id}"))
            })?;
        Ok(handler(payload).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::send_request;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    impl TransportAction for Echo {
        const NAME: &'static str = "internal:test/echo";
        type Response = String;
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let transport = LocalTransport::new();
        transport.register::<Echo, _, _>("n1", |req| async move { Ok(req.text.to_uppercase()) });

        let reply = send_request(&transport, "n1", &Echo { text: "hi".into() })
            .await
            .unwrap();
        assert_eq!(reply, "HI");
    }

    #[tokio::test]
    async fn test_remote_error_roundtrips() {
        let transport = LocalTransport::new();
        transport.register::<Echo, _, _>("n1", |_req| async move {
            Err(ClusterError::Core(basalt::Error::Validation("nope".into())))
        });

        let err = send_request(&transport, "n1", &Echo { text: "hi".into() })
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "validation");
    }

    #[tokio::test]
    async fn test_unknown_handler() {
        let transport = LocalTransport::new();
        let err = send_request(&transport, "n9", &Echo { text: "hi".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NodeUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let transport = LocalTransport::new();
        transport.register::<Echo, _, _>("n1", |req| async move { Ok(req.text) });
        transport.set_unreachable("n1", true);

        let err = send_request(&transport, "n1", &Echo { text: "hi".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Connection(_)));

        transport.set_unreachable("n1", false);
        assert!(send_request(&transport, "n1", &Echo { text: "hi".into() })
            .await
            .is_ok());
    }
}
