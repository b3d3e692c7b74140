// src/cluster/transport.rs

//! Channel transport connecting the scheduler, workers and clients of a
//! [`super::LocalCluster`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, trace};

use crate::errors::{FlotillaError, Result};
use crate::protocol::{ClientMessage, FetchResponse, WorkerMessage};
use crate::scheduler::SchedulerComms;
use crate::types::{ClientId, Key, WorkerAddr};
use crate::worker::{FetchRequest, PeerClient};

/// Inbound channels of one connected worker.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    pub messages: mpsc::Sender<WorkerMessage>,
    pub fetch: mpsc::Sender<FetchRequest>,
}

/// Who is connected, and how to reach them.
#[derive(Debug, Default)]
pub struct Registry {
    pub workers: BTreeMap<WorkerAddr, WorkerEndpoint>,
    pub clients: BTreeMap<ClientId, mpsc::UnboundedSender<ClientMessage>>,
}

pub type SharedRegistry = Arc<RwLock<Registry>>;

impl Registry {
    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Registry::default()))
    }
}

async fn worker_endpoint(registry: &SharedRegistry, worker: &str) -> Result<WorkerEndpoint> {
    registry
        .read()
        .await
        .workers
        .get(worker)
        .cloned()
        .ok_or_else(|| FlotillaError::WorkerNotFound(worker.to_string()))
}

/// [`SchedulerComms`] over the registry's channels.
#[derive(Debug, Clone)]
pub struct ChannelSchedulerComms {
    registry: SharedRegistry,
}

impl ChannelSchedulerComms {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }
}

impl SchedulerComms for ChannelSchedulerComms {
    fn send_to_worker(
        &self,
        worker: &str,
        msg: WorkerMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let worker = worker.to_string();
        Box::pin(async move {
            let endpoint = worker_endpoint(&self.registry, &worker).await?;
            trace!(worker = %worker, ?msg, "scheduler -> worker");
            endpoint
                .messages
                .send(msg)
                .await
                .map_err(|_| FlotillaError::ConnectionClosed(format!("worker {worker}")))
        })
    }

    fn send_to_client(
        &self,
        client: &str,
        msg: ClientMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let client = client.to_string();
        Box::pin(async move {
            let registry = self.registry.read().await;
            let tx = registry
                .clients
                .get(&client)
                .ok_or_else(|| FlotillaError::ConnectionClosed(format!("client {client}")))?;
            tx.send(msg)
                .map_err(|_| FlotillaError::ConnectionClosed(format!("client {client}")))
        })
    }

    fn disconnect_worker(&self, worker: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let worker = worker.to_string();
        Box::pin(async move {
            if self.registry.write().await.workers.remove(&worker).is_some() {
                debug!(worker = %worker, "worker disconnected");
            }
            Ok(())
        })
    }
}

/// [`PeerClient`] over the registry's channels. Also used by clients to
/// gather results.
#[derive(Debug, Clone)]
pub struct ChannelPeers {
    registry: SharedRegistry,
}

impl ChannelPeers {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }
}

impl PeerClient for ChannelPeers {
    fn fetch(
        &self,
        peer: &str,
        keys: Vec<Key>,
        from: &str,
    ) -> Pin<Box<dyn Future<Output = Result<FetchResponse>> + Send + '_>> {
        let peer = peer.to_string();
        let from = from.to_string();
        Box::pin(async move {
            let endpoint = worker_endpoint(&self.registry, &peer).await?;
            let (reply, response) = oneshot::channel();
            endpoint
                .fetch
                .send(FetchRequest { keys, from, reply })
                .await
                .map_err(|_| FlotillaError::ConnectionClosed(format!("peer {peer}")))?;
            response
                .await
                .map_err(|_| FlotillaError::ConnectionClosed(format!("peer {peer} dropped fetch")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_from_unknown_peer_fails() {
        let peers = ChannelPeers::new(Registry::shared());
        let err = peers.fetch("nobody", vec!["a".into()], "w1").await.unwrap_err();
        assert!(matches!(err, FlotillaError::WorkerNotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_drops_the_endpoint() {
        let registry = Registry::shared();
        let (messages, mut rx) = mpsc::channel(1);
        let (fetch, _fetch_rx) = mpsc::channel(1);
        registry
            .write()
            .await
            .workers
            .insert("w1".into(), WorkerEndpoint { messages, fetch });
        let comms = ChannelSchedulerComms::new(registry.clone());

        comms
            .send_to_worker("w1", WorkerMessage::Close { reason: "test".into() })
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(WorkerMessage::Close { .. })));

        comms.disconnect_worker("w1").await.unwrap();
        assert!(comms.send_to_worker("w1", WorkerMessage::Close { reason: "again".into() }).await.is_err());
        assert!(rx.recv().await.is_none());
    }
}
