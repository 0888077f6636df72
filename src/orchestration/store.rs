//! Write-through persistence of node state.
//!
//! The orchestrator never waits on the store. [`StoreWriter`] queues every
//! write onto a single background worker that applies them in order with
//! retries; a write that still fails is logged and counted, never raised.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::core::{Node, NodeId, NodeStatus};
use crate::error::{Error, Result};
use crate::util::retry_with_backoff;

/// External persistent graph store.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn create(&self, node: &Node) -> Result<()>;

    async fn update_status(&self, id: &NodeId, status: &NodeStatus) -> Result<()>;

    async fn update_progress(&self, id: &NodeId, fraction: f64) -> Result<()>;

    /// Nodes whose status has the same label as `status` (reasons ignored).
    async fn query_by_status(&self, status: &NodeStatus) -> Result<Vec<Node>>;
}

/// Store kept in process memory.
///
/// Availability can be toggled to simulate an outage.
#[derive(Default)]
pub struct InMemoryStore {
    nodes: RwLock<HashMap<NodeId, Node>>,
    progress: RwLock<HashMap<NodeId, f64>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Store("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    pub async fn get(&self, id: &NodeId) -> Option<Node> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn progress_of(&self, id: &NodeId) -> Option<f64> {
        self.progress.read().await.get(id).copied()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[async_trait]
impl NodeStore for InMemoryStore {
    async fn create(&self, node: &Node) -> Result<()> {
        self.check_available()?;
        self.nodes
            .write()
            .await
            .insert(node.id().clone(), node.clone());
        Ok(())
    }

    async fn update_status(&self, id: &NodeId, status: &NodeStatus) -> Result<()> {
        self.check_available()?;
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| Error::Store(format!("no stored record for {}", id)))?;
        node.header.status = status.clone();
        Ok(())
    }

    async fn update_progress(&self, id: &NodeId, fraction: f64) -> Result<()> {
        self.check_available()?;
        self.progress.write().await.insert(id.clone(), fraction);
        Ok(())
    }

    async fn query_by_status(&self, status: &NodeStatus) -> Result<Vec<Node>> {
        self.check_available()?;
        let mut found: Vec<Node> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.status().label() == status.label())
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(found)
    }
}

enum StoreOp {
    Create(Box<Node>),
    Status(NodeId, NodeStatus),
    Progress(NodeId, f64),
    Flush(oneshot::Sender<()>),
}

struct WriterInner {
    store: Arc<dyn NodeStore>,
    config: StoreConfig,
    tx: OnceLock<mpsc::UnboundedSender<StoreOp>>,
    failures: Arc<AtomicUsize>,
}

/// Best-effort, ordered, out-of-band writer in front of a [`NodeStore`].
///
/// A writer without a store discards everything. The background worker is
/// started on the first write, so writes must happen inside a Tokio runtime.
#[derive(Clone, Default)]
pub struct StoreWriter {
    inner: Option<Arc<WriterInner>>,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn NodeStore>, config: StoreConfig) -> Self {
        Self {
            inner: Some(Arc::new(WriterInner {
                store,
                config,
                tx: OnceLock::new(),
                failures: Arc::new(AtomicUsize::new(0)),
            })),
        }
    }

    /// A writer that drops every write.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Writes that were abandoned after exhausting their retries.
    pub fn failed_writes(&self) -> usize {
        self.inner
            .as_ref()
            .map(|i| i.failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn record_created(&self, node: &Node) {
        self.send(StoreOp::Create(Box::new(node.clone())));
    }

    pub fn record_status(&self, id: &NodeId, status: &NodeStatus) {
        self.send(StoreOp::Status(id.clone(), status.clone()));
    }

    pub fn record_progress(&self, id: &NodeId, fraction: f64) {
        self.send(StoreOp::Progress(id.clone(), fraction));
    }

    /// Wait until every write queued so far has been applied or abandoned.
    pub async fn flush(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let Some(tx) = inner.tx.get() else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(StoreOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn send(&self, op: StoreOp) {
        let Some(inner) = &self.inner else {
            return;
        };
        let tx = inner.tx.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_worker(
                Arc::clone(&inner.store),
                inner.config.clone(),
                rx,
                Arc::clone(&inner.failures),
            ));
            tx
        });
        if tx.send(op).is_err() {
            warn!("store worker stopped, dropping write");
        }
    }
}

async fn run_worker(
    store: Arc<dyn NodeStore>,
    config: StoreConfig,
    mut rx: mpsc::UnboundedReceiver<StoreOp>,
    failures: Arc<AtomicUsize>,
) {
    while let Some(op) = rx.recv().await {
        let (what, result) = match op {
            StoreOp::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            StoreOp::Create(node) => {
                let result = retry_with_backoff(config.retry_attempts, config.retry_delay(), || {
                    store.create(&node)
                })
                .await;
                (format!("create {}", node.id()), result)
            }
            StoreOp::Status(id, status) => {
                let result = retry_with_backoff(config.retry_attempts, config.retry_delay(), || {
                    store.update_status(&id, &status)
                })
                .await;
                (format!("status {} -> {}", id, status.label()), result)
            }
            StoreOp::Progress(id, fraction) => {
                let result = retry_with_backoff(config.retry_attempts, config.retry_delay(), || {
                    store.update_progress(&id, fraction)
                })
                .await;
                (format!("progress {} -> {:.3}", id, fraction), result)
            }
        };

        match result {
            Ok(()) => debug!(write = %what, "store write applied"),
            Err(e) => {
                failures.fetch_add(1, Ordering::SeqCst);
                warn!(write = %what, error = %e, "store write abandoned");
            }
        }
    }
}
