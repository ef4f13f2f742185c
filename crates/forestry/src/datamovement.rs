//! 🚚 Data movement: bulk writes and bulk reads across every forest.
//!
//! [`DataMovement`] discovers the topology once and hands out batchers that
//! share it. Builders are cheap. Jobs are not. Choose wisely. 🦆

mod query_batcher;
mod snapshot;
mod write_batcher;

use std::sync::Arc;

pub use query_batcher::{QueryBatch, QueryBatcher, QueryBatcherConfig, QueryJob, QuerySummary};
pub use write_batcher::{WriteBatch, WriteBatcher, WriteBatcherConfig, WriteJob, WriteSummary};

use crate::clients::HostClient;
use crate::common::Transaction;
use crate::error::Result;
use crate::services::transactions;
use crate::topology::Topology;

/// 🚚 Entry point for write and query batchers.
#[derive(Debug, Clone)]
pub struct DataMovement {
    topology: Arc<Topology>,
}

impl DataMovement {
    /// 🔭 Discover the forest map through `client`.
    pub async fn new(client: Arc<HostClient>) -> Result<Self> {
        Ok(Self::from_topology(Arc::new(Topology::discover(client).await?)))
    }

    /// 🗺️ Reuse a topology discovered elsewhere.
    pub fn from_topology(topology: Arc<Topology>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn write_batcher(&self) -> WriteBatcher {
        WriteBatcher::new(Arc::clone(&self.topology))
    }

    pub fn query_batcher(&self) -> QueryBatcher {
        QueryBatcher::new(Arc::clone(&self.topology))
    }

    /// 🧾 Open a multi-statement transaction on the primary host.
    pub async fn begin_transaction(
        &self,
        name: Option<&str>,
        time_limit_secs: Option<u64>,
    ) -> Result<Transaction> {
        transactions::begin(self.topology.primary(), name, time_limit_secs).await
    }

    pub async fn commit(&self, transaction: &Transaction) -> Result<()> {
        transactions::commit(self.topology.primary(), transaction).await
    }

    pub async fn rollback(&self, transaction: &Transaction) -> Result<()> {
        transactions::rollback(self.topology.primary(), transaction).await
    }
}
