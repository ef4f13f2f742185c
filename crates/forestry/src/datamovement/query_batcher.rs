//! 🔎 The query batcher: every URI matching a query, one forest at a time, all at one point in time.
//!
//! One worker per forest. Each worker pages through its forest with
//! `POST /internal/uris`, resuming after the last URI it saw, until a page
//! comes back shorter than the batch size. Every page becomes a [`QueryBatch`]
//! for the listeners.
//!
//! All forests are read at the same snapshot. The first forest's worker leads:
//! its first page is read unpinned and the server's effective timestamp becomes
//! the job's snapshot. Followers wait for it before their first page. A caller
//! can also pin the snapshot up front with [`QueryBatcher::with_timestamp`].
//! A leader whose first page carries no effective timestamp fails the job,
//! since there is nothing to pin.
//!
//! A read failure stops that forest's worker. The others carry on, and
//! [`QueryJob::wait`] reports the first failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::snapshot::Snapshot;
use crate::clients::HostClient;
use crate::common::Transaction;
use crate::error::{Error, Result};
use crate::handles::Handle;
use crate::listeners::Listeners;
use crate::phase::{JobCanceller, JobControl, WorkPhase};
use crate::services::internal::{self, UrisRequest};
use crate::topology::{ForestInfo, Topology};
use crate::workers::{Worker, join_crew};

fn default_query_batch_size() -> u16 {
    1000
}

/// 🔧 The `[query_batcher]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryBatcherConfig {
    #[serde(default = "default_query_batch_size")]
    pub batch_size: u16,
}

impl Default for QueryBatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_query_batch_size(),
        }
    }
}

/// 📜 One page of URIs from one forest.
#[derive(Debug, Clone)]
pub struct QueryBatch {
    sequence: u64,
    forest: String,
    client: Arc<HostClient>,
    uris: Vec<String>,
    timestamp: Arc<str>,
}

impl QueryBatch {
    /// 🔢 1-based, job-wide, in delivery order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 🌳 Name of the forest the page came from.
    pub fn forest(&self) -> &str {
        &self.forest
    }

    pub fn client(&self) -> &Arc<HostClient> {
        &self.client
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    /// 📸 The snapshot the page was read at. Every batch of one job carries the same one.
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }
}

/// 🏗️ Configures a query job. Nothing happens until [`run`](Self::run).
#[derive(Debug)]
pub struct QueryBatcher {
    topology: Arc<Topology>,
    batch_size: u16,
    query: Option<Handle>,
    transaction: Option<Transaction>,
    timestamp: Option<String>,
    listeners: Listeners<Arc<QueryBatch>>,
    phase_listeners: Vec<Sender<WorkPhase>>,
}

impl QueryBatcher {
    pub(crate) fn new(topology: Arc<Topology>) -> Self {
        Self {
            topology,
            batch_size: default_query_batch_size(),
            query: None,
            transaction: None,
            timestamp: None,
            listeners: Listeners::new(),
            phase_listeners: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: &QueryBatcherConfig) -> Self {
        self.batch_size = config.batch_size;
        self
    }

    /// 🔎 The serialized query the server evaluates. Sent as-is with its own Content-Type.
    pub fn with_query(mut self, query: Handle) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_batch_size(mut self, batch_size: u16) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_transaction(mut self, transaction: Transaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// 📌 Read every forest at this timestamp instead of "now".
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_listener(self, listener: Sender<Arc<QueryBatch>>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn remove_listener(&self, listener: &Sender<Arc<QueryBatch>>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn subscribe(&self, capacity: usize) -> Receiver<Arc<QueryBatch>> {
        self.listeners.subscribe(capacity)
    }

    pub fn with_phase_listener(mut self, listener: Sender<WorkPhase>) -> Self {
        self.phase_listeners.push(listener);
        self
    }

    pub fn batch_size(&self) -> u16 {
        self.batch_size
    }

    /// 🚀 Validate, spawn one reader per forest, and hand back the job. Needs a Tokio runtime.
    pub fn run(self) -> Result<QueryJob> {
        if self.batch_size == 0 {
            return Err(Error::Configuration(
                "query batch size must be at least 1. Pages of zero URIs never end.".into(),
            ));
        }
        if self.timestamp.as_deref().is_some_and(|ts| ts.trim().is_empty()) {
            return Err(Error::Configuration(
                "an empty timestamp pins nothing. Leave with_timestamp out to pin at the first page.".into(),
            ));
        }
        let query = self.query.map(Arc::new).ok_or_else(|| {
            Error::Configuration("the query batcher has no query. Call with_query first.".into())
        })?;
        if self.topology.forests().is_empty() {
            warn!("🌲 query job over zero forests. It will finish instantly, and find nothing.");
        }

        let snapshot = Arc::new(match self.timestamp {
            Some(ts) => Snapshot::pinned_at(ts),
            None => Snapshot::pending(),
        });
        let control = Arc::new(JobControl::new("query job", self.phase_listeners));
        let sequence = Arc::new(AtomicU64::new(0));

        let readers = self
            .topology
            .forests()
            .iter()
            .enumerate()
            .map(|(i, forest)| {
                Ok(ForestReader {
                    forest: forest.clone(),
                    client: self.topology.client_for_forest(forest)?,
                    query: Arc::clone(&query),
                    page_length: self.batch_size,
                    transaction: self.transaction.clone(),
                    snapshot: Arc::clone(&snapshot),
                    leader: i == 0,
                    listeners: self.listeners.clone(),
                    control: Arc::clone(&control),
                    sequence: Arc::clone(&sequence),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        control.start();
        info!(
            "🔎 query job starting: {} forest(s), pages of {}",
            readers.len(),
            self.batch_size
        );
        let crew = readers.into_iter().map(Worker::start).collect();

        Ok(QueryJob {
            control,
            listeners: self.listeners,
            crew,
        })
    }
}

/// 📊 How a query job went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySummary {
    pub phase: WorkPhase,
    pub batches: usize,
    pub uris: usize,
}

#[derive(Debug, Default)]
struct QueryReport {
    batches: usize,
    uris: usize,
}

/// 🏃 A running query job.
#[derive(Debug)]
pub struct QueryJob {
    control: Arc<JobControl>,
    listeners: Listeners<Arc<QueryBatch>>,
    crew: Vec<JoinHandle<Result<QueryReport>>>,
}

impl QueryJob {
    /// 🛑 Stop paging. Requests in flight are abandoned, pages already delivered stay delivered.
    pub fn cancel(&self) {
        self.control.interrupt();
    }

    pub fn canceller(&self) -> JobCanceller {
        JobCanceller::new(Arc::clone(&self.control))
    }

    pub fn phase(&self) -> WorkPhase {
        self.control.phase()
    }

    pub fn add_listener(&self, listener: Sender<Arc<QueryBatch>>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Sender<Arc<QueryBatch>>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn subscribe(&self, capacity: usize) -> Receiver<Arc<QueryBatch>> {
        self.listeners.subscribe(capacity)
    }

    pub fn add_phase_listener(&self, listener: Sender<WorkPhase>) {
        self.control.listeners().add(listener);
    }

    /// ⏳ Wait for every forest reader. The first reader failure wins.
    pub async fn wait(self) -> Result<QuerySummary> {
        let reports = join_crew(self.crew).await;
        let phase = self.control.finish(reports.is_err());
        let reports = reports?;
        let summary = QuerySummary {
            phase,
            batches: reports.iter().map(|r| r.batches).sum(),
            uris: reports.iter().map(|r| r.uris).sum(),
        };
        info!(
            "🏁 query job {}: {} uri(s) in {} batch(es)",
            phase, summary.uris, summary.batches
        );
        Ok(summary)
    }
}

/// 🌳 Pages through one forest.
struct ForestReader {
    forest: ForestInfo,
    client: Arc<HostClient>,
    query: Arc<Handle>,
    page_length: u16,
    transaction: Option<Transaction>,
    snapshot: Arc<Snapshot>,
    leader: bool,
    listeners: Listeners<Arc<QueryBatch>>,
    control: Arc<JobControl>,
    sequence: Arc<AtomicU64>,
}

#[async_trait]
impl Worker for ForestReader {
    type Report = QueryReport;

    async fn work(self) -> Result<QueryReport> {
        let mut report = QueryReport::default();
        let outcome = self.read_forest(&mut report).await;
        if self.leader {
            // followers must never wait on a leader that left
            self.snapshot.abandon();
        }
        match outcome {
            Ok(()) => Ok(report),
            Err(err) if err.is_cancelled() && self.control.is_interrupting() => Ok(report),
            Err(err) => {
                warn!("💀 reader for forest '{}' stopped: {}", self.forest.name, err);
                Err(err)
            }
        }
    }
}

impl ForestReader {
    async fn read_forest(&self, report: &mut QueryReport) -> Result<()> {
        // 📸 `None` only for the leader, until its first page comes back
        let mut timestamp: Option<Arc<str>> = match self.snapshot.current() {
            Some(resolved) => Some(resolved?),
            None if self.leader => None,
            None => Some(self.await_snapshot().await?),
        };

        let page_length = usize::from(self.page_length);
        let mut after = String::new();
        loop {
            if self.control.is_interrupting() {
                return Ok(());
            }
            let page = internal::uris_in_forest(
                &self.client,
                UrisRequest {
                    query: &self.query,
                    forest_name: &self.forest.name,
                    start: 0,
                    after: &after,
                    page_length: self.page_length,
                    transaction: self.transaction.as_ref(),
                    timestamp: timestamp.as_deref(),
                },
                Some(self.control.token()),
            )
            .await?;

            let pinned = match timestamp.clone() {
                Some(ts) => ts,
                None => {
                    // an unpinned job would read every forest at a different "now"
                    let effective = page.timestamp.filter(|ts| !ts.trim().is_empty()).ok_or_else(|| {
                        Error::Snapshot(format!(
                            "forest '{}' reported no effective timestamp, so there is no snapshot to pin",
                            self.forest.name
                        ))
                    })?;
                    let ts = self.snapshot.pin(effective);
                    timestamp = Some(Arc::clone(&ts));
                    ts
                }
            };

            let count = page.uris.len();
            if let Some(last) = page.uris.last() {
                after = last.clone();
                report.batches += 1;
                report.uris += count;
                let batch = Arc::new(QueryBatch {
                    sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
                    forest: self.forest.name.clone(),
                    client: Arc::clone(&self.client),
                    uris: page.uris,
                    timestamp: pinned,
                });
                tokio::select! {
                    biased;
                    _ = self.listeners.broadcast(batch) => {}
                    _ = self.control.token().cancelled() => return Ok(()),
                }
            }
            if count < page_length {
                debug!(
                    "🏁 forest '{}' exhausted after {} uri(s)",
                    self.forest.name, report.uris
                );
                return Ok(());
            }
        }
    }

    async fn await_snapshot(&self) -> Result<Arc<str>> {
        tokio::select! {
            biased;
            _ = self.control.token().cancelled() => Err(Error::Cancelled),
            resolved = self.snapshot.resolved() => resolved,
        }
    }
}
