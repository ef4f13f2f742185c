//! 📝 The write batcher: documents in, multipart write sets out, one host per worker.
//!
//! 🎬 *[a channel fills with documents. somewhere, a worker counts to 250.]*
//!
//! The caller feeds [`DocumentDescriptor`]s into a channel. A fixed crew of
//! workers drains it. Each worker fills its own batch and ships it with one
//! `POST /documents` to the host it was assigned. The outcome (success or
//! failure) goes to every listener as a [`WriteBatch`]. When the input channel
//! is closed and empty, each worker flushes its partial batch and clocks out.
//!
//! Assignment: with at least as many workers as forests, workers are dealt
//! round-robin over forests, so busy hosts (more forests) get more workers.
//! With fewer workers than forests, they are dealt round-robin over hosts.
//!
//! A failed batch does not stop the job. It is reported and counted, and
//! [`WriteJob::wait`] returns [`Error::BatchFailures`] at the end.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::HostClient;
use crate::common::{DocumentDescriptor, Metadata, Transaction, Transform};
use crate::error::{Error, Result};
use crate::handles::ResponseHandle;
use crate::listeners::Listeners;
use crate::phase::{JobCanceller, JobControl, WorkPhase};
use crate::services::documents::{self, WriteOptions};
use crate::topology::{Spread, Topology};
use crate::workers::{Worker, join_crew};

fn default_write_batch_size() -> u16 {
    250
}

/// 🔧 The `[write_batcher]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WriteBatcherConfig {
    #[serde(default = "default_write_batch_size")]
    pub batch_size: u16,
    /// 🧵 `None` means two workers per forest.
    #[serde(default)]
    pub thread_count: Option<usize>,
}

impl Default for WriteBatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_write_batch_size(),
            thread_count: None,
        }
    }
}

/// 📦 One shipped batch: what was sent, where, and how it went.
#[derive(Debug)]
pub struct WriteBatch {
    sequence: u64,
    worker: usize,
    client: Arc<HostClient>,
    descriptors: Vec<DocumentDescriptor>,
    outcome: Result<ResponseHandle>,
}

impl WriteBatch {
    /// 🔢 1-based, job-wide, in shipping order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 🧵 Index of the worker that built the batch.
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn client(&self) -> &Arc<HostClient> {
        &self.client
    }

    pub fn descriptors(&self) -> &[DocumentDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// 📬 The server's answer, for a successful batch.
    pub fn response(&self) -> Option<&ResponseHandle> {
        self.outcome.as_ref().ok()
    }

    /// 💀 What went wrong, for a failed batch.
    pub fn error(&self) -> Option<&Error> {
        self.outcome.as_ref().err()
    }
}

/// 🏗️ Configures a write job. Nothing happens until [`run`](Self::run).
#[derive(Debug)]
pub struct WriteBatcher {
    topology: Arc<Topology>,
    batch_size: u16,
    thread_count: Option<usize>,
    options: WriteOptions,
    input: Option<Receiver<DocumentDescriptor>>,
    listeners: Listeners<Arc<WriteBatch>>,
    phase_listeners: Vec<Sender<WorkPhase>>,
}

impl WriteBatcher {
    pub(crate) fn new(topology: Arc<Topology>) -> Self {
        let defaults = WriteBatcherConfig::default();
        Self {
            topology,
            batch_size: defaults.batch_size,
            thread_count: defaults.thread_count,
            options: WriteOptions::default(),
            input: None,
            listeners: Listeners::new(),
            phase_listeners: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: &WriteBatcherConfig) -> Self {
        self.batch_size = config.batch_size;
        self.thread_count = config.thread_count;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u16) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = Some(thread_count);
        self
    }

    /// 🗂️ Metadata applied to every document that does not bring its own.
    pub fn with_default_metadata(mut self, metadata: Metadata) -> Self {
        self.options.default_metadata = Some(metadata);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.options.transform = Some(transform);
        self
    }

    pub fn with_transaction(mut self, transaction: Transaction) -> Self {
        self.options.transaction = Some(transaction);
        self
    }

    /// 📥 The channel documents arrive on. Close the sending side to finish the job.
    pub fn with_input(mut self, input: Receiver<DocumentDescriptor>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_listener(self, listener: Sender<Arc<WriteBatch>>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn remove_listener(&self, listener: &Sender<Arc<WriteBatch>>) -> bool {
        self.listeners.remove(listener)
    }

    /// 📻 A new bounded listener channel, already registered.
    pub fn subscribe(&self, capacity: usize) -> Receiver<Arc<WriteBatch>> {
        self.listeners.subscribe(capacity)
    }

    pub fn with_phase_listener(mut self, listener: Sender<WorkPhase>) -> Self {
        self.phase_listeners.push(listener);
        self
    }

    pub fn batch_size(&self) -> u16 {
        self.batch_size
    }

    /// 🧵 The worker count `run` will use: explicit, or two per forest (at least one).
    pub fn thread_count(&self) -> usize {
        self.thread_count
            .unwrap_or_else(|| (self.topology.forests().len() * 2).max(1))
    }

    /// 🚀 Validate, spawn the crew, and hand back the job. Needs a Tokio runtime.
    pub fn run(self) -> Result<WriteJob> {
        if self.batch_size == 0 {
            return Err(Error::Configuration(
                "write batch size must be at least 1. A batch of nothing is a very fast no-op.".into(),
            ));
        }
        if self.thread_count == Some(0) {
            return Err(Error::Configuration(
                "write thread count must be at least 1. Zero workers write zero documents.".into(),
            ));
        }
        let input = self.input.clone().ok_or_else(|| {
            Error::Configuration("the write batcher has no input channel. Call with_input first.".into())
        })?;

        let threads = self.thread_count();
        let forest_count = self.topology.forests().len();
        let spread = if threads >= forest_count {
            Spread::ByForest
        } else {
            Spread::ByHost
        };
        let clients = self.topology.assign(threads, spread)?;

        let control = Arc::new(JobControl::new("write job", self.phase_listeners));
        let options = Arc::new(self.options);
        let sequence = Arc::new(AtomicU64::new(0));
        control.start();
        info!(
            "📝 write job starting: {} worker(s) over {} forest(s), batches of {}",
            threads, forest_count, self.batch_size
        );

        let crew = clients
            .into_iter()
            .enumerate()
            .map(|(id, client)| {
                WriteWorker {
                    id,
                    client,
                    input: input.clone(),
                    batch_size: usize::from(self.batch_size),
                    options: Arc::clone(&options),
                    listeners: self.listeners.clone(),
                    control: Arc::clone(&control),
                    sequence: Arc::clone(&sequence),
                }
                .start()
            })
            .collect();

        Ok(WriteJob {
            control,
            listeners: self.listeners,
            input,
            crew,
        })
    }
}

/// 📊 How a write job went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub phase: WorkPhase,
    pub batches: usize,
    pub documents: usize,
}

#[derive(Debug, Default)]
struct WriteReport {
    batches: usize,
    documents: usize,
    failed: usize,
}

/// 🏃 A running write job.
#[derive(Debug)]
pub struct WriteJob {
    control: Arc<JobControl>,
    listeners: Listeners<Arc<WriteBatch>>,
    input: Receiver<DocumentDescriptor>,
    crew: Vec<JoinHandle<Result<WriteReport>>>,
}

impl WriteJob {
    /// 🛑 Stop taking documents and stop shipping. Unsent partial batches are dropped.
    pub fn cancel(&self) {
        self.control.interrupt();
        self.input.close();
    }

    pub fn canceller(&self) -> JobCanceller {
        JobCanceller::new(Arc::clone(&self.control))
    }

    pub fn phase(&self) -> WorkPhase {
        self.control.phase()
    }

    pub fn add_listener(&self, listener: Sender<Arc<WriteBatch>>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Sender<Arc<WriteBatch>>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn subscribe(&self, capacity: usize) -> Receiver<Arc<WriteBatch>> {
        self.listeners.subscribe(capacity)
    }

    pub fn add_phase_listener(&self, listener: Sender<WorkPhase>) {
        self.control.listeners().add(listener);
    }

    /// ⏳ Wait for every worker. Fails with [`Error::BatchFailures`] if any batch failed.
    pub async fn wait(self) -> Result<WriteSummary> {
        let reports = join_crew(self.crew).await;
        let failed: usize = reports
            .as_ref()
            .map(|reports| reports.iter().map(|r| r.failed).sum())
            .unwrap_or_default();
        let phase = self.control.finish(reports.is_err() || failed > 0);
        let reports = reports?;

        let batches = reports.iter().map(|r| r.batches).sum();
        let documents = reports.iter().map(|r| r.documents).sum();
        info!(
            "🏁 write job {}: {} document(s) in {} batch(es), {} failed",
            phase, documents, batches, failed
        );
        if failed > 0 {
            return Err(Error::BatchFailures {
                failed,
                total: batches,
            });
        }
        Ok(WriteSummary {
            phase,
            batches,
            documents,
        })
    }
}

/// 🧵 One member of the write crew, pinned to one host.
struct WriteWorker {
    id: usize,
    client: Arc<HostClient>,
    input: Receiver<DocumentDescriptor>,
    batch_size: usize,
    options: Arc<WriteOptions>,
    listeners: Listeners<Arc<WriteBatch>>,
    control: Arc<JobControl>,
    sequence: Arc<AtomicU64>,
}

#[async_trait]
impl Worker for WriteWorker {
    type Report = WriteReport;

    async fn work(self) -> Result<WriteReport> {
        debug!("📥 write worker {} draining input for {}", self.id, self.client.host());
        let mut report = WriteReport::default();
        let mut pending = Vec::with_capacity(self.batch_size);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.control.token().cancelled() => None,
                received = self.input.recv() => Some(received),
            };
            match next {
                Some(Ok(document)) => {
                    pending.push(document);
                    if pending.len() >= self.batch_size {
                        let full =
                            std::mem::replace(&mut pending, Vec::with_capacity(self.batch_size));
                        self.ship(full, &mut report).await;
                    }
                }
                Some(Err(_)) => {
                    // closed and drained
                    if !pending.is_empty() {
                        self.ship(std::mem::take(&mut pending), &mut report).await;
                    }
                    debug!("🏁 write worker {} done: input closed", self.id);
                    return Ok(report);
                }
                None => {
                    self.input.close();
                    if !pending.is_empty() {
                        debug!(
                            "🗑️ write worker {} interrupted, dropping {} unsent document(s)",
                            self.id,
                            pending.len()
                        );
                    }
                    return Ok(report);
                }
            }
        }
    }
}

impl WriteWorker {
    async fn ship(&self, descriptors: Vec<DocumentDescriptor>, report: &mut WriteReport) {
        let outcome = documents::write_set(
            &self.client,
            &descriptors,
            &self.options,
            Some(self.control.token()),
        )
        .await;
        match &outcome {
            // cut off mid-flight by cancel(), it never counted
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                report.failed += 1;
                report.batches += 1;
                report.documents += descriptors.len();
                warn!(
                    "💀 write worker {} lost a batch of {} to {}: {}",
                    self.id,
                    descriptors.len(),
                    self.client.host(),
                    err
                );
            }
            Ok(_) => {
                report.batches += 1;
                report.documents += descriptors.len();
            }
        }

        let batch = Arc::new(WriteBatch {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            worker: self.id,
            client: Arc::clone(&self.client),
            descriptors,
            outcome,
        });
        tokio::select! {
            biased;
            _ = self.listeners.broadcast(batch) => {}
            _ = self.control.token().cancelled() => {
                debug!("🛑 write worker {} stopped waiting on a full listener", self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::datamovement::DataMovement;
    use crate::test_support::{json_doc, local_topology, request_parts};

    async fn mount_documents(server: &MockServer, status: u16) {
        Mock::given(method("POST"))
            .and(path("/LATEST/documents"))
            .respond_with(ResponseTemplate::new(status).set_body_string(r#"{"documents":[]}"#))
            .mount(server)
            .await;
    }

    fn feed(count: usize) -> Receiver<DocumentDescriptor> {
        let (tx, rx) = async_channel::bounded(count.max(1));
        for i in 0..count {
            tx.try_send(json_doc(&format!("/doc-{i:04}.json")))
                .expect("💀 the feeding trough overflowed");
        }
        rx
    }

    async fn drain(rx: &Receiver<Arc<WriteBatch>>) -> Vec<Arc<WriteBatch>> {
        let mut batches = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            batches.push(batch);
        }
        batches
    }

    #[tokio::test]
    async fn the_one_where_a_thousand_documents_ship_in_four_batches() {
        let server = MockServer::start().await;
        mount_documents(&server, 200).await;

        let movement = DataMovement::from_topology(local_topology(&server, &["f1"]));
        let batcher = movement
            .write_batcher()
            .with_batch_size(250)
            .with_thread_count(1)
            .with_default_metadata(Metadata::default().with_collection("collection-1"))
            .with_input(feed(1000));
        let listener = batcher.subscribe(16);

        let summary = batcher
            .run()
            .expect("💀 the batcher would not start")
            .wait()
            .await
            .expect("💀 the write job failed");
        assert_eq!(summary.phase, WorkPhase::Completed);
        assert_eq!(summary.batches, 4);
        assert_eq!(summary.documents, 1000);

        let batches = drain(&listener).await;
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.len() == 250 && b.is_success()));

        let requests = server.received_requests().await.expect("💀 recording is off");
        assert_eq!(requests.len(), 4);
        let mut in_collection = 0;
        for request in &requests {
            let parts = request_parts(request);
            let metadata: serde_json::Value =
                serde_json::from_slice(&parts[0].body).expect("💀 metadata part is not JSON");
            assert_eq!(metadata["collections"], serde_json::json!(["collection-1"]));
            in_collection += parts
                .iter()
                .filter(|p| p.header("content-disposition").is_some_and(|d| d.starts_with("attachment")))
                .count();
        }
        assert_eq!(in_collection, 1000);
    }

    #[tokio::test]
    async fn the_one_where_two_workers_cover_every_document_exactly_once() {
        let server = MockServer::start().await;
        mount_documents(&server, 200).await;

        let batcher = DataMovement::from_topology(local_topology(&server, &["f1"]))
            .write_batcher()
            .with_batch_size(100)
            .with_input(feed(1000));
        assert_eq!(batcher.thread_count(), 2);
        let listener = batcher.subscribe(64);

        batcher
            .run()
            .expect("💀 the batcher would not start")
            .wait()
            .await
            .expect("💀 the write job failed");

        let batches = drain(&listener).await;
        let mut seen = BTreeSet::new();
        let mut partials_per_worker: BTreeMap<usize, usize> = BTreeMap::new();
        for batch in &batches {
            assert!(batch.len() <= 100);
            if batch.len() < 100 {
                *partials_per_worker.entry(batch.worker()).or_default() += 1;
            }
            for doc in batch.descriptors() {
                assert!(seen.insert(doc.uri().to_string()), "💀 {} shipped twice", doc.uri());
            }
        }
        assert_eq!(seen.len(), 1000);
        assert!(partials_per_worker.values().all(|&n| n <= 1));
    }

    #[tokio::test]
    async fn the_one_where_failed_batches_are_reported_not_swallowed() {
        let server = MockServer::start().await;
        mount_documents(&server, 500).await;

        let batcher = DataMovement::from_topology(local_topology(&server, &["f1"]))
            .write_batcher()
            .with_batch_size(5)
            .with_thread_count(1)
            .with_input(feed(10));
        let listener = batcher.subscribe(8);

        let job = batcher.run().expect("💀 the batcher would not start");
        let canceller = job.canceller();
        let err = job
            .wait()
            .await
            .expect_err("💀 two failed batches and the job says it is fine");
        assert!(matches!(err, Error::BatchFailures { failed: 2, total: 2 }));
        assert_eq!(canceller.phase(), WorkPhase::Interrupted);

        let batches = drain(&listener).await;
        assert_eq!(batches.len(), 2);
        for batch in batches {
            assert_eq!(
                batch.error().and_then(Error::status),
                Some(reqwest::StatusCode::INTERNAL_SERVER_ERROR)
            );
        }
    }

    #[tokio::test]
    async fn the_one_where_cancel_closes_the_door_mid_write() {
        let server = MockServer::start().await;
        mount_documents(&server, 200).await;

        let (tx, rx) = async_channel::bounded(1000);
        for i in 0..300 {
            tx.send(json_doc(&format!("/early-{i}.json")))
                .await
                .expect("💀 the early docs did not fit");
        }
        let batcher = DataMovement::from_topology(local_topology(&server, &["f1"]))
            .write_batcher()
            .with_batch_size(100)
            .with_thread_count(1)
            .with_input(rx);
        let listener = batcher.subscribe(64);
        let job = batcher.run().expect("💀 the batcher would not start");

        for _ in 0..3 {
            listener.recv().await.expect("💀 a batch went missing");
        }
        job.cancel();
        job.cancel();
        assert!(
            tx.send(json_doc("/late.json")).await.is_err(),
            "💀 the door was supposed to be closed"
        );
        drop(tx);

        let summary = job.wait().await.expect("💀 cancelling is not a failure");
        assert_eq!(summary.phase, WorkPhase::Interrupted);
        assert!(summary.documents <= 300 + 100);
    }

    #[tokio::test]
    async fn the_one_where_a_batch_cut_off_by_cancel_is_not_counted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/LATEST/documents"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"documents":[]}"#)
                    .set_delay(std::time::Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let batcher = DataMovement::from_topology(local_topology(&server, &["f1"]))
            .write_batcher()
            .with_batch_size(10)
            .with_thread_count(1)
            .with_input(feed(50));
        let listener = batcher.subscribe(16);
        let job = batcher.run().expect("💀 the batcher would not start");

        let first = listener.recv().await.expect("💀 the first batch never landed");
        assert!(first.is_success());
        // 🐢 the second batch is now stuck in a slow request
        job.cancel();
        let summary = job.wait().await.expect("💀 cancelling is not a failure");

        let delivered = drain(&listener).await;
        let acknowledged = 1 + delivered.iter().filter(|b| b.is_success()).count();
        assert!(
            delivered.iter().all(|b| b.is_success() || b.error().is_some_and(Error::is_cancelled))
        );
        assert_eq!(summary.phase, WorkPhase::Interrupted);
        assert_eq!(summary.batches, acknowledged);
        assert_eq!(summary.documents, acknowledged * 10);
        assert!(summary.documents < 50);
    }

    #[tokio::test]
    async fn the_one_where_transform_and_transaction_ride_in_the_query_string() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/LATEST/documents"))
            .and(query_param("transform", "enrich"))
            .and(query_param("trans:mode", "loud"))
            .and(query_param("txid", "77"))
            .and(query_param("database", "Documents"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let summary = DataMovement::from_topology(local_topology(&server, &["f1"]))
            .write_batcher()
            .with_thread_count(1)
            .with_transform(Transform::new("enrich").with_param("mode", "loud"))
            .with_transaction(Transaction::from_id("77"))
            .with_input(feed(1))
            .run()
            .expect("💀 the batcher would not start")
            .wait()
            .await
            .expect("💀 the query string got lost");
        assert_eq!(summary.documents, 1);
    }

    #[tokio::test]
    async fn the_one_where_bad_settings_are_refused_at_run() {
        let server = MockServer::start().await;
        let movement = DataMovement::from_topology(local_topology(&server, &["f1"]));

        let no_input = movement.write_batcher().run();
        assert!(matches!(no_input, Err(Error::Configuration(_))));

        let empty_batches = movement.write_batcher().with_batch_size(0).with_input(feed(0)).run();
        assert!(matches!(empty_batches, Err(Error::Configuration(_))));

        let no_workers = movement.write_batcher().with_thread_count(0).with_input(feed(0)).run();
        assert!(matches!(no_workers, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn the_one_where_phase_listeners_hear_the_whole_story() {
        let server = MockServer::start().await;
        mount_documents(&server, 200).await;
        let (phase_tx, phase_rx) = async_channel::bounded(8);

        let (doc_tx, doc_rx) = async_channel::bounded(4);
        drop(doc_tx);
        let job = DataMovement::from_topology(local_topology(&server, &["f1"]))
            .write_batcher()
            .with_phase_listener(phase_tx)
            .with_input(doc_rx)
            .run()
            .expect("💀 the batcher would not start");
        let (stranger, _stranger_rx) = async_channel::bounded(1);
        assert!(!job.remove_listener(&stranger));

        job.wait().await.expect("💀 an empty job failed");
        assert_eq!(phase_rx.recv().await.expect("💀 running"), WorkPhase::Running);
        assert_eq!(phase_rx.recv().await.expect("💀 completed"), WorkPhase::Completed);
    }
}
