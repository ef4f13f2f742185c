//! 🔁 The bulk data-service runner: call an endpoint until it says "that's all, folks".
//!
//! 🎬 *[a server-side module waits by the phone. it rings. it rings again. it keeps ringing.]*
//!
//! A crew of workers calls one data-service endpoint over and over. Each call
//! carries up to three kinds of form fields:
//!
//! - `endpointState`: the worker's private checkpoint, replaced by the first
//!   part of every response;
//! - `workUnit`: the slice of work this worker owns, fixed for its lifetime;
//! - `input`: a batch of handles pulled from the input channel, if there is one.
//!
//! Every other response part is an output and goes to the output listeners.
//!
//! Two modes. With an input channel, a worker calls once per full batch and
//! once more for the leftovers when the channel closes. Without one, a worker
//! keeps calling until the endpoint hands back an empty (or `null`) state.
//!
//! State tracking is on only when the initial endpoint state is real JSON and
//! not `null`. No tracking means the first response part is an output like the
//! rest, and a state-driven worker calls exactly once.
//!
//! Workers never share state. The endpoint is expected to partition the work
//! by `workUnit`; two workers handed overlapping units will happily do the
//! same work twice.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::clients::HostClient;
use crate::error::{Error, Result};
use crate::handles::Handle;
use crate::listeners::Listeners;
use crate::phase::{JobCanceller, JobControl, WorkPhase};
use crate::services::data_services::{self, EndpointCall};
use crate::topology::{Spread, Topology};
use crate::workers::{Worker, join_crew};

fn default_data_service_batch_size() -> u16 {
    1000
}

/// 🔧 The `[data_services]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DataServicesConfig {
    /// 📦 Inputs per call, input-driven mode only.
    #[serde(default = "default_data_service_batch_size")]
    pub batch_size: u16,
    /// 🧵 `None` means one worker per forest. Ignored for forest work units.
    #[serde(default)]
    pub thread_count: Option<usize>,
}

impl Default for DataServicesConfig {
    fn default() -> Self {
        Self {
            batch_size: default_data_service_batch_size(),
            thread_count: None,
        }
    }
}

#[derive(Debug, Clone)]
enum WorkUnits {
    None,
    Explicit(Vec<serde_json::Value>),
    PerForest,
}

/// 🧐 Usable as endpoint state: non-empty JSON that is not `null`.
fn is_live_state(state: &[u8]) -> bool {
    !state.iter().all(u8::is_ascii_whitespace)
        && serde_json::from_slice::<serde_json::Value>(state).is_ok_and(|v| !v.is_null())
}

/// 🏗️ Configures a bulk data-service job. Nothing happens until [`run`](Self::run).
#[derive(Debug)]
pub struct BulkDataService {
    topology: Arc<Topology>,
    endpoint: String,
    batch_size: u16,
    thread_count: Option<usize>,
    work_units: WorkUnits,
    endpoint_state: Option<Bytes>,
    input: Option<Receiver<Handle>>,
    listeners: Listeners<Bytes>,
    phase_listeners: Vec<Sender<WorkPhase>>,
}

impl BulkDataService {
    pub(crate) fn new(topology: Arc<Topology>, endpoint: impl Into<String>) -> Self {
        let defaults = DataServicesConfig::default();
        Self {
            topology,
            endpoint: endpoint.into(),
            batch_size: defaults.batch_size,
            thread_count: defaults.thread_count,
            work_units: WorkUnits::None,
            endpoint_state: None,
            input: None,
            listeners: Listeners::new(),
            phase_listeners: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: &DataServicesConfig) -> Self {
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

    /// 🧩 Caller-supplied work units, dealt round-robin to the workers.
    ///
    /// Worker `i` gets unit `i % units`. Units beyond the thread count are never sent.
    pub fn with_work_units<I>(mut self, work_units: I) -> Self
    where
        I: IntoIterator<Item = serde_json::Value>,
    {
        self.work_units = WorkUnits::Explicit(work_units.into_iter().collect());
        self
    }

    /// 🌳 One `{"forestId": ...}` work unit per forest, one worker per forest,
    /// each talking to its forest's preferred host.
    pub fn with_forest_work_units(mut self) -> Self {
        self.work_units = WorkUnits::PerForest;
        self
    }

    /// 📍 The state every worker starts from. Turns state tracking on if it is live JSON.
    pub fn with_endpoint_state(mut self, state: impl Into<Bytes>) -> Self {
        self.endpoint_state = Some(state.into());
        self
    }

    /// 📥 Switch to input-driven mode. Close the sending side to finish the job.
    pub fn with_input(mut self, input: Receiver<Handle>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output_listener(self, listener: Sender<Bytes>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn remove_output_listener(&self, listener: &Sender<Bytes>) -> bool {
        self.listeners.remove(listener)
    }

    /// 📻 A new bounded output channel, already registered.
    pub fn subscribe(&self, capacity: usize) -> Receiver<Bytes> {
        self.listeners.subscribe(capacity)
    }

    pub fn with_phase_listener(mut self, listener: Sender<WorkPhase>) -> Self {
        self.phase_listeners.push(listener);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn batch_size(&self) -> u16 {
        self.batch_size
    }

    /// 🧵 The worker count `run` will use.
    pub fn thread_count(&self) -> usize {
        match self.work_units {
            WorkUnits::PerForest => self.topology.forests().len(),
            _ => self
                .thread_count
                .unwrap_or_else(|| self.topology.forests().len().max(1)),
        }
    }

    fn work_unit_bytes(&self) -> Result<Vec<Bytes>> {
        match &self.work_units {
            WorkUnits::None => Ok(Vec::new()),
            WorkUnits::Explicit(units) => units
                .iter()
                .map(|unit| {
                    serde_json::to_vec(unit).map(Bytes::from).map_err(|err| {
                        Error::Configuration(format!("a work unit would not serialize: {err}"))
                    })
                })
                .collect(),
            WorkUnits::PerForest => Ok(self
                .topology
                .forests()
                .iter()
                .map(|forest| {
                    Bytes::from(serde_json::json!({ "forestId": forest.id }).to_string())
                })
                .collect()),
        }
    }

    /// 🚀 Validate, spawn the crew, and hand back the job. Needs a Tokio runtime.
    pub fn run(self) -> Result<BulkJob> {
        if !self.endpoint.starts_with('/') {
            return Err(Error::Configuration(format!(
                "data-service endpoint {:?} must be a path starting with '/'",
                self.endpoint
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration(
                "data-service batch size must be at least 1".into(),
            ));
        }
        if self.thread_count == Some(0) {
            return Err(Error::Configuration(
                "data-service thread count must be at least 1. Nobody home, nobody calls.".into(),
            ));
        }
        let per_forest = matches!(self.work_units, WorkUnits::PerForest);
        if per_forest && self.topology.forests().is_empty() {
            return Err(Error::Configuration(
                "forest work units need forests, and the topology has none".into(),
            ));
        }

        let endpoint_state = match self.endpoint_state.clone() {
            Some(state) if is_live_state(&state) => Some(state),
            Some(_) => {
                warn!("🤷 initial endpoint state is empty, null or not JSON. State tracking is off.");
                None
            }
            None => None,
        };
        if self.listeners.is_empty() {
            warn!("📪 no output listeners yet, outputs go nowhere until one is added");
        }
        let work_units = self.work_unit_bytes()?;
        let threads = self.thread_count();
        if work_units.len() > threads {
            warn!(
                "🧩 {} work unit(s) for {} worker(s). Units past the first {} are never sent.",
                work_units.len(),
                threads,
                threads
            );
        }
        let spread = if per_forest {
            Spread::ByForest
        } else {
            Spread::ByHost
        };
        let clients = self.topology.assign(threads, spread)?;

        let control = Arc::new(JobControl::new("bulk data-service job", self.phase_listeners));
        let endpoint: Arc<str> = Arc::from(self.endpoint.as_str());
        control.start();
        info!(
            "🔁 bulk data-service job starting on {}: {} worker(s), {} work unit(s), {} mode, state tracking {}",
            endpoint,
            threads,
            work_units.len(),
            if self.input.is_some() { "input" } else { "state" },
            if endpoint_state.is_some() { "on" } else { "off" },
        );

        let crew = clients
            .into_iter()
            .enumerate()
            .map(|(id, client)| {
                let work_unit = (!work_units.is_empty())
                    .then(|| work_units[id % work_units.len()].clone());
                DataServiceWorker {
                    id,
                    client,
                    endpoint: Arc::clone(&endpoint),
                    tracking: endpoint_state.is_some(),
                    endpoint_state: endpoint_state.clone(),
                    work_unit,
                    input: self.input.clone(),
                    batch_size: usize::from(self.batch_size),
                    listeners: self.listeners.clone(),
                    control: Arc::clone(&control),
                }
                .start()
            })
            .collect();

        Ok(BulkJob {
            control,
            listeners: self.listeners,
            input: self.input,
            crew,
        })
    }
}

/// 📊 How a bulk data-service job went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkSummary {
    pub phase: WorkPhase,
    pub calls: usize,
    pub outputs: usize,
}

#[derive(Debug, Default)]
struct BulkReport {
    calls: usize,
    outputs: usize,
}

/// 🏃 A running bulk data-service job.
#[derive(Debug)]
pub struct BulkJob {
    control: Arc<JobControl>,
    listeners: Listeners<Bytes>,
    input: Option<Receiver<Handle>>,
    crew: Vec<JoinHandle<Result<BulkReport>>>,
}

impl BulkJob {
    /// 🛑 Stop calling. The call in flight is abandoned and unsent inputs are dropped.
    pub fn cancel(&self) {
        self.control.interrupt();
        if let Some(input) = &self.input {
            input.close();
        }
    }

    pub fn canceller(&self) -> JobCanceller {
        JobCanceller::new(Arc::clone(&self.control))
    }

    pub fn phase(&self) -> WorkPhase {
        self.control.phase()
    }

    pub fn add_listener(&self, listener: Sender<Bytes>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Sender<Bytes>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn subscribe(&self, capacity: usize) -> Receiver<Bytes> {
        self.listeners.subscribe(capacity)
    }

    pub fn add_phase_listener(&self, listener: Sender<WorkPhase>) {
        self.control.listeners().add(listener);
    }

    /// ⏳ Wait for every worker. The first worker error wins.
    pub async fn wait(self) -> Result<BulkSummary> {
        let reports = join_crew(self.crew).await;
        let phase = self.control.finish(reports.is_err());
        let reports = reports?;

        let calls = reports.iter().map(|r| r.calls).sum();
        let outputs = reports.iter().map(|r| r.outputs).sum();
        info!(
            "🏁 bulk data-service job {}: {} call(s), {} output(s)",
            phase, calls, outputs
        );
        Ok(BulkSummary {
            phase,
            calls,
            outputs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// 🧵 One caller of the endpoint, with its own state and its own work unit.
struct DataServiceWorker {
    id: usize,
    client: Arc<HostClient>,
    endpoint: Arc<str>,
    tracking: bool,
    endpoint_state: Option<Bytes>,
    work_unit: Option<Bytes>,
    input: Option<Receiver<Handle>>,
    batch_size: usize,
    listeners: Listeners<Bytes>,
    control: Arc<JobControl>,
}

#[async_trait]
impl Worker for DataServiceWorker {
    type Report = BulkReport;

    async fn work(mut self) -> Result<BulkReport> {
        let mut report = BulkReport::default();
        match self.input.take() {
            Some(input) => self.drain_input(input, &mut report).await?,
            None => self.follow_state(&mut report).await?,
        }
        debug!(
            "🏁 data-service worker {} done after {} call(s)",
            self.id, report.calls
        );
        Ok(report)
    }
}

impl DataServiceWorker {
    async fn follow_state(&mut self, report: &mut BulkReport) -> Result<()> {
        loop {
            if self.control.is_interrupting() {
                return Ok(());
            }
            if self.submit(&[], report).await? == Flow::Stop || !self.tracking {
                return Ok(());
            }
        }
    }

    async fn drain_input(&mut self, input: Receiver<Handle>, report: &mut BulkReport) -> Result<()> {
        let mut pending = Vec::with_capacity(self.batch_size);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.control.token().cancelled() => None,
                received = input.recv() => Some(received),
            };
            match next {
                Some(Ok(handle)) => {
                    pending.push(handle);
                    if pending.len() >= self.batch_size {
                        let full = std::mem::replace(&mut pending, Vec::with_capacity(self.batch_size));
                        if self.submit(&full, report).await? == Flow::Stop {
                            return Ok(());
                        }
                    }
                }
                Some(Err(_)) => {
                    // closed and drained
                    if !pending.is_empty() {
                        self.submit(&pending, report).await?;
                    }
                    return Ok(());
                }
                None => {
                    input.close();
                    return Ok(());
                }
            }
        }
    }

    /// 📞 One call. A cancelled call during interruption is a clean stop, not a failure.
    async fn submit(&mut self, inputs: &[Handle], report: &mut BulkReport) -> Result<Flow> {
        match self.call(inputs, report).await {
            Err(err) if err.is_cancelled() && self.control.is_interrupting() => Ok(Flow::Stop),
            Err(err) => {
                warn!(
                    "💀 data-service worker {} failed calling {} on {}: {}",
                    self.id,
                    self.endpoint,
                    self.client.host(),
                    err
                );
                Err(err)
            }
            ok => ok,
        }
    }

    async fn call(&mut self, inputs: &[Handle], report: &mut BulkReport) -> Result<Flow> {
        let call = EndpointCall {
            endpoint_state: self.endpoint_state.as_ref(),
            work_unit: self.work_unit.as_ref(),
            inputs,
            params: &[],
        };
        let parts =
            data_services::invoke(&self.client, &self.endpoint, &call, Some(self.control.token()))
                .await?;
        report.calls += 1;

        let mut parts = parts.into_iter();
        let mut flow = Flow::Continue;
        if self.tracking {
            match parts.next() {
                Some(next) if is_live_state(&next) => self.endpoint_state = Some(next),
                _ => {
                    trace!("🏳️ data-service worker {} got no further state", self.id);
                    self.endpoint_state = None;
                    flow = Flow::Stop;
                }
            }
        }
        for output in parts {
            report.outputs += 1;
            tokio::select! {
                biased;
                _ = self.listeners.broadcast(output) => {}
                _ = self.control.token().cancelled() => return Ok(Flow::Stop),
            }
        }
        Ok(flow)
    }
}
