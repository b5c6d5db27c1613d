//! Simulate command implementation.
//!
//! Seeds an in-memory store, lets a predicate source publish every record
//! that has not been synced yet, and drives the engine against a remote
//! that fails requests at random.

use objsync_engine::{
    DependencyGraph, MemoryStore, ObjectSync, ObjectTranscoder, PredicateSource, Record,
    ResponseStatus, SharedDependencyGraph, StoreObserver, SyncConfig, SyncDriver, SyncEvent,
    Transport, TransportResponse,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use tracing::info;

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown output format '{other}' (expected text or json)")),
        }
    }
}

/// Parameters of a simulated session.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Records seeded into the store.
    pub entities: u64,
    /// Transcoder fetch limit.
    pub fetch_limit: usize,
    /// Probability of a transient failure per request.
    pub transient_rate: f64,
    /// Records the remote always rejects.
    pub rejected: HashSet<u64>,
    /// Retry ceiling; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Whether record `n` waits on record `n - 1`.
    pub dependency_chain: bool,
    /// Maximum outstanding requests.
    pub concurrency: usize,
    /// Seed for the failure injection.
    pub seed: u64,
}

/// Outcome of a simulated session.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Records seeded into the store.
    pub entities: u64,
    /// Seed used for failure injection.
    pub seed: u64,
    /// Requests the remote received.
    pub requests_sent: usize,
    /// Batches handed out by the engine.
    pub batches_scheduled: u64,
    /// Batches sent again after a transient failure.
    pub batches_retried: u64,
    /// Entities accepted by the remote.
    pub entities_synced: u64,
    /// Entities rejected or given up on.
    pub entities_failed: u64,
    /// Records marked synced in the local store.
    pub records_synced: usize,
    /// Entities dropped because a record they waited on failed.
    pub expired: usize,
    /// Entities still pending when the session went idle.
    pub stranded: usize,
    /// Times the delegate was told a batch failed.
    pub failure_notifications: usize,
    /// Whether the delegate saw the session finish.
    pub finished: bool,
    /// Most recent error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A local record awaiting upload.
#[derive(Debug, Clone)]
struct SimRecord {
    id: u64,
    synced: bool,
}

impl Record for SimRecord {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
struct UploadRequest {
    ids: Vec<u64>,
}

#[derive(Debug)]
struct UploadResponse {
    status: ResponseStatus,
}

impl TransportResponse for UploadResponse {
    fn status(&self) -> ResponseStatus {
        self.status
    }
}

/// Uploads records and marks the accepted ones as synced in the store.
struct UploadTranscoder {
    store: Arc<MemoryStore<SimRecord>>,
    limit: usize,
}

impl UploadTranscoder {
    fn mark_synced(&self, response: &UploadResponse, id: &u64) {
        if response.status.is_success() {
            self.store.update(id, |record| record.synced = true);
        }
    }
}

impl ObjectTranscoder<u64> for UploadTranscoder {
    type Request = UploadRequest;
    type Response = UploadResponse;

    fn fetch_limit(&self) -> usize {
        self.limit
    }

    fn request_for(&mut self, object: &u64) -> Option<UploadRequest> {
        self.store.get(object)?;
        Some(UploadRequest { ids: vec![*object] })
    }

    fn request_for_batch(&mut self, objects: &HashSet<u64>) -> Option<UploadRequest> {
        let mut ids: Vec<u64> = objects.iter().copied().collect();
        ids.sort_unstable();
        Some(UploadRequest { ids })
    }

    fn handle_response(&mut self, response: &UploadResponse, object: &u64) {
        self.mark_synced(response, object);
    }

    fn handle_batch_response(&mut self, response: &UploadResponse, objects: &HashSet<u64>) {
        for id in objects {
            self.mark_synced(response, id);
        }
    }
}

/// Remote store with seeded failure injection.
struct SimulatedRemote {
    rng: Mutex<StdRng>,
    transient_rate: f64,
    rejected: HashSet<u64>,
    requests: AtomicUsize,
}

impl SimulatedRemote {
    fn respond(&self, request: &UploadRequest) -> UploadResponse {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let status = if request.ids.iter().any(|id| self.rejected.contains(id)) {
            ResponseStatus::PermanentFailure
        } else if self.rng.lock().gen_bool(self.transient_rate) {
            ResponseStatus::TransientFailure
        } else {
            ResponseStatus::Success
        };
        UploadResponse { status }
    }
}

impl Transport<UploadRequest, UploadResponse> for SimulatedRemote {
    fn send(&self, request: UploadRequest) -> impl Future<Output = UploadResponse> + Send {
        std::future::ready(self.respond(&request))
    }
}

/// Runs the simulate command.
pub fn run(options: &SimulateOptions, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(options)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text(&report),
    }

    Ok(())
}

/// Runs a session and returns its report.
pub fn simulate(options: &SimulateOptions) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    if !(0.0..=1.0).contains(&options.transient_rate) {
        return Err(format!(
            "transient rate must be between 0 and 1, got {}",
            options.transient_rate
        )
        .into());
    }

    let mut config = SyncConfig::new().with_max_concurrent_requests(options.concurrency);
    if let Some(retries) = options.max_retries {
        config = config.with_max_transient_retries(retries);
    }

    let store = Arc::new(MemoryStore::new());
    store.put_all(
        (0..options.entities)
            .map(|id| SimRecord { id, synced: false })
            .collect(),
    );

    let transcoder = UploadTranscoder {
        store: Arc::clone(&store),
        limit: options.fetch_limit,
    };
    let mut engine = ObjectSync::with_config(transcoder, config)?;

    let (events_tx, events) = mpsc::channel();
    engine.set_delegate(events_tx);

    let chain = options.dependency_chain.then(|| {
        let graph: SharedDependencyGraph<u64, u64> = Arc::new(Mutex::new(DependencyGraph::new()));
        {
            let mut edges = graph.lock();
            for id in 1..options.entities {
                edges.add(id, id - 1);
            }
        }
        engine.add_dependency_graph(Arc::clone(&graph));

        let failed = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::clone(&graph);
        let sink = Arc::clone(&failed);
        engine.on_completed(move |id, result| {
            if result.is_ok() {
                released.lock().enumerate_and_remove(id, |_| true);
            } else {
                sink.lock().push(*id);
            }
        });
        (graph, failed)
    });

    let mut source = PredicateSource::new(|record: &SimRecord| !record.synced);
    engine.add_source(&mut source);
    let mut observer = StoreObserver::new(store.as_ref());
    observer.add_tracker(store.as_ref(), source);
    engine.process_source_events();

    info!(
        entities = options.entities,
        pending = engine.pending().len(),
        seed = options.seed,
        "starting simulated session"
    );

    let remote = SimulatedRemote {
        rng: Mutex::new(StdRng::seed_from_u64(options.seed)),
        transient_rate: options.transient_rate,
        rejected: options.rejected.clone(),
        requests: AtomicUsize::new(0),
    };
    let mut driver = SyncDriver::new(engine, remote);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(driver.run_until_idle())?;

    // Records waiting on a failed record can never be sent. Expiring them
    // reports them as failed too, which feeds the next round.
    let mut expired = 0;
    if let Some((graph, failed)) = &chain {
        loop {
            let dead = std::mem::take(&mut *failed.lock());
            if dead.is_empty() {
                break;
            }
            for id in dead {
                expired += driver.engine_mut().expire_dependents(graph, &id).len();
            }
        }
    }

    // Synced records stop matching the source predicate.
    observer.process_changes();
    driver.engine_mut().process_source_events();

    let stats = driver.engine().stats();
    let events: Vec<SyncEvent> = events.try_iter().collect();
    let records_synced = (0..options.entities)
        .filter(|id| store.get(id).is_some_and(|record| record.synced))
        .count();

    let report = SimulationReport {
        entities: options.entities,
        seed: options.seed,
        requests_sent: driver.transport().requests.load(Ordering::Relaxed),
        batches_scheduled: stats.batches_scheduled,
        batches_retried: stats.batches_retried,
        entities_synced: stats.entities_synced,
        entities_failed: stats.entities_failed,
        records_synced,
        expired,
        stranded: driver.engine().pending().len(),
        failure_notifications: events.iter().filter(|e| **e == SyncEvent::Failed).count(),
        finished: events.contains(&SyncEvent::Finished),
        last_error: stats.last_error,
    };

    info!(
        synced = report.entities_synced,
        failed = report.entities_failed,
        expired = report.expired,
        stranded = report.stranded,
        "simulated session idle"
    );

    Ok(report)
}

fn print_text(report: &SimulationReport) {
    println!("Simulated sync session (seed {})", report.seed);
    println!("  Entities:          {}", report.entities);
    println!("  Requests sent:     {}", report.requests_sent);
    println!("  Batches scheduled: {}", report.batches_scheduled);
    println!("  Batches retried:   {}", report.batches_retried);
    println!("  Entities synced:   {}", report.entities_synced);
    println!("  Entities failed:   {}", report.entities_failed);
    println!("  Records synced:    {}", report.records_synced);
    println!("  Expired:           {}", report.expired);
    println!("  Stranded:          {}", report.stranded);
    println!("  Failure callbacks: {}", report.failure_notifications);
    println!("  Finished:          {}", report.finished);
    if let Some(error) = &report.last_error {
        println!("  Last error:        {error}");
    }
}
