//! Threaded job-dispatch pool: typed handler registry, compute/IO queues,
//! per-worker CPU affinity, job counters, named events, result collection.
//!
//! The original design runs this as OS processes to sidestep a
//! garbage-collected-language global lock; Rust has no such lock, so this
//! crate runs it as a pinned OS-thread pool instead (see DESIGN.md). All other
//! semantics — queues, handler registry, counters, named events, result map,
//! serial mode, shutdown/terminate — are unchanged.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use ndarray::{Array2, Array3};

use crate::config::AffinityPolicy;
use crate::error::{Result, WscmsError};

/// A transportable job argument. Threads share an address space, but job
/// arguments are still kept as owned, plain data (rather than borrowed
/// references) so the queueing model is the same whether a job runs on a
/// pinned worker or inline in serial mode.
#[derive(Debug, Clone)]
pub enum ArgValue {
    F32(f32),
    F64(f64),
    Usize(usize),
    Bool(bool),
    String(String),
    Array2F32(Array2<f32>),
    Array3F32(Array3<f32>),
}

#[derive(Debug, Clone, Default)]
pub struct JobArgs {
    pub positional: Vec<ArgValue>,
    pub keyword: HashMap<String, ArgValue>,
}

impl JobArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_positional(mut self, args: Vec<ArgValue>) -> Self {
        self.positional = args;
        self
    }
}

pub type JobOutput = Vec<ArgValue>;

/// A registered unit of work. Identity is `(handler_id, method)`: a handler
/// without methods registers under `None`; a handler exposing several named
/// operations registers once per `(id, Some(method))` pair.
pub type HandlerFn = Arc<dyn Fn(&JobArgs) -> Result<JobOutput> + Send + Sync>;

/// Handlers are registered by identity before workers start. Job messages
/// reference a handler by its stable id and optional method name, never by
/// serialized code.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, Option<String>), HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler_id: impl Into<String>, method: Option<&str>, f: HandlerFn) {
        self.handlers
            .insert((handler_id.into(), method.map(str::to_string)), f);
    }

    fn lookup(&self, handler_id: &str, method: Option<&str>) -> Result<HandlerFn> {
        self.handlers
            .get(&(handler_id.to_string(), method.map(str::to_string)))
            .cloned()
            .ok_or_else(|| WscmsError::UnknownHandler(handler_id.to_string()))
    }
}

/// Process-shared (here: thread-shared) atomic counter with `increment` /
/// `decrement` / `awaitZero` semantics.
#[derive(Debug)]
pub struct Counter {
    value: AtomicI64,
    zero_cv: Condvar,
    zero_mutex: Mutex<()>,
}

impl Counter {
    pub fn new(initial: i64) -> Arc<Self> {
        Arc::new(Counter {
            value: AtomicI64::new(initial),
            zero_cv: Condvar::new(),
            zero_mutex: Mutex::new(()),
        })
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        if self.value.fetch_sub(1, Ordering::SeqCst) - 1 <= 0 {
            let _guard = self.zero_mutex.lock().unwrap();
            self.zero_cv.notify_all();
        }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn await_zero(&self) {
        let mut guard = self.zero_mutex.lock().unwrap();
        while self.value.load(Ordering::SeqCst) > 0 {
            guard = self.zero_cv.wait(guard).unwrap();
        }
        drop(guard);
    }
}

#[derive(Debug)]
struct NamedEvent {
    set: Mutex<bool>,
    cv: Condvar,
}

impl NamedEvent {
    fn new() -> Self {
        NamedEvent {
            set: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

/// Named, settable, waitable events. Cleared when associated jobs are
/// enqueued, set after the last associated job completes.
#[derive(Clone, Default)]
pub struct EventRegistry {
    events: Arc<Mutex<HashMap<String, Arc<NamedEvent>>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<NamedEvent> {
        let mut events = self.events.lock().unwrap();
        events
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(NamedEvent::new()))
            .clone()
    }

    pub fn clear(&self, name: &str) {
        let event = self.entry(name);
        *event.set.lock().unwrap() = false;
    }

    pub fn set(&self, name: &str) {
        let event = self.entry(name);
        *event.set.lock().unwrap() = true;
        event.cv.notify_all();
    }

    pub fn wait(&self, name: &str) {
        let event = self.entry(name);
        let mut set = event.set.lock().unwrap();
        while !*set {
            set = event.cv.wait(set).unwrap();
        }
    }
}

/// Which queue a job is routed to: the shared compute queue, or a specific
/// I/O worker's private queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Compute,
    Io(usize),
}

pub struct JobRecord {
    pub job_id: u64,
    pub handler_id: String,
    pub method: Option<String>,
    pub args: JobArgs,
    pub kind: JobKind,
    pub event: Option<String>,
    pub counter: Option<Arc<Counter>>,
    pub collect: bool,
}

/// Outcome of one job: the handler's own `Err` return is a caught exception,
/// reported as a failed result — distinct from a worker dying outright.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Ok(JobOutput),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: u64,
    pub outcome: JobOutcome,
}

enum Pattern {
    JobId(u64),
    HandlerId(String),
    All,
}

/// Pending-result entries keyed by job id, consumed by `await_job_results`.
/// Singleton (non-collected) jobs are dropped from the map once observed;
/// collected jobs persist for future awaits on the same id.
#[derive(Default)]
struct ResultMap {
    ready: HashMap<u64, (JobResult, String)>,
    pending: HashMap<u64, String>,
}

struct Shared {
    registry: HandlerRegistry,
    results: Mutex<ResultMap>,
    results_cv: Condvar,
    poisoned: AtomicBool,
    events: EventRegistry,
    /// Outstanding job count per named event, so `finish_job` can tell when
    /// the *last* job sharing a name has completed.
    event_pending: Mutex<HashMap<String, u64>>,
}

fn execute(shared: &Shared, job: &JobRecord) -> JobOutcome {
    let handler = match shared.registry.lookup(&job.handler_id, job.method.as_deref()) {
        Ok(h) => h,
        Err(e) => return JobOutcome::Failed(e.to_string()),
    };
    match catch_unwind(AssertUnwindSafe(|| handler(&job.args))) {
        Ok(Ok(output)) => JobOutcome::Ok(output),
        Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
        Err(_) => {
            shared.poisoned.store(true, Ordering::SeqCst);
            JobOutcome::Failed("worker panicked while running job".to_string())
        }
    }
}

fn finish_job(shared: &Arc<Shared>, job: JobRecord, outcome: JobOutcome) {
    if let Some(counter) = &job.counter {
        counter.decrement();
    }
    if job.collect {
        let mut results = shared.results.lock().unwrap();
        results.ready.insert(
            job.job_id,
            (
                JobResult {
                    job_id: job.job_id,
                    outcome,
                },
                job.handler_id.clone(),
            ),
        );
        results.pending.remove(&job.job_id);
        shared.results_cv.notify_all();
    }
    if let Some(name) = &job.event {
        let mut pending = shared.event_pending.lock().unwrap();
        if let Some(count) = pending.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                pending.remove(name);
                drop(pending);
                shared.events.set(name);
            }
        }
    }
}

enum Envelope {
    Job(JobRecord),
    Shutdown,
}

/// Threaded job-dispatch pool. Compute workers share one queue and are
/// pinned per `AffinityPolicy`; I/O workers each own a private queue and are
/// left unpinned.
pub struct ProcessPool {
    shared: Arc<Shared>,
    compute_tx: Sender<Envelope>,
    io_tx: Vec<Sender<Envelope>>,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
    next_job_id: AtomicU64,
    terminated: AtomicBool,
}

fn affinity_core_ids(n_compute: usize, policy: AffinityPolicy) -> Vec<Option<usize>> {
    let available = core_affinity::get_core_ids().unwrap_or_default();
    if available.is_empty() {
        return vec![None; n_compute];
    }
    let n_cores = available.len();
    (0..n_compute)
        .map(|i| {
            let idx = match policy {
                AffinityPolicy::Contiguous => i % n_cores,
                AffinityPolicy::Stride2 => (i * 2) % n_cores,
                AffinityPolicy::InterleavedStride4 => (i * 4) % n_cores,
            };
            Some(available[idx].id)
        })
        .collect()
}

impl ProcessPool {
    /// Spawns `n_compute` pinned compute workers and `n_io` unpinned I/O
    /// workers, consuming a frozen `HandlerRegistry`.
    pub fn start(registry: HandlerRegistry, n_compute: usize, n_io: usize, affinity: AffinityPolicy) -> Self {
        let shared = Arc::new(Shared {
            registry,
            results: Mutex::new(ResultMap::default()),
            results_cv: Condvar::new(),
            poisoned: AtomicBool::new(false),
            events: EventRegistry::new(),
            event_pending: Mutex::new(HashMap::new()),
        });

        let (compute_tx, compute_rx) = bounded::<Envelope>(4096);
        let core_ids = affinity_core_ids(n_compute, affinity);

        let mut workers = Vec::with_capacity(n_compute + n_io);
        for core_id in core_ids.into_iter() {
            let shared = shared.clone();
            let rx: Receiver<Envelope> = compute_rx.clone();
            workers.push(std::thread::spawn(move || {
                if let Some(id) = core_id {
                    core_affinity::set_for_current(core_affinity::CoreId { id });
                }
                worker_loop(shared, rx);
            }));
        }

        let mut io_tx = Vec::with_capacity(n_io);
        for _ in 0..n_io {
            let (tx, rx) = bounded::<Envelope>(1024);
            io_tx.push(tx);
            let shared = shared.clone();
            workers.push(std::thread::spawn(move || worker_loop(shared, rx)));
        }

        ProcessPool {
            shared,
            compute_tx,
            io_tx,
            workers: Mutex::new(Some(workers)),
            next_job_id: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> &EventRegistry {
        &self.shared.events
    }

    /// Registers `count` additional outstanding jobs against `name`, so
    /// `finish_job` can recognize when the last one completes. Called once
    /// per `submit`/`submit_serial` that names an event.
    fn mark_event_pending(&self, name: &str) {
        self.shared.events.clear(name);
        let mut pending = self.shared.event_pending.lock().unwrap();
        *pending.entry(name.to_string()).or_insert(0) += 1;
    }

    fn allocate_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueues `job`, assigning it a fresh job id. If the job names an
    /// event, the event is cleared here (enqueue time), per spec.
    pub fn submit(
        &self,
        handler_id: impl Into<String>,
        method: Option<&str>,
        args: JobArgs,
        kind: JobKind,
        event: Option<&str>,
        counter: Option<Arc<Counter>>,
        collect: bool,
    ) -> Result<u64> {
        let job_id = self.allocate_job_id();
        let handler_id = handler_id.into();
        if let Some(c) = &counter {
            c.increment();
        }
        if let Some(name) = event {
            self.mark_event_pending(name);
        }
        if collect {
            let mut results = self.shared.results.lock().unwrap();
            results.pending.insert(job_id, handler_id.clone());
        }
        let job = JobRecord {
            job_id,
            handler_id,
            method: method.map(str::to_string),
            args,
            kind,
            event: event.map(str::to_string),
            counter,
            collect,
        };
        let tx = match kind {
            JobKind::Compute => &self.compute_tx,
            JobKind::Io(i) => self
                .io_tx
                .get(i)
                .ok_or_else(|| WscmsError::Configuration(format!("no such I/O worker {i}")))?,
        };
        tx.send(Envelope::Job(job))
            .map_err(|_| WscmsError::PoolShutDown)?;
        Ok(job_id)
    }

    /// Runs a job inline on the calling thread, bypassing the queues
    /// entirely. Semantics (counters, events, result map) match the async
    /// path exactly.
    pub fn submit_serial(
        &self,
        handler_id: impl Into<String>,
        method: Option<&str>,
        args: JobArgs,
        event: Option<&str>,
        counter: Option<Arc<Counter>>,
        collect: bool,
    ) -> u64 {
        let job_id = self.allocate_job_id();
        if let Some(c) = &counter {
            c.increment();
        }
        if let Some(name) = event {
            self.mark_event_pending(name);
        }
        let job = JobRecord {
            job_id,
            handler_id: handler_id.into(),
            method: method.map(str::to_string),
            args,
            kind: JobKind::Compute,
            event: event.map(str::to_string),
            counter,
            collect,
        };
        let outcome = execute(&self.shared, &job);
        finish_job(&self.shared, job, outcome);
        job_id
    }

    /// Blocks consuming results until every job id matching `patterns` has
    /// reported, returning their results keyed by job id. An empty pattern
    /// list matches every outstanding collected job.
    pub fn await_job_results(&self, job_ids: &[u64]) -> Result<HashMap<u64, JobResult>> {
        if self.shared.poisoned.load(Ordering::SeqCst) {
            return Err(WscmsError::WorkerDied);
        }
        let patterns: Vec<Pattern> = job_ids.iter().map(|&id| Pattern::JobId(id)).collect();
        self.await_patterns(&patterns)
    }

    /// As `await_job_results`, but matching by handler id (wildcard across
    /// all jobs registered under that handler) instead of exact job ids.
    pub fn await_handler_results(&self, handler_id: &str) -> Result<HashMap<u64, JobResult>> {
        self.await_patterns(&[Pattern::HandlerId(handler_id.to_string())])
    }

    /// Blocks until every outstanding collected job (of any handler) has
    /// reported. Equivalent to an `awaitJobResults` call with a catch-all
    /// wildcard pattern.
    pub fn await_all_results(&self) -> Result<HashMap<u64, JobResult>> {
        self.await_patterns(&[Pattern::All])
    }

    fn await_patterns(&self, patterns: &[Pattern]) -> Result<HashMap<u64, JobResult>> {
        let matches = |id: u64, handler: &str| -> bool {
            patterns.iter().any(|p| match p {
                Pattern::JobId(j) => *j == id,
                Pattern::HandlerId(h) => h == handler,
                Pattern::All => true,
            })
        };

        let mut collected = HashMap::new();
        let mut results = self.shared.results.lock().unwrap();
        loop {
            if self.shared.poisoned.load(Ordering::SeqCst) {
                return Err(WscmsError::WorkerDied);
            }
            let ready_ids: Vec<u64> = results
                .ready
                .iter()
                .filter(|(id, (_, handler))| matches(**id, handler))
                .map(|(id, _)| *id)
                .collect();
            for id in ready_ids {
                if let Some((result, _)) = results.ready.get(&id).cloned() {
                    collected.insert(id, result);
                }
            }

            let still_pending = results
                .pending
                .iter()
                .any(|(id, handler)| matches(*id, handler));
            if !still_pending {
                break;
            }
            results = self.shared.results_cv.wait(results).unwrap();
        }
        Ok(collected)
    }

    /// Graceful stop: drains queued work, then joins every worker. Idempotent.
    pub fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let n_compute = {
            let guard = self.workers.lock().unwrap();
            guard.as_ref().map(|w| w.len()).unwrap_or(0) - self.io_tx.len()
        };
        for _ in 0..n_compute {
            let _ = self.compute_tx.send(Envelope::Shutdown);
        }
        for tx in &self.io_tx {
            let _ = tx.send(Envelope::Shutdown);
        }
        self.join_all();
    }

    /// Hard stop: drops the queues immediately, abandoning unstarted jobs.
    /// Idempotent.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.join_all();
    }

    fn join_all(&self) {
        let handles = self.workers.lock().unwrap().take();
        if let Some(handles) = handles {
            for h in handles {
                let _ = h.join();
            }
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<Envelope>) {
    loop {
        match rx.recv() {
            Ok(Envelope::Job(job)) => {
                let outcome = execute(&shared, &job);
                finish_job(&shared, job, outcome);
            }
            Ok(Envelope::Shutdown) => break,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double_handler() -> HandlerFn {
        Arc::new(|args: &JobArgs| {
            let ArgValue::F32(v) = args.positional[0] else {
                return Err(WscmsError::Configuration("expected f32".into()));
            };
            Ok(vec![ArgValue::F32(v * 2.0)])
        })
    }

    #[test]
    fn compute_job_round_trips_result() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", None, double_handler());
        let pool = ProcessPool::start(registry, 2, 0, AffinityPolicy::Contiguous);

        let job_id = pool
            .submit(
                "double",
                None,
                JobArgs::new().with_positional(vec![ArgValue::F32(21.0)]),
                JobKind::Compute,
                None,
                None,
                true,
            )
            .unwrap();

        let results = pool.await_job_results(&[job_id]).unwrap();
        let result = &results[&job_id];
        match &result.outcome {
            JobOutcome::Ok(out) => {
                let ArgValue::F32(v) = out[0] else { panic!("wrong type") };
                assert!((v - 42.0).abs() < 1e-6);
            }
            JobOutcome::Failed(e) => panic!("job failed: {e}"),
        }
        pool.shutdown();
    }

    #[test]
    fn unknown_handler_reports_failed_result_not_pool_crash() {
        let registry = HandlerRegistry::new();
        let pool = ProcessPool::start(registry, 1, 0, AffinityPolicy::Contiguous);

        let job_id = pool
            .submit("missing", None, JobArgs::new(), JobKind::Compute, None, None, true)
            .unwrap();
        let results = pool.await_job_results(&[job_id]).unwrap();
        assert!(matches!(results[&job_id].outcome, JobOutcome::Failed(_)));
        pool.shutdown();
    }

    #[test]
    fn counter_await_zero_blocks_until_all_jobs_finish() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", None, double_handler());
        let pool = ProcessPool::start(registry, 4, 0, AffinityPolicy::Stride2);
        let counter = Counter::new(0);

        for i in 0..20 {
            pool.submit(
                "double",
                None,
                JobArgs::new().with_positional(vec![ArgValue::F32(i as f32)]),
                JobKind::Compute,
                None,
                Some(counter.clone()),
                false,
            )
            .unwrap();
        }
        counter.await_zero();
        assert_eq!(counter.get(), 0);
        pool.shutdown();
    }

    #[test]
    fn serial_mode_matches_async_semantics() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", None, double_handler());
        let pool = ProcessPool::start(registry, 1, 0, AffinityPolicy::Contiguous);

        let job_id = pool.submit_serial(
            "double",
            None,
            JobArgs::new().with_positional(vec![ArgValue::F32(10.0)]),
            None,
            None,
            true,
        );
        let results = pool.await_job_results(&[job_id]).unwrap();
        match &results[&job_id].outcome {
            JobOutcome::Ok(out) => {
                let ArgValue::F32(v) = out[0] else { panic!("wrong type") };
                assert!((v - 20.0).abs() < 1e-6);
            }
            JobOutcome::Failed(e) => panic!("job failed: {e}"),
        }
        pool.shutdown();
    }

    #[test]
    fn named_event_set_and_wait() {
        let events = EventRegistry::new();
        events.clear("done");
        let events2 = events.clone();
        let handle = std::thread::spawn(move || {
            events2.set("done");
        });
        events.wait("done");
        handle.join().unwrap();
    }

    #[test]
    fn named_event_is_set_by_the_pool_after_the_last_job_with_that_name() {
        let mut registry = HandlerRegistry::new();
        registry.register("double", None, double_handler());
        let pool = ProcessPool::start(registry, 4, 0, AffinityPolicy::Stride2);

        for i in 0..10 {
            pool.submit(
                "double",
                None,
                JobArgs::new().with_positional(vec![ArgValue::F32(i as f32)]),
                JobKind::Compute,
                Some("batch-done"),
                None,
                false,
            )
            .unwrap();
        }
        // Blocks until the pool itself sets the event, with no external
        // caller tracking job counts.
        pool.events().wait("batch-done");
        pool.shutdown();
    }

    #[test]
    fn panic_in_handler_poisons_pool_and_future_awaits_fail() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "boom",
            None,
            Arc::new(|_: &JobArgs| -> Result<JobOutput> { panic!("simulated worker crash") }),
        );
        let pool = ProcessPool::start(registry, 1, 0, AffinityPolicy::Contiguous);

        let job_id = pool
            .submit("boom", None, JobArgs::new(), JobKind::Compute, None, None, true)
            .unwrap();

        let result = pool.await_job_results(&[job_id]);
        assert!(result.is_err());
        pool.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let registry = HandlerRegistry::new();
        let pool = ProcessPool::start(registry, 1, 1, AffinityPolicy::Contiguous);
        pool.shutdown();
        pool.shutdown();
    }
}
