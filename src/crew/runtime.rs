//! The crew runtime: message processing, fan-out, lifecycle.
//!
//! A message sent to a crew is handled under that crew's lock:
//! - route it to target machines
//! - walk each target with the message pending
//! - persist every changed machine state in one write
//! - apply the new states in memory, only if the write succeeded
//!
//! Messages the walks emit are published on the bus and queued as new
//! top-level messages after the lock is released. A dispatcher task drains
//! the queue, processing at most `max_concurrent_messages` at once.

use super::cache::CrewCache;
use super::machine::{Crew, Machine, MachineInit};
use super::native::{handle_timers_message, TIMERS_MACHINE};
use super::provider::{SpecLibrary, SpecProvider};
use super::router::{DirectedRouter, Route, Router};
use super::storage::{MemoryStorage, Storage};
use crate::action::{InterpreterRegistry, StepProps};
use crate::bus::{BusEvent, MessageBus};
use crate::matcher::Bindings;
use crate::spec::Spec;
use crate::timers::{Emitter, PendingTimer, Timers};
use crate::types::{Config, CrewId, Error, MachineId, Result};
use crate::walker::{Control, State, Walked};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Results
// =============================================================================

/// Outcome of processing one message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Processed {
    /// Walk per target machine.
    pub walks: BTreeMap<MachineId, Walked>,
    /// Targets whose spec couldn't be resolved.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub failed: BTreeMap<MachineId, String>,
    /// Messages emitted and queued, in emission order.
    pub emitted: Vec<Value>,
}

// =============================================================================
// Internals
// =============================================================================

#[derive(Debug)]
struct CrewHandle {
    crew: Mutex<Crew>,
    timers: Timers,
}

#[derive(Debug)]
struct Job {
    crew_id: CrewId,
    message: Value,
}

/// Unbounded FIFO of top-level messages plus a count of queued and
/// in-flight jobs.
#[derive(Debug, Clone)]
struct WorkQueue {
    tx: mpsc::UnboundedSender<Job>,
    depth: Arc<watch::Sender<usize>>,
    warn_depth: usize,
}

impl WorkQueue {
    fn push(&self, crew_id: CrewId, message: Value) -> Result<()> {
        let mut depth = 0;
        self.depth.send_modify(|n| {
            *n += 1;
            depth = *n;
        });
        if self.tx.send(Job { crew_id, message }).is_err() {
            self.done();
            return Err(Error::cancelled("crew runtime is shut down"));
        }
        if depth == self.warn_depth + 1 {
            tracing::warn!("Work queue depth {} exceeds {}", depth, self.warn_depth);
        }
        Ok(())
    }

    fn done(&self) {
        self.depth.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug)]
struct RuntimeInner {
    config: Config,
    specs: Arc<dyn SpecProvider>,
    storage: Arc<dyn Storage>,
    router: Arc<dyn Router>,
    bus: MessageBus,
    crews: Mutex<CrewCache<Arc<CrewHandle>>>,
    queue: WorkQueue,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`CrewRuntime`]. Unset parts get in-memory defaults.
#[derive(Debug)]
pub struct CrewRuntimeBuilder {
    config: Config,
    specs: Option<Arc<dyn SpecProvider>>,
    storage: Option<Arc<dyn Storage>>,
    router: Option<Arc<dyn Router>>,
    bus: Option<MessageBus>,
}

impl CrewRuntimeBuilder {
    pub fn specs(mut self, specs: Arc<dyn SpecProvider>) -> Self {
        self.specs = Some(specs);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validate the config and spawn the dispatcher and eviction tasks.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(self) -> Result<CrewRuntime> {
        self.config.validate()?;

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (depth, _) = watch::channel(0usize);
        let ttl = self.config.runtime.crew_cache_ttl;

        let inner = Arc::new(RuntimeInner {
            specs: self
                .specs
                .unwrap_or_else(|| {
                    Arc::new(SpecLibrary::with_capacity(
                        InterpreterRegistry::default(),
                        self.config.runtime.spec_cache_capacity,
                    ))
                }),
            storage: self.storage.unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            router: self.router.unwrap_or_else(|| Arc::new(DirectedRouter)),
            bus: self.bus.unwrap_or_default(),
            crews: Mutex::new(CrewCache::new(ttl)),
            queue: WorkQueue {
                tx,
                depth: Arc::new(depth),
                warn_depth: self.config.runtime.queue_warn_depth,
            },
            permits: Arc::new(Semaphore::new(self.config.runtime.max_concurrent_messages)),
            cancel: cancel.clone(),
            config: self.config,
        });

        tokio::spawn(dispatch(Arc::downgrade(&inner), rx, cancel.clone()));
        tokio::spawn(evict_idle_crews(
            Arc::downgrade(&inner),
            cancel,
            ttl.max(Duration::from_secs(1)),
        ));

        tracing::info!(
            "Crew runtime started (workers={}, crew_cache_ttl={:?})",
            inner.config.runtime.max_concurrent_messages,
            ttl
        );
        Ok(CrewRuntime { inner })
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Shared handle to a running crew runtime.
#[derive(Debug, Clone)]
pub struct CrewRuntime {
    inner: Arc<RuntimeInner>,
}

impl CrewRuntime {
    pub fn builder(config: Config) -> CrewRuntimeBuilder {
        CrewRuntimeBuilder {
            config,
            specs: None,
            storage: None,
            router: None,
            bus: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    // =========================================================================
    // Crew lifecycle
    // =========================================================================

    pub async fn make_crew(&self, cid: &CrewId) -> Result<()> {
        let mut crews = self.inner.crews.lock().await;
        if crews.get(cid).is_some() {
            return Err(Error::exists(format!("crew {}", cid)));
        }
        self.inner.storage.make_crew(cid).await?;
        crews.insert(cid.clone(), self.new_handle(Crew::new(cid.clone())));
        tracing::info!("Created crew {}", cid);
        Ok(())
    }

    /// Remove a crew and halt its timers.
    pub async fn rem_crew(&self, cid: &CrewId) -> Result<()> {
        let mut crews = self.inner.crews.lock().await;
        let handle = crews.remove(cid);
        if let Err(e) = self.inner.storage.rem_crew(cid).await {
            if handle.is_none() {
                return Err(e);
            }
            tracing::warn!("Crew {} was cached but storage removal failed: {}", cid, e);
        }
        if let Some(handle) = handle {
            handle.timers.shutdown();
        }
        tracing::info!("Removed crew {}", cid);
        Ok(())
    }

    /// Snapshot of a crew's machines.
    pub async fn get_crew(&self, cid: &CrewId) -> Result<Crew> {
        let handle = self.find_crew(cid).await?;
        let crew = handle.crew.lock().await;
        Ok(crew.clone())
    }

    pub async fn machines(&self, cid: &CrewId) -> Result<Vec<Machine>> {
        Ok(self.get_crew(cid).await?.machines.into_values().collect())
    }

    pub async fn machine(&self, cid: &CrewId, mid: &MachineId) -> Result<Machine> {
        self.get_crew(cid)
            .await?
            .machines
            .remove(mid)
            .ok_or_else(|| Error::not_found(format!("machine {} in crew {}", mid, cid)))
    }

    /// Add a machine, filling parameter defaults from its spec.
    pub async fn add_machine(&self, cid: &CrewId, init: MachineInit) -> Result<Machine> {
        let handle = self.find_crew(cid).await?;
        let mut crew = handle.crew.lock().await;

        let id = init.id.unwrap_or_default();
        if id.as_str() == TIMERS_MACHINE || crew.machines.contains_key(&id) {
            return Err(Error::exists(format!("machine {} in crew {}", id, cid)));
        }
        if init.spec.is_empty() {
            return Err(Error::validation("machine needs a spec source"));
        }

        let spec = self.inner.specs.find_spec(&init.spec).await?.spec();
        let mut bs = init.bindings.unwrap_or_default();
        apply_params(&spec, &mut bs)?;

        let node = init
            .node
            .unwrap_or_else(|| self.inner.config.runtime.default_node.clone());
        if spec.node(&node).is_none() {
            return Err(Error::validation(format!(
                "spec {} has no node '{}'",
                spec.name, node
            )));
        }

        let machine = Machine {
            id,
            spec: init.spec,
            state: State::new(node, bs),
        };
        self.inner
            .storage
            .write_state(cid, &[machine.to_record()])
            .await?;
        crew.machines.insert(machine.id.clone(), machine.clone());
        tracing::info!("Added machine {} to crew {} at {}", machine.id, cid, machine.state.node);
        Ok(machine)
    }

    pub async fn rem_machine(&self, cid: &CrewId, mid: &MachineId) -> Result<()> {
        let handle = self.find_crew(cid).await?;
        let mut crew = handle.crew.lock().await;
        let machine = crew
            .machines
            .get(mid)
            .ok_or_else(|| Error::not_found(format!("machine {} in crew {}", mid, cid)))?;
        let mut tombstone = machine.to_record();
        tombstone.deleted = true;
        self.inner.storage.write_state(cid, &[tombstone]).await?;
        crew.machines.remove(mid);
        tracing::info!("Removed machine {} from crew {}", mid, cid);
        Ok(())
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Process `message` in crew `cid` now, with the configured walk control.
    pub async fn process(&self, cid: &CrewId, message: Value) -> Result<Processed> {
        let control = Control::from_config(&self.inner.config.walker);
        self.process_with(cid, message, &control).await
    }

    pub async fn process_with(&self, cid: &CrewId, message: Value, control: &Control) -> Result<Processed> {
        let handle = self.find_crew(cid).await?;
        self.inner
            .bus
            .publish(BusEvent::inbound(cid.clone(), message.clone()))
            .await?;

        let mut processed = Processed::default();
        let mut outbound: Vec<(String, Value)> = Vec::new();
        {
            let mut crew = handle.crew.lock().await;
            let targets: Vec<MachineId> = match self.inner.router.route(&crew, &message)? {
                Route::All => crew.machines.keys().cloned().collect(),
                Route::Machines(ids) => ids,
            };

            let mut changed = Vec::new();
            for mid in targets {
                let Some(machine) = crew.machines.get(&mid) else {
                    if mid.as_str() == TIMERS_MACHINE {
                        outbound.extend(
                            handle_timers_message(&handle.timers, &message)
                                .into_iter()
                                .map(|reply| (TIMERS_MACHINE.to_string(), reply)),
                        );
                    } else {
                        tracing::debug!("No machine {} in crew {}", mid, cid);
                    }
                    continue;
                };

                let specter = match self.inner.specs.find_spec(&machine.spec).await {
                    Ok(specter) => specter,
                    Err(e) => {
                        tracing::warn!("Machine {} in crew {} has no usable spec: {}", mid, cid, e);
                        processed.failed.insert(mid, e.to_string());
                        continue;
                    }
                };
                let spec = specter.spec();

                let mut props = StepProps::new();
                props.insert("mid".to_string(), json!(mid));
                props.insert("cid".to_string(), json!(cid));
                let walked = spec.walk(
                    &self.inner.cancel,
                    &machine.state,
                    vec![message.clone()],
                    control,
                    &props,
                );
                tracing::debug!(
                    "Walked machine {} in crew {}: {} strides, {:?}",
                    mid,
                    cid,
                    walked.strides.len(),
                    walked.stopped_because
                );

                if let Some(to) = walked.to() {
                    if *to != machine.state {
                        let mut record = machine.to_record();
                        record.node = to.node.clone();
                        record.bindings = to.bs.clone();
                        changed.push(record);
                    }
                }
                outbound.extend(walked.emitted().map(|m| (mid.to_string(), m.clone())));
                processed.walks.insert(mid, walked);
            }

            if !changed.is_empty() {
                if let Err(e) = self.inner.storage.write_state(cid, &changed).await {
                    tracing::warn!(
                        "Failed to persist {} machine states for crew {}: {}",
                        changed.len(),
                        cid,
                        e
                    );
                    return Err(match e {
                        Error::Storage(_) => e,
                        other => Error::storage(other.to_string()),
                    });
                }
                for record in changed {
                    if let Some(machine) = crew.machines.get_mut(&record.id) {
                        machine.state = State::new(record.node, record.bindings);
                    }
                }
            }
        }

        for (source, message) in outbound {
            self.inner
                .bus
                .publish(BusEvent::outbound(cid.clone(), source, message.clone()))
                .await?;
            self.inner.queue.push(cid.clone(), message.clone())?;
            processed.emitted.push(message);
        }
        Ok(processed)
    }

    /// Queue `message` for asynchronous processing in crew `cid`.
    pub fn submit(&self, cid: &CrewId, message: Value) -> Result<()> {
        self.inner.queue.push(cid.clone(), message)
    }

    /// Resolves when no messages are queued or being processed, or the
    /// runtime has shut down.
    pub async fn wait_idle(&self) {
        let mut depth = self.inner.queue.depth.subscribe();
        tokio::select! {
            _ = depth.wait_for(|n| *n == 0) => {}
            _ = self.inner.cancel.cancelled() => {}
        }
    }

    /// Stop the dispatcher and every crew's timers.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        tracing::info!("Crew runtime shutting down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Schedule `message` to be submitted to crew `cid` after `delay`.
    pub async fn add_timer(&self, cid: &CrewId, id: &str, message: Value, delay: Duration) -> Result<()> {
        self.find_crew(cid).await?.timers.add(id, message, delay)
    }

    pub async fn rem_timer(&self, cid: &CrewId, id: &str) -> Result<()> {
        self.find_crew(cid).await?.timers.rem(id)
    }

    pub async fn timers(&self, cid: &CrewId) -> Result<Vec<PendingTimer>> {
        Ok(self.find_crew(cid).await?.timers.pending())
    }

    // =========================================================================
    // Cache
    // =========================================================================

    /// Drop crews idle past the ttl. Crews in use or with pending timers
    /// stay.
    pub async fn evict_idle(&self) -> Vec<CrewId> {
        self.inner
            .crews
            .lock()
            .await
            .evict_idle(|handle| Arc::strong_count(handle) > 1 || !handle.timers.is_empty())
    }

    async fn find_crew(&self, cid: &CrewId) -> Result<Arc<CrewHandle>> {
        let mut crews = self.inner.crews.lock().await;
        if let Some(handle) = crews.get(cid) {
            return Ok(handle);
        }
        let records = self.inner.storage.read_crew(cid).await?;
        tracing::debug!("Loaded crew {} with {} machines", cid, records.len());
        let handle = self.new_handle(Crew::from_records(cid.clone(), records));
        crews.insert(cid.clone(), handle.clone());
        Ok(handle)
    }

    fn new_handle(&self, crew: Crew) -> Arc<CrewHandle> {
        let queue = self.inner.queue.clone();
        let crew_id = crew.id.clone();
        let emitter: Emitter = Arc::new(move |timer_id: &str, message: Value| {
            if let Err(e) = queue.push(crew_id.clone(), message) {
                tracing::warn!("Timer {} in crew {} fired after shutdown: {}", timer_id, crew_id, e);
            }
        });
        Arc::new(CrewHandle {
            crew: Mutex::new(crew),
            timers: Timers::new(
                emitter,
                &self.inner.cancel,
                self.inner.config.timers.max_timers_per_crew,
            ),
        })
    }
}

/// Fill defaults for missing parameters; fail on a missing required one.
fn apply_params(spec: &Spec, bs: &mut Bindings) -> Result<()> {
    for (name, param) in &spec.param_specs {
        if bs.contains_key(name) {
            continue;
        }
        match &param.default {
            Some(default) => {
                bs.insert(name.clone(), default.clone());
            }
            None if param.optional => {}
            None => {
                return Err(Error::validation(format!(
                    "spec {} requires parameter '{}'",
                    spec.name, name
                )))
            }
        }
    }
    Ok(())
}

// =============================================================================
// Background tasks
// =============================================================================

async fn dispatch(
    inner: Weak<RuntimeInner>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let runtime = CrewRuntime { inner };
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = runtime.process(&job.crew_id, job.message).await {
                tracing::warn!("Queued message for crew {} failed: {}", job.crew_id, e);
            }
            runtime.inner.queue.done();
        });
    }
    tracing::info!("Crew dispatcher stopped");
}

async fn evict_idle_crews(inner: Weak<RuntimeInner>, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                CrewRuntime { inner }.evict_idle().await;
            }
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("Crew eviction stopped");
}
