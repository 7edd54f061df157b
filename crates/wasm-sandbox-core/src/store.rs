//! Bounded cache of live guest instances.
//!
//! [`InstanceStore`] resolves instance ids to live guests, loading them on
//! demand, and delivers events to them. Per id the lifecycle is
//! `Absent -> Loading -> Active -> Draining -> Closed`:
//!
//! - **Loading** is represented by a [`LoadTicket`] in the ticket table. Only
//!   the caller that created the ticket runs the loader; concurrent callers
//!   wait on it.
//! - **Active** instances live in the live map. Inserting one at capacity
//!   first evicts the least recently used instance under the same write lock.
//! - **Draining** instances have left the live map; a retire task waits for
//!   their in-flight count to reach zero and then closes them.
//!
//! Lock order is always tickets, then live map, then the retire set. No lock
//! is held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};
use wasmtime::Linker;

use crate::context::GuestContext;
use crate::instance::{InFlightGuard, Instance, InstanceRunner};
use crate::loader::ModuleLoader;
use crate::supervisor::{EpochTicker, Supervisor};
use crate::ticket::{LoadOutcome, LoadTicket};
use crate::WasmEngine;
use wasm_sandbox_common::{EventRecord, SandboxConfig, SandboxError};

/// Multi-tenant store of live guest instances.
///
/// Cloning is cheap; clones share the same instances.
///
/// # Example
///
/// ```ignore
/// let store = InstanceStore::new(engine, linker, loader, &config)?;
///
/// store
///     .dispatch(EventRecord::new(conn, room, "chat", 0, vec!["hello".into()]))
///     .await?;
///
/// store.close().await;
/// ```
#[derive(Clone)]
pub struct InstanceStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    runner: InstanceRunner,
    supervisor: Supervisor,
    loader: Arc<dyn ModuleLoader>,
    config: SandboxConfig,

    live: RwLock<HashMap<String, Arc<Instance>>>,
    tickets: DashMap<String, Arc<LoadTicket>>,
    retiring: Mutex<JoinSet<()>>,

    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    ticker: Mutex<Option<EpochTicker>>,
}

enum Claim {
    Wait(Arc<LoadTicket>),
    Load(Arc<LoadTicket>),
}

impl InstanceStore {
    /// Create a store whose guests are instantiated against `linker`.
    ///
    /// Starts the epoch ticker and, when both `store.max_idle_ms` and
    /// `store.cleanup_interval_ms` are set, the idle sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::InvalidConfig`] if the configuration is
    /// invalid, or if idle reclamation is enabled outside a Tokio runtime.
    pub fn new(
        engine: WasmEngine,
        linker: Linker<GuestContext>,
        loader: Arc<dyn ModuleLoader>,
        config: &SandboxConfig,
    ) -> Result<Self, SandboxError> {
        config.validate()?;

        let supervisor = Supervisor::new(engine.clone(), config.execution.clone());
        let ticker = supervisor.start_epoch_ticker();
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(StoreInner {
            runner: InstanceRunner::new(engine, linker).with_protocol(&config.protocol),
            supervisor,
            loader,
            config: config.clone(),
            live: RwLock::new(HashMap::new()),
            tickets: DashMap::new(),
            retiring: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            shutdown,
            background: Mutex::new(Vec::new()),
            ticker: Mutex::new(ticker),
        });

        if let Some((max_idle, interval)) = config.store.reclamation() {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                SandboxError::invalid_config("idle reclamation requires a Tokio runtime")
            })?;
            let sweeper = runtime.spawn(sweep_loop(Arc::downgrade(&inner), max_idle, interval));
            inner.background.lock().push(sweeper);

            info!(
                max_idle_ms = config.store.max_idle_ms,
                cleanup_interval_ms = config.store.cleanup_interval_ms,
                "Idle reclamation enabled"
            );
        }

        info!(
            capacity = config.store.max_active_instances,
            max_execution_ms = config.execution.max_execution_ms,
            "Instance store created"
        );

        Ok(Self { inner })
    }

    /// Deliver an event to its instance, loading the instance if needed.
    ///
    /// The event type is validated before any other work. On success the
    /// instance's `last_used` time is updated.
    ///
    /// # Errors
    ///
    /// - [`SandboxError::StoreClosed`] after [`InstanceStore::close`]
    /// - [`SandboxError::InvalidEvent`] for unknown event codes
    /// - load errors ([`SandboxError::LoadFailed`], [`SandboxError::CompilationFailed`])
    /// - call errors ([`SandboxError::MissingExport`], [`SandboxError::MemoryFault`],
    ///   [`SandboxError::ExecutionTimeout`], [`SandboxError::FuelExhausted`],
    ///   [`SandboxError::Trap`])
    #[instrument(skip_all, fields(instance_id = %event.instance_id, event_type = event.event_type))]
    pub async fn dispatch(&self, event: EventRecord<u32>) -> Result<(), SandboxError> {
        self.inner.ensure_open()?;
        let event = event.validate()?;

        let guard = self.inner.acquire(&event.instance_id).await?;
        let instance = guard.instance();

        instance.invoke(&self.inner.supervisor, &event).await?;
        instance.touch();
        Ok(())
    }

    /// Load an instance without delivering an event.
    ///
    /// # Errors
    ///
    /// Returns the same load errors as [`InstanceStore::dispatch`].
    #[instrument(skip(self))]
    pub async fn warm(&self, instance_id: &str) -> Result<(), SandboxError> {
        self.inner.ensure_open()?;
        self.inner.acquire(instance_id).await.map(drop)
    }

    /// Remove an instance, waiting for its in-flight calls before closing it.
    ///
    /// Removing an id that is not live is not an error.
    #[instrument(skip(self))]
    pub async fn remove_instance(&self, instance_id: &str) -> Result<(), SandboxError> {
        let removed = self.inner.live.write().remove(instance_id);

        if let Some(instance) = removed {
            instance.wait_drained().await;
            instance.close().await;
            info!(instance_id, "Instance removed");
        }
        Ok(())
    }

    /// Evict every instance idle for longer than `store.max_idle_ms`.
    ///
    /// Returns the evicted ids. Eviction drains and closes instances in the
    /// background, so this must run inside a Tokio runtime. Does nothing when
    /// `store.max_idle_ms` is zero.
    pub fn sweep_idle(&self) -> Vec<String> {
        match self.inner.config.store.max_idle_ms {
            0 => Vec::new(),
            ms => self.inner.sweep(Duration::from_millis(ms)),
        }
    }

    /// Shut the store down.
    ///
    /// Rejects further dispatches, stops the sweeper, retires every live
    /// instance, and waits for all pending drains to finish. The compiled
    /// module cache is released too. Calling it again has no effect.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.send_replace(true);

        let background = std::mem::take(&mut *self.inner.background.lock());
        for task in background {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        let live: Vec<Arc<Instance>> = self.inner.live.write().drain().map(|(_, i)| i).collect();
        let count = live.len();
        for instance in live {
            self.inner.retire(instance, "shutdown");
        }

        let mut retiring = std::mem::take(&mut *self.inner.retiring.lock());
        while let Some(result) = retiring.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Retire task failed");
            }
        }

        self.inner.runner.clear_cache();

        let ticker = self.inner.ticker.lock().take();
        if let Some(mut ticker) = ticker {
            if tokio::task::spawn_blocking(move || ticker.stop()).await.is_err() {
                warn!("Failed to stop epoch ticker");
            }
        }

        info!(closed_instances = count, "Instance store closed");
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.inner.live.read().len()
    }

    /// Whether no instance is live.
    pub fn is_empty(&self) -> bool {
        self.inner.live.read().is_empty()
    }

    /// Whether `instance_id` is live.
    pub fn contains(&self, instance_id: &str) -> bool {
        self.inner.live.read().contains_key(instance_id)
    }

    /// Whether a load for `instance_id` is in progress.
    pub fn is_loading(&self, instance_id: &str) -> bool {
        self.inner.tickets.contains_key(instance_id)
    }

    /// Ids of all live instances, sorted.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.live.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether [`InstanceStore::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the store configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Number of compiled modules held in the compilation cache.
    pub fn cached_modules(&self) -> usize {
        self.inner.runner.cached_modules()
    }

    #[cfg(test)]
    fn instance(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.inner.live.read().get(instance_id).cloned()
    }
}

impl std::fmt::Debug for InstanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceStore")
            .field("live", &self.len())
            .field("loading", &self.inner.tickets.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl StoreInner {
    fn ensure_open(&self) -> Result<(), SandboxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SandboxError::StoreClosed);
        }
        Ok(())
    }

    /// Find or load `id` and register an in-flight call on it.
    async fn acquire(&self, id: &str) -> Result<InFlightGuard, SandboxError> {
        loop {
            self.ensure_open()?;

            if let Some(guard) = self.enter_live(id) {
                return Ok(guard);
            }

            let claim = match self.tickets.entry(id.to_string()) {
                Entry::Occupied(entry) => Claim::Wait(Arc::clone(entry.get())),
                Entry::Vacant(entry) => {
                    // A load may have finished since the live check
                    if let Some(guard) = self.enter_live(id) {
                        return Ok(guard);
                    }
                    let ticket = Arc::new(LoadTicket::new(id));
                    entry.insert(Arc::clone(&ticket));
                    Claim::Load(ticket)
                }
            };

            match claim {
                Claim::Load(ticket) => return self.load(id, ticket).await,
                Claim::Wait(ticket) => {
                    debug!(instance_id = id, "Waiting for in-progress load");
                    if let LoadOutcome::Failed(e) = ticket.wait().await {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Look up a live instance and enter it under the read lock.
    fn enter_live(&self, id: &str) -> Option<InFlightGuard> {
        self.live.read().get(id).map(Instance::enter)
    }

    async fn load(&self, id: &str, ticket: Arc<LoadTicket>) -> Result<InFlightGuard, SandboxError> {
        let pending = PendingLoad {
            inner: self,
            id,
            ticket,
            settled: false,
        };

        match self.create_instance(id).await {
            Ok(instance) => self.insert_loaded(id, instance, pending),
            Err(e) => {
                warn!(instance_id = id, error = %e, "Instance load failed");
                pending.settle(LoadOutcome::Failed(e.clone()), false);
                Err(e)
            }
        }
    }

    async fn create_instance(&self, id: &str) -> Result<Instance, SandboxError> {
        let fetch_timeout = self.config.execution.fetch_timeout();

        let bytes = match tokio::time::timeout(fetch_timeout, self.loader.load(id)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e @ SandboxError::LoadFailed { .. })) => return Err(e),
            Ok(Err(e)) => return Err(SandboxError::load_failed(id, e.to_string())),
            Err(_) => {
                return Err(SandboxError::load_failed(
                    id,
                    format!(
                        "loader timed out after {}ms",
                        self.config.execution.fetch_timeout_ms
                    ),
                ));
            }
        };

        self.runner.instantiate(id, &bytes, &self.supervisor).await
    }

    /// Publish a freshly loaded instance, evicting first if at capacity.
    fn insert_loaded(
        &self,
        id: &str,
        instance: Instance,
        pending: PendingLoad<'_>,
    ) -> Result<InFlightGuard, SandboxError> {
        let instance = Arc::new(instance);

        let entry = self.tickets.entry(id.to_string());
        let mut live = self.live.write();

        let result = if self.closed.load(Ordering::Acquire) {
            Err(SandboxError::StoreClosed)
        } else {
            while live.len() >= self.config.store.max_active_instances {
                let victim = live
                    .iter()
                    .min_by_key(|(_, candidate)| candidate.last_used())
                    .map(|(victim_id, _)| victim_id.clone());
                let Some(victim) = victim.and_then(|victim_id| live.remove(&victim_id)) else {
                    break;
                };

                info!(
                    instance_id = victim.id(),
                    idle_ms = victim.idle_for().as_millis(),
                    "Evicting least recently used instance"
                );
                self.retire(victim, "capacity");
            }

            let guard = instance.enter();
            live.insert(id.to_string(), Arc::clone(&instance));
            Ok(guard)
        };

        if let Entry::Occupied(entry) = entry {
            if Arc::ptr_eq(entry.get(), &pending.ticket) {
                entry.remove();
            }
        }
        drop(live);

        match &result {
            Ok(_) => {
                debug!(instance_id = id, "Instance active");
                pending.settle(LoadOutcome::Loaded, true);
            }
            Err(e) => pending.settle(LoadOutcome::Failed(e.clone()), true),
        }
        result
    }

    /// Remove idle instances under the write lock and retire them.
    fn sweep(&self, max_idle: Duration) -> Vec<String> {
        let expired: Vec<Arc<Instance>> = {
            let mut live = self.live.write();
            if self.closed.load(Ordering::Acquire) {
                return Vec::new();
            }

            let ids: Vec<String> = live
                .iter()
                .filter(|(_, instance)| instance.idle_for() > max_idle)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| live.remove(id)).collect()
        };

        let ids: Vec<String> = expired.iter().map(|i| i.id().to_string()).collect();
        for instance in expired {
            info!(
                instance_id = instance.id(),
                idle_ms = instance.idle_for().as_millis(),
                "Reclaiming idle instance"
            );
            self.retire(instance, "idle");
        }
        ids
    }

    /// Drain and close a removed instance on a tracked background task.
    fn retire(&self, instance: Arc<Instance>, reason: &'static str) {
        let mut retiring = self.retiring.lock();

        while let Some(finished) = retiring.try_join_next() {
            if let Err(e) = finished {
                warn!(error = %e, "Retire task failed");
            }
        }

        retiring.spawn(async move {
            instance.wait_drained().await;
            instance.close().await;
            debug!(instance_id = instance.id(), reason, "Instance retired");
        });
    }
}

/// Ticket owner for a load in progress.
///
/// If the loading future is dropped before it settles, the ticket is removed
/// and waiters are told the load failed.
struct PendingLoad<'a> {
    inner: &'a StoreInner,
    id: &'a str,
    ticket: Arc<LoadTicket>,
    settled: bool,
}

impl PendingLoad<'_> {
    fn settle(mut self, outcome: LoadOutcome, ticket_removed: bool) {
        if !ticket_removed {
            self.remove_ticket();
        }
        self.ticket.finish(outcome);
        self.settled = true;
    }

    fn remove_ticket(&self) {
        self.inner
            .tickets
            .remove_if(self.id, |_, ticket| Arc::ptr_eq(ticket, &self.ticket));
    }
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(instance_id = self.id, "Instance load cancelled");
            self.remove_ticket();
            self.ticket
                .finish(LoadOutcome::Failed(SandboxError::load_failed(self.id, "load cancelled")));
        }
    }
}

async fn sweep_loop(inner: Weak<StoreInner>, max_idle: Duration, interval: Duration) {
    let mut shutdown = match inner.upgrade() {
        Some(inner) => inner.shutdown.subscribe(),
        None => return,
    };
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticks.tick().await;

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let evicted = inner.sweep(max_idle);
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "Idle sweep evicted instances");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Idle sweeper stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use async_trait::async_trait;
    use wasmtime::Caller;

    use super::*;
    use wasm_sandbox_common::GuestEvent;

    /// `__onJoin` sleeps 300ms in the host, `__onLeave` spins forever.
    const GUEST: &str = r#"
        (module
            (import "env" "sleep" (func $sleep (param i32)))
            (memory (export "memory") 1)
            (global $next (mut i32) (i32.const 1024))
            (func (export "__new") (param $size i32) (param $id i32) (result i32)
                (local $ptr i32)
                (if (i32.gt_u
                        (i32.add (global.get $next) (i32.add (local.get $size) (i32.const 8)))
                        (i32.const 65536))
                    (then (global.set $next (i32.const 1024))))
                (local.set $ptr (i32.add (global.get $next) (i32.const 8)))
                (global.set $next (i32.add (local.get $ptr) (local.get $size)))
                (local.get $ptr))
            (func (export "__onMessage") (param i32 i32))
            (func (export "__onJoin") (param i32 i32)
                (call $sleep (i32.const 300)))
            (func (export "__onLeave") (param i32 i32)
                (loop $spin (br $spin)))
        )
    "#;

    /// Has memory and an allocator but no event handlers.
    const BARE: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "__new") (param i32 i32) (result i32) (i32.const 1024))
        )
    "#;

    struct TestLoader {
        loads: AtomicUsize,
        delay: Duration,
    }

    impl TestLoader {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                delay,
            })
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModuleLoader for TestLoader {
        async fn load(&self, instance_id: &str) -> Result<Vec<u8>, SandboxError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            match instance_id {
                "broken" => Err(SandboxError::load_failed(instance_id, "object store unavailable")),
                "bare" => Ok(BARE.as_bytes().to_vec()),
                "garbage" => Ok(b"\0asm garbage".to_vec()),
                _ => Ok(GUEST.as_bytes().to_vec()),
            }
        }
    }

    fn config(capacity: usize) -> SandboxConfig {
        let mut config = SandboxConfig::default();
        config.store.max_active_instances = capacity;
        config
    }

    fn new_store(config: &SandboxConfig, loader: &Arc<TestLoader>) -> InstanceStore {
        let engine = WasmEngine::new(&config.engine).unwrap();

        let mut linker = Linker::new(engine.inner());
        linker
            .func_wrap_async(
                "env",
                "sleep",
                |_caller: Caller<'_, GuestContext>, (ms,): (u32,)| {
                    Box::new(async move {
                        tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
                    })
                },
            )
            .unwrap();

        let loader: Arc<dyn ModuleLoader> = Arc::clone(loader) as Arc<dyn ModuleLoader>;
        InstanceStore::new(engine, linker, loader, config).unwrap()
    }

    fn event(instance_id: &str, kind: GuestEvent) -> EventRecord<u32> {
        EventRecord::new("conn-1", "room-1", instance_id, kind.code(), vec!["hello, world!".into()])
    }

    async fn wait_closed(instance: &Instance) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !instance.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("instance was not closed");
    }

    #[tokio::test]
    async fn test_dispatch_loads_on_demand() {
        let loader = TestLoader::new(Duration::ZERO);
        let store = new_store(&config(25), &loader);

        store.dispatch(event("mod-a", GuestEvent::OnMessage)).await.unwrap();

        assert_eq!(loader.loads(), 1);
        assert!(store.contains("mod-a"));
        assert_eq!(store.instance_ids(), vec!["mod-a"]);

        store.dispatch(event("mod-a", GuestEvent::OnMessage)).await.unwrap();
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_loads_once() {
        let loader = TestLoader::new(Duration::from_millis(50));
        let store = new_store(&config(25), &loader);

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch(event("mod-a", GuestEvent::OnMessage)).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(loader.loads(), 1);
        assert_eq!(store.len(), 1);
        assert!(!store.is_loading("mod-a"));
    }

    async fn concurrent_failures(store: &InstanceStore, instance_id: &'static str) -> Vec<SandboxError> {
        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch(event(instance_id, GuestEvent::OnJoin)).await })
            })
            .collect();

        let mut errors = Vec::new();
        for task in tasks {
            errors.push(task.await.unwrap().unwrap_err());
        }
        errors
    }

    #[tokio::test]
    async fn test_load_failure_reaches_every_waiter() {
        let loader = TestLoader::new(Duration::from_millis(50));
        let store = new_store(&config(25), &loader);

        let errors = concurrent_failures(&store, "broken").await;
        for err in &errors {
            assert!(matches!(err, SandboxError::LoadFailed { .. }));
            assert_eq!(
                err.to_string(),
                "Failed to load instance 'broken': object store unavailable"
            );
        }

        assert_eq!(loader.loads(), 1);
        assert!(!store.contains("broken"));
        assert!(!store.is_loading("broken"));
    }

    #[tokio::test]
    async fn test_compile_failure_is_shared_by_waiters() {
        let loader = TestLoader::new(Duration::from_millis(50));
        let store = new_store(&config(25), &loader);

        let errors = concurrent_failures(&store, "garbage").await;
        let first = errors[0].to_string();
        for err in &errors {
            assert!(matches!(err, SandboxError::CompilationFailed { .. }), "unexpected error: {err}");
            assert_eq!(err.to_string(), first);
        }

        assert_eq!(loader.loads(), 1);
        assert!(!store.contains("garbage"));
    }

    #[tokio::test]
    async fn test_invalid_event_skips_loader() {
        let loader = TestLoader::new(Duration::ZERO);
        let store = new_store(&config(25), &loader);

        let raw = EventRecord::new("conn-1", "room-1", "mod-a", 99_u32, vec![]);
        let err = store.dispatch(raw).await.unwrap_err();

        assert!(matches!(err, SandboxError::InvalidEvent { code: 99 }));
        assert_eq!(loader.loads(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let loader = TestLoader::new(Duration::ZERO);
        let store = new_store(&config(1), &loader);

        store.warm("a").await.unwrap();
        let a = store.instance("a").unwrap();

        store.warm("b").await.unwrap();
        assert_eq!(store.instance_ids(), vec!["b"]);
        wait_closed(&a).await;

        // "a" is loaded again from scratch
        store.dispatch(event("a", GuestEvent::OnMessage)).await.unwrap();
        assert_eq!(loader.loads(), 3);
        assert_eq!(store.instance_ids(), vec!["a"]);
        assert_eq!(store.cached_modules(), 1);
    }

    #[tokio::test]
    async fn test_lru_prefers_oldest() {
        let loader = TestLoader::new(Duration::ZERO);
        let store = new_store(&config(2), &loader);

        store.warm("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.warm("b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch "a" so "b" becomes the least recently used
        store.dispatch(event("a", GuestEvent::OnMessage)).await.unwrap();
        store.warm("c").await.unwrap();

        assert_eq!(store.instance_ids(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_eviction_waits_for_in_flight_call() {
        let loader = TestLoader::new(Duration::ZERO);
        let store = new_store(&config(1), &loader);

        store.warm("a").await.unwrap();
        let a = store.instance("a").unwrap();

        let started = Instant::now();
        let slow = {
            let store = store.clone();
            tokio::spawn(async move { store.dispatch(event("a", GuestEvent::OnJoin)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.in_flight(), 1);

        store.warm("b").await.unwrap();
        assert!(!store.contains("a"));
        assert!(!a.is_closed(), "closed while a call was in flight");

        slow.await.unwrap().unwrap();
        wait_closed(&a).await;

        let closed_at = a.closed_at().unwrap();
        assert!(closed_at >= started + Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_idle_instances_are_reclaimed() {
        let loader = TestLoader::new(Duration::ZERO);
        let mut config = config(25);
        config.store.max_idle_ms = 1_000;
        config.store.cleanup_interval_ms = 100;
        let store = new_store(&config, &loader);

        store.warm("a").await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.contains("a"));

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!store.contains("a"));

        store.close().await;
    }

    #[tokio::test]
    async fn test_manual_sweep() {
        let loader = TestLoader::new(Duration::ZERO);
        let mut config = config(25);
        config.store.max_idle_ms = 50;
        let store = new_store(&config, &loader);

        store.warm("a").await.unwrap();
        assert!(store.sweep_idle().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        store.warm("b").await.unwrap();

        assert_eq!(store.sweep_idle(), vec!["a".to_string()]);
        assert_eq!(store.instance_ids(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_timeout_keeps_instance() {
        let loader = TestLoader::new(Duration::ZERO);
        let mut config = config(25);
        config.execution.max_execution_ms = 100;
        let store = new_store(&config, &loader);

        let err = store
            .dispatch(event("a", GuestEvent::OnLeave))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionTimeout { duration_ms: 100 }));

        assert!(store.contains("a"));
        store.dispatch(event("a", GuestEvent::OnMessage)).await.unwrap();
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_missing_export_keeps_instance() {
        let loader = TestLoader::new(Duration::ZERO);
        let store = new_store(&config(25), &loader);

        let err = store
            .dispatch(event("bare", GuestEvent::OnMessage))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::MissingExport { ref name } if name == "__onMessage"));
        assert!(store.contains("bare"));
    }

    #[tokio::test]
    async fn test_remove_instance() {
        let loader = TestLoader::new(Duration::ZERO);
        let store = new_store(&config(25), &loader);

        store.warm("a").await.unwrap();
        let a = store.instance("a").unwrap();

        store.remove_instance("a").await.unwrap();
        assert!(!store.contains("a"));
        assert!(a.is_closed());

        store.remove_instance("a").await.unwrap();
        store.remove_instance("never-loaded").await.unwrap();
    }

    #[tokio::test]
    async fn test_loader_timeout() {
        let loader = TestLoader::new(Duration::from_millis(300));
        let mut config = config(25);
        config.execution.fetch_timeout_ms = 50;
        let store = new_store(&config, &loader);

        let err = store.warm("a").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(!store.is_loading("a"));
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn test_cancelled_load_releases_ticket() {
        let loader = TestLoader::new(Duration::from_millis(500));
        let store = new_store(&config(25), &loader);

        let task = {
            let store = store.clone();
            tokio::spawn(async move { store.warm("a").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_loading("a"));

        task.abort();
        let _ = task.await;
        assert!(!store.is_loading("a"));
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn test_close() {
        let loader = TestLoader::new(Duration::ZERO);
        let store = new_store(&config(25), &loader);

        store.warm("a").await.unwrap();
        store.warm("b").await.unwrap();
        let a = store.instance("a").unwrap();
        assert_eq!(store.cached_modules(), 1);

        store.close().await;
        assert!(store.is_closed());
        assert!(store.is_empty());
        assert!(a.is_closed());
        assert_eq!(store.cached_modules(), 0);

        let err = store
            .dispatch(event("a", GuestEvent::OnMessage))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::StoreClosed));
        assert!(matches!(store.warm("c").await, Err(SandboxError::StoreClosed)));

        // Second close is a no-op
        store.close().await;
    }

    #[tokio::test]
    async fn test_module_cache_does_not_outgrow_its_bound() {
        let loader = TestLoader::new(Duration::ZERO);
        let mut config = config(25);
        config.engine.max_cached_modules = 1;
        let store = new_store(&config, &loader);

        store.warm("a").await.unwrap();
        store.warm("bare").await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.cached_modules(), 1);
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_call() {
        let loader = TestLoader::new(Duration::ZERO);
        let store = new_store(&config(25), &loader);

        store.warm("a").await.unwrap();
        let a = store.instance("a").unwrap();

        let slow = {
            let store = store.clone();
            tokio::spawn(async move { store.dispatch(event("a", GuestEvent::OnJoin)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.close().await;
        assert!(a.is_closed());
        slow.await.unwrap().unwrap();
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let engine = WasmEngine::new(&Default::default()).unwrap();
        let linker = Linker::new(engine.inner());
        let loader: Arc<dyn ModuleLoader> = TestLoader::new(Duration::ZERO);

        let result = InstanceStore::new(engine, linker, loader, &config(0));
        assert!(matches!(result, Err(SandboxError::InvalidConfig { .. })));
    }
}
