//! Space engine: shared state and public entry points
//!
//! [`SpaceEngine`] is a cheap handle over `Arc<EngineInner>`. The operation
//! executor, the transaction terminator, the notifier and the reaper are
//! `impl EngineInner` blocks in their own modules; this module wires the
//! collaborators together and exposes the public API.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

use gridspace_concurrency::{FifoSequencer, XtnManager};
use gridspace_core::local::{LocalGenerationCoordinator, NoPersistence, NoReplication, SystemLeases};
use gridspace_core::{
    ChangeSet, EntryData, EntryPacket, EntryPersistence, GenerationCoordinator, GenerationState,
    LeaseOracle, Modifiers, OperationFilter, OperationKind, ReplicationSink, Result, Selector,
    SpaceConfig, SpaceError, Template, UpdateSource, XtnId,
};
use gridspace_storage::{EntryStore, ScanDriver, ScanPolicy, TypeDescriptor, TypeRegistry};

use crate::completion::{Completion, CompletionFuture};
use crate::filters::FilterChain;
use crate::outcome::{OpResult, UpdateOrWriteResult, UpdateResult, WriteResult};
use crate::reaper;
use crate::stats::{SpaceCounters, SpaceStats};
use crate::templates::TemplateArena;

/// External services the engine hands work to
#[derive(Clone)]
pub struct Collaborators {
    /// Durable storage
    pub persistence: Arc<dyn EntryPersistence>,
    /// Replication channel
    pub replication: Arc<dyn ReplicationSink>,
    /// Clock and lease arithmetic
    pub leases: Arc<dyn LeaseOracle>,
    /// MVCC generation source
    pub generations: Arc<dyn GenerationCoordinator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            persistence: Arc::new(NoPersistence),
            replication: Arc::new(NoReplication),
            leases: Arc::new(SystemLeases),
            generations: Arc::new(LocalGenerationCoordinator::new()),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Shared engine state
pub(crate) struct EngineInner {
    pub config: SpaceConfig,
    pub store: EntryStore,
    pub types: TypeRegistry,
    pub xtns: XtnManager,
    pub fifo: FifoSequencer,
    pub templates: TemplateArena,
    pub persistence: Arc<dyn EntryPersistence>,
    pub replication: Arc<dyn ReplicationSink>,
    pub leases: Arc<dyn LeaseOracle>,
    pub generations: Arc<dyn GenerationCoordinator>,
    pub filters: FilterChain,
    pub counters: SpaceCounters,
    pub shutdown: Mutex<bool>,
    pub shutdown_signal: Condvar,
}

impl EngineInner {
    /// Scan driver over the store
    pub fn scanner(&self) -> ScanDriver<'_> {
        ScanDriver::new(
            &self.store,
            &self.types,
            ScanPolicy {
                all_in_cache: self.config.all_in_cache,
            },
        )
    }

    /// Whether MVCC visibility applies
    pub fn mvcc(&self) -> bool {
        self.config.mvcc_enabled
    }
}

/// Entry-matching engine of one space
pub struct SpaceEngine {
    inner: Arc<EngineInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SpaceEngine {
    /// Engine with in-process collaborators and no filters
    pub fn new(config: SpaceConfig) -> Result<Self> {
        Self::with_collaborators(config, Collaborators::default(), Vec::new())
    }

    /// Engine with explicit collaborators and filters
    pub fn with_collaborators(
        config: SpaceConfig,
        collaborators: Collaborators,
        filters: Vec<Arc<dyn OperationFilter>>,
    ) -> Result<Self> {
        config.validate()?;
        let mut chain = FilterChain::new();
        for filter in filters {
            chain.push(filter);
        }
        let inner = Arc::new(EngineInner {
            store: EntryStore::new(),
            types: TypeRegistry::new(),
            xtns: XtnManager::new(),
            fifo: FifoSequencer::new(),
            templates: TemplateArena::new(),
            persistence: collaborators.persistence,
            replication: collaborators.replication,
            leases: collaborators.leases,
            generations: collaborators.generations,
            filters: chain,
            counters: SpaceCounters::default(),
            shutdown: Mutex::new(false),
            shutdown_signal: Condvar::new(),
            config,
        });
        let reaper = reaper::spawn(&inner)?;
        info!(
            space = %inner.config.name,
            mvcc = inner.config.mvcc_enabled,
            all_in_cache = inner.config.all_in_cache,
            "space engine started"
        );
        Ok(Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &SpaceConfig {
        &self.inner.config
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// Register a type before writing entries of it
    pub fn register_type(&self, descriptor: TypeDescriptor) -> Result<Arc<TypeDescriptor>> {
        self.inner.types.register(descriptor)
    }

    /// Descriptor of a known type
    pub fn type_descriptor(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.inner.types.get(name)
    }

    // ========================================================================
    // Single-entry operations
    // ========================================================================

    /// Insert a new entry
    pub fn write(
        &self,
        packet: EntryPacket,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
    ) -> Result<WriteResult> {
        self.inner.write(packet, xtn, lease, modifiers)
    }

    /// Run a read/take/update/change template, blocking up to its timeout
    pub fn execute(&self, template: Template) -> OpResult {
        self.inner.execute(template)
    }

    /// Run a template and deliver the answer through a completion handle
    ///
    /// Never blocks the calling thread beyond the initial search.
    pub fn submit(&self, template: Template) -> Arc<Completion<OpResult>> {
        self.inner.submit(template)
    }

    /// [`SpaceEngine::submit`] as a future
    pub fn submit_async(&self, template: Template) -> CompletionFuture<OpResult> {
        CompletionFuture::new(self.submit(template))
    }

    /// [`SpaceEngine::submit`] delivering to a callback
    pub fn submit_with_callback(
        &self,
        template: Template,
        callback: impl FnOnce(OpResult) + Send + 'static,
    ) {
        self.submit(template).on_complete(callback);
    }

    /// Read one matching entry
    pub fn read(&self, template: Template) -> Result<Option<EntryData>> {
        expect_kind(&template, OperationKind::is_read, "read")?;
        Ok(self.inner.execute(template)?.map(|a| a.entry))
    }

    /// Remove and return one matching entry
    pub fn take(&self, template: Template) -> Result<Option<EntryData>> {
        expect_kind(&template, OperationKind::is_take, "take")?;
        Ok(self.inner.execute(template)?.map(|a| a.entry))
    }

    /// Replace an entry's content by uid
    ///
    /// Fails with `EntryNotInSpace` when the uid is not resident.
    pub fn update(
        &self,
        packet: EntryPacket,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
        source: UpdateSource,
        timeout: Duration,
    ) -> Result<Option<UpdateResult>> {
        let template = self
            .inner
            .update_template(packet, source, lease)?
            .with_optional_xtn(xtn)
            .with_modifiers(modifiers)
            .with_timeout(timeout);
        Ok(self.inner.execute(template)?.map(UpdateResult::from_applied))
    }

    /// Apply mutators to one matching entry
    pub fn change(
        &self,
        selector: Selector,
        changes: ChangeSet,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
        timeout: Duration,
    ) -> Result<Option<UpdateResult>> {
        let template = Template::change(selector, changes, lease)
            .with_optional_xtn(xtn)
            .with_modifiers(modifiers)
            .with_timeout(timeout);
        Ok(self.inner.execute(template)?.map(UpdateResult::from_applied))
    }

    /// Update when the uid exists, write otherwise
    pub fn update_or_write(
        &self,
        packet: EntryPacket,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
        timeout: Duration,
        update_first: bool,
    ) -> Result<UpdateOrWriteResult> {
        self.inner
            .update_or_write(packet, xtn, lease, modifiers, timeout, update_first)
    }

    // ========================================================================
    // Batch operations
    // ========================================================================

    /// Write every packet; one result per packet
    pub fn write_multiple(
        &self,
        packets: Vec<EntryPacket>,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
    ) -> Vec<Result<WriteResult>> {
        self.inner.write_multiple(packets, xtn, lease, modifiers)
    }

    /// Update every packet by uid; one result per packet
    pub fn update_multiple(
        &self,
        packets: Vec<EntryPacket>,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
    ) -> Vec<Result<Option<UpdateResult>>> {
        self.inner.update_multiple(packets, xtn, lease, modifiers)
    }

    /// Up to `max` matching entries
    pub fn read_multiple(&self, template: Template, max: usize) -> Result<Vec<EntryData>> {
        expect_kind(&template, OperationKind::is_read, "read_multiple")?;
        self.inner.execute_multiple(template, max)
    }

    /// Remove up to `max` matching entries
    pub fn take_multiple(&self, template: Template, max: usize) -> Result<Vec<EntryData>> {
        expect_kind(&template, OperationKind::is_take, "take_multiple")?;
        self.inner.execute_multiple(template, max)
    }

    /// Read each id of a `ByIds` selector; one result per id
    pub fn read_by_ids(&self, template: Template) -> Result<Vec<Result<Option<EntryData>>>> {
        expect_kind(&template, OperationKind::is_read, "read_by_ids")?;
        self.inner.execute_by_ids(template)
    }

    /// Take each id of a `ByIds` selector; one result per id
    pub fn take_by_ids(&self, template: Template) -> Result<Vec<Result<Option<EntryData>>>> {
        expect_kind(&template, OperationKind::is_take, "take_by_ids")?;
        self.inner.execute_by_ids(template)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Start a transaction
    ///
    /// Single-participant transactions commit in one phase.
    pub fn begin(&self, single_participant: bool) -> XtnId {
        self.inner.xtns.begin(single_participant).id()
    }

    /// Join a transaction created by an external coordinator
    pub fn join(&self, xtn: XtnId, single_participant: bool) -> XtnId {
        self.inner.xtns.join(xtn, single_participant).id()
    }

    /// First phase of two-phase commit; returns the replication level
    pub fn prepare(&self, xtn: XtnId) -> Result<u32> {
        self.inner.prepare(xtn)
    }

    /// Commit; returns the replication consistency level
    pub fn commit(&self, xtn: XtnId) -> Result<u32> {
        self.inner.commit(xtn)
    }

    /// Roll back
    pub fn abort(&self, xtn: XtnId) -> Result<()> {
        self.inner.abort(xtn)
    }

    /// Ids of live transactions
    pub fn active_transactions(&self) -> Vec<XtnId> {
        self.inner.xtns.active_ids()
    }

    // ========================================================================
    // MVCC
    // ========================================================================

    /// Current generation state, for pinning historical reads
    pub fn generation_state(&self) -> Result<GenerationState> {
        if !self.inner.mvcc() {
            return Err(SpaceError::Unsupported("mvcc is disabled".into()));
        }
        self.inner.generations.state()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Counter snapshot
    pub fn stats(&self) -> SpaceStats {
        let inner = &self.inner;
        SpaceStats {
            entries: inner.store.len(),
            open_scans: inner.store.open_scans(),
            pending_templates: inner.templates.len(),
            active_transactions: inner.xtns.active_count(),
            ..inner.counters.snapshot()
        }
    }

    /// Stop the reaper; pending templates stay until their callers time out
    pub fn shutdown(&self) {
        {
            let mut stopped = self.inner.shutdown.lock();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        self.inner.shutdown_signal.notify_all();
        if let Some(handle) = self.reaper.lock().take() {
            if handle.join().is_err() {
                debug!("template reaper panicked before shutdown");
            }
        }
        info!(space = %self.inner.config.name, "space engine stopped");
    }
}

fn expect_kind(template: &Template, check: fn(OperationKind) -> bool, op: &str) -> Result<()> {
    if check(template.kind) {
        return Ok(());
    }
    Err(SpaceError::InvalidOperation(format!(
        "{op} called with a {} template",
        template.kind
    )))
}

impl Drop for SpaceEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SpaceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceEngine")
            .field("space", &self.inner.config.name)
            .field("entries", &self.inner.store.len())
            .finish()
    }
}
