//! Main space entry point for gridspace.
//!
//! This module provides the `GridSpace` struct, the primary entry point for
//! all entry operations, and its builder.

use std::sync::Arc;
use std::time::Duration;

use gridspace_core::{
    ChangeSet, EntryData, EntryPacket, EntryPersistence, GenerationCoordinator, GenerationState,
    LeaseOracle, Modifiers, OperationFilter, ReplicationSink, Selector, SpaceConfig, Template,
    UpdateSource,
};
use gridspace_engine::{
    Applied, Collaborators, CompletionFuture, SpaceEngine, SpaceStats, UpdateOrWriteResult,
    UpdateResult, WriteResult,
};
use gridspace_storage::TypeDescriptor;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// One in-memory space.
///
/// Create a space using [`GridSpace::new`] or [`GridSpace::builder`].
///
/// # Example
///
/// ```ignore
/// use gridspace::prelude::*;
///
/// let space = GridSpace::new()?;
/// space.register_type(TypeDescriptor::new("Order").id_property("id"))?;
///
/// space.write(EntryPacket::new("Order").with_field("id", 1).with_field("status", "open"))?;
/// let order = space.read(Selector::by_id("Order", 1))?;
///
/// let txn = space.begin();
/// txn.take(Selector::by_id("Order", 1))?;
/// txn.commit()?;
/// ```
///
/// The API follows the same progressive disclosure as the rest of the crate:
///
/// 1. **Simple** - non-blocking, non-transactional: `space.read(selector)`
/// 2. **Blocking** - wait for a match: `space.take_blocking(selector, timeout)`
/// 3. **Full control** - any template: `space.execute(template)`
#[derive(Clone)]
pub struct GridSpace {
    pub(crate) engine: Arc<SpaceEngine>,
}

impl GridSpace {
    /// Open a space with default settings and in-process collaborators.
    pub fn new() -> Result<Self> {
        Self::builder().open()
    }

    /// Open a space from a TOML configuration document.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let space = GridSpace::from_toml(r#"
    ///     name = "orders"
    ///     mvcc_enabled = true
    /// "#)?;
    /// ```
    pub fn from_toml(text: &str) -> Result<Self> {
        Self::builder().toml(text)?.open()
    }

    /// Create a builder for space configuration.
    pub fn builder() -> GridSpaceBuilder {
        GridSpaceBuilder::new()
    }

    /// Active configuration
    pub fn config(&self) -> &SpaceConfig {
        self.engine.config()
    }

    /// The underlying engine, for operations the facade does not wrap
    pub fn engine(&self) -> &SpaceEngine {
        &self.engine
    }

    /// Register a type before writing entries of it.
    ///
    /// Types written without registration are introduced as root types with
    /// no id property, so every write of them gets a generated uid.
    pub fn register_type(&self, descriptor: TypeDescriptor) -> Result<()> {
        self.engine.register_type(descriptor)?;
        Ok(())
    }

    // =========================================================================
    // Simple API (no transaction, no waiting)
    // =========================================================================

    /// Write a new entry with the configured default lease.
    pub fn write(&self, packet: EntryPacket) -> Result<WriteResult> {
        Ok(self.engine.write(packet, None, None, Modifiers::new())?)
    }

    /// Write a new entry with an explicit lease.
    pub fn write_with_lease(&self, packet: EntryPacket, lease: Duration) -> Result<WriteResult> {
        Ok(self
            .engine
            .write(packet, None, Some(lease), Modifiers::new())?)
    }

    /// Read one matching entry.
    ///
    /// Returns `None` when nothing matches. Fails with [`Error::Timeout`]
    /// when matching entries exist but are locked by a transaction.
    pub fn read(&self, selector: Selector) -> Result<Option<EntryData>> {
        Ok(self.engine.read(Template::read(selector))?)
    }

    /// Remove and return one matching entry.
    pub fn take(&self, selector: Selector) -> Result<Option<EntryData>> {
        Ok(self.engine.take(Template::take(selector))?)
    }

    /// Replace an entry's content by uid (derived from its id property).
    pub fn update(&self, packet: EntryPacket) -> Result<UpdateResult> {
        self.engine
            .update(
                packet,
                None,
                None,
                Modifiers::new(),
                UpdateSource::Local,
                Duration::ZERO,
            )?
            .ok_or_else(|| Error::NotFound("entry to update".to_string()))
    }

    /// Apply mutators to one matching entry.
    pub fn change(&self, selector: Selector, changes: ChangeSet) -> Result<Option<UpdateResult>> {
        Ok(self.engine.change(
            selector,
            changes,
            None,
            None,
            Modifiers::new(),
            Duration::ZERO,
        )?)
    }

    /// Update the entry if its uid is resident, write it otherwise.
    pub fn update_or_write(&self, packet: EntryPacket) -> Result<UpdateOrWriteResult> {
        Ok(self.engine.update_or_write(
            packet,
            None,
            None,
            Modifiers::new(),
            Duration::ZERO,
            false,
        )?)
    }

    // =========================================================================
    // Blocking API
    // =========================================================================

    /// Read one matching entry, waiting up to `timeout` for one to appear.
    pub fn read_blocking(&self, selector: Selector, timeout: Duration) -> Result<Option<EntryData>> {
        Ok(self
            .engine
            .read(Template::read(selector).with_timeout(timeout))?)
    }

    /// Take one matching entry, waiting up to `timeout` for one to appear.
    pub fn take_blocking(&self, selector: Selector, timeout: Duration) -> Result<Option<EntryData>> {
        Ok(self
            .engine
            .take(Template::take(selector).with_timeout(timeout))?)
    }

    // =========================================================================
    // Batch API
    // =========================================================================

    /// Write every packet; one result per packet.
    pub fn write_multiple(&self, packets: Vec<EntryPacket>) -> Vec<Result<WriteResult>> {
        self.engine
            .write_multiple(packets, None, None, Modifiers::new())
            .into_iter()
            .map(|r| r.map_err(Error::from))
            .collect()
    }

    /// Read up to `max` matching entries.
    pub fn read_multiple(&self, selector: Selector, max: usize) -> Result<Vec<EntryData>> {
        Ok(self.engine.read_multiple(Template::read(selector), max)?)
    }

    /// Take up to `max` matching entries.
    pub fn take_multiple(&self, selector: Selector, max: usize) -> Result<Vec<EntryData>> {
        Ok(self.engine.take_multiple(Template::take(selector), max)?)
    }

    // =========================================================================
    // Full control
    // =========================================================================

    /// Run any read/take/update/change template.
    pub fn execute(&self, template: Template) -> Result<Option<Applied>> {
        Ok(self.engine.execute(template)?)
    }

    /// Run a template and await its answer.
    ///
    /// The initial search runs on the calling thread; a template that has to
    /// wait is answered by whichever thread releases a matching entry.
    pub async fn execute_async(&self, template: Template) -> Result<Option<Applied>> {
        let future: CompletionFuture<_> = self.engine.submit_async(template);
        Ok(future.await?)
    }

    /// Run a template and hand its answer to `callback`.
    pub fn execute_with_callback(
        &self,
        template: Template,
        callback: impl FnOnce(Result<Option<Applied>>) + Send + 'static,
    ) {
        self.engine
            .submit_with_callback(template, move |result| callback(result.map_err(Error::from)));
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a single-participant transaction (one-phase commit).
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.engine.clone(), self.engine.begin(true))
    }

    /// Begin a transaction that commits in two phases.
    pub fn begin_two_phase(&self) -> Transaction {
        Transaction::new(self.engine.clone(), self.engine.begin(false))
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, aborts when it returns `Err`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// space.transaction(|txn| {
    ///     let order = txn.take(Selector::by_id("Order", 1))?;
    ///     txn.write(EntryPacket::new("Invoice").with_field("id", 1))?;
    ///     Ok(order)
    /// })?;
    /// ```
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let txn = self.begin();
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                debug!(xtn = %txn.id(), error = %err, "transaction closure failed");
                txn.abort()?;
                Err(err)
            }
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Current MVCC generation state, for pinning historical reads.
    ///
    /// Fails with [`Error::Unsupported`] when MVCC is disabled.
    pub fn generation_state(&self) -> Result<GenerationState> {
        Ok(self.engine.generation_state()?)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SpaceStats {
        self.engine.stats()
    }

    /// Stop background work. Further operations still run, but detached
    /// templates are no longer expired by the reaper.
    pub fn close(&self) {
        self.engine.shutdown();
    }
}

impl std::fmt::Debug for GridSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridSpace")
            .field("engine", &self.engine)
            .finish()
    }
}

/// Builder for space configuration.
///
/// # Example
///
/// ```ignore
/// let space = GridSpace::builder()
///     .name("orders")
///     .mvcc(true)
///     .default_lease(Duration::from_secs(60))
///     .persistence(Arc::new(MemoryPersistence::new()))
///     .register_type(TypeDescriptor::new("Order").id_property("id").index("status"))
///     .open()?;
/// ```
pub struct GridSpaceBuilder {
    config: SpaceConfig,
    collaborators: Collaborators,
    filters: Vec<Arc<dyn OperationFilter>>,
    types: Vec<TypeDescriptor>,
}

impl GridSpaceBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: SpaceConfig::default(),
            collaborators: Collaborators::default(),
            filters: Vec::new(),
            types: Vec::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SpaceConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the configuration with one parsed from TOML.
    ///
    /// Unknown keys are rejected.
    pub fn toml(mut self, text: &str) -> Result<Self> {
        self.config = SpaceConfig::from_toml(text)?;
        Ok(self)
    }

    /// Space name used in log fields.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Enable MVCC generation chains.
    pub fn mvcc(mut self, enabled: bool) -> Self {
        self.config.mvcc_enabled = enabled;
        self
    }

    /// Whether every entry is resident in memory.
    ///
    /// When disabled, by-uid lookups that miss memory consult persistence.
    pub fn all_in_cache(mut self, enabled: bool) -> Self {
        self.config.all_in_cache = enabled;
        self
    }

    /// Reject writes without an id property value.
    pub fn require_id_property(mut self, required: bool) -> Self {
        self.config.require_id_property = required;
        self
    }

    /// Reject writes of routed types without a routing value.
    pub fn require_routing_value(mut self, required: bool) -> Self {
        self.config.require_routing_value = required;
        self
    }

    /// Lease applied when a write names none.
    pub fn default_lease(mut self, lease: Duration) -> Self {
        self.config.default_lease_ms = Some(lease.as_millis() as u64);
        self
    }

    /// FIFO rescans allowed before a reject counts as a conflict.
    pub fn fifo_retry_limit(mut self, limit: u32) -> Self {
        self.config.fifo_retry_limit = limit;
        self
    }

    /// How often expired detached templates are retired.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Run as a local cache: updates must not move versions backwards.
    pub fn local_cache_mode(mut self, enabled: bool) -> Self {
        self.config.local_cache_mode = enabled;
        self
    }

    /// Version-check local updates that carry a non-zero version.
    pub fn versioned_updates(mut self, enabled: bool) -> Self {
        self.config.versioned_updates = enabled;
        self
    }

    /// Durable storage adapter.
    pub fn persistence(mut self, persistence: Arc<dyn EntryPersistence>) -> Self {
        self.collaborators.persistence = persistence;
        self
    }

    /// Replication channel.
    pub fn replication(mut self, replication: Arc<dyn ReplicationSink>) -> Self {
        self.collaborators.replication = replication;
        self
    }

    /// Clock and lease arithmetic.
    pub fn leases(mut self, leases: Arc<dyn LeaseOracle>) -> Self {
        self.collaborators.leases = leases;
        self
    }

    /// MVCC generation source.
    pub fn generations(mut self, generations: Arc<dyn GenerationCoordinator>) -> Self {
        self.collaborators.generations = generations;
        self
    }

    /// Append an operation filter; filters run in insertion order.
    pub fn filter(mut self, filter: Arc<dyn OperationFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Register a type when the space opens.
    pub fn register_type(mut self, descriptor: TypeDescriptor) -> Self {
        self.types.push(descriptor);
        self
    }

    /// Open the space.
    pub fn open(self) -> Result<GridSpace> {
        let engine = SpaceEngine::with_collaborators(self.config, self.collaborators, self.filters)?;
        for descriptor in self.types {
            engine.register_type(descriptor)?;
        }
        Ok(GridSpace {
            engine: Arc::new(engine),
        })
    }
}

impl Default for GridSpaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
