//! Transaction handle.
//!
//! A [`Transaction`] scopes operations to one transaction id. Entries it
//! writes stay invisible to others until commit; entries it reads, takes or
//! updates stay locked against conflicting access until it terminates.
//!
//! # Example
//!
//! ```ignore
//! let txn = space.begin();
//! let order = txn.take(Selector::by_id("Order", 1))?;
//! txn.write(EntryPacket::new("Shipment").with_field("id", 1))?;
//! txn.commit()?;
//! ```
//!
//! Dropping an unterminated handle aborts the transaction.

use std::sync::Arc;
use std::time::Duration;

use gridspace_core::{
    ChangeSet, EntryData, EntryPacket, Modifiers, Selector, SpaceError, Template, UpdateSource,
    XtnId,
};
use gridspace_engine::{Applied, SpaceEngine, UpdateOrWriteResult, UpdateResult, WriteResult};
use tracing::warn;

use crate::error::{Error, Result};

/// Handle to one open transaction.
pub struct Transaction {
    engine: Arc<SpaceEngine>,
    id: XtnId,
    terminated: bool,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<SpaceEngine>, id: XtnId) -> Self {
        Self {
            engine,
            id,
            terminated: false,
        }
    }

    /// Transaction id.
    pub fn id(&self) -> XtnId {
        self.id
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Write a new entry under this transaction.
    pub fn write(&self, packet: EntryPacket) -> Result<WriteResult> {
        Ok(self
            .engine
            .write(packet, Some(self.id), None, Modifiers::new())?)
    }

    /// Read one matching entry, taking a shared lock on it.
    pub fn read(&self, selector: Selector) -> Result<Option<EntryData>> {
        self.read_with(selector, Modifiers::new())
    }

    /// Read with isolation modifiers (dirty read, read committed, exclusive).
    pub fn read_with(&self, selector: Selector, modifiers: Modifiers) -> Result<Option<EntryData>> {
        let template = Template::read(selector)
            .with_xtn(self.id)
            .with_modifiers(modifiers);
        Ok(self.engine.read(template)?)
    }

    /// Take one matching entry; others see it gone once this commits.
    pub fn take(&self, selector: Selector) -> Result<Option<EntryData>> {
        Ok(self
            .engine
            .take(Template::take(selector).with_xtn(self.id))?)
    }

    /// Take one matching entry, waiting up to `timeout` for one.
    pub fn take_blocking(&self, selector: Selector, timeout: Duration) -> Result<Option<EntryData>> {
        let template = Template::take(selector)
            .with_xtn(self.id)
            .with_timeout(timeout);
        Ok(self.engine.take(template)?)
    }

    /// Replace an entry's content by uid.
    pub fn update(&self, packet: EntryPacket) -> Result<UpdateResult> {
        self.engine
            .update(
                packet,
                Some(self.id),
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
            Some(self.id),
            None,
            Modifiers::new(),
            Duration::ZERO,
        )?)
    }

    /// Update the entry if its uid is resident, write it otherwise.
    pub fn update_or_write(&self, packet: EntryPacket) -> Result<UpdateOrWriteResult> {
        Ok(self.engine.update_or_write(
            packet,
            Some(self.id),
            None,
            Modifiers::new(),
            Duration::ZERO,
            false,
        )?)
    }

    /// Run any template under this transaction.
    pub fn execute(&self, template: Template) -> Result<Option<Applied>> {
        Ok(self.engine.execute(template.with_xtn(self.id))?)
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// First phase of two-phase commit; returns the replication level.
    ///
    /// On failure the transaction can only be aborted.
    pub fn prepare(&self) -> Result<u32> {
        Ok(self.engine.prepare(self.id)?)
    }

    /// Commit; returns the replication consistency level.
    ///
    /// A transaction whose prepare failed cannot commit; it is aborted when
    /// the handle drops.
    pub fn commit(mut self) -> Result<u32> {
        let result = self.engine.commit(self.id);
        if !matches!(result, Err(SpaceError::TransactionNotActive { .. })) {
            self.terminated = true;
        }
        Ok(result?)
    }

    /// Roll back every operation of this transaction.
    pub fn abort(mut self) -> Result<()> {
        self.terminated = true;
        Ok(self.engine.abort(self.id)?)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        if let Err(err) = self.engine.abort(self.id) {
            warn!(xtn = %self.id, error = %err, "abort of dropped transaction failed");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("terminated", &self.terminated)
            .finish()
    }
}
