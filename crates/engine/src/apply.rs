//! Applying an operation to a locked entry
//!
//! Called once the attempt protocol has cleared a candidate. Transactional
//! operations only take locks and record their mutation; the commit pass
//! makes them durable. Non-transactional mutations are handed to
//! persistence and replication before the new content is published.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use gridspace_concurrency::XtnEntry;
use gridspace_core::{
    ChangeSet, EntryData, EntryPacket, Generation, Modifiers, Mutation, OperationKind, Result,
    SpaceError, Template, TemplatePayload, UpdateSource,
};
use gridspace_storage::{EntryCell, EntryGuard, Resolved};

use crate::durability::Durable;
use crate::engine::EngineInner;
use crate::executor::Notices;
use crate::outcome::{Applied, ScanOutcome};
use crate::stats::SpaceCounters;

type Attempted = std::result::Result<Applied, ScanOutcome>;

impl EngineInner {
    /// Apply `template` to the entry behind `guard`
    pub(crate) fn apply(
        &self,
        cell: &Arc<EntryCell>,
        guard: &mut EntryGuard<'_>,
        resolved: Resolved,
        template: &Template,
        xtn: Option<&Arc<XtnEntry>>,
        notices: &mut Notices,
    ) -> Attempted {
        match template.kind {
            OperationKind::Read | OperationKind::ReadIfExists => {
                let locks_read = template.historical.is_none() && !template.has_isolation_override();
                if let Some(xtn) = xtn.filter(|_| locks_read) {
                    guard.locks.add_read_owner(xtn);
                    self.record_lock(xtn, &resolved.data);
                }
                SpaceCounters::bump(&self.counters.reads);
                Ok(read_answer(resolved.data))
            }
            OperationKind::ReadExclusive => {
                let xtn = xtn.ok_or_else(|| {
                    SpaceError::Internal("exclusive read without a transaction".into())
                })?;
                guard.locks.set_write_owner(xtn, OperationKind::ReadExclusive);
                self.record_lock(xtn, &resolved.data);
                SpaceCounters::bump(&self.counters.reads);
                Ok(read_answer(resolved.data))
            }
            OperationKind::Take | OperationKind::TakeIfExists => {
                self.apply_take(cell, guard, resolved.data, template, xtn, notices)
            }
            OperationKind::Update | OperationKind::Change => {
                self.apply_update(cell, guard, resolved.data, template, xtn, notices)
            }
            OperationKind::Write => Err(ScanOutcome::Failed(SpaceError::InvalidOperation(
                "write is not a template operation".into(),
            ))),
        }
    }

    fn apply_take(
        &self,
        cell: &Arc<EntryCell>,
        guard: &mut EntryGuard<'_>,
        data: EntryData,
        template: &Template,
        xtn: Option<&Arc<XtnEntry>>,
        notices: &mut Notices,
    ) -> Attempted {
        let mutation = Mutation::Take {
            uid: data.uid.clone(),
            type_name: data.type_name.clone(),
            version: data.version,
        };
        if let Some(xtn) = xtn {
            guard.locks.set_write_owner(xtn, template.kind);
            self.record_lock(xtn, &data);
            xtn.record_mutation(mutation);
            SpaceCounters::bump(&self.counters.takes);
            return Ok(read_answer(data));
        }

        let transient = guard.transient;
        let level = self.with_generation(|generation| {
            let level = self.hand_off(Durable::Remove(&data.uid), Some(&data), &mutation, transient)?;
            let holder = &mut **guard;
            if let (Some(shell), Some(generation)) = (holder.mvcc.as_mut(), generation) {
                shell.commit_hollow(data.clone(), generation);
            }
            holder.deleted = true;
            holder.shadow = None;
            Ok(level)
        })?;
        self.unlink(guard);
        SpaceCounters::bump(&self.counters.takes);
        debug!(uid = %data.uid, "entry taken");
        if !template.modifiers.backup_only {
            notices.push(Arc::clone(cell));
        }
        Ok(Applied {
            entry: data,
            previous: None,
            replication_level: level,
        })
    }

    fn apply_update(
        &self,
        cell: &Arc<EntryCell>,
        guard: &mut EntryGuard<'_>,
        current: EntryData,
        template: &Template,
        xtn: Option<&Arc<XtnEntry>>,
        notices: &mut Notices,
    ) -> Attempted {
        let next = match &template.payload {
            TemplatePayload::Replace {
                packet,
                source,
                lease,
            } => self.replacement(&current, packet, *source, *lease, template.modifiers)?,
            TemplatePayload::Change { changes, lease } => {
                Some(self.changed(&current, changes, *lease, template.modifiers)?)
            }
            TemplatePayload::None => {
                return Err(ScanOutcome::Failed(SpaceError::InvalidOperation(format!(
                    "{} without a payload",
                    template.kind
                ))))
            }
        };
        let Some(next) = next else {
            // stale replicated update: keep the entry as it is
            return Ok(Applied {
                entry: current.clone(),
                previous: Some(current),
                replication_level: 0,
            });
        };
        let mutation = Mutation::Update {
            entry: next.clone(),
            previous_version: current.version,
        };

        if let Some(xtn) = xtn {
            let created_here = guard
                .locks
                .entry_writer()
                .is_some_and(|writer| writer.id() == xtn.id());
            let holder = &mut **guard;
            if holder.shadow.is_none() && !created_here {
                holder.shadow = Some(holder.data.clone());
            }
            holder.data = next.clone();
            holder.locks.set_write_owner(xtn, template.kind);
            self.record_lock(xtn, &next);
            xtn.record_mutation(mutation);
        } else {
            let transient = guard.transient;
            let level = self.with_generation(|generation| {
                let level =
                    self.hand_off(Durable::Put(&next), Some(&current), &mutation, transient)?;
                let holder = &mut **guard;
                if let (Some(shell), Some(generation)) = (holder.mvcc.as_mut(), generation) {
                    shell.commit(next.clone(), generation);
                }
                holder.data = next.clone();
                Ok(level)
            })?;
            if !template.modifiers.backup_only {
                notices.push(Arc::clone(cell));
            }
            self.count_update(template.kind);
            return Ok(Applied {
                entry: next,
                previous: Some(current),
                replication_level: level,
            });
        }
        self.count_update(template.kind);
        Ok(Applied {
            entry: next,
            previous: Some(current),
            replication_level: 0,
        })
    }

    fn count_update(&self, kind: OperationKind) {
        let counter = if kind == OperationKind::Change {
            &self.counters.changes
        } else {
            &self.counters.updates
        };
        SpaceCounters::bump(counter);
    }

    /// New content of an update, or `None` for a stale replicated update
    fn replacement(
        &self,
        current: &EntryData,
        packet: &EntryPacket,
        source: UpdateSource,
        lease: Option<Duration>,
        modifiers: Modifiers,
    ) -> Result<Option<EntryData>> {
        if packet.type_name != current.type_name {
            return Err(SpaceError::InvalidOperation(format!(
                "update of {} {} with a {} packet",
                current.type_name, current.uid, packet.type_name
            )));
        }
        let source = match source {
            UpdateSource::Local if self.config.local_cache_mode => UpdateSource::LocalCache,
            other => other,
        };
        let actual = current.version;
        let conflict = |expected: u64| SpaceError::VersionConflict {
            uid: current.uid.clone(),
            expected,
            actual,
        };
        let version = match source {
            UpdateSource::Local => {
                if self.config.versioned_updates && packet.version > 0 && packet.version != actual {
                    return Err(conflict(packet.version));
                }
                actual + 1
            }
            UpdateSource::Replicated => {
                if packet.version > 0 && packet.version <= actual {
                    debug!(
                        uid = %current.uid,
                        incoming = packet.version,
                        actual,
                        "ignoring stale replicated update"
                    );
                    return Ok(None);
                }
                if packet.version > 0 {
                    packet.version
                } else {
                    actual + 1
                }
            }
            UpdateSource::Gateway { previous_version } => {
                if previous_version != actual {
                    return Err(conflict(previous_version));
                }
                actual + 1
            }
            UpdateSource::LocalCache => {
                if packet.version < actual {
                    return Err(conflict(packet.version));
                }
                packet.version.max(actual)
            }
        };
        let expiration = if modifiers.preserve_lease {
            current.expiration
        } else {
            let lease = lease.or_else(|| self.config.default_lease());
            self.leases.to_absolute(lease, self.leases.now())
        };
        Ok(Some(EntryData {
            uid: current.uid.clone(),
            type_name: current.type_name.clone(),
            fields: packet.fields.clone(),
            version,
            expiration,
        }))
    }

    /// Content after applying change mutators
    fn changed(
        &self,
        current: &EntryData,
        changes: &ChangeSet,
        lease: Option<Duration>,
        modifiers: Modifiers,
    ) -> Result<EntryData> {
        let fields = changes.apply(&current.fields)?;
        let expiration = match lease {
            Some(lease) if !modifiers.preserve_lease => {
                self.leases.to_absolute(Some(lease), self.leases.now())
            }
            _ => current.expiration,
        };
        Ok(EntryData {
            fields,
            version: current.version + 1,
            expiration,
            ..current.clone()
        })
    }

    // ========================================================================
    // Helpers shared with write and termination
    // ========================================================================

    /// Record a lock in the transaction's footprint
    pub(crate) fn record_lock(&self, xtn: &XtnEntry, data: &EntryData) {
        let fifo = self.types.get(&data.type_name).is_some_and(|d| d.fifo);
        xtn.record_lock(&data.uid, &data.type_name, fifo);
    }

    /// Run `f` with a fresh MVCC generation, completing it afterwards
    ///
    /// Without MVCC `f` gets `None`. The generation is completed even when
    /// `f` fails, so an abandoned mutation never stalls the watermark.
    pub(crate) fn with_generation<T>(
        &self,
        f: impl FnOnce(Option<Generation>) -> Result<T>,
    ) -> Result<T> {
        let generation = if self.mvcc() {
            Some(self.generations.next_generation()?)
        } else {
            None
        };
        let result = f(generation);
        if let Some(generation) = generation {
            if let Err(err) = self.generations.mark_completed(generation) {
                warn!(generation, error = %err, "could not complete mvcc generation");
            }
        }
        result
    }

    /// Detach a deleted entry from lookups
    ///
    /// Under MVCC an entry with committed generations stays resident so
    /// historical reads still find it; its index postings are dropped.
    pub(crate) fn unlink(&self, guard: &mut EntryGuard<'_>) {
        let keeps_history = guard.mvcc.as_ref().is_some_and(|shell| !shell.is_empty());
        if self.mvcc() && keeps_history {
            guard.republish();
        } else {
            self.store.remove(guard);
        }
    }

    /// Drop an entry whose lease ran out
    pub(crate) fn expire_entry(&self, guard: &mut EntryGuard<'_>) {
        guard.deleted = true;
        guard.shadow = None;
        if !guard.transient {
            if let Err(err) = self.persistence.remove(&guard.data.uid) {
                warn!(uid = %guard.data.uid, error = %err, "could not remove expired entry from persistence");
            }
        }
        debug!(uid = %guard.data.uid, "entry lease expired");
        self.unlink(guard);
    }
}

fn read_answer(entry: EntryData) -> Applied {
    Applied {
        entry,
        previous: None,
        replication_level: 0,
    }
}
