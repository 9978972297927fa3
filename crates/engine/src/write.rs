//! Write, update-by-packet and update-or-write
//!
//! A write inserts a new cell; the store reports a clash when the uid is
//! already resident. A clash with a deleted or expired entry replaces it
//! (inheriting its MVCC history); a clash with an entry the writing
//! transaction itself took is re-dispatched as an update.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use gridspace_concurrency::{EntryLockState, XtnEntry, XtnUsage};
use gridspace_core::{
    EntryData, EntryPacket, FilterContext, Modifiers, Mutation, OperationKind, Result,
    SpaceError, Template, Uid, UpdateSource, Value, XtnId,
};
use gridspace_storage::{EntryCell, EntryHolder, Inserted, MvccShell, TypeDescriptor};

use crate::durability::Durable;
use crate::engine::EngineInner;
use crate::executor::Notices;
use crate::outcome::{UpdateOrWriteResult, UpdateResult, WriteResult};
use crate::stats::SpaceCounters;

/// How often a write may replace a dead resident entry before giving up
const WRITE_ATTEMPTS: usize = 4;

/// Update/write alternations allowed in one update-or-write call
const MAX_FLIPS: usize = 2;

enum Clash {
    /// The resident entry is dead; retry with its MVCC history
    Replace(Option<MvccShell>),
    /// Taken by the writing transaction; turn the write into an update
    Fuse,
    /// A live entry holds the uid
    Exists,
}

impl EngineInner {
    /// Insert a new entry
    pub(crate) fn write(
        &self,
        packet: EntryPacket,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
    ) -> Result<WriteResult> {
        if modifiers.backup_only && self.mvcc() {
            return Err(SpaceError::Unsupported(
                "backup-only operations are not defined under mvcc".into(),
            ));
        }
        let descriptor = self.types.get_or_introduce(&packet.type_name);
        let uid = self.derive_uid(&descriptor, &packet)?;
        let ctx = FilterContext {
            xtn,
            packet: Some(&packet),
            ..FilterContext::default()
        };
        self.filters.before(OperationKind::Write, &ctx)?;

        let usage = xtn.map(|id| self.xtns.attach(id)).transpose()?;
        let mut notices = Notices::new();
        let result = self.insert_entry(
            uid,
            &descriptor,
            &packet,
            usage.as_ref().map(XtnUsage::xtn),
            lease,
            modifiers,
            &mut notices,
        );
        drop(usage);
        self.notify(notices);
        if result.is_ok() {
            self.filters.after(OperationKind::Write, &ctx);
        }
        result
    }

    /// Uid of a packet about to be written
    ///
    /// Explicit uid first, then the id property, then a generated one.
    pub(crate) fn derive_uid(
        &self,
        descriptor: &TypeDescriptor,
        packet: &EntryPacket,
    ) -> Result<Uid> {
        if self.config.require_routing_value {
            let routing = descriptor
                .routing_property
                .as_ref()
                .or(descriptor.id_property.as_ref());
            if let Some(field) = routing {
                if packet.fields.get(field).map_or(true, Value::is_null) {
                    return Err(SpaceError::ProtectiveViolation {
                        type_name: descriptor.name.clone(),
                        reason: format!("routing property '{field}' has no value"),
                    });
                }
            }
        }
        if let Some(uid) = &packet.uid {
            return Ok(uid.clone());
        }
        if let Some(id) = id_value(descriptor, packet) {
            return Ok(Uid::from_id(&descriptor.name, id));
        }
        if self.config.require_id_property {
            return Err(SpaceError::ProtectiveViolation {
                type_name: descriptor.name.clone(),
                reason: "entry has neither a uid nor an id property value".into(),
            });
        }
        Ok(Uid::generate())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_entry(
        &self,
        uid: Uid,
        descriptor: &TypeDescriptor,
        packet: &EntryPacket,
        xtn: Option<&Arc<XtnEntry>>,
        lease: Option<Duration>,
        modifiers: Modifiers,
        notices: &mut Notices,
    ) -> Result<WriteResult> {
        let lease = lease.or_else(|| self.config.default_lease());
        let expiration = self.leases.to_absolute(lease, self.leases.now());
        let data = EntryData::from_packet(uid.clone(), packet, expiration);
        let shard = self.store.shard(&descriptor.name, &descriptor.indexes);
        let mut history: Option<MvccShell> = None;

        for _ in 0..WRITE_ATTEMPTS {
            let locks = match xtn {
                Some(xtn) => EntryLockState::created_by(Arc::clone(xtn)),
                None => EntryLockState::new(),
            };
            let mut holder = EntryHolder::new(data.clone(), locks, packet.transient);
            if self.mvcc() {
                holder = holder.with_mvcc(history.take().unwrap_or_default());
            }

            let inserted = if xtn.is_some() {
                self.store
                    .insert_with(holder, &shard, |_| Ok::<u32, SpaceError>(0))?
            } else {
                self.with_generation(|generation| {
                    self.store.insert_with(holder, &shard, |guard| {
                        let mutation = Mutation::Write {
                            entry: guard.data.clone(),
                        };
                        let level =
                            self.hand_off(Durable::Put(&data), None, &mutation, guard.transient)?;
                        if let (Some(shell), Some(generation)) = (guard.mvcc.as_mut(), generation)
                        {
                            shell.commit(data.clone(), generation);
                        }
                        Ok(level)
                    })
                })?
            };

            match inserted {
                Inserted::Linked(cell, level) => {
                    if let Some(xtn) = xtn {
                        self.record_lock(xtn, &data);
                        xtn.record_mutation(Mutation::Write { entry: data.clone() });
                    }
                    SpaceCounters::bump(&self.counters.writes);
                    debug!(uid = %uid, type_name = %data.type_name, xtn = ?xtn.map(|x| x.id()), "entry written");
                    if !modifiers.backup_only {
                        notices.push(cell);
                    }
                    return Ok(WriteResult {
                        uid,
                        version: data.version,
                        expiration,
                        replication_level: level,
                        fused_update: false,
                    });
                }
                Inserted::Clash(resident) => match self.resolve_clash(&resident, xtn, notices) {
                    Clash::Replace(shell) => {
                        debug!(uid = %uid, "replacing a dead entry with the same uid");
                        history = shell;
                    }
                    Clash::Fuse => {
                        let xtn = xtn.ok_or_else(|| {
                            SpaceError::Internal("write fusion without a transaction".into())
                        })?;
                        return self.fuse_update(uid, packet, xtn, lease, modifiers, notices);
                    }
                    Clash::Exists => return Err(SpaceError::EntryAlreadyInSpace { uid }),
                },
            }
        }
        Err(SpaceError::Internal(format!(
            "write of {uid} kept clashing with dead entries"
        )))
    }

    fn resolve_clash(
        &self,
        resident: &Arc<EntryCell>,
        xtn: Option<&Arc<XtnEntry>>,
        notices: &mut Notices,
    ) -> Clash {
        let _table = self.xtns.conflict_guard();
        let mut guard = resident.lock();
        self.settle_owners(resident, &mut guard, notices);
        if !guard.deleted && guard.locks.entry_writer().is_none() && !guard.locks.is_locked() {
            let now = self.leases.now();
            if self.leases.is_expired(&guard.data, now) {
                self.expire_entry(&mut guard);
            }
        }
        if guard.deleted {
            let shell = guard.mvcc.take();
            self.store.remove(&mut guard);
            return Clash::Replace(shell);
        }
        let taken_by_writer = xtn.is_some_and(|xtn| {
            guard.locks.is_write_owner(xtn.id())
                && guard
                    .locks
                    .write_lock_kind()
                    .is_some_and(OperationKind::is_take)
        });
        if taken_by_writer {
            Clash::Fuse
        } else {
            Clash::Exists
        }
    }

    fn fuse_update(
        &self,
        uid: Uid,
        packet: &EntryPacket,
        xtn: &Arc<XtnEntry>,
        lease: Option<Duration>,
        modifiers: Modifiers,
        notices: &mut Notices,
    ) -> Result<WriteResult> {
        let mut template = Template::update(
            packet.clone().with_uid(uid.clone()),
            UpdateSource::Local,
            lease,
        )?
        .with_xtn(xtn.id())
        .with_modifiers(modifiers);
        template.update_or_write = true;
        debug!(uid = %uid, xtn = %xtn.id(), "write after take in the same transaction, updating");
        match self.run_once(&template, Some(xtn), notices)? {
            Some(applied) => Ok(WriteResult {
                uid,
                version: applied.entry.version,
                expiration: applied.entry.expiration,
                replication_level: applied.replication_level,
                fused_update: true,
            }),
            None => Err(SpaceError::EntryNotInSpace { uid }),
        }
    }

    // ========================================================================
    // Update by packet
    // ========================================================================

    /// Update template addressing a packet's entry by uid
    pub(crate) fn update_template(
        &self,
        packet: EntryPacket,
        source: UpdateSource,
        lease: Option<Duration>,
    ) -> Result<Template> {
        let uid = match &packet.uid {
            Some(uid) => uid.clone(),
            None => {
                let descriptor = self.types.get_or_introduce(&packet.type_name);
                match id_value(&descriptor, &packet) {
                    Some(id) => Uid::from_id(&descriptor.name, id),
                    None => {
                        return Err(SpaceError::InvalidOperation(format!(
                            "update of a {} packet without a uid or id value",
                            packet.type_name
                        )))
                    }
                }
            }
        };
        Template::update(packet.with_uid(uid), source, lease)
    }

    /// Update when the entry exists, write otherwise
    pub(crate) fn update_or_write(
        &self,
        packet: EntryPacket,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
        timeout: Duration,
        update_first: bool,
    ) -> Result<UpdateOrWriteResult> {
        let descriptor = self.types.get_or_introduce(&packet.type_name);
        let addressable = packet.uid.is_some() || id_value(&descriptor, &packet).is_some();
        let mut updating = update_first && addressable;

        for flips in 0..=MAX_FLIPS {
            if flips > 1 {
                warn!(
                    type_name = %packet.type_name,
                    flips,
                    "update-or-write keeps alternating between update and write"
                );
            }
            if updating {
                let mut template = self
                    .update_template(packet.clone(), UpdateSource::Local, lease)?
                    .with_optional_xtn(xtn)
                    .with_modifiers(modifiers)
                    .with_timeout(timeout);
                template.update_or_write = true;
                match self.execute(template) {
                    Ok(Some(applied)) => {
                        return Ok(UpdateOrWriteResult::Updated(UpdateResult::from_applied(
                            applied,
                        )))
                    }
                    Ok(None) | Err(SpaceError::EntryNotInSpace { .. }) => updating = false,
                    Err(err) => return Err(err),
                }
            } else {
                match self.write(packet.clone(), xtn, lease, modifiers) {
                    Ok(written) => return Ok(UpdateOrWriteResult::Written(written)),
                    Err(SpaceError::EntryAlreadyInSpace { .. }) if addressable => updating = true,
                    Err(err) => return Err(err),
                }
            }
        }
        Err(SpaceError::Internal(format!(
            "update-or-write of a {} packet did not settle after {MAX_FLIPS} flips",
            packet.type_name
        )))
    }
}

/// Non-null id property value of a packet
fn id_value<'a>(descriptor: &TypeDescriptor, packet: &'a EntryPacket) -> Option<&'a Value> {
    descriptor
        .id_property
        .as_ref()
        .and_then(|field| packet.fields.get(field))
        .filter(|value| !value.is_null())
}
