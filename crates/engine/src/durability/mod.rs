//! Persistence and replication hand-off
//!
//! Non-transactional mutations are handed off one at a time, under the
//! entry lock, before the change becomes visible:
//!
//! 1. persistence (skipped for transient entries)
//! 2. replication, whose answer is the consistency level reported back
//!
//! If replication refuses, the persistence write is compensated and the
//! mutation fails. Transactions replicate once as a bundle and persist once
//! as a batch.

use rustc_hash::FxHashMap;
use tracing::{error, warn};

use gridspace_concurrency::XtnEntry;
use gridspace_core::{EntryData, Mutation, Result, SpaceError, Uid};

use crate::engine::EngineInner;

/// Durable effect of one mutation
#[derive(Debug, Clone, Copy)]
pub(crate) enum Durable<'a> {
    /// Store this content
    Put(&'a EntryData),
    /// Forget this uid
    Remove(&'a Uid),
}

impl Durable<'_> {
    fn uid(&self) -> &Uid {
        match self {
            Durable::Put(data) => &data.uid,
            Durable::Remove(uid) => uid,
        }
    }
}

/// Final persistence effect of a transaction
#[derive(Debug, Default)]
pub(crate) struct PersistPlan {
    pub puts: Vec<EntryData>,
    pub removes: Vec<Uid>,
}

impl PersistPlan {
    /// Collapse recorded mutations into the last effect per uid
    pub fn from_mutations(mutations: &[Mutation]) -> Self {
        let mut last: FxHashMap<Uid, Option<EntryData>> = FxHashMap::default();
        let mut order: Vec<Uid> = Vec::new();
        let mut record = |uid: &Uid, effect: Option<EntryData>| {
            if last.insert(uid.clone(), effect).is_none() {
                order.push(uid.clone());
            }
        };
        for mutation in mutations {
            match mutation {
                Mutation::Write { entry } | Mutation::Update { entry, .. } => {
                    record(&entry.uid, Some(entry.clone()))
                }
                Mutation::Take { uid, .. } => record(uid, None),
                Mutation::Transaction { mutations, .. } => {
                    for (uid, effect) in PersistPlan::from_mutations(mutations).flatten() {
                        record(&uid, effect);
                    }
                }
            }
        }
        let mut plan = PersistPlan::default();
        for uid in order {
            match last.remove(&uid) {
                Some(Some(entry)) => plan.puts.push(entry),
                Some(None) => plan.removes.push(uid),
                None => {}
            }
        }
        plan
    }

    fn flatten(self) -> Vec<(Uid, Option<EntryData>)> {
        let mut effects: Vec<(Uid, Option<EntryData>)> = self
            .puts
            .into_iter()
            .map(|entry| (entry.uid.clone(), Some(entry)))
            .collect();
        effects.extend(self.removes.into_iter().map(|uid| (uid, None)));
        effects
    }

    /// Drop entries that must never reach persistence
    pub fn without(mut self, transient: &[Uid]) -> Self {
        self.puts.retain(|e| !transient.contains(&e.uid));
        self.removes.retain(|uid| !transient.contains(uid));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty()
    }
}

fn replication_error(err: SpaceError) -> SpaceError {
    match err {
        SpaceError::Replication { .. } => err,
        other => SpaceError::Replication {
            message: other.to_string(),
        },
    }
}

impl EngineInner {
    /// Persist, then replicate, one non-transactional mutation
    ///
    /// `previous` is the durable content before the mutation; it is
    /// written back if replication refuses.
    pub(crate) fn hand_off(
        &self,
        change: Durable<'_>,
        previous: Option<&EntryData>,
        mutation: &Mutation,
        transient: bool,
    ) -> Result<u32> {
        if !transient {
            match change {
                Durable::Put(data) => self.persistence.put(data)?,
                Durable::Remove(uid) => self.persistence.remove(uid)?,
            }
        }
        match self.replication.submit(mutation) {
            Ok(level) => Ok(level),
            Err(err) => {
                if !transient {
                    self.compensate(change.uid(), previous);
                }
                Err(replication_error(err))
            }
        }
    }

    fn compensate(&self, uid: &Uid, previous: Option<&EntryData>) {
        let restored = match previous {
            Some(data) => self.persistence.put(data),
            None => self.persistence.remove(uid),
        };
        if let Err(err) = restored {
            warn!(uid = %uid, error = %err, "could not undo persistence after replication refusal");
        }
    }

    /// Replicate a transaction's bundle unless that already happened
    pub(crate) fn replicate_transaction(&self, xtn: &XtnEntry) -> Result<u32> {
        let Some(mutations) = xtn.claim_replication() else {
            return Ok(0);
        };
        if mutations.is_empty() {
            return Ok(0);
        }
        let bundle = Mutation::Transaction {
            xtn: xtn.id(),
            mutations,
        };
        self.replication.submit(&bundle).map_err(replication_error)
    }

    /// Write a committed transaction's effects in one batch
    pub(crate) fn persist_plan(&self, xtn: &XtnEntry, plan: &PersistPlan) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        self.persistence
            .apply_batch(&plan.puts, &plan.removes)
            .map_err(|err| {
                error!(
                    xtn = %xtn.id(),
                    puts = plan.puts.len(),
                    removes = plan.removes.len(),
                    error = %err,
                    "persisting committed transaction failed"
                );
                err
            })
    }
}
