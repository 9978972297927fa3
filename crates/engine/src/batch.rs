//! Multiple-entry operations
//!
//! Batch writes and updates run item by item and report per item. Multiple
//! reads and takes walk one scan and never block: a candidate locked by
//! another transaction is skipped, not waited for.

use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use gridspace_core::{
    EntryData, EntryPacket, FilterContext, Modifiers, Result, Selector, SpaceError, Template, Uid,
    UpdateSource, XtnId,
};
use gridspace_concurrency::{XtnEntry, XtnUsage};

use crate::engine::EngineInner;
use crate::executor::{AttemptCtx, FifoSnapshots, Notices};
use crate::outcome::{ScanOutcome, UpdateResult, WriteResult};

/// How one pass of a multiple operation ended
#[derive(Debug)]
pub(crate) enum PassEnd {
    /// Scan exhausted or `max` reached
    Done,
    /// A candidate failed FIFO validation; later candidates were not tried
    FifoRejected,
    /// The operation failed
    Failed(SpaceError),
}

impl EngineInner {
    /// Write every packet; one result per packet
    pub(crate) fn write_multiple(
        &self,
        packets: Vec<EntryPacket>,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
    ) -> Vec<Result<WriteResult>> {
        packets
            .into_iter()
            .map(|packet| self.write(packet, xtn, lease, modifiers))
            .collect()
    }

    /// Update every packet by uid without waiting; one result per packet
    pub(crate) fn update_multiple(
        &self,
        packets: Vec<EntryPacket>,
        xtn: Option<XtnId>,
        lease: Option<Duration>,
        modifiers: Modifiers,
    ) -> Vec<Result<Option<UpdateResult>>> {
        packets
            .into_iter()
            .map(|packet| {
                let template = self
                    .update_template(packet, UpdateSource::Local, lease)?
                    .with_optional_xtn(xtn)
                    .with_modifiers(modifiers);
                Ok(self.execute(template)?.map(UpdateResult::from_applied))
            })
            .collect()
    }

    /// Read or take up to `max` matching entries
    ///
    /// A failure after some entries were already acted on returns those
    /// entries; a failure before any fails the call. A FIFO rejection ends
    /// the pass so no later entry overtakes the rejected one; the scan then
    /// restarts from a fresh snapshot, up to `fifo_retry_limit` times.
    pub(crate) fn execute_multiple(&self, template: Template, max: usize) -> Result<Vec<EntryData>> {
        let template = template.normalized();
        self.admit(&template)?;
        if max == 0 {
            return Ok(Vec::new());
        }
        let usage = template.xtn.map(|id| self.xtns.attach(id)).transpose()?;
        let xtn = usage.as_ref().map(XtnUsage::xtn);

        let mut notices = Notices::new();
        let mut found = Vec::new();
        let mut rescans = 0;
        let failure = loop {
            let snapshots = self.fifo_snapshots(&template);
            match self.multiple_pass(&template, &snapshots, xtn, max, &mut found, &mut notices) {
                PassEnd::Done => break None,
                PassEnd::Failed(err) => break Some(err),
                PassEnd::FifoRejected if rescans >= self.config.fifo_retry_limit => {
                    break Some(SpaceError::FifoRetry)
                }
                PassEnd::FifoRejected => {
                    rescans += 1;
                    debug!(
                        op = %template.kind,
                        rescans,
                        "fifo rejection in multiple operation, rescanning"
                    );
                }
            }
        };
        drop(usage);
        self.notify(notices);

        if let Some(err) = failure {
            if found.is_empty() {
                return Err(err);
            }
            warn!(
                op = %template.kind,
                found = found.len(),
                error = %err,
                "multiple operation stopped early"
            );
        }
        for entry in &found {
            let ctx = FilterContext {
                xtn: template.xtn,
                template: Some(&template),
                entry: Some(entry),
                ..FilterContext::default()
            };
            self.filters.after(template.kind, &ctx);
        }
        Ok(found)
    }

    /// One scan of a multiple operation, appending to `found`
    ///
    /// Entries already in `found` are skipped, so a rescan never answers
    /// the same entry twice.
    pub(crate) fn multiple_pass(
        &self,
        template: &Template,
        snapshots: &FifoSnapshots,
        xtn: Option<&Arc<XtnEntry>>,
        max: usize,
        found: &mut Vec<EntryData>,
        notices: &mut Notices,
    ) -> PassEnd {
        let ctx = AttemptCtx {
            template,
            xtn,
            snapshots,
            initial_search: true,
        };
        let mut seen: FxHashSet<Uid> = found.iter().map(|entry| entry.uid.clone()).collect();
        for candidate in self.scanner().scan(template) {
            if found.len() >= max {
                break;
            }
            if seen.contains(candidate.cell.uid()) {
                continue;
            }
            match self.attempt(&candidate, &ctx, None, notices) {
                Ok(applied) => {
                    seen.insert(applied.entry.uid.clone());
                    found.push(applied.entry);
                }
                Err(ScanOutcome::Failed(err)) => return PassEnd::Failed(err),
                Err(ScanOutcome::FifoReject) => return PassEnd::FifoRejected,
                Err(ScanOutcome::XtnConflict { uid }) => {
                    debug!(uid = %uid, "skipping locked entry in multiple operation");
                }
                Err(_) => {}
            }
        }
        PassEnd::Done
    }

    /// Run a `ByIds` template as one single-entry operation per id
    pub(crate) fn execute_by_ids(&self, template: Template) -> Result<Vec<Result<Option<EntryData>>>> {
        let Selector::ByIds { type_name, ids } = &template.selector else {
            return Err(SpaceError::InvalidOperation(
                "by-ids operations need a by-ids selector".into(),
            ));
        };
        let results = ids
            .iter()
            .map(|id| {
                let single = Template {
                    selector: Selector::by_id(type_name.clone(), id.clone()),
                    ..template.clone()
                };
                Ok(self.execute(single)?.map(|applied| applied.entry))
            })
            .collect();
        Ok(results)
    }
}
