//! Pending templates and their arena
//!
//! A blocked operation lives here until it is answered, times out or is
//! retired. Entries refer to templates by [`TemplateHandle`] (slot index plus
//! generation), never by pointer, so a stale handle on an entry's waiting
//! set simply fails to resolve once its slot is reused.
//!
//! Locking: a template's `state` mutex is the template lock. It is taken
//! before the transaction table lock and before any entry lock.

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use gridspace_concurrency::XtnEntry;
use gridspace_core::{Template, TemplateHandle, Uid, XtnId};
use gridspace_storage::EntryCell;

use crate::completion::Completion;
use crate::outcome::OpResult;

/// Mutable part of a pending template, guarded by the template lock
#[derive(Debug, Default)]
pub(crate) struct PendingState {
    /// Answered or retired; no further attempts
    pub deleted: bool,
    /// Entries whose waiting set holds this template
    pub waiting_on: FxHashSet<Uid>,
    /// Some conflicting entry was met since registration
    pub last_conflict: Option<Uid>,
    /// The registering thread is still running its first search
    pub initial_search_in_progress: bool,
    /// FIFO candidates handed over by notifiers during the first search
    pub pending_fifo: VecDeque<Arc<EntryCell>>,
    /// FIFO rescans ran out during the first search
    pub fifo_starved: bool,
}

/// A registered, not yet answered template
pub(crate) struct PendingTemplate {
    pub handle: TemplateHandle,
    pub template: Template,
    pub xtn: Option<Arc<XtnEntry>>,
    pub state: Mutex<PendingState>,
    pub completion: Arc<Completion<OpResult>>,
    pub started: Instant,
    pub deadline: Option<Instant>,
    /// Delivered through a future or callback; the reaper enforces the deadline
    pub detached: bool,
    /// Types this template listens on for new writes
    pub listens_on: Option<String>,
}

impl PendingTemplate {
    /// Milliseconds since registration
    pub fn waited_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Construction parameters of a pending template
pub(crate) struct PendingSpec {
    pub template: Template,
    pub xtn: Option<Arc<XtnEntry>>,
    pub deadline: Option<Instant>,
    pub detached: bool,
    pub listens_on: Option<String>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    pending: Option<Arc<PendingTemplate>>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Handle-addressed storage of pending templates
#[derive(Default)]
pub(crate) struct TemplateArena {
    slots: Mutex<Slots>,
    listeners: DashMap<String, Vec<TemplateHandle>>,
}

impl TemplateArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template; it listens on its type from now on
    pub fn insert(&self, spec: PendingSpec) -> Arc<PendingTemplate> {
        let pending = {
            let mut slots = self.slots.lock();
            let index = match slots.free.pop() {
                Some(index) => index,
                None => {
                    slots.slots.push(Slot::default());
                    u32::try_from(slots.slots.len() - 1).unwrap_or(u32::MAX)
                }
            };
            let slot = &mut slots.slots[index as usize];
            let handle = TemplateHandle {
                index,
                generation: slot.generation,
            };
            let pending = Arc::new(PendingTemplate {
                handle,
                template: spec.template,
                xtn: spec.xtn,
                state: Mutex::new(PendingState {
                    initial_search_in_progress: true,
                    ..PendingState::default()
                }),
                completion: Arc::new(Completion::new()),
                started: Instant::now(),
                deadline: spec.deadline,
                detached: spec.detached,
                listens_on: spec.listens_on,
            });
            slot.pending = Some(Arc::clone(&pending));
            slots.live += 1;
            pending
        };
        if let Some(type_name) = &pending.listens_on {
            self.listeners
                .entry(type_name.clone())
                .or_default()
                .push(pending.handle);
        }
        pending
    }

    /// Resolve a handle; `None` once the slot was released or reused
    pub fn get(&self, handle: TemplateHandle) -> Option<Arc<PendingTemplate>> {
        let slots = self.slots.lock();
        let slot = slots.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.pending.clone()
    }

    /// Release a template's slot and stop it listening
    pub fn remove(&self, pending: &PendingTemplate) {
        if let Some(type_name) = &pending.listens_on {
            if let Some(mut handles) = self.listeners.get_mut(type_name) {
                handles.retain(|h| *h != pending.handle);
            }
        }
        let mut slots = self.slots.lock();
        let handle = pending.handle;
        let Some(slot) = slots.slots.get_mut(handle.index as usize) else {
            return;
        };
        if slot.generation != handle.generation || slot.pending.is_none() {
            return;
        }
        slot.pending = None;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(handle.index);
        slots.live -= 1;
    }

    /// Templates listening on any of `types`, in registration order per type
    pub fn listeners(&self, types: &[String]) -> Vec<TemplateHandle> {
        let mut handles = Vec::new();
        for type_name in types {
            if let Some(listening) = self.listeners.get(type_name) {
                handles.extend(listening.iter().copied());
            }
        }
        handles
    }

    /// Detached templates whose deadline passed
    pub fn expired(&self, now: Instant) -> Vec<Arc<PendingTemplate>> {
        let slots = self.slots.lock();
        slots
            .slots
            .iter()
            .filter_map(|slot| slot.pending.as_ref())
            .filter(|p| p.detached && p.deadline.is_some_and(|d| d <= now))
            .cloned()
            .collect()
    }

    /// Templates issued under transaction `xtn`
    pub fn for_xtn(&self, xtn: XtnId) -> Vec<Arc<PendingTemplate>> {
        let slots = self.slots.lock();
        slots
            .slots
            .iter()
            .filter_map(|slot| slot.pending.as_ref())
            .filter(|p| p.xtn.as_ref().is_some_and(|x| x.id() == xtn))
            .cloned()
            .collect()
    }

    /// Number of pending templates
    pub fn len(&self) -> usize {
        self.slots.lock().live
    }
}
