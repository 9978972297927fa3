//! MVCC generation chains and the visibility resolver
//!
//! A shell keeps the committed generations of one uid, oldest first. The
//! uncommitted "dirty" generation is the holder's current data while an
//! undecided transaction owns it; it joins the chain when that transaction
//! commits and is discarded when it rolls back. A committed take appends a
//! hollow generation (tombstone).

use gridspace_core::{
    EntryData, Generation, GenerationState, OperationKind, SpaceError, Template,
};

use crate::holder::EntryHolder;

/// One committed generation
#[derive(Debug, Clone, PartialEq)]
pub struct MvccGeneration {
    /// Content at this generation
    pub data: EntryData,
    /// Generation number
    pub generation: Generation,
    /// Tombstone left by a committed take
    pub hollow: bool,
    /// A later generation replaced this one
    pub overridden: bool,
}

/// Committed generation chain of one uid
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MvccShell {
    generations: Vec<MvccGeneration>,
}

impl MvccShell {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a committed generation
    pub fn commit(&mut self, data: EntryData, generation: Generation) {
        self.push(data, generation, false);
    }

    /// Append a tombstone
    pub fn commit_hollow(&mut self, data: EntryData, generation: Generation) {
        self.push(data, generation, true);
    }

    fn push(&mut self, data: EntryData, generation: Generation, hollow: bool) {
        if let Some(last) = self.generations.last_mut() {
            last.overridden = true;
        }
        self.generations.push(MvccGeneration {
            data,
            generation,
            hollow,
            overridden: false,
        });
    }

    /// Latest committed generation
    pub fn latest(&self) -> Option<&MvccGeneration> {
        self.generations.last()
    }

    /// Latest generation visible in a pinned snapshot
    pub fn visible_at(&self, state: &GenerationState) -> Option<&MvccGeneration> {
        self.generations
            .iter()
            .rev()
            .find(|g| state.is_visible(g.generation))
    }

    /// Generations oldest first
    pub fn generations(&self) -> &[MvccGeneration] {
        &self.generations
    }

    /// Number of committed generations
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    /// Whether nothing was ever committed
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }
}

/// Generation chosen for an operation
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// Content to operate on
    pub data: EntryData,
    /// Its generation number; `None` for the dirty generation
    pub generation: Option<Generation>,
    /// The content is uncommitted
    pub dirty: bool,
    /// Differs from what the caller matched; re-run the predicate
    pub needs_rematch: bool,
}

/// Outcome of MVCC resolution
#[derive(Debug, Clone, PartialEq)]
pub enum Visibility {
    /// Operate on this generation
    Visible(Resolved),
    /// No generation exists for this operation; treat as deleted
    Absent,
}

/// Pick the generation `template` operates on
///
/// `examined` is the content the caller already matched. Mutations against a
/// historical or non-active generation fail with `MvccModifyConflict`.
pub fn resolve_generation(
    holder: &EntryHolder,
    template: &Template,
    examined: &EntryData,
) -> Result<Visibility, SpaceError> {
    let empty = MvccShell::new();
    let shell = holder.mvcc.as_ref().unwrap_or(&empty);
    let latest_generation = shell.latest().map(|g| g.generation);
    let mutating = template.kind.is_mutating() || template.kind == OperationKind::ReadExclusive;

    if let Some(state) = &template.historical {
        let pinned = shell.visible_at(state);
        if mutating {
            return Err(SpaceError::MvccModifyConflict {
                uid: holder.data.uid.clone(),
                conflicting: pinned.map(|g| g.generation),
                active: latest_generation,
            });
        }
        return Ok(match pinned {
            Some(g) if !g.hollow => visible(g.data.clone(), Some(g.generation), false, examined),
            _ => Visibility::Absent,
        });
    }

    if template.modifiers.read_committed && !is_owner(holder, template) {
        let committed = match shell.latest() {
            Some(g) if !g.hollow => g,
            _ => return Ok(Visibility::Absent),
        };
        if mutating && holder.is_dirty() {
            return Err(SpaceError::MvccModifyConflict {
                uid: holder.data.uid.clone(),
                conflicting: Some(committed.generation),
                active: None,
            });
        }
        return Ok(visible(
            committed.data.clone(),
            Some(committed.generation),
            false,
            examined,
        ));
    }

    let dirty = holder.is_dirty();
    let generation = if dirty { None } else { latest_generation };
    Ok(visible(holder.data.clone(), generation, dirty, examined))
}

/// Pick the content `template` operates on without MVCC
///
/// Read-committed readers that do not own the entry see the shadow (the
/// last committed content). An uncommitted creation has no committed
/// content; it is returned dirty and the conflict check decides.
pub fn resolve_shadow(holder: &EntryHolder, template: &Template, examined: &EntryData) -> Visibility {
    if template.modifiers.read_committed && !is_owner(holder, template) {
        if let Some(committed) = holder.committed_data() {
            return visible(committed.clone(), None, false, examined);
        }
    }
    visible(holder.data.clone(), None, holder.is_dirty(), examined)
}

/// Dispatch to the MVCC or shadow resolver
pub fn resolve_visible(
    holder: &EntryHolder,
    template: &Template,
    examined: &EntryData,
    mvcc: bool,
) -> Result<Visibility, SpaceError> {
    if mvcc {
        resolve_generation(holder, template, examined)
    } else {
        Ok(resolve_shadow(holder, template, examined))
    }
}

fn is_owner(holder: &EntryHolder, template: &Template) -> bool {
    template.xtn.is_some_and(|xtn| {
        holder.locks.is_write_owner(xtn)
            || holder.locks.entry_writer().is_some_and(|w| w.id() == xtn)
    })
}

fn visible(
    data: EntryData,
    generation: Option<Generation>,
    dirty: bool,
    examined: &EntryData,
) -> Visibility {
    let needs_rematch = data.version != examined.version || data.fields != examined.fields;
    Visibility::Visible(Resolved {
        data,
        generation,
        dirty,
        needs_rematch,
    })
}
