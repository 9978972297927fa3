//! Template / operation descriptor
//!
//! A [`Template`] is the normalized form of every client request that has to
//! find an existing entry: read, take, update and change. Writes do not need
//! a template unless they are re-dispatched as updates.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::change::ChangeSet;
use crate::entry::{EntryData, EntryPacket};
use crate::error::{Result, SpaceError};
use crate::operation::{Modifiers, OperationKind, UpdateSource};
use crate::predicate::Predicate;
use crate::traits::GenerationState;
use crate::types::{Uid, XtnId};
use crate::value::Value;

/// Which entries a template targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    /// Exactly one entry by uid
    ByUid(Uid),
    /// Exactly one entry by its type's id property
    ById {
        /// Type name
        type_name: String,
        /// Id property value
        id: Value,
    },
    /// Any entry of the type (or a subtype) matching the predicate
    Match {
        /// Type name
        type_name: String,
        /// Predicate over fields
        predicate: Predicate,
    },
    /// Batch of ids of one type; answered per id
    ByIds {
        /// Type name
        type_name: String,
        /// Id property values
        ids: Vec<Value>,
    },
}

impl Selector {
    /// Match every entry of a type
    pub fn all_of(type_name: impl Into<String>) -> Self {
        Selector::Match {
            type_name: type_name.into(),
            predicate: Predicate::all(),
        }
    }

    /// Match entries of a type with a predicate
    pub fn matching(type_name: impl Into<String>, predicate: Predicate) -> Self {
        Selector::Match {
            type_name: type_name.into(),
            predicate,
        }
    }

    /// Select by id property
    pub fn by_id(type_name: impl Into<String>, id: impl Into<Value>) -> Self {
        Selector::ById {
            type_name: type_name.into(),
            id: id.into(),
        }
    }

    /// The uid this selector resolves to without scanning, if any
    pub fn direct_uid(&self) -> Option<Uid> {
        match self {
            Selector::ByUid(uid) => Some(uid.clone()),
            Selector::ById { type_name, id } => Some(Uid::from_id(type_name, id)),
            _ => None,
        }
    }

    /// Declared type name, if the selector is typed
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Selector::ByUid(_) => None,
            Selector::ById { type_name, .. }
            | Selector::Match { type_name, .. }
            | Selector::ByIds { type_name, .. } => Some(type_name),
        }
    }

    /// Full predicate check against candidate data
    pub fn matches(&self, data: &EntryData) -> bool {
        match self {
            Selector::ByUid(uid) => &data.uid == uid,
            Selector::ById { type_name, id } => data.uid == Uid::from_id(type_name, id),
            Selector::Match { predicate, .. } => predicate.matches(data),
            Selector::ByIds { type_name, ids } => {
                ids.iter().any(|id| data.uid == Uid::from_id(type_name, id))
            }
        }
    }
}

/// Data carried by mutating templates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum TemplatePayload {
    /// Reads and takes carry nothing
    #[default]
    None,
    /// Full replacement for update
    Replace {
        /// New entry content
        packet: EntryPacket,
        /// Version policy
        source: UpdateSource,
        /// New relative lease (ignored with `preserve_lease`)
        lease: Option<Duration>,
    },
    /// In-place mutators for change
    Change {
        /// Mutators to apply
        changes: ChangeSet,
        /// New relative lease, `None` keeps the current one
        lease: Option<Duration>,
    },
}

/// Normalized client request against existing entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Operation kind
    pub kind: OperationKind,
    /// Target selector
    pub selector: Selector,
    /// Owning transaction
    pub xtn: Option<XtnId>,
    /// Isolation and ordering modifiers
    pub modifiers: Modifiers,
    /// How long to block for a match (zero = no wait)
    pub timeout: Duration,
    /// Pinned MVCC snapshot for historical reads
    pub historical: Option<GenerationState>,
    /// Update/change payload
    pub payload: TemplatePayload,
    /// Update issued by update-or-write; may resurrect an entry taken by
    /// the same transaction
    pub update_or_write: bool,
}

impl Template {
    /// Template of the given kind and selector with default settings
    pub fn new(kind: OperationKind, selector: Selector) -> Self {
        Self {
            kind,
            selector,
            xtn: None,
            modifiers: Modifiers::default(),
            timeout: Duration::ZERO,
            historical: None,
            payload: TemplatePayload::None,
            update_or_write: false,
        }
    }

    /// Read template
    pub fn read(selector: Selector) -> Self {
        Self::new(OperationKind::Read, selector)
    }

    /// Take template
    pub fn take(selector: Selector) -> Self {
        Self::new(OperationKind::Take, selector)
    }

    /// Update template for a packet
    ///
    /// Fails with `InvalidOperation` when the packet carries no uid.
    pub fn update(
        packet: EntryPacket,
        source: UpdateSource,
        lease: Option<Duration>,
    ) -> Result<Self> {
        let Some(uid) = packet.uid.clone() else {
            return Err(SpaceError::InvalidOperation(format!(
                "update of a {} packet without a uid",
                packet.type_name
            )));
        };
        let mut template = Self::new(OperationKind::Update, Selector::ByUid(uid));
        template.payload = TemplatePayload::Replace {
            packet,
            source,
            lease,
        };
        Ok(template)
    }

    /// Change template
    pub fn change(selector: Selector, changes: ChangeSet, lease: Option<Duration>) -> Self {
        let mut template = Self::new(OperationKind::Change, selector);
        template.payload = TemplatePayload::Change { changes, lease };
        template
    }

    /// Bind to a transaction
    pub fn with_xtn(mut self, xtn: XtnId) -> Self {
        self.xtn = Some(xtn);
        self
    }

    /// Optionally bind to a transaction
    pub fn with_optional_xtn(mut self, xtn: Option<XtnId>) -> Self {
        self.xtn = xtn;
        self
    }

    /// Set the blocking timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set modifiers
    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Pin an MVCC snapshot for a historical read
    pub fn at_snapshot(mut self, state: GenerationState) -> Self {
        self.historical = Some(state);
        self
    }

    /// Apply normalization rules
    ///
    /// Transactional reads with `exclusive_read_lock` become `ReadExclusive`.
    pub fn normalized(mut self) -> Self {
        if self.modifiers.exclusive_read_lock
            && self.xtn.is_some()
            && matches!(self.kind, OperationKind::Read | OperationKind::ReadIfExists)
        {
            self.kind = OperationKind::ReadExclusive;
        }
        self
    }

    /// Whether the template is a FIFO template
    pub fn is_fifo(&self) -> bool {
        self.modifiers.fifo
    }

    /// Dirty-read or read-committed isolation requested
    pub fn has_isolation_override(&self) -> bool {
        self.modifiers.dirty_read || self.modifiers.read_committed
    }

    /// Whether the caller is willing to block
    pub fn may_block(&self) -> bool {
        !self.timeout.is_zero()
    }
}
