//! Before/after operation hooks

use std::sync::Arc;
use tracing::warn;

use gridspace_core::{FilterContext, OperationFilter, OperationKind, Result, SpaceError};

/// Ordered list of registered filters
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn OperationFilter>>,
}

impl FilterChain {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter
    pub fn push(&mut self, filter: Arc<dyn OperationFilter>) {
        self.filters.push(filter);
    }

    /// Number of filters
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether no filter is registered
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run every before-hook; the first failure aborts the operation
    pub fn before(&self, op: OperationKind, ctx: &FilterContext<'_>) -> Result<()> {
        for filter in &self.filters {
            filter.before(op, ctx).map_err(|err| match err {
                SpaceError::FilterRejected { .. } => err,
                other => SpaceError::FilterRejected {
                    operation: op.to_string(),
                    reason: other.to_string(),
                },
            })?;
        }
        Ok(())
    }

    /// Run every after-hook; failures are logged and swallowed
    pub fn after(&self, op: OperationKind, ctx: &FilterContext<'_>) {
        for filter in &self.filters {
            if let Err(err) = filter.after(op, ctx) {
                warn!(op = ?op, error = %err, "after-filter failed, ignoring");
            }
        }
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}
