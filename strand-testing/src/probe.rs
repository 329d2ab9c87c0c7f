//! Records which execution context a callback ran on.

use parking_lot::Mutex;
use std::sync::Arc;
use strand_core::{ContextId, current_context};

/// Shared log of the current context at each call to [`record`](Self::record).
#[derive(Clone, Debug, Default)]
pub struct ContextProbe {
    observations: Arc<Mutex<Vec<Option<ContextId>>>>,
}

impl ContextProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the calling thread's current context.
    pub fn record(&self) {
        self.observations.lock().push(current_context());
    }

    pub fn hits(&self) -> usize {
        self.observations.lock().len()
    }

    pub fn observations(&self) -> Vec<Option<ContextId>> {
        self.observations.lock().clone()
    }

    /// The context seen by the first hit, if any.
    pub fn first(&self) -> Option<ContextId> {
        self.observations.lock().first().copied().flatten()
    }

    /// True when every hit ran on the same, bound context.
    pub fn is_consistent(&self) -> bool {
        let observations = self.observations.lock();
        match observations.first() {
            Some(Some(first)) => observations.iter().all(|seen| *seen == Some(*first)),
            _ => false,
        }
    }

    /// True when there was at least one hit and every hit ran on `context`.
    pub fn all_on(&self, context: ContextId) -> bool {
        self.is_consistent() && self.first() == Some(context)
    }
}
