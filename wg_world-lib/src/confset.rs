use std::sync::Arc;

use thiserror::Error;

use crate::exec::Runner;
use crate::primitive::{self, Primitive};

#[derive(Debug, Error)]
pub enum Error {
    #[error("transaction already applied")]
    AlreadyApplied,
    #[error("transaction not applied")]
    NotApplied,
    #[error("primitive failed to apply: {0}")]
    Apply(#[source] primitive::Error),
    #[error("teardown completed with {failed} failures, first: {first}")]
    Teardown { failed: usize, first: primitive::Error },
}

/// Ordered, all-or-nothing group of primitives.
///
/// Application walks forward and rolls back already-applied primitives in
/// reverse on the first failure; teardown walks the strict reverse and is
/// best-effort, surfacing failures only after the full traversal.
#[derive(Debug, Default)]
pub struct ConfSet {
    items: Vec<Primitive>,
    applied: bool,
}

impl ConfSet {
    pub fn new() -> Self {
        ConfSet::default()
    }

    pub fn append(&mut self, primitive: Primitive) {
        self.items.push(primitive);
    }

    /// Used for address sets so they exist before any rule referencing them.
    pub fn prepend(&mut self, primitive: Primitive) {
        self.items.insert(0, primitive);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn render(&self) -> Vec<String> {
        self.items.iter().flat_map(Primitive::render).collect()
    }

    pub fn apply(&mut self, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        if self.applied {
            return Err(Error::AlreadyApplied);
        }
        for i in 0..self.items.len() {
            if let Err(e) = self.items[i].apply(runner) {
                tracing::error!(error = %e, kind = self.items[i].kind(), "apply failed, rolling back");
                for j in (0..i).rev() {
                    if let Err(re) = self.items[j].revert(runner) {
                        tracing::warn!(error = %re, kind = self.items[j].kind(), "rollback revert failed");
                    }
                }
                return Err(Error::Apply(e));
            }
        }
        self.applied = true;
        Ok(())
    }

    pub fn revert(&mut self, runner: &Arc<dyn Runner>) -> Result<(), Error> {
        if !self.applied {
            return Err(Error::NotApplied);
        }
        self.applied = false;
        let mut failures = Vec::new();
        for primitive in self.items.iter_mut().rev() {
            if let Err(e) = primitive.revert(runner) {
                tracing::warn!(error = %e, kind = primitive.kind(), "revert failed");
                failures.push(e);
            }
        }
        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(Error::Teardown { failed, first }),
        }
    }
}
