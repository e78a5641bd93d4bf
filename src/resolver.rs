//! Turns selectors into resources.

use crate::descriptor::{ExecutionDescriptor, Selector};
use crate::directory::ResourceDirectory;
use crate::error::MeshError;
use crate::resource::Resource;

/// How many targets the caller is prepared to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Interactive "run one": a label must match exactly one resource.
    Single,
    /// Batch fan-out: every match is a target.
    Many,
}

/// Read-only view over a directory. Resolution never locks or reserves a resource, and the
/// returned resources are owned snapshots.
pub struct TargetResolver<'a> {
    directory: &'a ResourceDirectory,
}

impl<'a> TargetResolver<'a> {
    pub fn new(directory: &'a ResourceDirectory) -> Self {
        Self { directory }
    }

    /// Resolves a descriptor to exactly one resource.
    pub fn resolve(&self, descriptor: &ExecutionDescriptor) -> Result<Resource, MeshError> {
        let mut matches = self.resolve_with(descriptor, Cardinality::Single)?;
        // `Single` guarantees exactly one match on success.
        Ok(matches.remove(0))
    }

    /// Resolves a descriptor to every resource it selects. Never returns an empty vector.
    pub fn resolve_all(&self, descriptor: &ExecutionDescriptor) -> Result<Vec<Resource>, MeshError> {
        self.resolve_with(descriptor, Cardinality::Many)
    }

    pub fn resolve_with(
        &self,
        descriptor: &ExecutionDescriptor,
        cardinality: Cardinality,
    ) -> Result<Vec<Resource>, MeshError> {
        let selector = descriptor.selector();
        let matches = self.directory.lookup(selector);
        if matches.is_empty() {
            return Err(MeshError::NotFound(selector.to_string()));
        }
        match (selector, cardinality) {
            (Selector::Label(label), Cardinality::Single) if matches.len() > 1 => {
                Err(MeshError::AmbiguousTarget {
                    label: label.clone(),
                    matches: matches.into_iter().map(|r| r.name).collect(),
                })
            }
            _ => Ok(matches),
        }
    }
}
