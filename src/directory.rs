//! The in-memory resource directory.
//!
//! Entries live in an insertion-ordered vector behind an `Arc`. Mutations build a new vector and
//! swap it in under the write lock, so a reader always holds a whole snapshot: either the state
//! before a mutation or the one after it.

use std::sync::{Arc, PoisonError, RwLock};

use crate::descriptor::Selector;
use crate::error::MeshError;
use crate::resource::{ConnectionSpec, Resource};

#[derive(Debug, Default)]
pub struct ResourceDirectory {
    entries: RwLock<Arc<Vec<Resource>>>,
}

impl ResourceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a directory from already validated resources, e.g. the output of a store load.
    /// Later duplicates overwrite earlier ones.
    pub fn from_resources(resources: impl IntoIterator<Item = Resource>) -> Self {
        let directory = Self::new();
        directory.update(|entries| {
            for resource in resources {
                upsert(entries, resource);
            }
        });
        directory
    }

    /// Inserts a resource or overwrites the one with the same name, keeping its position.
    pub fn put(&self, name: impl Into<String>, spec: ConnectionSpec) -> Result<(), MeshError> {
        let resource = spec.into_resource(name.into())?;
        tracing::debug!(resource = %resource.name, kind = %resource.kind(), "put resource");
        self.update(|entries| upsert(entries, resource));
        Ok(())
    }

    /// Removes a resource, returning it. Absent names are reported as `NotFound`.
    pub fn remove(&self, name: &str) -> Result<Resource, MeshError> {
        let mut removed = None;
        self.update(|entries| {
            if let Some(position) = entries.iter().position(|r| r.name == name) {
                removed = Some(entries.remove(position));
            }
        });
        match removed {
            Some(resource) => {
                tracing::debug!(resource = %name, "removed resource");
                Ok(resource)
            }
            None => Err(MeshError::NotFound(name.to_owned())),
        }
    }

    /// Lazily walks all resources in insertion order.
    ///
    /// The walk is over the snapshot taken at call time and is not affected by later mutations.
    pub fn list(&self) -> Listing {
        Listing {
            snapshot: self.snapshot(),
            position: 0,
        }
    }

    /// Returns every resource the selector matches, in insertion order.
    /// A name selector yields at most one resource.
    pub fn lookup(&self, selector: &Selector) -> Vec<Resource> {
        let snapshot = self.snapshot();
        match selector {
            Selector::Name(name) => snapshot
                .iter()
                .find(|r| r.name == *name)
                .cloned()
                .into_iter()
                .collect(),
            Selector::Label(label) => snapshot
                .iter()
                .filter(|r| r.has_label(label))
                .cloned()
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Resource> {
        self.snapshot().iter().find(|r| r.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn snapshot(&self) -> Arc<Vec<Resource>> {
        // Writers never leave a half-built vector behind, so a poisoned lock is still consistent.
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update(&self, mutate: impl FnOnce(&mut Vec<Resource>)) {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&guard);
        mutate(&mut next);
        *guard = Arc::new(next);
    }
}

fn upsert(entries: &mut Vec<Resource>, resource: Resource) {
    match entries.iter_mut().find(|r| r.name == resource.name) {
        Some(existing) => *existing = resource,
        None => entries.push(resource),
    }
}

/// Iterator returned by [`ResourceDirectory::list`].
#[derive(Debug)]
pub struct Listing {
    snapshot: Arc<Vec<Resource>>,
    position: usize,
}

impl Iterator for Listing {
    type Item = Resource;

    fn next(&mut self) -> Option<Resource> {
        let item = self.snapshot.get(self.position).cloned();
        self.position += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.snapshot.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Listing {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Kind;

    fn remote(labels: &[&str]) -> ConnectionSpec {
        ConnectionSpec {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            kind: Kind::Remote,
            username: Some("ubuntu".to_string()),
            ..Default::default()
        }
    }

    fn names(resources: impl IntoIterator<Item = Resource>) -> Vec<String> {
        resources.into_iter().map(|r| r.name).collect()
    }

    #[test]
    fn test_list_keeps_insertion_order() {
        let directory = ResourceDirectory::new();
        for name in ["c", "a", "b"] {
            directory.put(name, ConnectionSpec::default()).unwrap();
        }
        assert_eq!(names(directory.list()), vec!["c", "a", "b"]);
        assert_eq!(names(directory.list()), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_overwrite_keeps_position() {
        let directory = ResourceDirectory::new();
        directory.put("a", ConnectionSpec::default()).unwrap();
        directory.put("b", ConnectionSpec::default()).unwrap();
        directory.put("a", remote(&["prod"])).unwrap();
        assert_eq!(names(directory.list()), vec!["a", "b"]);
        assert_eq!(directory.get("a").unwrap().kind(), Kind::Remote);
    }

    #[test]
    fn test_put_rejects_remote_without_credentials() {
        let directory = ResourceDirectory::new();
        let spec = ConnectionSpec {
            kind: Kind::Remote,
            ..Default::default()
        };
        assert!(matches!(
            directory.put("web1", spec),
            Err(MeshError::InvalidDescriptor(_))
        ));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_remove_absent_is_not_found() {
        let directory = ResourceDirectory::new();
        assert!(matches!(
            directory.remove("ghost"),
            Err(MeshError::NotFound(name)) if name == "ghost"
        ));
    }

    #[test]
    fn test_lookup_by_label_returns_all_matches() {
        let directory = ResourceDirectory::new();
        directory.put("web1", remote(&["prod"])).unwrap();
        directory.put("db1", remote(&["staging"])).unwrap();
        directory.put("web2", remote(&["prod", "web"])).unwrap();
        let matches = directory.lookup(&Selector::Label("prod".to_string()));
        assert_eq!(names(matches), vec!["web1", "web2"]);
        assert!(directory
            .lookup(&Selector::Label("none".to_string()))
            .is_empty());
    }

    #[test]
    fn test_lookup_by_name_is_stable() {
        let directory = ResourceDirectory::new();
        directory.put("web1", remote(&["prod"])).unwrap();
        let selector = Selector::Name("web1".to_string());
        assert_eq!(directory.lookup(&selector), directory.lookup(&selector));
        assert_eq!(directory.lookup(&selector).len(), 1);
    }

    #[test]
    fn test_listing_is_unaffected_by_later_mutation() {
        let directory = ResourceDirectory::new();
        directory.put("a", ConnectionSpec::default()).unwrap();
        directory.put("b", ConnectionSpec::default()).unwrap();
        let listing = directory.list();
        directory.remove("a").unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(names(listing), vec!["a", "b"]);
        assert_eq!(names(directory.list()), vec!["b"]);
    }

    #[test]
    fn test_concurrent_readers_see_whole_states() {
        let directory = Arc::new(ResourceDirectory::new());
        let writer = {
            let directory = Arc::clone(&directory);
            std::thread::spawn(move || {
                for i in 0..200 {
                    directory
                        .put(format!("r{}", i), ConnectionSpec::default())
                        .unwrap();
                }
            })
        };
        let mut last = 0;
        while last < 200 {
            let seen = directory.list().count();
            // Entries are only ever appended here, so the count can't go backwards.
            assert!(seen >= last);
            last = seen;
            std::thread::yield_now();
        }
        writer.join().unwrap();
    }
}
