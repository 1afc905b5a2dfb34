//! Namespace grouping: capsules that share a filesystem prefix end up in
//! the same private dynamic-linker namespace so they can see each other's
//! exports.
//!
//! Registry shape: an `IndexMap` behind a `spin::RwLock`, wrapped in
//! `spin::Lazy`. The "first capsule with a concrete id wins, later ones
//! reuse it" rule mirrors the requirement that every root already be
//! registered before its dependency scope is computed.

use indexmap::IndexMap;
use spin::{Lazy, RwLock};
use std::collections::HashSet;

/// A private-namespace identifier. `New` is the sentinel the resolver's
/// `load` contract uses for "not yet opened under this prefix";
/// `Concrete` is filled in once the first capsule in the prefix is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceId {
    New,
    Concrete(i64),
}

/// One filesystem-prefix's worth of bookkeeping, shared by every capsule
/// registered under it.
pub struct Namespace {
    pub prefix: String,
    pub id: NamespaceId,
    pub exclude: HashSet<String>,
    pub export: HashSet<String>,
}

impl Namespace {
    fn new(prefix: String) -> Self {
        Namespace {
            prefix,
            id: NamespaceId::New,
            exclude: crate::resolver::NEVER_ENCAPSULATED
                .iter()
                .map(|s| s.to_string())
                .collect(),
            export: HashSet::new(),
        }
    }

    /// Merge another capsule's exclude/export lists in, de-duplicating.
    pub fn merge_lists(&mut self, exclude: &[String], export: &[String]) {
        self.exclude.extend(exclude.iter().cloned());
        self.export.extend(export.iter().cloned());
    }
}

struct Registry {
    namespaces: IndexMap<String, Namespace>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    RwLock::new(Registry {
        namespaces: IndexMap::new(),
    })
});

/// Fetch (creating if needed) the namespace for `prefix`, merge in a new
/// capsule's exclude/export lists, and return the namespace id currently
/// in effect — `New` if this is the first capsule registered for the
/// prefix, the already-concrete id of an earlier sibling otherwise.
pub fn register_capsule(prefix: &str, exclude: &[String], export: &[String]) -> NamespaceId {
    let mut registry = REGISTRY.write();
    let ns = registry
        .namespaces
        .entry(prefix.to_string())
        .or_insert_with(|| Namespace::new(prefix.to_string()));
    ns.merge_lists(exclude, export);
    ns.id
}

/// Record the concrete id the loader obtained for `prefix`'s first open, so
/// later capsules sharing the prefix reuse it instead of opening a second
/// private namespace.
pub fn set_concrete_id(prefix: &str, id: i64) {
    let mut registry = REGISTRY.write();
    if let Some(ns) = registry.namespaces.get_mut(prefix) {
        if matches!(ns.id, NamespaceId::New) {
            log::debug!("namespace for {prefix} got concrete id {id}");
            ns.id = NamespaceId::Concrete(id);
        }
    }
}

/// Snapshot of a namespace's merged lists, for callers (comparator,
/// interceptors) that need a read-only view without holding the lock.
pub fn snapshot(prefix: &str) -> Option<(NamespaceId, Vec<String>, Vec<String>)> {
    let registry = REGISTRY.read();
    registry.namespaces.get(prefix).map(|ns| {
        (
            ns.id,
            ns.exclude.iter().cloned().collect(),
            ns.export.iter().cloned().collect(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_prefix(tag: &str) -> String {
        format!("/test/namespace/{tag}")
    }

    #[test]
    fn first_capsule_in_a_prefix_gets_the_new_sentinel() {
        let prefix = unique_prefix("first");
        let id = register_capsule(&prefix, &[], &[]);
        assert_eq!(id, NamespaceId::New);
    }

    #[test]
    fn second_capsule_reuses_the_concrete_id() {
        let prefix = unique_prefix("second");
        register_capsule(&prefix, &[], &[]);
        set_concrete_id(&prefix, 7);
        let id = register_capsule(&prefix, &[], &[]);
        assert_eq!(id, NamespaceId::Concrete(7));
    }

    #[test]
    fn exclude_and_export_lists_merge_without_duplicates() {
        let prefix = unique_prefix("merge");
        register_capsule(&prefix, &["libfoo.so.1".to_string()], &[]);
        register_capsule(
            &prefix,
            &["libfoo.so.1".to_string(), "libbar.so.2".to_string()],
            &["libGL.so.1".to_string()],
        );
        let (_, exclude, export) = snapshot(&prefix).unwrap();
        // two caller-supplied entries, deduplicated, on top of the seeded
        // never-encapsulated family.
        assert_eq!(
            exclude.len(),
            crate::resolver::NEVER_ENCAPSULATED.len() + 2
        );
        assert_eq!(export.len(), 1);
    }

    #[test]
    fn a_fresh_namespace_is_seeded_with_the_never_encapsulated_family() {
        let prefix = unique_prefix("seeded");
        register_capsule(&prefix, &[], &[]);
        let (_, exclude, _) = snapshot(&prefix).unwrap();
        for soname in crate::resolver::NEVER_ENCAPSULATED {
            assert!(exclude.contains(&soname.to_string()));
        }
    }
}
