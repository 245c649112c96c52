//! Inheritance graph
//!
//! Lazily discovered (class, parents) edges, filled from the repository
//! federation on first use and cached forever. Member lookups that miss on
//! the static owner climb this graph depth-first.

use crate::repo::ClassRepoFederation;
use dashmap::DashMap;
use remora_classfile::{access, Hierarchy, OBJECT};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::debug;

/// Class → direct parents (superclass first, then interfaces)
pub struct InheritanceGraph {
    federation: Arc<ClassRepoFederation>,
    parents: DashMap<String, Arc<[String]>>,
}

impl InheritanceGraph {
    pub fn new(federation: Arc<ClassRepoFederation>) -> Self {
        Self {
            federation,
            parents: DashMap::new(),
        }
    }

    /// The federation edges are discovered from
    pub fn federation(&self) -> &Arc<ClassRepoFederation> {
        &self.federation
    }

    /// Record the parents of a class, replacing anything cached
    pub fn record(&self, class: &str, parents: Vec<String>) {
        self.parents.insert(class.to_string(), Arc::from(parents));
    }

    /// Direct parents of a class
    ///
    /// An unknown class has no parents; that answer is cached like any other
    /// until [`record`](Self::record) replaces it.
    pub fn parents_of(&self, class: &str) -> Arc<[String]> {
        if let Some(entry) = self.parents.get(class) {
            return entry.value().clone();
        }
        let discovered: Arc<[String]> = match self.federation.find_class(class) {
            Some(descriptor) => Arc::from(descriptor.parents()),
            None => Arc::from(Vec::new()),
        };
        self.parents
            .entry(class.to_string())
            .or_insert(discovered)
            .value()
            .clone()
    }

    /// Whether the structure of a class is known
    pub fn is_known(&self, class: &str) -> bool {
        !self.parents_of(class).is_empty() || self.federation.find_class(class).is_some()
    }

    /// Whether a class is an interface; `None` when the class is unknown
    pub fn is_interface(&self, class: &str) -> Option<bool> {
        self.federation.find_class(class).map(|d| d.is_interface())
    }

    /// Number of classes with cached edges
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Look a member up on `owner`, then on its ancestors
    ///
    /// Ancestors are searched depth-first in declaration order and the first
    /// hit wins. Private and static members never climb; `None` access means
    /// unknown and does. Each class is looked up at most once per call.
    pub fn climb(
        &self,
        owner: &str,
        access_flags: Option<u16>,
        mut lookup: impl FnMut(&str) -> Option<String>,
    ) -> Option<(String, String)> {
        if let Some(mapped) = lookup(owner) {
            return Some((owner.to_string(), mapped));
        }
        if access_flags.map_or(false, |flags| flags & (access::PRIVATE | access::STATIC) != 0) {
            return None;
        }
        let mut visited = FxHashSet::default();
        visited.insert(owner.to_string());
        self.climb_parents(owner, &mut visited, &mut lookup)
    }

    fn climb_parents(
        &self,
        class: &str,
        visited: &mut FxHashSet<String>,
        lookup: &mut dyn FnMut(&str) -> Option<String>,
    ) -> Option<(String, String)> {
        for parent in self.parents_of(class).iter() {
            if !visited.insert(parent.clone()) {
                continue;
            }
            if let Some(mapped) = lookup(parent) {
                return Some((parent.clone(), mapped));
            }
            if let Some(found) = self.climb_parents(parent, visited, lookup) {
                return Some(found);
            }
        }
        None
    }

    /// All ancestors of a class, including itself
    pub fn ancestors(&self, class: &str) -> FxHashSet<String> {
        let mut seen = FxHashSet::default();
        let mut stack = vec![class.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            stack.extend(self.parents_of(&current).iter().cloned());
        }
        seen
    }

    /// Closest common superclass of two classes
    pub fn common_super_class(&self, a: &str, b: &str) -> String {
        if a == b {
            return a.to_string();
        }
        let ancestors_b = self.ancestors(b);
        if ancestors_b.contains(a) {
            return a.to_string();
        }
        if self.ancestors(a).contains(b) {
            return b.to_string();
        }
        if self.is_interface(a) == Some(true) || self.is_interface(b) == Some(true) {
            return OBJECT.to_string();
        }

        let mut visited = FxHashSet::default();
        let mut current = a.to_string();
        loop {
            let parents = self.parents_of(&current);
            match parents.first() {
                Some(parent) if visited.insert(parent.clone()) => {
                    if ancestors_b.contains(parent) {
                        return parent.clone();
                    }
                    current = parent.clone();
                }
                _ => {
                    if current != OBJECT {
                        debug!(class = %current, merging = %b, "superclass chain unresolved, merging to Object");
                    }
                    return OBJECT.to_string();
                }
            }
        }
    }
}

impl Hierarchy for InheritanceGraph {
    fn common_super_class(&self, a: &str, b: &str) -> String {
        InheritanceGraph::common_super_class(self, a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Namespace;
    use crate::platform::PlatformRepo;
    use crate::repo::{ClassDescriptor, MemberDescriptor};

    fn descriptor(name: &str, super_name: Option<&str>, interfaces: &[&str], flags: u16) -> ClassDescriptor {
        ClassDescriptor {
            name: name.to_string(),
            access: flags,
            super_name: super_name.map(str::to_string),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            fields: Vec::new(),
            methods: vec![MemberDescriptor::new("run", "()V", access::PUBLIC)],
        }
    }

    fn graph(classes: Vec<ClassDescriptor>) -> InheritanceGraph {
        let federation = Arc::new(ClassRepoFederation::new());
        for class in classes {
            federation.runtime().insert(class);
        }
        InheritanceGraph::new(federation)
    }

    #[test]
    fn test_parents_discovered_and_cached() {
        let graph = graph(vec![descriptor("a/C", Some("a/B"), &["a/I"], access::PUBLIC)]);
        assert_eq!(&*graph.parents_of("a/C"), &["a/B".to_string(), "a/I".to_string()]);
        assert!(graph.parents_of("a/Unknown").is_empty());
        assert_eq!(graph.len(), 2);
        assert!(graph.is_known("a/C"));
        assert!(!graph.is_known("a/Unknown"));
        assert!(graph.is_known(OBJECT));
    }

    #[test]
    fn test_record_replaces_negative_entry() {
        let graph = graph(Vec::new());
        assert!(graph.parents_of("a/Late").is_empty());
        graph.record("a/Late", vec![OBJECT.to_string()]);
        assert_eq!(&*graph.parents_of("a/Late"), &[OBJECT.to_string()]);
    }

    #[test]
    fn test_climb_first_hit_in_declaration_order() {
        let graph = graph(vec![
            descriptor("a/C", Some("a/B"), &["a/I"], access::PUBLIC),
            descriptor("a/B", Some("a/A"), &[], access::PUBLIC),
            descriptor("a/A", Some(OBJECT), &[], access::PUBLIC),
            descriptor("a/I", None, &[], access::PUBLIC | access::INTERFACE),
        ]);
        let hit = graph.climb("a/C", None, |class| match class {
            "a/A" => Some("fromA".to_string()),
            "a/I" => Some("fromI".to_string()),
            _ => None,
        });
        // Superclass chain is exhausted before the interface
        assert_eq!(hit, Some(("a/A".to_string(), "fromA".to_string())));
    }

    #[test]
    fn test_climb_exact_owner_first() {
        let graph = graph(vec![descriptor("a/C", Some("a/B"), &[], access::PUBLIC)]);
        let hit = graph.climb("a/C", Some(access::PRIVATE), |_| Some("x".to_string()));
        assert_eq!(hit, Some(("a/C".to_string(), "x".to_string())));
    }

    #[test]
    fn test_climb_disabled_for_private_and_static() {
        let graph = graph(vec![descriptor("a/C", Some("a/B"), &[], access::PUBLIC)]);
        let lookup = |class: &str| (class == "a/B").then(|| "found".to_string());
        assert!(graph.climb("a/C", Some(access::PRIVATE), lookup).is_none());
        assert!(graph.climb("a/C", Some(access::STATIC), lookup).is_none());
        assert!(graph.climb("a/C", Some(access::PUBLIC), lookup).is_some());
        assert!(graph.climb("a/C", None, lookup).is_some());
    }

    #[test]
    fn test_climb_visits_each_class_once() {
        let graph = graph(vec![
            descriptor("a/D", Some("a/B"), &["a/J"], access::PUBLIC),
            descriptor("a/B", Some("a/A"), &[], access::PUBLIC),
            descriptor("a/J", None, &["a/K"], access::INTERFACE),
            descriptor("a/K", None, &[], access::INTERFACE),
            descriptor("a/A", Some("a/D"), &["a/K"], access::PUBLIC),
        ]);
        let mut lookups = Vec::new();
        let hit = graph.climb("a/D", None, |class| {
            lookups.push(class.to_string());
            None
        });
        assert!(hit.is_none());
        let unique: FxHashSet<&String> = lookups.iter().collect();
        assert_eq!(unique.len(), lookups.len());
        assert_eq!(lookups, vec!["a/D", "a/B", "a/A", "a/K", "a/J"]);
    }

    #[test]
    fn test_ancestors_reflexive() {
        let graph = graph(vec![
            descriptor("a/C", Some("a/B"), &["a/I"], access::PUBLIC),
            descriptor("a/B", Some(OBJECT), &[], access::PUBLIC),
        ]);
        let ancestors = graph.ancestors("a/C");
        for name in ["a/C", "a/B", "a/I", OBJECT] {
            assert!(ancestors.contains(name), "missing {}", name);
        }
        assert_eq!(ancestors.len(), 4);
    }

    #[test]
    fn test_common_super_class() {
        let graph = graph(vec![
            descriptor("a/Base", Some(OBJECT), &[], access::PUBLIC),
            descriptor("a/Left", Some("a/Base"), &[], access::PUBLIC),
            descriptor("a/Right", Some("a/Base"), &["a/I"], access::PUBLIC),
            descriptor("a/Deep", Some("a/Left"), &[], access::PUBLIC),
            descriptor("a/I", Some(OBJECT), &[], access::PUBLIC | access::INTERFACE),
        ]);
        assert_eq!(graph.common_super_class("a/Deep", "a/Right"), "a/Base");
        assert_eq!(graph.common_super_class("a/Left", "a/Deep"), "a/Left");
        assert_eq!(graph.common_super_class("a/Deep", "a/Left"), "a/Left");
        assert_eq!(graph.common_super_class("a/Right", "a/I"), "a/I");
        assert_eq!(graph.common_super_class("a/Left", "a/I"), OBJECT);
        assert_eq!(graph.common_super_class("a/Left", "x/Unknown"), OBJECT);
    }

    #[test]
    fn test_common_super_class_of_platform_exceptions() {
        let federation = Arc::new(ClassRepoFederation::new());
        federation.set_platform(Arc::new(PlatformRepo::new(Namespace::new("a/"))));
        federation.runtime().insert(descriptor(
            "a/ModIoError",
            Some("java/io/IOException"),
            &[],
            access::PUBLIC,
        ));
        let graph = InheritanceGraph::new(federation);

        assert_eq!(
            graph.common_super_class("java/io/FileNotFoundException", "java/io/EOFException"),
            "java/io/IOException"
        );
        assert_eq!(
            graph.common_super_class("a/ModIoError", "java/io/EOFException"),
            "java/io/IOException"
        );
        assert_eq!(
            graph.common_super_class("a/ModIoError", "java/lang/IllegalStateException"),
            "java/lang/Exception"
        );
        assert_eq!(
            graph.common_super_class("java/lang/NullPointerException", "java/lang/AssertionError"),
            "java/lang/Throwable"
        );
        assert!(graph.is_known("java/io/IOException"));
    }

    #[test]
    fn test_common_super_class_cycle_terminates() {
        let graph = graph(vec![
            descriptor("a/P", Some("a/Q"), &[], access::PUBLIC),
            descriptor("a/Q", Some("a/P"), &[], access::PUBLIC),
        ]);
        assert_eq!(graph.common_super_class("a/P", "x/Other"), OBJECT);
    }
}
