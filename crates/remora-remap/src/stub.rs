//! Stub synthesis for missing internal classes
//!
//! A reference to an internal class that no repository knows (typically a
//! class that only exists on the other side of a client/server split) is
//! satisfied with an empty placeholder. Recovery is bounded: a call chain
//! synthesizes each name at most once and a second miss on the same name is
//! fatal.

use crate::config::Namespace;
use crate::error::RemapError;
use crate::inheritance::InheritanceGraph;
use crate::repo::{ClassDescriptor, ClassRepo, ClassRepoFederation};
use parking_lot::Mutex;
use remora_classfile::{empty_class, OBJECT};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

/// Errors reported by a [`ClassDefiner`]
#[derive(Debug, Error)]
pub enum DefineError {
    /// The host already has a class with this name
    #[error("Class already defined: {0}")]
    AlreadyDefined(String),

    /// The host rejected the class
    #[error("Failed to define {name}: {reason}")]
    Failed { name: String, reason: String },
}

/// Host hook that makes generated classes loadable
pub trait ClassDefiner: Send + Sync {
    fn define_class(&self, name: &str, bytes: &[u8]) -> Result<(), DefineError>;
}

/// Define a class, treating "already defined" as success
pub(crate) fn define_once(definer: &dyn ClassDefiner, name: &str, bytes: &[u8]) -> Result<(), DefineError> {
    match definer.define_class(name, bytes) {
        Ok(()) | Err(DefineError::AlreadyDefined(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Builds and registers placeholder classes
pub struct StubSynthesizer {
    namespace: Namespace,
    federation: Arc<ClassRepoFederation>,
    graph: Arc<InheritanceGraph>,
    definer: Option<Arc<dyn ClassDefiner>>,
    synthesized: Mutex<Vec<String>>,
}

impl StubSynthesizer {
    pub fn new(
        namespace: Namespace,
        graph: Arc<InheritanceGraph>,
        definer: Option<Arc<dyn ClassDefiner>>,
    ) -> Self {
        Self {
            namespace,
            federation: graph.federation().clone(),
            graph,
            definer,
            synthesized: Mutex::new(Vec::new()),
        }
    }

    /// Satisfy a missing class with a stub
    ///
    /// Names outside the internal namespace are [`RemapError::Unresolvable`].
    /// Synthesizing a name twice returns the registered stub. The stub is
    /// published to the runtime repository only after the host accepted it,
    /// so a failed definition leaves nothing behind and can be retried.
    pub fn synthesize(&self, name: &str) -> Result<Arc<ClassDescriptor>, RemapError> {
        if !self.namespace.is_internal(name) || name.starts_with('[') {
            return Err(RemapError::Unresolvable(name.to_string()));
        }
        let runtime = self.federation.runtime();
        if let Some(existing) = runtime.find_class(name) {
            trace!(class = name, "stub already registered");
            return Ok(existing);
        }

        let bytes = empty_class(name, OBJECT).map_err(|e| RemapError::malformed(name, e))?;
        let descriptor = ClassDescriptor::parse(&bytes).map_err(|e| RemapError::malformed(name, e))?;
        if let Some(definer) = &self.definer {
            define_once(definer.as_ref(), name, &bytes)?;
        }

        let (stored, inserted) = runtime.insert_if_absent(descriptor);
        if !inserted {
            trace!(class = name, "stub registered concurrently");
            return Ok(stored);
        }
        warn!(class = name, "loading client-side class");
        runtime.attach_bytes(name, &bytes);
        self.graph.record(name, stored.parents());
        self.synthesized.lock().push(name.to_string());
        Ok(stored)
    }

    /// Names synthesized so far, in order
    pub fn synthesized(&self) -> Vec<String> {
        self.synthesized.lock().clone()
    }
}

/// Retry state of one call chain
#[derive(Debug, Default)]
pub struct Recovery {
    attempted: FxHashSet<String>,
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recover from a missing class, at most once per name
    pub fn recover(&mut self, name: &str, stubs: &StubSynthesizer) -> Result<(), RemapError> {
        if !self.attempted.insert(name.to_string()) {
            return Err(RemapError::Unresolvable(name.to_string()));
        }
        stubs.synthesize(name).map(|_| ())
    }

    /// Run an operation, synthesizing stubs for missing classes until it
    /// succeeds or fails for another reason
    pub fn run<T>(
        &mut self,
        stubs: &StubSynthesizer,
        mut operation: impl FnMut() -> Result<T, RemapError>,
    ) -> Result<T, RemapError> {
        loop {
            match operation() {
                Err(RemapError::MissingClass(name)) => self.recover(&name, stubs)?,
                result => return result,
            }
        }
    }

    /// Names recovered in this chain
    pub fn attempted(&self) -> usize {
        self.attempted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDefiner {
        defined: Mutex<FxHashSet<String>>,
        calls: AtomicUsize,
    }

    impl ClassDefiner for CountingDefiner {
        fn define_class(&self, name: &str, _bytes: &[u8]) -> Result<(), DefineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.defined.lock().insert(name.to_string()) {
                Ok(())
            } else {
                Err(DefineError::AlreadyDefined(name.to_string()))
            }
        }
    }

    /// Rejects the first definition of every class
    #[derive(Default)]
    struct FlakyDefiner {
        calls: AtomicUsize,
    }

    impl ClassDefiner for FlakyDefiner {
        fn define_class(&self, name: &str, _bytes: &[u8]) -> Result<(), DefineError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DefineError::Failed {
                    name: name.to_string(),
                    reason: "host busy".to_string(),
                });
            }
            Ok(())
        }
    }

    fn synthesizer(definer: Option<Arc<dyn ClassDefiner>>) -> StubSynthesizer {
        let federation = Arc::new(ClassRepoFederation::new());
        let graph = Arc::new(InheritanceGraph::new(federation));
        StubSynthesizer::new(Namespace::new("a/b/"), graph, definer)
    }

    #[test]
    fn test_synthesize_registers_stub() {
        let stubs = synthesizer(None);
        let stub = stubs.synthesize("a/b/ClientOnly").unwrap();
        assert_eq!(stub.name, "a/b/ClientOnly");
        assert_eq!(stub.super_name.as_deref(), Some(OBJECT));
        assert!(stub.fields.is_empty() && stub.methods.is_empty());

        let runtime = stubs.federation.runtime();
        assert!(runtime.contains("a/b/ClientOnly"));
        assert!(runtime.bytes_of("a/b/ClientOnly").is_some());
        assert_eq!(&*stubs.graph.parents_of("a/b/ClientOnly"), &[OBJECT.to_string()]);
    }

    #[test]
    fn test_synthesize_is_idempotent() {
        let definer = Arc::new(CountingDefiner::default());
        let stubs = synthesizer(Some(definer.clone()));
        let first = stubs.synthesize("a/b/ClientOnly").unwrap();
        let second = stubs.synthesize("a/b/ClientOnly").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(stubs.synthesized(), vec!["a/b/ClientOnly".to_string()]);
        assert_eq!(definer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stubs.federation.runtime().len(), 1);
    }

    #[test]
    fn test_already_defined_is_success() {
        let definer = Arc::new(CountingDefiner::default());
        definer.defined.lock().insert("a/b/Host".to_string());
        let stubs = synthesizer(Some(definer));
        assert!(stubs.synthesize("a/b/Host").is_ok());
    }

    #[test]
    fn test_failed_define_publishes_nothing() {
        let definer = Arc::new(FlakyDefiner::default());
        let stubs = synthesizer(Some(definer.clone()));

        let err = stubs.synthesize("a/b/ClientOnly").unwrap_err();
        assert!(matches!(err, RemapError::Define(DefineError::Failed { .. })));
        let runtime = stubs.federation.runtime();
        assert!(!runtime.contains("a/b/ClientOnly"));
        assert!(runtime.bytes_of("a/b/ClientOnly").is_none());
        assert!(stubs.synthesized().is_empty());

        // a later attempt defines the class for real
        stubs.synthesize("a/b/ClientOnly").unwrap();
        assert_eq!(definer.calls.load(Ordering::SeqCst), 2);
        assert!(runtime.contains("a/b/ClientOnly"));
        assert_eq!(stubs.synthesized(), vec!["a/b/ClientOnly".to_string()]);
    }

    #[test]
    fn test_outside_namespace_is_unresolvable() {
        let stubs = synthesizer(None);
        let err = stubs.synthesize("com/external/Lib").unwrap_err();
        assert!(matches!(err, RemapError::Unresolvable(name) if name == "com/external/Lib"));
        assert!(stubs.synthesized().is_empty());
    }

    #[test]
    fn test_recovery_retries_until_success() {
        let stubs = synthesizer(None);
        let mut recovery = Recovery::new();
        let mut attempts = 0;
        let result = recovery.run(&stubs, || {
            attempts += 1;
            match attempts {
                1 => Err(RemapError::MissingClass("a/b/One".to_string())),
                2 => Err(RemapError::MissingClass("a/b/Two".to_string())),
                _ => Ok(attempts),
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(recovery.attempted(), 2);
    }

    #[test]
    fn test_recovery_second_miss_is_fatal() {
        let stubs = synthesizer(None);
        let mut recovery = Recovery::new();
        let result: Result<(), _> =
            recovery.run(&stubs, || Err(RemapError::MissingClass("a/b/Ghost".to_string())));
        assert!(matches!(result, Err(RemapError::Unresolvable(name)) if name == "a/b/Ghost"));
    }

    #[test]
    fn test_recovery_passes_other_errors_through() {
        let stubs = synthesizer(None);
        let mut recovery = Recovery::new();
        let result: Result<(), _> = recovery.run(&stubs, || Err(RemapError::Unresolvable("x".to_string())));
        assert!(matches!(result, Err(RemapError::Unresolvable(_))));
        assert_eq!(recovery.attempted(), 0);
    }
}
