//! Remapping error taxonomy

use crate::bridge::BridgeError;
use crate::config::ConfigError;
use crate::stub::DefineError;
use remora_classfile::{ClassFileError, FrameError};
use thiserror::Error;

/// Errors raised by the remapping engine
#[derive(Debug, Error)]
pub enum RemapError {
    /// The input is not a well-formed class file
    #[error("Malformed class {name}: {source}")]
    Malformed {
        /// Class name, or `<unknown>` if it could not be read
        name: String,
        #[source]
        source: ClassFileError,
    },

    /// A referenced class cannot be resolved and is outside the internal namespace
    #[error("Unresolvable reference: {0}")]
    Unresolvable(String),

    /// A referenced class is missing (recoverable through stub synthesis)
    #[error("Missing class: {0}")]
    MissingClass(String),

    /// Wrapper produced by the primary surface
    #[error("Class not found: {name}")]
    ClassNotFound {
        name: String,
        #[source]
        source: Box<RemapError>,
    },

    /// Reflection bridge construction failed
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Defining a class in the host failed
    #[error("Define error: {0}")]
    Define(#[from] DefineError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A transformer failed or broke an invariant
    #[error("Transformer {id} failed: {reason}")]
    Transformer { id: String, reason: String },

    /// Frame recomputation failed
    #[error("Frame computation failed for {class}.{method}: {source}")]
    Frames {
        class: String,
        method: String,
        #[source]
        source: FrameError,
    },

    /// The rewritten class no longer fits the class-file format
    #[error("Failed to encode class {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: ClassFileError,
    },

    /// I/O error from a byte supplier
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemapError {
    /// Malformed-input error for a named class
    pub fn malformed(name: impl Into<String>, source: impl Into<ClassFileError>) -> Self {
        RemapError::Malformed {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Whether stub synthesis can recover from this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RemapError::MissingClass(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_classfile::PoolError;
    use std::error::Error;

    #[test]
    fn test_malformed_carries_name_and_cause() {
        let err = RemapError::malformed("a/b/Foo", PoolError::Overflow);
        assert!(err.to_string().contains("a/b/Foo"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_class_not_found_chain() {
        let err = RemapError::ClassNotFound {
            name: "a/b/Foo".to_string(),
            source: Box::new(RemapError::Unresolvable("com/external/Lib".to_string())),
        };
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "Unresolvable reference: com/external/Lib");
    }

    #[test]
    fn test_recoverable() {
        assert!(RemapError::MissingClass("a/X".to_string()).is_recoverable());
        assert!(!RemapError::Unresolvable("a/X".to_string()).is_recoverable());
    }
}
