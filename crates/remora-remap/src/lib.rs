//! Class-file symbol remapping
//!
//! Translates compiled classes between an internal naming scheme and a
//! public one: classes, fields and methods are renamed through a
//! [`MappingTable`], inherited members are resolved over an
//! [`InheritanceGraph`] built from pluggable repositories, missing internal
//! classes are replaced by stubs, and reflective lookups are routed through
//! a generated bridge class.
//!
//! ```text
//! let remapper = Remapper::builder(config, table)
//!     .repo(classpath_repo(Path::new("libs/deps.jar"))?)
//!     .build()?;
//! let public_bytes = remapper.rewrite(&internal_bytes)?;
//! ```

#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod cache;
pub mod config;
pub mod dump;
pub mod error;
pub mod inheritance;
pub mod mapping;
pub mod platform;
pub mod remapper;
pub mod repo;
mod rewriter;
pub mod srg;
pub mod stub;
pub mod transform;

pub use bridge::{BridgeError, BuiltinTemplate, ReflectionBridge, TemplateSource};
pub use cache::{IntrospectError, MemberCache, MemberHandle, MemberIntrospector, StructuralIntrospector};
pub use config::{ConfigError, Direction, Namespace, RemapConfig};
pub use error::RemapError;
pub use inheritance::InheritanceGraph;
pub use mapping::{MappingTable, NameMapping};
pub use remapper::{CodeSource, Connection, Remapper, RemapperBuilder};
pub use platform::PlatformRepo;
pub use repo::{
    classpath_repo, ClassDescriptor, ClassRepo, ClassRepoFederation, DirectoryRepo, JarRepo, MemoryRepo,
};
pub use srg::MappingError;
pub use stub::{ClassDefiner, DefineError, Recovery, StubSynthesizer};
pub use transform::{ReflectionRedirect, Transformer, TransformerChain};
