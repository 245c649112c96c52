//! Reflection bridge
//!
//! Dependent code written against public names calls reflection with public
//! names, but the classes it reflects on were loaded with internal ones. Each
//! engine generates one bridge class from a template: a set of static native
//! methods standing in for the reflective calls. The host binds those natives
//! to [`ReflectionBridge`], which finds its engine through a process-wide
//! registry keyed by the generated class name.

use crate::cache::MemberHandle;
use crate::error::RemapError;
use crate::inheritance::InheritanceGraph;
use crate::remapper::Remapper;
use crate::rewriter::{substitute, ClassRename, Failure};
use crate::stub::{define_once, ClassDefiner, DefineError};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use remora_classfile::{access, ClassBuilder, ClassFile, ClassFileError, MemberRef, OBJECT};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::debug;

/// Errors raised while building or reaching a bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The template source has no such class
    #[error("Bridge template not found: {0}")]
    TemplateNotFound(String),

    /// The template is not a usable class file
    #[error("Malformed bridge template {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: ClassFileError,
    },

    /// Renaming the template failed
    #[error("Failed to relink bridge {name}: {reason}")]
    Relink { name: String, reason: String },

    /// The host refused the generated class
    #[error("Failed to define bridge {name}: {source}")]
    Define {
        name: String,
        #[source]
        source: DefineError,
    },

    /// No live engine owns this bridge
    #[error("No engine registered for bridge {0}")]
    NotRegistered(String),
}

/// A reflective call routed through the bridge
pub(crate) struct Redirect {
    pub owner: &'static str,
    pub name: &'static str,
    pub descriptor: &'static str,
    pub is_static: bool,
    pub bridge_method: &'static str,
}

impl Redirect {
    /// Descriptor of the bridge method; the receiver becomes the first argument
    pub(crate) fn bridge_descriptor(&self) -> String {
        if self.is_static {
            self.descriptor.to_string()
        } else {
            format!("(L{};{}", self.owner, &self.descriptor[1..])
        }
    }

    pub(crate) fn matches(&self, member: &MemberRef<'_>, is_static: bool) -> bool {
        self.is_static == is_static
            && member.owner == self.owner
            && member.name == self.name
            && member.descriptor == self.descriptor
    }
}

const CLASS: &str = "java/lang/Class";
const FIELD: &str = "java/lang/reflect/Field";
const METHOD: &str = "java/lang/reflect/Method";

pub(crate) const REDIRECTS: &[Redirect] = &[
    Redirect {
        owner: CLASS,
        name: "getField",
        descriptor: "(Ljava/lang/String;)Ljava/lang/reflect/Field;",
        is_static: false,
        bridge_method: "getField",
    },
    Redirect {
        owner: CLASS,
        name: "getDeclaredField",
        descriptor: "(Ljava/lang/String;)Ljava/lang/reflect/Field;",
        is_static: false,
        bridge_method: "getDeclaredField",
    },
    Redirect {
        owner: CLASS,
        name: "getMethod",
        descriptor: "(Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;",
        is_static: false,
        bridge_method: "getMethod",
    },
    Redirect {
        owner: CLASS,
        name: "getDeclaredMethod",
        descriptor: "(Ljava/lang/String;[Ljava/lang/Class;)Ljava/lang/reflect/Method;",
        is_static: false,
        bridge_method: "getDeclaredMethod",
    },
    Redirect {
        owner: CLASS,
        name: "forName",
        descriptor: "(Ljava/lang/String;)Ljava/lang/Class;",
        is_static: true,
        bridge_method: "forName",
    },
    Redirect {
        owner: FIELD,
        name: "getName",
        descriptor: "()Ljava/lang/String;",
        is_static: false,
        bridge_method: "getFieldName",
    },
    Redirect {
        owner: METHOD,
        name: "getName",
        descriptor: "()Ljava/lang/String;",
        is_static: false,
        bridge_method: "getMethodName",
    },
];

/// Supplies the bridge template class
pub trait TemplateSource: Send + Sync {
    fn template(&self, name: &str) -> Result<Vec<u8>, BridgeError>;
}

/// Template built in memory: one static native method per redirect
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTemplate;

impl TemplateSource for BuiltinTemplate {
    fn template(&self, name: &str) -> Result<Vec<u8>, BridgeError> {
        let mut builder = ClassBuilder::new(name, Some(OBJECT), access::PUBLIC | access::FINAL | access::SUPER);
        for redirect in REDIRECTS {
            builder.add_method(
                access::PUBLIC | access::STATIC | access::NATIVE,
                redirect.bridge_method,
                &redirect.bridge_descriptor(),
            );
        }
        builder.build().map_err(|source| BridgeError::Template {
            name: name.to_string(),
            source,
        })
    }
}

static BRIDGE_COUNTER: AtomicUsize = AtomicUsize::new(0);

static REGISTRY: Lazy<DashMap<String, Weak<Remapper>>> = Lazy::new(DashMap::new);

/// A generated bridge class
#[derive(Debug, Clone)]
pub struct GeneratedBridge {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Build, define and register a fresh bridge from `template`
pub(crate) fn generate(
    source: &dyn TemplateSource,
    template: &str,
    definer: Option<&dyn ClassDefiner>,
    graph: &InheritanceGraph,
) -> Result<GeneratedBridge, BridgeError> {
    let bytes = source.template(template)?;
    let malformed = |source: ClassFileError| BridgeError::Template {
        name: template.to_string(),
        source,
    };
    let mut class = ClassFile::decode(&bytes).map_err(malformed)?;
    if class.name().map_err(|e| malformed(e.into()))? != template {
        return Err(BridgeError::TemplateNotFound(template.to_string()));
    }

    let name = format!("{}_{}", template, BRIDGE_COUNTER.fetch_add(1, Ordering::Relaxed));
    substitute(&mut class, &ClassRename { from: template, to: &name }).map_err(|failure| match failure {
        Failure::Class(source) => BridgeError::Template {
            name: template.to_string(),
            source,
        },
        Failure::Remap(err) => BridgeError::Relink {
            name: name.clone(),
            reason: err.to_string(),
        },
    })?;
    let bytes = class.encode().map_err(malformed)?;

    if let Some(definer) = definer {
        define_once(definer, &name, &bytes).map_err(|source| BridgeError::Define {
            name: name.clone(),
            source,
        })?;
    }
    let descriptor = graph
        .federation()
        .runtime()
        .put_bytes(&bytes)
        .map_err(malformed)?;
    graph.record(&name, descriptor.parents());
    debug!(bridge = %name, "generated reflection bridge");
    Ok(GeneratedBridge { name, bytes })
}

pub(crate) fn register(name: &str, remapper: &Arc<Remapper>) {
    REGISTRY.insert(name.to_string(), Arc::downgrade(remapper));
}

pub(crate) fn unregister(name: &str) {
    REGISTRY.remove(name);
}

/// Host-side implementation of the bridge natives
///
/// Lookups take public names and answer with internal ones; name queries
/// take internal members and answer with public names.
#[derive(Clone)]
pub struct ReflectionBridge {
    remapper: Arc<Remapper>,
}

impl ReflectionBridge {
    /// Find the engine owning a generated bridge class
    pub fn lookup(bridge: &str) -> Result<Self, BridgeError> {
        REGISTRY
            .get(bridge)
            .and_then(|entry| entry.value().upgrade())
            .map(|remapper| Self { remapper })
            .ok_or_else(|| BridgeError::NotRegistered(bridge.to_string()))
    }

    pub fn remapper(&self) -> &Arc<Remapper> {
        &self.remapper
    }

    /// `Class.getField`: internal name of a public field
    pub fn get_field(&self, class: &str, public_name: &str) -> Result<String, RemapError> {
        self.remapper.cache().field_to_internal(class, public_name)
    }

    /// `Class.getDeclaredField`: internal name of a declared field
    pub fn get_declared_field(&self, class: &str, public_name: &str) -> Result<String, RemapError> {
        self.remapper.cache().declared_field_to_internal(class, public_name)
    }

    /// `Class.getMethod`: the method with this public name and parameters
    ///
    /// `None` means the caller's own lookup applies unchanged.
    pub fn get_method(&self, class: &str, public_name: &str, params: &str) -> Result<Option<MemberHandle>, RemapError> {
        self.remapper.cache().translate_member_lookup(class, public_name, params)
    }

    /// `Class.getDeclaredMethod`: like [`get_method`](Self::get_method) but
    /// only for methods the class declares itself
    pub fn get_declared_method(
        &self,
        class: &str,
        public_name: &str,
        params: &str,
    ) -> Result<Option<MemberHandle>, RemapError> {
        if !self.remapper.namespace().is_internal(class) {
            return Ok(None);
        }
        Ok(self
            .remapper
            .cache()
            .method_table(class)?
            .method(public_name, params)
            .filter(|method| method.owner == class)
            .cloned())
    }

    /// `Class.forName`: binary name (dotted) of the internal class
    pub fn class_for_name(&self, name: &str) -> String {
        let internal = name.replace('.', "/");
        self.remapper.mapping().to_internal().map_type(&internal).replace('/', ".")
    }

    /// `Field.getName`: public name of an internal field
    pub fn field_name(&self, class: &str, field: &MemberHandle) -> Result<String, RemapError> {
        self.remapper.cache().field_to_public(class, field)
    }

    /// `Method.getName`: public name of an internal method
    pub fn method_name(&self, class: &str, method: &MemberHandle) -> Result<String, RemapError> {
        self.remapper.cache().translate_member_name(class, method)
    }

    /// Every method of the class with its public name
    pub fn methods(&self, class: &str) -> Result<Vec<(MemberHandle, String)>, RemapError> {
        let table = self.remapper.cache().method_table(class)?;
        let mut methods: Vec<_> = table
            .iter()
            .map(|(method, name)| (method.clone(), name.to_string()))
            .collect();
        methods.sort_by(|a, b| (&a.1, &a.0.descriptor).cmp(&(&b.1, &b.0.descriptor)));
        Ok(methods)
    }
}
