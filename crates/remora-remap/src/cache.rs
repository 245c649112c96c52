//! Member resolution cache
//!
//! Reflection from dependent code asks for members by their public names.
//! For every class in (or inheriting from) the internal namespace the cache
//! holds a field table and a method table translating between the internal
//! members and their public names. Tables are built once, outside any lock,
//! and the first published table is what every caller sees.

use crate::config::Namespace;
use crate::error::RemapError;
use crate::inheritance::InheritanceGraph;
use crate::mapping::MappingTable;
use crate::repo::{ClassDescriptor, ClassRepoFederation, MemberDescriptor};
use crate::stub::{Recovery, StubSynthesizer};
use dashmap::DashMap;
use remora_classfile::{FieldType, MethodDescriptor};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while enumerating members
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntrospectError {
    /// A class needed to describe a member cannot be found
    #[error("Missing class: {0}")]
    MissingClass(String),
}

impl From<IntrospectError> for RemapError {
    fn from(err: IntrospectError) -> Self {
        match err {
            IntrospectError::MissingClass(name) => RemapError::MissingClass(name),
        }
    }
}

/// A concrete field or method of a loaded class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberHandle {
    /// Declaring class
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub access: u16,
}

impl MemberHandle {
    pub fn new(owner: &str, member: &MemberDescriptor) -> Self {
        Self {
            owner: owner.to_string(),
            name: member.name.clone(),
            descriptor: member.descriptor.clone(),
            access: member.access,
        }
    }

    pub fn is_method(&self) -> bool {
        self.descriptor.starts_with('(')
    }

    /// Parameter part of a method descriptor, e.g. `(IJ)`
    pub fn params(&self) -> &str {
        match self.descriptor.find(')') {
            Some(end) => &self.descriptor[..=end],
            None => "",
        }
    }
}

/// Member enumeration, the reflective view of a class
pub trait MemberIntrospector: Send + Sync {
    /// Public fields of the class and its ancestors
    fn public_fields(&self, class: &str) -> Result<Vec<MemberHandle>, IntrospectError>;
    /// Fields declared by the class itself
    fn declared_fields(&self, class: &str) -> Result<Vec<MemberHandle>, IntrospectError>;
    /// Public methods of the class and its ancestors, most derived first
    fn public_methods(&self, class: &str) -> Result<Vec<MemberHandle>, IntrospectError>;
    /// Methods declared by the class itself
    fn declared_methods(&self, class: &str) -> Result<Vec<MemberHandle>, IntrospectError>;
}

/// Introspector reading member lists from the repository federation
///
/// Like a class loader linking a class, it needs every class named in a
/// member's descriptor; a name that is neither known nor a platform class
/// is reported as missing.
pub struct StructuralIntrospector {
    federation: Arc<ClassRepoFederation>,
    namespace: Namespace,
}

#[derive(Clone, Copy)]
enum MemberKind {
    Field,
    Method,
}

impl StructuralIntrospector {
    pub fn new(federation: Arc<ClassRepoFederation>, namespace: Namespace) -> Self {
        Self { federation, namespace }
    }

    fn resolve(&self, class: &str) -> Result<Option<Arc<ClassDescriptor>>, IntrospectError> {
        match self.federation.find_class(class) {
            Some(descriptor) => Ok(Some(descriptor)),
            None if self.namespace.is_platform(class) => Ok(None),
            None => Err(IntrospectError::MissingClass(class.to_string())),
        }
    }

    fn check_types(&self, descriptor: &str) -> Result<(), IntrospectError> {
        let mut names = Vec::new();
        if descriptor.starts_with('(') {
            if let Ok(method) = MethodDescriptor::parse(descriptor) {
                method.params.iter().chain(method.ret.iter()).for_each(|t| class_names(t, &mut names));
            }
        } else if let Ok(field) = FieldType::parse(descriptor) {
            class_names(&field, &mut names);
        }
        for name in names {
            self.resolve(&name)?;
        }
        Ok(())
    }

    fn members(&self, class: &ClassDescriptor, kind: MemberKind) -> Result<Vec<MemberHandle>, IntrospectError> {
        let list = match kind {
            MemberKind::Field => &class.fields,
            MemberKind::Method => &class.methods,
        };
        let mut handles = Vec::with_capacity(list.len());
        for member in list.iter().filter(|m| !m.name.starts_with('<')) {
            self.check_types(&member.descriptor)?;
            handles.push(MemberHandle::new(&class.name, member));
        }
        Ok(handles)
    }

    fn declared(&self, class: &str, kind: MemberKind) -> Result<Vec<MemberHandle>, IntrospectError> {
        match self.resolve(class)? {
            Some(descriptor) => self.members(&descriptor, kind),
            None => Ok(Vec::new()),
        }
    }

    fn public(&self, class: &str, kind: MemberKind) -> Result<Vec<MemberHandle>, IntrospectError> {
        let mut result = Vec::new();
        let mut signatures = FxHashSet::default();
        let mut visited = FxHashSet::default();
        let mut pending = vec![class.to_string()];
        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(descriptor) = self.resolve(&current)? else {
                continue;
            };
            for member in self.members(&descriptor, kind)? {
                if member.access & remora_classfile::access::PUBLIC == 0 {
                    continue;
                }
                // Overridden methods are reported once, most derived first
                if matches!(kind, MemberKind::Method)
                    && !signatures.insert((member.name.clone(), member.descriptor.clone()))
                {
                    continue;
                }
                result.push(member);
            }
            // Reverse so the superclass is popped first
            pending.extend(descriptor.parents().into_iter().rev());
        }
        Ok(result)
    }
}

fn class_names(field_type: &FieldType, out: &mut Vec<String>) {
    match field_type {
        FieldType::Object(name) => out.push(name.clone()),
        FieldType::Array(element) => class_names(element, out),
        _ => {}
    }
}

impl MemberIntrospector for StructuralIntrospector {
    fn public_fields(&self, class: &str) -> Result<Vec<MemberHandle>, IntrospectError> {
        self.public(class, MemberKind::Field)
    }

    fn declared_fields(&self, class: &str) -> Result<Vec<MemberHandle>, IntrospectError> {
        self.declared(class, MemberKind::Field)
    }

    fn public_methods(&self, class: &str) -> Result<Vec<MemberHandle>, IntrospectError> {
        self.public(class, MemberKind::Method)
    }

    fn declared_methods(&self, class: &str) -> Result<Vec<MemberHandle>, IntrospectError> {
        self.declared(class, MemberKind::Method)
    }
}

/// Field translations of one class
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FieldTable {
    to_public: FxHashMap<MemberHandle, String>,
    by_public: FxHashMap<String, MemberHandle>,
}

impl FieldTable {
    /// Public name of a field
    pub fn public_name(&self, field: &MemberHandle) -> Option<&str> {
        self.to_public.get(field).map(String::as_str)
    }

    /// Field with a public name
    pub fn field(&self, public_name: &str) -> Option<&MemberHandle> {
        self.by_public.get(public_name)
    }

    pub fn len(&self) -> usize {
        self.to_public.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_public.is_empty()
    }
}

/// Method translations of one class
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MethodTable {
    to_public: FxHashMap<MemberHandle, String>,
    by_signature: FxHashMap<(String, String), MemberHandle>,
}

impl MethodTable {
    /// Public name of a method
    pub fn public_name(&self, method: &MemberHandle) -> Option<&str> {
        self.to_public.get(method).map(String::as_str)
    }

    /// Method with a public name and parameter descriptor such as `(I)`
    pub fn method(&self, public_name: &str, params: &str) -> Option<&MemberHandle> {
        self.by_signature
            .get(&(public_name.to_string(), params.to_string()))
    }

    /// Iterate `(method, public name)`
    pub fn iter(&self) -> impl Iterator<Item = (&MemberHandle, &str)> {
        self.to_public.iter().map(|(m, name)| (m, name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.to_public.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_public.is_empty()
    }
}

/// Per-class member translation tables
pub struct MemberCache {
    mapping: Arc<MappingTable>,
    graph: Arc<InheritanceGraph>,
    namespace: Namespace,
    introspector: Arc<dyn MemberIntrospector>,
    stubs: Arc<StubSynthesizer>,
    needs_remap: DashMap<String, bool>,
    fields: DashMap<String, Arc<FieldTable>>,
    methods: DashMap<String, Arc<MethodTable>>,
}

impl MemberCache {
    pub fn new(
        mapping: Arc<MappingTable>,
        graph: Arc<InheritanceGraph>,
        namespace: Namespace,
        introspector: Arc<dyn MemberIntrospector>,
        stubs: Arc<StubSynthesizer>,
    ) -> Self {
        Self {
            mapping,
            graph,
            namespace,
            introspector,
            stubs,
            needs_remap: DashMap::new(),
            fields: DashMap::new(),
            methods: DashMap::new(),
        }
    }

    /// Whether the class or any ancestor is in the internal namespace
    pub fn needs_remap(&self, class: &str) -> bool {
        if let Some(entry) = self.needs_remap.get(class) {
            return *entry.value();
        }
        let computed = self
            .graph
            .ancestors(class)
            .iter()
            .any(|ancestor| self.namespace.is_internal(ancestor));
        *self.needs_remap.entry(class.to_string()).or_insert(computed).value()
    }

    /// Field table of a class, built on first use
    pub fn field_table(&self, class: &str) -> Result<Arc<FieldTable>, RemapError> {
        if let Some(entry) = self.fields.get(class) {
            return Ok(entry.value().clone());
        }
        let built = Arc::new(Recovery::new().run(&self.stubs, || self.build_field_table(class))?);
        Ok(self
            .fields
            .entry(class.to_string())
            .or_insert(built)
            .value()
            .clone())
    }

    /// Method table of a class, built on first use
    pub fn method_table(&self, class: &str) -> Result<Arc<MethodTable>, RemapError> {
        if let Some(entry) = self.methods.get(class) {
            return Ok(entry.value().clone());
        }
        let built = Arc::new(Recovery::new().run(&self.stubs, || self.build_method_table(class))?);
        Ok(self
            .methods
            .entry(class.to_string())
            .or_insert(built)
            .value()
            .clone())
    }

    fn public_field_name(&self, field: &MemberHandle) -> String {
        let to_public = self.mapping.to_public();
        self.graph
            .climb(&field.owner, Some(field.access), |owner| {
                to_public
                    .map_field(owner, &field.name, &field.descriptor)
                    .map(str::to_string)
            })
            .map(|(_, mapped)| mapped)
            .unwrap_or_else(|| field.name.clone())
    }

    fn public_method_name(&self, method: &MemberHandle) -> String {
        let to_public = self.mapping.to_public();
        self.graph
            .climb(&method.owner, Some(method.access), |owner| {
                to_public
                    .map_method(owner, &method.name, &method.descriptor)
                    .map(str::to_string)
            })
            .map(|(_, mapped)| mapped)
            .unwrap_or_else(|| method.name.clone())
    }

    fn build_field_table(&self, class: &str) -> Result<FieldTable, RemapError> {
        let mut table = FieldTable::default();
        let public = self.introspector.public_fields(class)?;
        let declared = self.introspector.declared_fields(class)?;
        // Declared fields come last so they win a public-name collision
        for field in public.into_iter().chain(declared) {
            let name = self.public_field_name(&field);
            table.by_public.insert(name.clone(), field.clone());
            table.to_public.insert(field, name);
        }
        Ok(table)
    }

    fn build_method_table(&self, class: &str) -> Result<MethodTable, RemapError> {
        let mut table = MethodTable::default();
        let public = self.introspector.public_methods(class)?;
        let declared = self.introspector.declared_methods(class)?;
        for method in public.into_iter().chain(declared) {
            let name = self.public_method_name(&method);
            table
                .by_signature
                .insert((name.clone(), method.params().to_string()), method.clone());
            table.to_public.insert(method, name);
        }
        Ok(table)
    }

    /// Number of published field tables
    pub fn cached_field_tables(&self) -> usize {
        self.fields.len()
    }

    /// Number of published method tables
    pub fn cached_method_tables(&self) -> usize {
        self.methods.len()
    }

    /// Method of `class` with the given public name and parameters
    ///
    /// `None` when the class needs no remapping (the caller's own lookup
    /// applies) or no such method exists.
    pub fn translate_member_lookup(
        &self,
        class: &str,
        public_name: &str,
        params: &str,
    ) -> Result<Option<MemberHandle>, RemapError> {
        if !self.needs_remap(class) {
            return Ok(None);
        }
        Ok(self.method_table(class)?.method(public_name, params).cloned())
    }

    /// Public name of a member of `class`
    pub fn translate_member_name(&self, class: &str, member: &MemberHandle) -> Result<String, RemapError> {
        if !self.needs_remap(class) {
            return Ok(member.name.clone());
        }
        let name = if member.is_method() {
            self.method_table(class)?.public_name(member).map(str::to_string)
        } else {
            self.field_table(class)?.public_name(member).map(str::to_string)
        };
        Ok(name.unwrap_or_else(|| member.name.clone()))
    }

    /// Internal name of a field looked up by public name
    pub fn field_to_internal(&self, class: &str, public_name: &str) -> Result<String, RemapError> {
        if !self.needs_remap(class) {
            return Ok(public_name.to_string());
        }
        self.internal_field_name(class, public_name)
    }

    /// Internal name of a declared field looked up by public name
    ///
    /// Declared lookups only concern the class itself, so only classes in
    /// the internal namespace translate.
    pub fn declared_field_to_internal(&self, class: &str, public_name: &str) -> Result<String, RemapError> {
        if !self.namespace.is_internal(class) {
            return Ok(public_name.to_string());
        }
        self.internal_field_name(class, public_name)
    }

    /// Public name of a field of an internal class
    pub fn field_to_public(&self, class: &str, field: &MemberHandle) -> Result<String, RemapError> {
        if !self.namespace.is_internal(class) {
            return Ok(field.name.clone());
        }
        let table = self.field_table(class)?;
        Ok(table
            .public_name(field)
            .map(str::to_string)
            .unwrap_or_else(|| field.name.clone()))
    }

    fn internal_field_name(&self, class: &str, public_name: &str) -> Result<String, RemapError> {
        let table = self.field_table(class)?;
        Ok(table
            .field(public_name)
            .map(|f| f.name.clone())
            .unwrap_or_else(|| public_name.to_string()))
    }
}
