//! Name mapping table
//!
//! A [`NameMapping`] translates class, field and method names in one
//! direction. A [`MappingTable`] pairs the internal→public mapping with its
//! public→internal counterpart. Both are immutable once built and shared
//! behind an `Arc`.

use crate::config::Direction;
use remora_classfile::{map_field_descriptor, map_method_descriptor, map_signature, DescriptorError};
use rustc_hash::FxHashMap;

/// Member names keyed by owner, then by `"name"` or `"name descriptor"`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberMap {
    owners: FxHashMap<String, FxHashMap<String, String>>,
}

impl MemberMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapping, replacing any previous one for the same key
    pub fn insert(&mut self, owner: &str, key: &str, mapped: &str) {
        self.owners
            .entry(owner.to_string())
            .or_default()
            .insert(key.to_string(), mapped.to_string());
    }

    /// Look up a key on an exact owner
    pub fn get(&self, owner: &str, key: &str) -> Option<&str> {
        self.owners.get(owner)?.get(key).map(String::as_str)
    }

    /// Whether any member of `owner` is mapped
    pub fn has_owner(&self, owner: &str) -> bool {
        self.owners.contains_key(owner)
    }

    /// Number of keys across all owners
    pub fn len(&self) -> usize {
        self.owners.values().map(|keys| keys.len()).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate `(owner, key, mapped)`
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.owners.iter().flat_map(|(owner, keys)| {
            keys.iter()
                .map(move |(key, mapped)| (owner.as_str(), key.as_str(), mapped.as_str()))
        })
    }
}

/// Key of a member with a descriptor
pub fn member_key(name: &str, descriptor: &str) -> String {
    format!("{} {}", name, descriptor)
}

/// One direction of the mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameMapping {
    classes: FxHashMap<String, String>,
    packages: FxHashMap<String, String>,
    fields: MemberMap,
    methods: MemberMap,
}

impl NameMapping {
    /// Create an empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a class
    pub fn add_class(&mut self, from: &str, to: &str) {
        self.classes.insert(from.to_string(), to.to_string());
    }

    /// Map a package; both sides end in `/`, e.g. `a/b/` to `org/pub/`
    pub fn add_package(&mut self, from: &str, to: &str) {
        self.packages.insert(package_key(from), package_key(to));
    }

    /// Map a field
    ///
    /// With a descriptor the field is keyed both with and without it, so
    /// lookups that only know the name still find it.
    pub fn add_field(&mut self, owner: &str, name: &str, descriptor: Option<&str>, mapped: &str) {
        if let Some(descriptor) = descriptor {
            self.fields.insert(owner, &member_key(name, descriptor), mapped);
        }
        self.fields.insert(owner, name, mapped);
    }

    /// Map a method
    pub fn add_method(&mut self, owner: &str, name: &str, descriptor: &str, mapped: &str) {
        self.methods.insert(owner, &member_key(name, descriptor), mapped);
    }

    /// Exact class lookup
    pub fn map_class(&self, name: &str) -> Option<&str> {
        self.classes.get(name).map(String::as_str)
    }

    /// Translate a class name
    ///
    /// Tries the class map, then the outer class of a nested class, then the
    /// package map. Array names are mapped through their element type.
    pub fn map_type(&self, name: &str) -> String {
        if name.starts_with('[') {
            return map_field_descriptor(name, &mut |n| self.map_type(n)).unwrap_or_else(|_| name.to_string());
        }
        if let Some(mapped) = self.classes.get(name) {
            return mapped.clone();
        }
        if let Some((outer, inner)) = name.rsplit_once('$') {
            let mapped_outer = self.map_type(outer);
            if mapped_outer != outer {
                return format!("{}${}", mapped_outer, inner);
            }
        }
        if let Some((package, simple)) = name.rsplit_once('/') {
            if let Some(mapped) = self.packages.get(&package_key(package)) {
                return format!("{}{}", mapped, simple);
            }
        }
        name.to_string()
    }

    /// Exact field lookup: `"name descriptor"` first, then `"name"`
    pub fn map_field(&self, owner: &str, name: &str, descriptor: &str) -> Option<&str> {
        self.fields
            .get(owner, &member_key(name, descriptor))
            .or_else(|| self.fields.get(owner, name))
    }

    /// Exact method lookup
    pub fn map_method(&self, owner: &str, name: &str, descriptor: &str) -> Option<&str> {
        self.methods.get(owner, &member_key(name, descriptor))
    }

    /// Translate a field descriptor
    pub fn map_descriptor(&self, descriptor: &str) -> Result<String, DescriptorError> {
        map_field_descriptor(descriptor, &mut |n| self.map_type(n))
    }

    /// Translate a method descriptor
    pub fn map_method_descriptor(&self, descriptor: &str) -> Result<String, DescriptorError> {
        map_method_descriptor(descriptor, &mut |n| self.map_type(n))
    }

    /// Translate a generic signature
    pub fn map_signature(&self, signature: &str) -> Result<String, DescriptorError> {
        map_signature(signature, &mut |n| self.map_type(n))
    }

    /// Mapped field entries
    pub fn fields(&self) -> &MemberMap {
        &self.fields
    }

    /// Mapped method entries
    pub fn methods(&self) -> &MemberMap {
        &self.methods
    }

    /// Number of mapped classes
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Build the opposite direction
    ///
    /// Member keys are re-expressed in the target scheme: owners and
    /// descriptors are translated through this mapping. Overloads that
    /// collapse onto one target name keep the last one seen.
    pub fn invert(&self) -> NameMapping {
        let mut inverse = NameMapping::new();
        for (from, to) in &self.classes {
            inverse.classes.insert(to.clone(), from.clone());
        }
        for (from, to) in &self.packages {
            inverse.packages.insert(to.clone(), from.clone());
        }
        for (owner, key, mapped) in self.fields.iter() {
            let owner = self.map_type(owner);
            match key.split_once(' ') {
                Some((name, descriptor)) => {
                    let descriptor = self.map_descriptor(descriptor).unwrap_or_else(|_| descriptor.to_string());
                    inverse.fields.insert(&owner, &member_key(mapped, &descriptor), name);
                }
                None => inverse.fields.insert(&owner, mapped, key),
            }
        }
        for (owner, key, mapped) in self.methods.iter() {
            let Some((name, descriptor)) = key.split_once(' ') else {
                continue;
            };
            let owner = self.map_type(owner);
            let descriptor = self
                .map_method_descriptor(descriptor)
                .unwrap_or_else(|_| descriptor.to_string());
            inverse.methods.insert(&owner, &member_key(mapped, &descriptor), name);
        }
        inverse
    }
}

fn package_key(package: &str) -> String {
    if package.ends_with('/') {
        package.to_string()
    } else {
        format!("{}/", package)
    }
}

/// Both directions of the mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    to_public: NameMapping,
    to_internal: NameMapping,
}

impl MappingTable {
    /// Build a table from the internal→public mapping, deriving the inverse
    pub fn new(to_public: NameMapping) -> Self {
        let to_internal = to_public.invert();
        Self { to_public, to_internal }
    }

    /// Build a table from both directions
    pub fn with_inverse(to_public: NameMapping, to_internal: NameMapping) -> Self {
        Self { to_public, to_internal }
    }

    /// Internal→public mapping
    pub fn to_public(&self) -> &NameMapping {
        &self.to_public
    }

    /// Public→internal mapping
    pub fn to_internal(&self) -> &NameMapping {
        &self.to_internal
    }

    /// Mapping for a direction
    pub fn mapping(&self, direction: Direction) -> &NameMapping {
        match direction {
            Direction::ToPublic => &self.to_public,
            Direction::ToInternal => &self.to_internal,
        }
    }

    /// Public name of an internal class
    pub fn map_class_name(&self, internal: &str) -> String {
        self.to_public.map_type(internal)
    }

    /// Translate a member name with an exact lookup on `owner`
    ///
    /// A descriptor starting with `(` names a method, anything else a field.
    /// Unmapped members keep their name.
    pub fn map_member_name(&self, owner: &str, name: &str, descriptor: &str, direction: Direction) -> String {
        let mapping = self.mapping(direction);
        let mapped = if descriptor.starts_with('(') {
            mapping.map_method(owner, name, descriptor)
        } else {
            mapping.map_field(owner, name, descriptor)
        };
        mapped.unwrap_or(name).to_string()
    }
}
