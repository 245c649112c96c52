//! Symbol substitution over a decoded class file
//!
//! Every class, member and descriptor reference is rewritten in the constant
//! pool without moving any existing entry: class entries are re-pointed at
//! new names, member references get fresh `NameAndType` entries. Code keeps
//! its pool indices, so instructions are never touched. UTF-8 entries may be
//! shared between unrelated uses and are never modified in place.

use crate::error::RemapError;
use remora_classfile::{
    access, decode_attributes, encode_attributes, map_field_descriptor, map_method_descriptor, map_signature,
    AttributeInfo, BytecodeReader, BytecodeWriter, ClassFile, ClassFileError, CodeAttribute, Constant,
    ConstantPool, DecodeError, DescriptorError, FieldType, MemberInfo, MemberKind, MethodDescriptor, PoolError,
};

const LAMBDA_METAFACTORY: &str = "java/lang/invoke/LambdaMetafactory";

/// Access passed for members that are looked up on their exact owner only
const EXACT: Option<u16> = Some(access::PRIVATE);

/// Name translation consulted during substitution
pub(crate) trait SymbolResolver {
    /// Translate a class name (never an array)
    fn map_type(&self, name: &str) -> String;

    /// Translate a field; `Some((declaring class, new name))` when mapped
    fn map_field(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
        access_flags: Option<u16>,
    ) -> Result<Option<(String, String)>, RemapError>;

    /// Translate a method; `Some((declaring class, new name))` when mapped
    fn map_method(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
        access_flags: Option<u16>,
    ) -> Result<Option<(String, String)>, RemapError>;

    /// Whether a class is an interface, if known
    fn is_interface(&self, name: &str) -> Option<bool>;
}

/// Substitution failure: broken input or a resolution error
#[derive(Debug)]
pub(crate) enum Failure {
    Class(ClassFileError),
    Remap(RemapError),
}

impl Failure {
    pub(crate) fn into_remap(self, class: &str) -> RemapError {
        match self {
            Failure::Class(source) => RemapError::malformed(class, source),
            Failure::Remap(err) => err,
        }
    }
}

impl From<ClassFileError> for Failure {
    fn from(err: ClassFileError) -> Self {
        Failure::Class(err)
    }
}

impl From<PoolError> for Failure {
    fn from(err: PoolError) -> Self {
        Failure::Class(err.into())
    }
}

impl From<DecodeError> for Failure {
    fn from(err: DecodeError) -> Self {
        Failure::Class(err.into())
    }
}

impl From<DescriptorError> for Failure {
    fn from(err: DescriptorError) -> Self {
        Failure::Class(err.into())
    }
}

impl From<RemapError> for Failure {
    fn from(err: RemapError) -> Self {
        Failure::Remap(err)
    }
}

/// Renames a single class, used to relink the bridge template
pub(crate) struct ClassRename<'a> {
    pub from: &'a str,
    pub to: &'a str,
}

impl SymbolResolver for ClassRename<'_> {
    fn map_type(&self, name: &str) -> String {
        if name == self.from {
            self.to.to_string()
        } else {
            name.to_string()
        }
    }

    fn map_field(&self, _: &str, _: &str, _: &str, _: Option<u16>) -> Result<Option<(String, String)>, RemapError> {
        Ok(None)
    }

    fn map_method(&self, _: &str, _: &str, _: &str, _: Option<u16>) -> Result<Option<(String, String)>, RemapError> {
        Ok(None)
    }

    fn is_interface(&self, _: &str) -> Option<bool> {
        None
    }
}

struct BootstrapMethod {
    method_ref: u16,
    arguments: Vec<u16>,
}

fn bootstrap_methods(info: &[u8]) -> Result<Vec<BootstrapMethod>, DecodeError> {
    let mut reader = BytecodeReader::new(info);
    let count = reader.read_u16()?;
    let mut methods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let method_ref = reader.read_u16()?;
        let argument_count = reader.read_u16()?;
        let arguments = (0..argument_count)
            .map(|_| reader.read_u16())
            .collect::<Result<Vec<_>, _>>()?;
        methods.push(BootstrapMethod { method_ref, arguments });
    }
    Ok(methods)
}

/// Rewrite every symbolic reference of `class` through `resolver`
pub(crate) fn substitute(class: &mut ClassFile, resolver: &dyn SymbolResolver) -> Result<(), Failure> {
    let original = class.constant_pool.clone();
    let owner = original.class_name(class.this_class)?.to_string();
    let bootstrap = match class.find_attribute("BootstrapMethods") {
        Some(attribute) => bootstrap_methods(&attribute.info)?,
        None => Vec::new(),
    };

    let ClassFile {
        constant_pool,
        fields,
        methods,
        attributes,
        ..
    } = class;
    let mut substitution = Substitution {
        original: &original,
        pool: constant_pool,
        resolver,
        owner: &owner,
    };

    // Class entries first so relocated member owners reuse them
    substitution.class_entries()?;
    substitution.references(&bootstrap)?;
    for field in fields.iter_mut() {
        substitution.field(field)?;
    }
    for method in methods.iter_mut() {
        substitution.method(method)?;
    }
    substitution.attributes(attributes)
}

struct Substitution<'a> {
    /// Snapshot taken before any change; all reads go here
    original: &'a ConstantPool,
    pool: &'a mut ConstantPool,
    resolver: &'a dyn SymbolResolver,
    owner: &'a str,
}

impl<'a> Substitution<'a> {
    fn class_name(&self, name: &str) -> Result<String, DescriptorError> {
        if name.starts_with('[') {
            self.field_descriptor(name)
        } else {
            Ok(self.resolver.map_type(name))
        }
    }

    fn field_descriptor(&self, descriptor: &str) -> Result<String, DescriptorError> {
        let resolver = self.resolver;
        map_field_descriptor(descriptor, &mut |n| resolver.map_type(n))
    }

    fn method_descriptor(&self, descriptor: &str) -> Result<String, DescriptorError> {
        let resolver = self.resolver;
        map_method_descriptor(descriptor, &mut |n| resolver.map_type(n))
    }

    fn signature(&self, signature: &str) -> Result<String, DescriptorError> {
        let resolver = self.resolver;
        map_signature(signature, &mut |n| resolver.map_type(n))
    }

    /// Index of a UTF-8 entry holding `value`, reusing `index` if unchanged
    fn utf8_index(&mut self, index: u16, value: &str) -> Result<u16, PoolError> {
        if self.original.utf8(index)? == value {
            Ok(index)
        } else {
            self.pool.add_utf8(value)
        }
    }

    fn class_entries(&mut self) -> Result<(), Failure> {
        let original = self.original;
        for (index, constant) in original.iter() {
            let Constant::Class { name_index } = constant else {
                continue;
            };
            let name = original.utf8(*name_index)?;
            let mapped = self.class_name(name)?;
            if mapped != name {
                let name_index = self.pool.add_utf8(&mapped)?;
                self.pool.set(index, Constant::Class { name_index })?;
            }
        }
        Ok(())
    }

    fn references(&mut self, bootstrap: &[BootstrapMethod]) -> Result<(), Failure> {
        let original = self.original;
        for (index, constant) in original.iter() {
            match constant {
                Constant::Fieldref { .. } | Constant::Methodref { .. } | Constant::InterfaceMethodref { .. } => {
                    self.member_ref(index)?;
                }
                Constant::MethodType { descriptor_index } => {
                    let descriptor = original.utf8(*descriptor_index)?;
                    let mapped = self.method_descriptor(descriptor)?;
                    if mapped != descriptor {
                        let descriptor_index = self.pool.add_utf8(&mapped)?;
                        self.pool.set(index, Constant::MethodType { descriptor_index })?;
                    }
                }
                Constant::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    let (name, descriptor) = original.name_and_type(*name_and_type_index)?;
                    let mapped_descriptor = self.method_descriptor(descriptor)?;
                    let mapped_name = self
                        .lambda_name(bootstrap.get(*bootstrap_method_attr_index as usize), name, descriptor)?
                        .unwrap_or_else(|| name.to_string());
                    if mapped_name != name || mapped_descriptor != descriptor {
                        let name_and_type_index = self.pool.add_name_and_type(&mapped_name, &mapped_descriptor)?;
                        self.pool.set(
                            index,
                            Constant::InvokeDynamic {
                                bootstrap_method_attr_index: *bootstrap_method_attr_index,
                                name_and_type_index,
                            },
                        )?;
                    }
                }
                Constant::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    let (name, descriptor) = original.name_and_type(*name_and_type_index)?;
                    let mapped = self.field_descriptor(descriptor)?;
                    if mapped != descriptor {
                        let name_and_type_index = self.pool.add_name_and_type(name, &mapped)?;
                        self.pool.set(
                            index,
                            Constant::Dynamic {
                                bootstrap_method_attr_index: *bootstrap_method_attr_index,
                                name_and_type_index,
                            },
                        )?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn member_ref(&mut self, index: u16) -> Result<(), Failure> {
        let original = self.original;
        let member = original.member_ref(index)?;
        let is_field = member.kind == MemberKind::Field;

        // Members of array types (clone, length) are never mapped
        let resolved = if member.owner.starts_with('[') {
            None
        } else if is_field {
            self.resolver
                .map_field(member.owner, member.name, member.descriptor, None)?
        } else {
            self.resolver
                .map_method(member.owner, member.name, member.descriptor, None)?
        };
        let descriptor = if is_field {
            self.field_descriptor(member.descriptor)?
        } else {
            self.method_descriptor(member.descriptor)?
        };

        let mut class_index = member.class_index;
        let mut name = member.name;
        if let Some((declaring, mapped)) = &resolved {
            name = mapped;
            if declaring != member.owner && self.owner_matches(member.kind, declaring) {
                let target = self.class_name(declaring)?;
                class_index = self.pool.add_class(&target)?;
            }
        }

        if name == member.name && descriptor == member.descriptor && class_index == member.class_index {
            return Ok(());
        }
        let name_and_type_index = self.pool.add_name_and_type(name, &descriptor)?;
        let replacement = match member.kind {
            MemberKind::Field => Constant::Fieldref {
                class_index,
                name_and_type_index,
            },
            MemberKind::Method => Constant::Methodref {
                class_index,
                name_and_type_index,
            },
            MemberKind::InterfaceMethod => Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            },
        };
        self.pool.set(index, replacement)?;
        Ok(())
    }

    /// Whether a reference of `kind` may name `declaring` as its owner
    fn owner_matches(&self, kind: MemberKind, declaring: &str) -> bool {
        match kind {
            MemberKind::Field => true,
            MemberKind::Method => self.resolver.is_interface(declaring) == Some(false),
            MemberKind::InterfaceMethod => self.resolver.is_interface(declaring) == Some(true),
        }
    }

    /// Functional method name of a `LambdaMetafactory` call site
    fn lambda_name(
        &self,
        bootstrap: Option<&BootstrapMethod>,
        name: &str,
        descriptor: &str,
    ) -> Result<Option<String>, Failure> {
        let original = self.original;
        let Some(bootstrap) = bootstrap else {
            return Ok(None);
        };
        let Some(Constant::MethodHandle { reference_index, .. }) = original.get(bootstrap.method_ref) else {
            return Ok(None);
        };
        if original.member_ref(*reference_index)?.owner != LAMBDA_METAFACTORY {
            return Ok(None);
        }
        let Some(Constant::MethodType { descriptor_index }) =
            bootstrap.arguments.first().and_then(|&argument| original.get(argument))
        else {
            return Ok(None);
        };
        let Some(FieldType::Object(interface)) = MethodDescriptor::parse(descriptor)?.ret else {
            return Ok(None);
        };
        let functional = original.utf8(*descriptor_index)?;
        Ok(self
            .resolver
            .map_method(&interface, name, functional, None)?
            .map(|(_, mapped)| mapped))
    }

    fn field(&mut self, field: &mut MemberInfo) -> Result<(), Failure> {
        let original = self.original;
        let name = original.utf8(field.name_index)?;
        let descriptor = original.utf8(field.descriptor_index)?;
        if let Some((_, mapped)) = self
            .resolver
            .map_field(self.owner, name, descriptor, Some(field.access_flags))?
        {
            field.name_index = self.utf8_index(field.name_index, &mapped)?;
        }
        let mapped = self.field_descriptor(descriptor)?;
        field.descriptor_index = self.utf8_index(field.descriptor_index, &mapped)?;
        self.attributes(&mut field.attributes)
    }

    fn method(&mut self, method: &mut MemberInfo) -> Result<(), Failure> {
        let original = self.original;
        let name = original.utf8(method.name_index)?;
        let descriptor = original.utf8(method.descriptor_index)?;
        if !name.starts_with('<') {
            if let Some((_, mapped)) = self
                .resolver
                .map_method(self.owner, name, descriptor, Some(method.access_flags))?
            {
                method.name_index = self.utf8_index(method.name_index, &mapped)?;
            }
        }
        let mapped = self.method_descriptor(descriptor)?;
        method.descriptor_index = self.utf8_index(method.descriptor_index, &mapped)?;
        self.attributes(&mut method.attributes)
    }

    fn attributes(&mut self, attributes: &mut [AttributeInfo]) -> Result<(), Failure> {
        let original = self.original;
        for attribute in attributes.iter_mut() {
            let info = &attribute.info;
            let rewritten = match original.utf8(attribute.name_index)? {
                "Signature" => Some(self.stream(info, |s, r, w| s.signature_attribute(r, w))?),
                "LocalVariableTable" => Some(self.stream(info, |s, r, w| s.local_variables(r, w, false))?),
                "LocalVariableTypeTable" => Some(self.stream(info, |s, r, w| s.local_variables(r, w, true))?),
                "InnerClasses" => Some(self.stream(info, |s, r, w| s.inner_classes(r, w))?),
                "EnclosingMethod" => Some(self.stream(info, |s, r, w| s.enclosing_method(r, w))?),
                "Record" => Some(self.stream(info, |s, r, w| s.record(r, w))?),
                "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                    Some(self.stream(info, |s, r, w| s.annotations(r, w))?)
                }
                "RuntimeVisibleParameterAnnotations" | "RuntimeInvisibleParameterAnnotations" => {
                    Some(self.stream(info, |s, r, w| s.parameter_annotations(r, w))?)
                }
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    Some(self.stream(info, |s, r, w| s.type_annotations(r, w))?)
                }
                "AnnotationDefault" => Some(self.stream(info, |s, r, w| s.element_value(r, w))?),
                "Code" => {
                    let mut code = CodeAttribute::decode(info)?;
                    self.attributes(&mut code.attributes)?;
                    Some(code.encode())
                }
                _ => None,
            };
            if let Some(info) = rewritten {
                attribute.info = info;
            }
        }
        Ok(())
    }

    fn stream(
        &mut self,
        info: &[u8],
        rewrite: impl FnOnce(&mut Self, &mut BytecodeReader<'_>, &mut BytecodeWriter) -> Result<(), Failure>,
    ) -> Result<Vec<u8>, Failure> {
        let mut reader = BytecodeReader::new(info);
        let mut writer = BytecodeWriter::with_capacity(info.len());
        rewrite(self, &mut reader, &mut writer)?;
        writer.emit_bytes(reader.read_slice(reader.remaining())?);
        Ok(writer.into_bytes())
    }

    fn signature_attribute(&mut self, r: &mut BytecodeReader<'_>, w: &mut BytecodeWriter) -> Result<(), Failure> {
        let index = r.read_u16()?;
        let mapped = self.signature(self.original.utf8(index)?)?;
        w.emit_u16(self.utf8_index(index, &mapped)?);
        Ok(())
    }

    fn local_variables(
        &mut self,
        r: &mut BytecodeReader<'_>,
        w: &mut BytecodeWriter,
        generic: bool,
    ) -> Result<(), Failure> {
        let original = self.original;
        let count = r.read_u16()?;
        w.emit_u16(count);
        for _ in 0..count {
            // start_pc, length, name_index
            w.emit_bytes(r.read_slice(6)?);
            let index = r.read_u16()?;
            let value = original.utf8(index)?;
            let mapped = if generic {
                self.signature(value)?
            } else {
                self.field_descriptor(value)?
            };
            w.emit_u16(self.utf8_index(index, &mapped)?);
            // slot
            w.emit_u16(r.read_u16()?);
        }
        Ok(())
    }

    fn inner_classes(&mut self, r: &mut BytecodeReader<'_>, w: &mut BytecodeWriter) -> Result<(), Failure> {
        let original = self.original;
        let count = r.read_u16()?;
        w.emit_u16(count);
        for _ in 0..count {
            let inner_info = r.read_u16()?;
            let outer_info = r.read_u16()?;
            let mut inner_name = r.read_u16()?;
            let flags = r.read_u16()?;

            if inner_info != 0 && inner_name != 0 {
                let inner = original.class_name(inner_info)?;
                let mapped = self.class_name(inner)?;
                if mapped != inner {
                    let nested = if outer_info != 0 {
                        let outer = self.class_name(original.class_name(outer_info)?)?;
                        mapped.strip_prefix(outer.as_str()).and_then(|rest| rest.strip_prefix('$'))
                    } else {
                        None
                    };
                    let simple = match nested {
                        Some(simple) => Some(simple.to_string()),
                        // Local classes: only a renamed suffix changes the simple name
                        None if suffix(&mapped) != suffix(inner) => {
                            Some(suffix(&mapped).trim_start_matches(|c: char| c.is_ascii_digit()).to_string())
                        }
                        None => None,
                    };
                    if let Some(simple) = simple.filter(|s| !s.is_empty()) {
                        inner_name = self.utf8_index(inner_name, &simple)?;
                    }
                }
            }

            w.emit_u16(inner_info);
            w.emit_u16(outer_info);
            w.emit_u16(inner_name);
            w.emit_u16(flags);
        }
        Ok(())
    }

    fn enclosing_method(&mut self, r: &mut BytecodeReader<'_>, w: &mut BytecodeWriter) -> Result<(), Failure> {
        let original = self.original;
        let class_index = r.read_u16()?;
        let mut method_index = r.read_u16()?;
        if method_index != 0 {
            let owner = original.class_name(class_index)?;
            let (name, descriptor) = original.name_and_type(method_index)?;
            let mapped_name = if name.starts_with('<') {
                None
            } else {
                self.resolver
                    .map_method(owner, name, descriptor, EXACT)?
                    .map(|(_, mapped)| mapped)
            };
            let mapped_name = mapped_name.as_deref().unwrap_or(name);
            let mapped_descriptor = self.method_descriptor(descriptor)?;
            if mapped_name != name || mapped_descriptor != descriptor {
                method_index = self.pool.add_name_and_type(mapped_name, &mapped_descriptor)?;
            }
        }
        w.emit_u16(class_index);
        w.emit_u16(method_index);
        Ok(())
    }

    fn record(&mut self, r: &mut BytecodeReader<'_>, w: &mut BytecodeWriter) -> Result<(), Failure> {
        let original = self.original;
        let count = r.read_u16()?;
        w.emit_u16(count);
        for _ in 0..count {
            let name_index = r.read_u16()?;
            let descriptor_index = r.read_u16()?;
            let mut attributes = decode_attributes(r)?;

            let name = original.utf8(name_index)?;
            let descriptor = original.utf8(descriptor_index)?;
            let name_index = match self.resolver.map_field(self.owner, name, descriptor, EXACT)? {
                Some((_, mapped)) => self.utf8_index(name_index, &mapped)?,
                None => name_index,
            };
            let mapped = self.field_descriptor(descriptor)?;
            let descriptor_index = self.utf8_index(descriptor_index, &mapped)?;
            self.attributes(&mut attributes)?;

            w.emit_u16(name_index);
            w.emit_u16(descriptor_index);
            encode_attributes(&attributes, w);
        }
        Ok(())
    }

    fn annotations(&mut self, r: &mut BytecodeReader<'_>, w: &mut BytecodeWriter) -> Result<(), Failure> {
        let count = r.read_u16()?;
        w.emit_u16(count);
        for _ in 0..count {
            self.annotation(r, w)?;
        }
        Ok(())
    }

    fn parameter_annotations(&mut self, r: &mut BytecodeReader<'_>, w: &mut BytecodeWriter) -> Result<(), Failure> {
        let parameters = r.read_u8()?;
        w.emit_u8(parameters);
        for _ in 0..parameters {
            self.annotations(r, w)?;
        }
        Ok(())
    }

    fn type_annotations(&mut self, r: &mut BytecodeReader<'_>, w: &mut BytecodeWriter) -> Result<(), Failure> {
        let count = r.read_u16()?;
        w.emit_u16(count);
        for _ in 0..count {
            let target = r.read_u8()?;
            w.emit_u8(target);
            let target_info = match target {
                0x13..=0x15 => 0,
                0x00 | 0x01 | 0x16 => 1,
                0x10 | 0x11 | 0x12 | 0x17 | 0x42..=0x46 => 2,
                0x47..=0x4B => 3,
                0x40 | 0x41 => {
                    let entries = r.read_u16()?;
                    w.emit_u16(entries);
                    entries as usize * 6
                }
                other => {
                    return Err(Failure::Class(ClassFileError::MalformedAttribute {
                        name: "type annotation",
                        reason: format!("unknown target type {:#04x}", other),
                    }))
                }
            };
            w.emit_bytes(r.read_slice(target_info)?);
            let path = r.read_u8()?;
            w.emit_u8(path);
            w.emit_bytes(r.read_slice(path as usize * 2)?);
            self.annotation(r, w)?;
        }
        Ok(())
    }

    fn annotation(&mut self, r: &mut BytecodeReader<'_>, w: &mut BytecodeWriter) -> Result<(), Failure> {
        let type_index = r.read_u16()?;
        let mapped = self.field_descriptor(self.original.utf8(type_index)?)?;
        w.emit_u16(self.utf8_index(type_index, &mapped)?);
        let pairs = r.read_u16()?;
        w.emit_u16(pairs);
        for _ in 0..pairs {
            w.emit_u16(r.read_u16()?);
            self.element_value(r, w)?;
        }
        Ok(())
    }

    fn element_value(&mut self, r: &mut BytecodeReader<'_>, w: &mut BytecodeWriter) -> Result<(), Failure> {
        let original = self.original;
        let tag = r.read_u8()?;
        w.emit_u8(tag);
        match tag {
            b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' => w.emit_u16(r.read_u16()?),
            b'e' => {
                let type_index = r.read_u16()?;
                let constant_index = r.read_u16()?;
                let descriptor = original.utf8(type_index)?;
                let constant = original.utf8(constant_index)?;
                let renamed = match FieldType::parse(descriptor)? {
                    FieldType::Object(owner) => self
                        .resolver
                        .map_field(&owner, constant, descriptor, Some(access::STATIC))?
                        .map(|(_, mapped)| mapped),
                    _ => None,
                };
                let mapped = self.field_descriptor(descriptor)?;
                w.emit_u16(self.utf8_index(type_index, &mapped)?);
                let constant_index = match renamed {
                    Some(name) => self.utf8_index(constant_index, &name)?,
                    None => constant_index,
                };
                w.emit_u16(constant_index);
            }
            b'c' => {
                let index = r.read_u16()?;
                let descriptor = original.utf8(index)?;
                let mapped = if descriptor == "V" {
                    descriptor.to_string()
                } else {
                    self.field_descriptor(descriptor)?
                };
                w.emit_u16(self.utf8_index(index, &mapped)?);
            }
            b'@' => self.annotation(r, w)?,
            b'[' => {
                let count = r.read_u16()?;
                w.emit_u16(count);
                for _ in 0..count {
                    self.element_value(r, w)?;
                }
            }
            other => {
                return Err(Failure::Class(ClassFileError::MalformedAttribute {
                    name: "annotation",
                    reason: format!("unknown element tag {:#04x}", other),
                }))
            }
        }
        Ok(())
    }
}

/// Part of a binary name after the last `$` or `/`
fn suffix(name: &str) -> &str {
    name.rsplit(|c| c == '$' || c == '/').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::NameMapping;
    use remora_classfile::{find_attribute, ClassBuilder, OBJECT};

    /// Resolver over a plain mapping, exact lookups only
    struct Plain(NameMapping);

    impl SymbolResolver for Plain {
        fn map_type(&self, name: &str) -> String {
            self.0.map_type(name)
        }

        fn map_field(
            &self,
            owner: &str,
            name: &str,
            descriptor: &str,
            _: Option<u16>,
        ) -> Result<Option<(String, String)>, RemapError> {
            Ok(self.0.map_field(owner, name, descriptor).map(|m| (owner.to_string(), m.to_string())))
        }

        fn map_method(
            &self,
            owner: &str,
            name: &str,
            descriptor: &str,
            _: Option<u16>,
        ) -> Result<Option<(String, String)>, RemapError> {
            if owner == "a/b/Bar" && name == "doX" {
                // Found on the superclass
                return Ok(Some(("a/b/Foo".to_string(), "run".to_string())));
            }
            Ok(self.0.map_method(owner, name, descriptor).map(|m| (owner.to_string(), m.to_string())))
        }

        fn is_interface(&self, name: &str) -> Option<bool> {
            Some(name.ends_with("Iface"))
        }
    }

    fn resolver() -> Plain {
        let mut mapping = NameMapping::new();
        mapping.add_class("a/b/Foo", "org/pub/Foo");
        mapping.add_class("a/b/Bar", "org/pub/Bar");
        mapping.add_class("a/b/Iface", "org/pub/Iface");
        mapping.add_class("a/b/Foo$C_1", "org/pub/Foo$Node");
        mapping.add_field("a/b/Foo", "f_1", Some("I"), "count");
        mapping.add_method("a/b/Foo", "doX", "()V", "run");
        mapping.add_method("a/b/Iface", "m_5", "(La/b/Foo;)V", "accept");
        Plain(mapping)
    }

    fn substituted(class: &mut ClassFile) -> ClassFile {
        substitute(class, &resolver()).unwrap();
        ClassFile::decode(&class.encode().unwrap()).unwrap()
    }

    fn code_refs(class: &ClassFile, method: usize) -> Vec<(String, String, String)> {
        let code = class.methods[method].code(&class.constant_pool).unwrap().unwrap();
        remora_classfile::decode_instructions(&code.code)
            .unwrap()
            .iter()
            .filter(|insn| insn.opcode.is_member_access())
            .map(|insn| {
                let member = class.constant_pool.member_ref(insn.u16_operand()).unwrap();
                (member.owner.to_string(), member.name.to_string(), member.descriptor.to_string())
            })
            .collect()
    }

    #[test]
    fn test_declarations_and_references() {
        let mut builder = ClassBuilder::new("a/b/Foo", Some(OBJECT), access::PUBLIC | access::SUPER);
        builder.add_field(access::PUBLIC, "f_1", "I");
        builder.add_field(access::PUBLIC, "other", "La/b/Bar;");
        let pool = builder.pool();
        let field = pool.add_member_ref(MemberKind::Field, "a/b/Foo", "f_1", "I").unwrap();
        let [fh, fl] = field.to_be_bytes();
        builder
            .add_method(access::PUBLIC, "doX", "()V")
            .code(2, 1, vec![0x2A, 0xB4, fh, fl, 0x57, 0xB1]);
        builder
            .add_method(access::PUBLIC | access::STATIC, "make", "(La/b/Bar;)[La/b/Foo;")
            .code(1, 1, vec![0x01, 0xB0]);
        let mut class = builder.build_class().unwrap();

        let out = substituted(&mut class);
        let pool = &out.constant_pool;
        assert_eq!(out.name().unwrap(), "org/pub/Foo");
        assert_eq!(out.fields[0].name(pool).unwrap(), "count");
        assert_eq!(out.fields[1].descriptor(pool).unwrap(), "Lorg/pub/Bar;");
        assert_eq!(out.methods[0].name(pool).unwrap(), "run");
        assert_eq!(out.methods[1].descriptor(pool).unwrap(), "(Lorg/pub/Bar;)[Lorg/pub/Foo;");
        assert_eq!(
            code_refs(&out, 0),
            vec![("org/pub/Foo".to_string(), "count".to_string(), "I".to_string())]
        );
    }

    #[test]
    fn test_inherited_reference_is_relocated() {
        let mut builder = ClassBuilder::new("x/Caller", Some(OBJECT), access::PUBLIC | access::SUPER);
        let pool = builder.pool();
        let call = pool.add_member_ref(MemberKind::Method, "a/b/Bar", "doX", "()V").unwrap();
        let [hi, lo] = call.to_be_bytes();
        builder
            .add_method(access::PUBLIC | access::STATIC, "call", "(La/b/Bar;)V")
            .code(1, 1, vec![0x2A, 0xB6, hi, lo, 0xB1]);
        let mut class = builder.build_class().unwrap();
        let before = class.methods[0].code(&class.constant_pool).unwrap().unwrap().code;

        let out = substituted(&mut class);
        assert_eq!(
            code_refs(&out, 0),
            vec![("org/pub/Foo".to_string(), "run".to_string(), "()V".to_string())]
        );
        // Instructions untouched
        assert_eq!(out.methods[0].code(&out.constant_pool).unwrap().unwrap().code, before);
    }

    #[test]
    fn test_shared_utf8_is_not_modified() {
        let mut builder = ClassBuilder::new("x/User", Some(OBJECT), access::PUBLIC | access::SUPER);
        let pool = builder.pool();
        // The string constant shares its UTF-8 entry with the class name
        let string = pool.add_string("a/b/Foo").unwrap();
        pool.add_class("a/b/Foo").unwrap();
        let mut class = builder.build_class().unwrap();

        let out = substituted(&mut class);
        let Some(Constant::String { string_index }) = out.constant_pool.get(string) else {
            panic!("string constant moved");
        };
        assert_eq!(out.constant_pool.utf8(*string_index).unwrap(), "a/b/Foo");
    }

    #[test]
    fn test_signature_and_local_variables() {
        let mut builder = ClassBuilder::new("x/Holder", Some(OBJECT), access::PUBLIC | access::SUPER);
        builder
            .add_method(access::PUBLIC, "m", "(La/b/Foo;)V")
            .code(0, 2, vec![0xB1]);
        let mut class = builder.build_class().unwrap();
        let pool = &mut class.constant_pool;
        let signature_name = pool.add_utf8("Signature").unwrap();
        let signature = pool.add_utf8("Ljava/util/List<La/b/Bar;>;").unwrap();
        let table_name = pool.add_utf8("LocalVariableTable").unwrap();
        let local_name = pool.add_utf8("foo").unwrap();
        let local_desc = pool.add_utf8("La/b/Foo;").unwrap();
        class.attributes.push(AttributeInfo {
            name_index: signature_name,
            info: signature.to_be_bytes().to_vec(),
        });
        let mut code = class.methods[0].code(&class.constant_pool).unwrap().unwrap();
        let mut table = vec![0, 1, 0, 0, 0, 1];
        table.extend_from_slice(&local_name.to_be_bytes());
        table.extend_from_slice(&local_desc.to_be_bytes());
        table.extend_from_slice(&[0, 1]);
        code.attributes.push(AttributeInfo {
            name_index: table_name,
            info: table,
        });
        let pool = class.constant_pool.clone();
        class.methods[0].set_code(&pool, &code);

        let out = substituted(&mut class);
        let pool = &out.constant_pool;
        let attribute = find_attribute(&out.attributes, pool, "Signature").unwrap();
        let index = u16::from_be_bytes([attribute.info[0], attribute.info[1]]);
        assert_eq!(pool.utf8(index).unwrap(), "Ljava/util/List<Lorg/pub/Bar;>;");

        let code = out.methods[0].code(pool).unwrap().unwrap();
        let table = find_attribute(&code.attributes, pool, "LocalVariableTable").unwrap();
        let desc = u16::from_be_bytes([table.info[10], table.info[11]]);
        assert_eq!(pool.utf8(desc).unwrap(), "Lorg/pub/Foo;");
        let name = u16::from_be_bytes([table.info[8], table.info[9]]);
        assert_eq!(pool.utf8(name).unwrap(), "foo");
    }

    #[test]
    fn test_inner_class_simple_name() {
        let mut class = ClassBuilder::new("a/b/Foo", Some(OBJECT), access::PUBLIC | access::SUPER)
            .build_class()
            .unwrap();
        let pool = &mut class.constant_pool;
        let attribute_name = pool.add_utf8("InnerClasses").unwrap();
        let inner = pool.add_class("a/b/Foo$C_1").unwrap();
        let outer = pool.add_class("a/b/Foo").unwrap();
        let simple = pool.add_utf8("C_1").unwrap();
        let mut info = vec![0, 1];
        for value in [inner, outer, simple, access::PUBLIC | access::STATIC] {
            info.extend_from_slice(&value.to_be_bytes());
        }
        class.attributes.push(AttributeInfo {
            name_index: attribute_name,
            info,
        });

        let out = substituted(&mut class);
        let pool = &out.constant_pool;
        let attribute = find_attribute(&out.attributes, pool, "InnerClasses").unwrap();
        let inner = u16::from_be_bytes([attribute.info[2], attribute.info[3]]);
        let simple = u16::from_be_bytes([attribute.info[6], attribute.info[7]]);
        assert_eq!(pool.class_name(inner).unwrap(), "org/pub/Foo$Node");
        assert_eq!(pool.utf8(simple).unwrap(), "Node");
    }

    #[test]
    fn test_annotation_descriptors() {
        let mut class = ClassBuilder::new("x/Annotated", Some(OBJECT), access::PUBLIC | access::SUPER)
            .build_class()
            .unwrap();
        let pool = &mut class.constant_pool;
        let attribute_name = pool.add_utf8("RuntimeVisibleAnnotations").unwrap();
        let type_index = pool.add_utf8("La/b/Foo;").unwrap();
        let element = pool.add_utf8("value").unwrap();
        let class_value = pool.add_utf8("La/b/Bar;").unwrap();
        let mut info = vec![0, 1];
        info.extend_from_slice(&type_index.to_be_bytes());
        info.extend_from_slice(&[0, 1]);
        info.extend_from_slice(&element.to_be_bytes());
        info.push(b'c');
        info.extend_from_slice(&class_value.to_be_bytes());
        class.attributes.push(AttributeInfo {
            name_index: attribute_name,
            info,
        });

        let out = substituted(&mut class);
        let pool = &out.constant_pool;
        let info = &find_attribute(&out.attributes, pool, "RuntimeVisibleAnnotations").unwrap().info;
        assert_eq!(pool.utf8(u16::from_be_bytes([info[2], info[3]])).unwrap(), "Lorg/pub/Foo;");
        assert_eq!(pool.utf8(u16::from_be_bytes([info[6], info[7]])).unwrap(), "value");
        assert_eq!(info[8], b'c');
        assert_eq!(pool.utf8(u16::from_be_bytes([info[9], info[10]])).unwrap(), "Lorg/pub/Bar;");
    }

    #[test]
    fn test_lambda_functional_name() {
        let mut builder = ClassBuilder::new("x/Lambdas", Some(OBJECT), access::PUBLIC | access::SUPER);
        let pool = builder.pool();
        let factory = pool
            .add_member_ref(
                MemberKind::Method,
                LAMBDA_METAFACTORY,
                "metafactory",
                "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodHandle;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;",
            )
            .unwrap();
        let handle = pool
            .add(Constant::MethodHandle {
                reference_kind: remora_classfile::constants::ref_kind::INVOKE_STATIC,
                reference_index: factory,
            })
            .unwrap();
        let sam = pool.add_utf8("(La/b/Foo;)V").unwrap();
        let sam_type = pool.add(Constant::MethodType { descriptor_index: sam }).unwrap();
        let call_site = pool.add_name_and_type("m_5", "()La/b/Iface;").unwrap();
        let indy = pool
            .add(Constant::InvokeDynamic {
                bootstrap_method_attr_index: 0,
                name_and_type_index: call_site,
            })
            .unwrap();
        let bootstrap_name = pool.add_utf8("BootstrapMethods").unwrap();
        let mut class = builder.build_class().unwrap();
        let mut info = vec![0, 1];
        info.extend_from_slice(&handle.to_be_bytes());
        info.extend_from_slice(&[0, 1]);
        info.extend_from_slice(&sam_type.to_be_bytes());
        class.attributes.push(AttributeInfo {
            name_index: bootstrap_name,
            info,
        });

        let out = substituted(&mut class);
        let pool = &out.constant_pool;
        let Some(Constant::InvokeDynamic { name_and_type_index, .. }) = pool.get(indy) else {
            panic!("invokedynamic moved");
        };
        assert_eq!(
            pool.name_and_type(*name_and_type_index).unwrap(),
            ("accept", "()Lorg/pub/Iface;")
        );
        let Some(Constant::MethodType { descriptor_index }) = pool.get(sam_type) else {
            panic!("method type moved");
        };
        assert_eq!(pool.utf8(*descriptor_index).unwrap(), "(Lorg/pub/Foo;)V");
    }

    #[test]
    fn test_class_rename() {
        let mut class = ClassBuilder::new("remora/bridge/T", Some(OBJECT), access::PUBLIC | access::SUPER)
            .build_class()
            .unwrap();
        substitute(
            &mut class,
            &ClassRename {
                from: "remora/bridge/T",
                to: "remora/bridge/T_7",
            },
        )
        .unwrap();
        assert_eq!(class.name().unwrap(), "remora/bridge/T_7");
        assert_eq!(class.super_name().unwrap(), Some(OBJECT));
    }

    #[test]
    fn test_failure_conversion() {
        let failure = Failure::from(PoolError::Overflow);
        assert!(matches!(failure.into_remap("a/X"), RemapError::Malformed { name, .. } if name == "a/X"));
        let failure = Failure::from(RemapError::MissingClass("a/Y".to_string()));
        assert!(matches!(failure.into_remap("a/X"), RemapError::MissingClass(_)));
    }

    #[test]
    fn test_suffix() {
        assert_eq!(suffix("a/b/Foo$1Local"), "1Local");
        assert_eq!(suffix("a/b/Foo"), "Foo");
        assert_eq!(suffix("Foo"), "Foo");
    }
}
