//! Class file format
//!
//! A [`ClassFile`] keeps every structure by constant pool index so that a
//! decoded class can be patched in place and re-encoded without disturbing
//! anything the patch did not touch.

use crate::constants::{ConstantPool, PoolError};
use crate::descriptor::DescriptorError;
use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use thiserror::Error;

/// Magic number of every class file
pub const MAGIC: u32 = 0xCAFE_BABE;

/// First major version that requires `StackMapTable` frames
pub const FRAMES_MAJOR_VERSION: u16 = 50;

/// Internal name of the universal root class
pub const OBJECT: &str = "java/lang/Object";

/// Class-file structure errors
#[derive(Debug, Error)]
pub enum ClassFileError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Constant pool error
    #[error("Constant pool error: {0}")]
    Pool(#[from] PoolError),

    /// Malformed descriptor or signature
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Invalid magic number
    #[error("Invalid magic number: expected 0xCAFEBABE, got {0:#010x}")]
    InvalidMagic(u32),

    /// Bytes left over after the last attribute
    #[error("{0} trailing bytes after class structure")]
    TrailingBytes(usize),

    /// Attribute whose body does not match its declared layout
    #[error("Malformed {name} attribute: {reason}")]
    MalformedAttribute { name: &'static str, reason: String },
}

/// Access flags for classes, fields and methods (JVMS 4.1, 4.5, 4.6)
pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SUPER: u16 = 0x0020;
    pub const SYNCHRONIZED: u16 = 0x0020;
    pub const VOLATILE: u16 = 0x0040;
    pub const BRIDGE: u16 = 0x0040;
    pub const TRANSIENT: u16 = 0x0080;
    pub const VARARGS: u16 = 0x0080;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const STRICT: u16 = 0x0800;
    pub const SYNTHETIC: u16 = 0x1000;
    pub const ANNOTATION: u16 = 0x2000;
    pub const ENUM: u16 = 0x4000;
}

/// Raw attribute: name index plus undecoded body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    /// Index of the attribute name (`CONSTANT_Utf8`)
    pub name_index: u16,
    /// Attribute body
    pub info: Vec<u8>,
}

impl AttributeInfo {
    /// Attribute name
    pub fn name<'p>(&self, pool: &'p ConstantPool) -> Result<&'p str, PoolError> {
        pool.utf8(self.name_index)
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u16(self.name_index);
        writer.emit_u32(self.info.len() as u32);
        writer.emit_bytes(&self.info);
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let name_index = reader.read_u16()?;
        let len = reader.read_u32()? as usize;
        let info = reader.read_bytes(len)?;
        Ok(Self { name_index, info })
    }
}

/// Write an attribute table (count, then each attribute)
pub fn encode_attributes(attributes: &[AttributeInfo], writer: &mut BytecodeWriter) {
    writer.emit_u16(attributes.len() as u16);
    for attribute in attributes {
        attribute.encode(writer);
    }
}

/// Read an attribute table
pub fn decode_attributes(reader: &mut BytecodeReader<'_>) -> Result<Vec<AttributeInfo>, DecodeError> {
    let count = reader.read_u16()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        attributes.push(AttributeInfo::decode(reader)?);
    }
    Ok(attributes)
}

/// Find an attribute by name
pub fn find_attribute<'a>(
    attributes: &'a [AttributeInfo],
    pool: &ConstantPool,
    name: &str,
) -> Option<&'a AttributeInfo> {
    attributes
        .iter()
        .find(|attribute| attribute.name(pool).map(|n| n == name).unwrap_or(false))
}

/// Field or method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Access flags
    pub access_flags: u16,
    /// Index of the member name
    pub name_index: u16,
    /// Index of the member descriptor
    pub descriptor_index: u16,
    /// Member attributes
    pub attributes: Vec<AttributeInfo>,
}

impl MemberInfo {
    /// Member name
    pub fn name<'p>(&self, pool: &'p ConstantPool) -> Result<&'p str, PoolError> {
        pool.utf8(self.name_index)
    }

    /// Member descriptor
    pub fn descriptor<'p>(&self, pool: &'p ConstantPool) -> Result<&'p str, PoolError> {
        pool.utf8(self.descriptor_index)
    }

    /// Decode the `Code` attribute, if any
    pub fn code(&self, pool: &ConstantPool) -> Result<Option<CodeAttribute>, ClassFileError> {
        match find_attribute(&self.attributes, pool, "Code") {
            Some(attribute) => Ok(Some(CodeAttribute::decode(&attribute.info)?)),
            None => Ok(None),
        }
    }

    /// Replace the body of the `Code` attribute
    pub fn set_code(&mut self, pool: &ConstantPool, code: &CodeAttribute) {
        let position = self
            .attributes
            .iter()
            .position(|attribute| attribute.name(pool).map(|n| n == "Code").unwrap_or(false));
        if let Some(position) = position {
            self.attributes[position].info = code.encode();
        }
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u16(self.access_flags);
        writer.emit_u16(self.name_index);
        writer.emit_u16(self.descriptor_index);
        encode_attributes(&self.attributes, writer);
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            access_flags: reader.read_u16()?,
            name_index: reader.read_u16()?,
            descriptor_index: reader.read_u16()?,
            attributes: decode_attributes(reader)?,
        })
    }
}

/// One row of a method's exception table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    /// Start of the protected range (inclusive)
    pub start_pc: u16,
    /// End of the protected range (exclusive)
    pub end_pc: u16,
    /// Handler offset
    pub handler_pc: u16,
    /// Caught class, 0 for any
    pub catch_type: u16,
}

/// Decoded `Code` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    /// Maximum operand stack depth
    pub max_stack: u16,
    /// Number of local variable slots
    pub max_locals: u16,
    /// Instruction bytes
    pub code: Vec<u8>,
    /// Exception handlers
    pub exception_table: Vec<ExceptionEntry>,
    /// Nested attributes (`StackMapTable`, `LineNumberTable`, ...)
    pub attributes: Vec<AttributeInfo>,
}

impl CodeAttribute {
    /// Decode from an attribute body
    pub fn decode(info: &[u8]) -> Result<Self, ClassFileError> {
        let mut reader = BytecodeReader::new(info);
        let max_stack = reader.read_u16()?;
        let max_locals = reader.read_u16()?;
        let code_len = reader.read_u32()? as usize;
        let code = reader.read_bytes(code_len)?;

        let handler_count = reader.read_u16()? as usize;
        let mut exception_table = Vec::with_capacity(handler_count);
        for _ in 0..handler_count {
            exception_table.push(ExceptionEntry {
                start_pc: reader.read_u16()?,
                end_pc: reader.read_u16()?,
                handler_pc: reader.read_u16()?,
                catch_type: reader.read_u16()?,
            });
        }

        let attributes = decode_attributes(&mut reader)?;
        if reader.has_more() {
            return Err(ClassFileError::MalformedAttribute {
                name: "Code",
                reason: format!("{} trailing bytes", reader.remaining()),
            });
        }

        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    /// Encode to an attribute body
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BytecodeWriter::with_capacity(self.code.len() + 32);
        writer.emit_u16(self.max_stack);
        writer.emit_u16(self.max_locals);
        writer.emit_u32(self.code.len() as u32);
        writer.emit_bytes(&self.code);
        writer.emit_u16(self.exception_table.len() as u16);
        for entry in &self.exception_table {
            writer.emit_u16(entry.start_pc);
            writer.emit_u16(entry.end_pc);
            writer.emit_u16(entry.handler_pc);
            writer.emit_u16(entry.catch_type);
        }
        encode_attributes(&self.attributes, &mut writer);
        writer.into_bytes()
    }
}

/// A decoded class file
#[derive(Debug, Clone)]
pub struct ClassFile {
    /// Minor version
    pub minor_version: u16,
    /// Major version
    pub major_version: u16,
    /// Constant pool
    pub constant_pool: ConstantPool,
    /// Class access flags
    pub access_flags: u16,
    /// Index of this class (`CONSTANT_Class`)
    pub this_class: u16,
    /// Index of the superclass, 0 for `java/lang/Object` itself
    pub super_class: u16,
    /// Indices of direct superinterfaces
    pub interfaces: Vec<u16>,
    /// Declared fields
    pub fields: Vec<MemberInfo>,
    /// Declared methods
    pub methods: Vec<MemberInfo>,
    /// Class attributes
    pub attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    /// Internal name of this class
    pub fn name(&self) -> Result<&str, PoolError> {
        self.constant_pool.class_name(self.this_class)
    }

    /// Internal name of the superclass
    pub fn super_name(&self) -> Result<Option<&str>, PoolError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    /// Internal names of the direct superinterfaces, in declaration order
    pub fn interface_names(&self) -> Result<Vec<&str>, PoolError> {
        self.interfaces
            .iter()
            .map(|&index| self.constant_pool.class_name(index))
            .collect()
    }

    /// Whether this is an interface
    pub fn is_interface(&self) -> bool {
        self.access_flags & access::INTERFACE != 0
    }

    /// Find a class attribute by name
    pub fn find_attribute(&self, name: &str) -> Option<&AttributeInfo> {
        find_attribute(&self.attributes, &self.constant_pool, name)
    }

    /// Decode a class file
    pub fn decode(data: &[u8]) -> Result<Self, ClassFileError> {
        let mut reader = BytecodeReader::new(data);

        let magic = reader.read_u32()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }
        let minor_version = reader.read_u16()?;
        let major_version = reader.read_u16()?;
        let constant_pool = ConstantPool::decode(&mut reader)?;

        let access_flags = reader.read_u16()?;
        let this_class = reader.read_u16()?;
        let super_class = reader.read_u16()?;

        let interface_count = reader.read_u16()? as usize;
        let mut interfaces = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            interfaces.push(reader.read_u16()?);
        }

        let field_count = reader.read_u16()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(MemberInfo::decode(&mut reader)?);
        }

        let method_count = reader.read_u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            methods.push(MemberInfo::decode(&mut reader)?);
        }

        let attributes = decode_attributes(&mut reader)?;
        if reader.has_more() {
            return Err(ClassFileError::TrailingBytes(reader.remaining()));
        }

        let class = Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        // this_class must name a class
        class.name()?;
        Ok(class)
    }

    /// Encode the class file
    pub fn encode(&self) -> Result<Vec<u8>, ClassFileError> {
        let mut writer = BytecodeWriter::with_capacity(4096);
        writer.emit_u32(MAGIC);
        writer.emit_u16(self.minor_version);
        writer.emit_u16(self.major_version);
        self.constant_pool.encode(&mut writer)?;
        writer.emit_u16(self.access_flags);
        writer.emit_u16(self.this_class);
        writer.emit_u16(self.super_class);
        writer.emit_u16(self.interfaces.len() as u16);
        for &interface in &self.interfaces {
            writer.emit_u16(interface);
        }
        writer.emit_u16(self.fields.len() as u16);
        for field in &self.fields {
            field.encode(&mut writer);
        }
        writer.emit_u16(self.methods.len() as u16);
        for method in &self.methods {
            method.encode(&mut writer);
        }
        encode_attributes(&self.attributes, &mut writer);
        Ok(writer.into_bytes())
    }
}

/// Read only the binary name of a class file without decoding the rest
pub fn peek_class_name(data: &[u8]) -> Option<String> {
    let mut reader = BytecodeReader::new(data);
    if reader.read_u32().ok()? != MAGIC {
        return None;
    }
    reader.skip(4).ok()?;
    let pool = ConstantPool::decode(&mut reader).ok()?;
    reader.skip(2).ok()?;
    let this_class = reader.read_u16().ok()?;
    pool.class_name(this_class).ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassBuilder;

    fn sample() -> Vec<u8> {
        let mut builder = ClassBuilder::new("a/b/Foo", Some("a/b/Base"), access::PUBLIC | access::SUPER);
        builder.add_interface("a/b/Marker");
        builder.add_field(access::PRIVATE, "count", "I");
        builder
            .add_method(access::PUBLIC, "doX", "()V")
            .code(1, 1, vec![0xB1]);
        builder.build().unwrap()
    }

    #[test]
    fn test_decode_accessors() {
        let class = ClassFile::decode(&sample()).unwrap();
        assert_eq!(class.name().unwrap(), "a/b/Foo");
        assert_eq!(class.super_name().unwrap(), Some("a/b/Base"));
        assert_eq!(class.interface_names().unwrap(), vec!["a/b/Marker"]);
        assert!(!class.is_interface());
        assert_eq!(class.fields[0].name(&class.constant_pool).unwrap(), "count");
        assert_eq!(class.methods[0].descriptor(&class.constant_pool).unwrap(), "()V");
    }

    #[test]
    fn test_reencode_is_identical() {
        let bytes = sample();
        let class = ClassFile::decode(&bytes).unwrap();
        assert_eq!(class.encode().unwrap(), bytes);
    }

    #[test]
    fn test_encode_fails_on_oversized_constant() {
        let mut class = ClassFile::decode(&sample()).unwrap();
        class.constant_pool.add_string(&"q".repeat(70_000)).unwrap();
        assert!(matches!(
            class.encode(),
            Err(ClassFileError::Pool(PoolError::Encode(_)))
        ));
    }

    #[test]
    fn test_code_attribute() {
        let class = ClassFile::decode(&sample()).unwrap();
        let code = class.methods[0].code(&class.constant_pool).unwrap().unwrap();
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.code, vec![0xB1]);
        assert_eq!(CodeAttribute::decode(&code.encode()).unwrap(), code);
    }

    #[test]
    fn test_invalid_magic() {
        let result = ClassFile::decode(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0]);
        assert!(matches!(result, Err(ClassFileError::InvalidMagic(0xDEAD_BEEF))));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = sample();
        bytes.push(0);
        assert!(matches!(
            ClassFile::decode(&bytes),
            Err(ClassFileError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_truncated_is_decode_error() {
        let bytes = sample();
        let result = ClassFile::decode(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(ClassFileError::Decode(_))));
    }

    #[test]
    fn test_peek_class_name() {
        assert_eq!(peek_class_name(&sample()).as_deref(), Some("a/b/Foo"));
        assert_eq!(peek_class_name(b"nope"), None);
    }
}
