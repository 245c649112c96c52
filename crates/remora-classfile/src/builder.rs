//! Programmatic construction of small class files

use crate::classfile::{access, AttributeInfo, ClassFile, ClassFileError, CodeAttribute, ExceptionEntry, MemberInfo};
use crate::constants::{ConstantPool, PoolError};

/// Default major version of built classes (Java 8)
pub const DEFAULT_MAJOR_VERSION: u16 = 52;

/// Method under construction
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    access_flags: u16,
    name: String,
    descriptor: String,
    code: Option<CodeAttribute>,
}

impl MethodBuilder {
    /// Attach a body
    pub fn code(&mut self, max_stack: u16, max_locals: u16, code: Vec<u8>) -> &mut Self {
        self.code = Some(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        });
        self
    }

    /// Add an exception handler to the body
    pub fn handler(&mut self, entry: ExceptionEntry) -> &mut Self {
        if let Some(code) = &mut self.code {
            code.exception_table.push(entry);
        }
        self
    }
}

/// Builder for a class file
///
/// Bodies that reference the constant pool obtain their indices through
/// [`ClassBuilder::pool`] before being attached.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    name: String,
    super_name: Option<String>,
    access_flags: u16,
    major_version: u16,
    deprecated: bool,
    interfaces: Vec<String>,
    fields: Vec<(u16, String, String)>,
    methods: Vec<MethodBuilder>,
    pool: ConstantPool,
}

impl ClassBuilder {
    /// Start a class
    pub fn new(name: &str, super_name: Option<&str>, access_flags: u16) -> Self {
        Self {
            name: name.to_string(),
            super_name: super_name.map(str::to_string),
            access_flags,
            major_version: DEFAULT_MAJOR_VERSION,
            deprecated: false,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            pool: ConstantPool::new(),
        }
    }

    /// Set the major version
    pub fn version(&mut self, major_version: u16) -> &mut Self {
        self.major_version = major_version;
        self
    }

    /// Mark the class with a `Deprecated` attribute
    pub fn deprecated(&mut self) -> &mut Self {
        self.deprecated = true;
        self
    }

    /// Constant pool of the class being built
    pub fn pool(&mut self) -> &mut ConstantPool {
        &mut self.pool
    }

    /// Add a superinterface
    pub fn add_interface(&mut self, name: &str) -> &mut Self {
        self.interfaces.push(name.to_string());
        self
    }

    /// Add a field
    pub fn add_field(&mut self, access_flags: u16, name: &str, descriptor: &str) -> &mut Self {
        self.fields
            .push((access_flags, name.to_string(), descriptor.to_string()));
        self
    }

    /// Add a method; abstract and native methods need no body
    pub fn add_method(&mut self, access_flags: u16, name: &str, descriptor: &str) -> &mut MethodBuilder {
        self.methods.push(MethodBuilder {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: None,
        });
        let last = self.methods.len() - 1;
        &mut self.methods[last]
    }

    /// Assemble the class model
    pub fn build_class(self) -> Result<ClassFile, PoolError> {
        let mut pool = self.pool;
        let this_class = pool.add_class(&self.name)?;
        let super_class = match &self.super_name {
            Some(name) => pool.add_class(name)?,
            None => 0,
        };
        let interfaces = self
            .interfaces
            .iter()
            .map(|name| pool.add_class(name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut fields = Vec::with_capacity(self.fields.len());
        for (access_flags, name, descriptor) in &self.fields {
            fields.push(MemberInfo {
                access_flags: *access_flags,
                name_index: pool.add_utf8(name)?,
                descriptor_index: pool.add_utf8(descriptor)?,
                attributes: Vec::new(),
            });
        }

        let mut methods = Vec::with_capacity(self.methods.len());
        for method in &self.methods {
            let mut attributes = Vec::new();
            if let Some(code) = &method.code {
                attributes.push(AttributeInfo {
                    name_index: pool.add_utf8("Code")?,
                    info: code.encode(),
                });
            }
            methods.push(MemberInfo {
                access_flags: method.access_flags,
                name_index: pool.add_utf8(&method.name)?,
                descriptor_index: pool.add_utf8(&method.descriptor)?,
                attributes,
            });
        }

        let mut attributes = Vec::new();
        if self.deprecated {
            attributes.push(AttributeInfo {
                name_index: pool.add_utf8("Deprecated")?,
                info: Vec::new(),
            });
        }

        Ok(ClassFile {
            minor_version: 0,
            major_version: self.major_version,
            constant_pool: pool,
            access_flags: self.access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    /// Assemble and encode the class
    pub fn build(self) -> Result<Vec<u8>, ClassFileError> {
        self.build_class()?.encode()
    }
}

/// Build an empty public class, as used for placeholders
pub fn empty_class(name: &str, super_name: &str) -> Result<Vec<u8>, ClassFileError> {
    let mut builder = ClassBuilder::new(name, Some(super_name), access::PUBLIC | access::SUPER);
    builder.deprecated();
    builder.build()
}
