//! Constant pool
//!
//! Indices are 1-based as in the class file; `Long` and `Double` entries
//! occupy two slots, the second one being [`Constant::Unusable`].

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError, EncodeError};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Largest constant pool count representable in a class file
pub const MAX_POOL_SIZE: usize = u16::MAX as usize;

/// Constant pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Entry that cannot be written back
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Unknown tag byte
    #[error("Unsupported constant pool tag {tag} at index {index}")]
    UnsupportedTag { tag: u8, index: u16 },

    /// Index out of range or pointing at the wrong kind of entry
    #[error("Invalid constant pool index {index}: expected {expected}")]
    InvalidIndex { index: u16, expected: &'static str },

    /// Pool would exceed 65535 entries
    #[error("Constant pool overflow: more than {MAX_POOL_SIZE} entries")]
    Overflow,
}

/// Method handle reference kinds (JVMS 4.4.8)
pub mod ref_kind {
    pub const GET_FIELD: u8 = 1;
    pub const GET_STATIC: u8 = 2;
    pub const PUT_FIELD: u8 = 3;
    pub const PUT_STATIC: u8 = 4;
    pub const INVOKE_VIRTUAL: u8 = 5;
    pub const INVOKE_STATIC: u8 = 6;
    pub const INVOKE_SPECIAL: u8 = 7;
    pub const NEW_INVOKE_SPECIAL: u8 = 8;
    pub const INVOKE_INTERFACE: u8 = 9;
}

/// A constant pool entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Modified UTF-8 string
    Utf8(String),
    /// 32-bit integer
    Integer(i32),
    /// 32-bit float, stored as raw bits
    Float(u32),
    /// 64-bit integer
    Long(i64),
    /// 64-bit float, stored as raw bits
    Double(u64),
    /// Class or array type reference
    Class { name_index: u16 },
    /// String literal
    String { string_index: u16 },
    /// Field reference
    Fieldref { class_index: u16, name_and_type_index: u16 },
    /// Class method reference
    Methodref { class_index: u16, name_and_type_index: u16 },
    /// Interface method reference
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    /// Name and descriptor pair
    NameAndType { name_index: u16, descriptor_index: u16 },
    /// Method handle
    MethodHandle { reference_kind: u8, reference_index: u16 },
    /// Method type
    MethodType { descriptor_index: u16 },
    /// Dynamically computed constant
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    /// Dynamically computed call site
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    /// Module name
    Module { name_index: u16 },
    /// Package name
    Package { name_index: u16 },
    /// Slot 0 and the slot after a `Long`/`Double`
    Unusable,
}

impl Constant {
    /// Whether this entry occupies two pool slots
    pub fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }

    fn tag(&self) -> u8 {
        match self {
            Constant::Utf8(_) => 1,
            Constant::Integer(_) => 3,
            Constant::Float(_) => 4,
            Constant::Long(_) => 5,
            Constant::Double(_) => 6,
            Constant::Class { .. } => 7,
            Constant::String { .. } => 8,
            Constant::Fieldref { .. } => 9,
            Constant::Methodref { .. } => 10,
            Constant::InterfaceMethodref { .. } => 11,
            Constant::NameAndType { .. } => 12,
            Constant::MethodHandle { .. } => 15,
            Constant::MethodType { .. } => 16,
            Constant::Dynamic { .. } => 17,
            Constant::InvokeDynamic { .. } => 18,
            Constant::Module { .. } => 19,
            Constant::Package { .. } => 20,
            Constant::Unusable => 0,
        }
    }
}

/// Kind of a member reference entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// `CONSTANT_Fieldref`
    Field,
    /// `CONSTANT_Methodref`
    Method,
    /// `CONSTANT_InterfaceMethodref`
    InterfaceMethod,
}

/// Resolved view of a field or method reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef<'a> {
    /// Reference kind
    pub kind: MemberKind,
    /// Index of the owning `CONSTANT_Class`
    pub class_index: u16,
    /// Owner internal name
    pub owner: &'a str,
    /// Member name
    pub name: &'a str,
    /// Member descriptor
    pub descriptor: &'a str,
}

/// Class-file constant pool with de-duplicating insertion
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    lookup: FxHashMap<Constant, u16>,
}

impl ConstantPool {
    /// Create an empty pool (only the unusable slot 0)
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
            lookup: FxHashMap::default(),
        }
    }

    /// Number of slots including slot 0, i.e. the class file's `constant_pool_count`
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over `(index, entry)` for every usable slot
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, c)| !matches!(c, Constant::Unusable))
            .map(|(i, c)| (i as u16, c))
    }

    /// Get an entry
    pub fn get(&self, index: u16) -> Option<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => None,
            Some(constant) => Some(constant),
        }
    }

    /// Get a `CONSTANT_Utf8` value
    pub fn utf8(&self, index: u16) -> Result<&str, PoolError> {
        match self.get(index) {
            Some(Constant::Utf8(value)) => Ok(value.as_str()),
            _ => Err(PoolError::InvalidIndex { index, expected: "Utf8" }),
        }
    }

    /// Get the internal name of a `CONSTANT_Class`
    pub fn class_name(&self, index: u16) -> Result<&str, PoolError> {
        match self.get(index) {
            Some(Constant::Class { name_index }) => self.utf8(*name_index),
            _ => Err(PoolError::InvalidIndex { index, expected: "Class" }),
        }
    }

    /// Get the `(name, descriptor)` of a `CONSTANT_NameAndType`
    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), PoolError> {
        match self.get(index) {
            Some(Constant::NameAndType {
                name_index,
                descriptor_index,
            }) => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(PoolError::InvalidIndex {
                index,
                expected: "NameAndType",
            }),
        }
    }

    /// Resolve a field, method or interface method reference
    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>, PoolError> {
        let (kind, class_index, nat) = match self.get(index) {
            Some(Constant::Fieldref {
                class_index,
                name_and_type_index,
            }) => (MemberKind::Field, *class_index, *name_and_type_index),
            Some(Constant::Methodref {
                class_index,
                name_and_type_index,
            }) => (MemberKind::Method, *class_index, *name_and_type_index),
            Some(Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            }) => (MemberKind::InterfaceMethod, *class_index, *name_and_type_index),
            _ => {
                return Err(PoolError::InvalidIndex {
                    index,
                    expected: "member reference",
                })
            }
        };
        let (name, descriptor) = self.name_and_type(nat)?;
        Ok(MemberRef {
            kind,
            class_index,
            owner: self.class_name(class_index)?,
            name,
            descriptor,
        })
    }

    /// Add an entry, reusing an identical existing one
    pub fn add(&mut self, constant: Constant) -> Result<u16, PoolError> {
        if let Some(&index) = self.lookup.get(&constant) {
            return Ok(index);
        }
        let slots = if constant.is_wide() { 2 } else { 1 };
        if self.entries.len() + slots > MAX_POOL_SIZE {
            return Err(PoolError::Overflow);
        }
        let index = self.entries.len() as u16;
        self.lookup.insert(constant.clone(), index);
        let wide = constant.is_wide();
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    /// Replace the entry at `index`, keeping de-duplication coherent.
    ///
    /// Wide entries cannot be introduced or removed this way.
    pub fn set(&mut self, index: u16, constant: Constant) -> Result<(), PoolError> {
        let slot = self
            .entries
            .get_mut(index as usize)
            .filter(|c| !matches!(c, Constant::Unusable))
            .ok_or(PoolError::InvalidIndex {
                index,
                expected: "usable slot",
            })?;
        if slot.is_wide() || constant.is_wide() {
            return Err(PoolError::InvalidIndex {
                index,
                expected: "narrow constant",
            });
        }
        let old = std::mem::replace(slot, constant.clone());
        if self.lookup.get(&old) == Some(&index) {
            self.lookup.remove(&old);
        }
        self.lookup.entry(constant).or_insert(index);
        Ok(())
    }

    /// Add a `CONSTANT_Utf8`
    pub fn add_utf8(&mut self, value: &str) -> Result<u16, PoolError> {
        self.add(Constant::Utf8(value.to_string()))
    }

    /// Add a `CONSTANT_Class`
    pub fn add_class(&mut self, name: &str) -> Result<u16, PoolError> {
        let name_index = self.add_utf8(name)?;
        self.add(Constant::Class { name_index })
    }

    /// Add a `CONSTANT_String`
    pub fn add_string(&mut self, value: &str) -> Result<u16, PoolError> {
        let string_index = self.add_utf8(value)?;
        self.add(Constant::String { string_index })
    }

    /// Add a `CONSTANT_NameAndType`
    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, PoolError> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.add(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    /// Add a field, method or interface method reference
    pub fn add_member_ref(
        &mut self,
        kind: MemberKind,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, PoolError> {
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.add(match kind {
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
        })
    }

    /// Encode the pool, including the leading `constant_pool_count`
    pub fn encode(&self, writer: &mut BytecodeWriter) -> Result<(), PoolError> {
        writer.emit_u16(self.entries.len() as u16);
        for constant in &self.entries {
            if matches!(constant, Constant::Unusable) {
                continue;
            }
            writer.emit_u8(constant.tag());
            match constant {
                Constant::Utf8(value) => writer.emit_utf8(value)?,
                Constant::Integer(value) => writer.emit_i32(*value),
                Constant::Float(bits) => writer.emit_u32(*bits),
                Constant::Long(value) => writer.emit_u64(*value as u64),
                Constant::Double(bits) => writer.emit_u64(*bits),
                Constant::Class { name_index } => writer.emit_u16(*name_index),
                Constant::String { string_index } => writer.emit_u16(*string_index),
                Constant::Fieldref {
                    class_index,
                    name_and_type_index,
                }
                | Constant::Methodref {
                    class_index,
                    name_and_type_index,
                }
                | Constant::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => {
                    writer.emit_u16(*class_index);
                    writer.emit_u16(*name_and_type_index);
                }
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    writer.emit_u16(*name_index);
                    writer.emit_u16(*descriptor_index);
                }
                Constant::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    writer.emit_u8(*reference_kind);
                    writer.emit_u16(*reference_index);
                }
                Constant::MethodType { descriptor_index } => writer.emit_u16(*descriptor_index),
                Constant::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                }
                | Constant::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    writer.emit_u16(*bootstrap_method_attr_index);
                    writer.emit_u16(*name_and_type_index);
                }
                Constant::Module { name_index } | Constant::Package { name_index } => {
                    writer.emit_u16(*name_index)
                }
                Constant::Unusable => {}
            }
        }
        Ok(())
    }

    /// Decode a pool, starting at `constant_pool_count`
    pub fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, PoolError> {
        let count = reader.read_u16()? as usize;
        let mut pool = Self {
            entries: Vec::with_capacity(count.max(1)),
            lookup: FxHashMap::default(),
        };
        pool.entries.push(Constant::Unusable);

        while pool.entries.len() < count {
            let index = pool.entries.len() as u16;
            let tag = reader.read_u8()?;
            let constant = match tag {
                1 => Constant::Utf8(reader.read_utf8()?),
                3 => Constant::Integer(reader.read_i32()?),
                4 => Constant::Float(reader.read_u32()?),
                5 => Constant::Long(reader.read_u64()? as i64),
                6 => Constant::Double(reader.read_u64()?),
                7 => Constant::Class {
                    name_index: reader.read_u16()?,
                },
                8 => Constant::String {
                    string_index: reader.read_u16()?,
                },
                9 => Constant::Fieldref {
                    class_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                10 => Constant::Methodref {
                    class_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                11 => Constant::InterfaceMethodref {
                    class_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                12 => Constant::NameAndType {
                    name_index: reader.read_u16()?,
                    descriptor_index: reader.read_u16()?,
                },
                15 => Constant::MethodHandle {
                    reference_kind: reader.read_u8()?,
                    reference_index: reader.read_u16()?,
                },
                16 => Constant::MethodType {
                    descriptor_index: reader.read_u16()?,
                },
                17 => Constant::Dynamic {
                    bootstrap_method_attr_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                18 => Constant::InvokeDynamic {
                    bootstrap_method_attr_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                19 => Constant::Module {
                    name_index: reader.read_u16()?,
                },
                20 => Constant::Package {
                    name_index: reader.read_u16()?,
                },
                tag => return Err(PoolError::UnsupportedTag { tag, index }),
            };

            // First occurrence wins for de-duplication; duplicates are legal
            pool.lookup.entry(constant.clone()).or_insert(index);
            let wide = constant.is_wide();
            pool.entries.push(constant);
            if wide {
                pool.entries.push(Constant::Unusable);
            }
        }

        if pool.entries.len() > count {
            // A trailing Long/Double spilled past the declared count
            return Err(PoolError::InvalidIndex {
                index: count as u16,
                expected: "pool end on a slot boundary",
            });
        }

        Ok(pool)
    }
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_deduplicates() {
        let mut pool = ConstantPool::new();
        let a = pool.add_class("a/b/Foo").unwrap();
        let b = pool.add_class("a/b/Foo").unwrap();
        assert_eq!(a, b);
        // Utf8 + Class
        assert_eq!(pool.count(), 3);
        assert_eq!(pool.class_name(a).unwrap(), "a/b/Foo");
    }

    #[test]
    fn test_wide_entries_take_two_slots() {
        let mut pool = ConstantPool::new();
        let long = pool.add(Constant::Long(1)).unwrap();
        let next = pool.add_utf8("x").unwrap();
        assert_eq!(long, 1);
        assert_eq!(next, 3);
        assert!(pool.get(2).is_none());
    }

    #[test]
    fn test_member_ref_resolution() {
        let mut pool = ConstantPool::new();
        let index = pool
            .add_member_ref(MemberKind::Method, "a/b/Foo", "doX", "()V")
            .unwrap();
        let member = pool.member_ref(index).unwrap();
        assert_eq!(member.kind, MemberKind::Method);
        assert_eq!(member.owner, "a/b/Foo");
        assert_eq!(member.name, "doX");
        assert_eq!(member.descriptor, "()V");
    }

    #[test]
    fn test_set_keeps_lookup_coherent() {
        let mut pool = ConstantPool::new();
        let foo = pool.add_class("a/b/Foo").unwrap();
        let bar_name = pool.add_utf8("a/b/Bar").unwrap();
        pool.set(foo, Constant::Class { name_index: bar_name }).unwrap();

        // Adding Foo again must not hand back the rewritten slot
        let foo_again = pool.add_class("a/b/Foo").unwrap();
        assert_ne!(foo_again, foo);
        assert_eq!(pool.class_name(foo_again).unwrap(), "a/b/Foo");
        // Adding Bar reuses the rewritten slot
        assert_eq!(pool.add_class("a/b/Bar").unwrap(), foo);
    }

    #[test]
    fn test_encode_decode() {
        let mut pool = ConstantPool::new();
        pool.add_string("hello").unwrap();
        pool.add(Constant::Double(2.5f64.to_bits())).unwrap();
        pool.add_member_ref(MemberKind::Field, "a/Owner", "f", "I").unwrap();

        let mut writer = BytecodeWriter::new();
        pool.encode(&mut writer).unwrap();
        let bytes = writer.into_bytes();
        let decoded = ConstantPool::decode(&mut BytecodeReader::new(&bytes)).unwrap();
        assert_eq!(decoded.count(), pool.count());
        for (index, constant) in pool.iter() {
            assert_eq!(decoded.get(index), Some(constant));
        }
    }

    #[test]
    fn test_encode_rejects_oversized_utf8() {
        let mut pool = ConstantPool::new();
        pool.add_string(&"s".repeat(70_000)).unwrap();
        let result = pool.encode(&mut BytecodeWriter::new());
        assert!(matches!(
            result,
            Err(PoolError::Encode(EncodeError::StringTooLong(70_000)))
        ));
    }

    #[test]
    fn test_unsupported_tag() {
        let bytes = [0x00, 0x02, 0x02];
        let result = ConstantPool::decode(&mut BytecodeReader::new(&bytes));
        assert!(matches!(result, Err(PoolError::UnsupportedTag { tag: 2, index: 1 })));
    }

    #[test]
    fn test_wrong_kind_is_reported() {
        let mut pool = ConstantPool::new();
        let utf = pool.add_utf8("x").unwrap();
        assert!(matches!(
            pool.class_name(utf),
            Err(PoolError::InvalidIndex { expected: "Class", .. })
        ));
    }
}
