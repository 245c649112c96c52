//! Field and method descriptors, generic signatures
//!
//! The `map_*` functions rewrite every class name embedded in a descriptor or
//! signature through a caller-supplied function and leave everything else
//! byte-for-byte intact.

use std::fmt;
use thiserror::Error;

/// Descriptor and signature errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    /// Grammar violation
    #[error("Invalid descriptor {descriptor:?} at position {position}")]
    Invalid { descriptor: String, position: usize },
}

/// A field type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
    /// Class or interface, by internal name
    Object(String),
    /// Array of the element type
    Array(Box<FieldType>),
}

impl FieldType {
    /// Parse a complete field descriptor
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut parser = Parser::new(descriptor);
        let ty = parser.field_type()?;
        parser.finish()?;
        Ok(ty)
    }

    /// Number of local variable / stack slots taken
    pub fn slots(&self) -> usize {
        match self {
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }

    /// Rewrite embedded class names
    pub fn map_names(&self, map: &mut dyn FnMut(&str) -> String) -> Self {
        match self {
            FieldType::Object(name) => FieldType::Object(map(name)),
            FieldType::Array(element) => FieldType::Array(Box::new(element.map_names(map))),
            other => other.clone(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Byte => f.write_str("B"),
            FieldType::Char => f.write_str("C"),
            FieldType::Double => f.write_str("D"),
            FieldType::Float => f.write_str("F"),
            FieldType::Int => f.write_str("I"),
            FieldType::Long => f.write_str("J"),
            FieldType::Short => f.write_str("S"),
            FieldType::Boolean => f.write_str("Z"),
            FieldType::Object(name) => write!(f, "L{name};"),
            FieldType::Array(element) => write!(f, "[{element}"),
        }
    }
}

/// A method descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Parameter types
    pub params: Vec<FieldType>,
    /// Return type, `None` for `void`
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    /// Parse a complete method descriptor
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut parser = Parser::new(descriptor);
        parser.expect(b'(')?;
        let mut params = Vec::new();
        while parser.peek() != Some(b')') {
            params.push(parser.field_type()?);
        }
        parser.expect(b')')?;
        let ret = if parser.peek() == Some(b'V') {
            parser.pos += 1;
            None
        } else {
            Some(parser.field_type()?)
        };
        parser.finish()?;
        Ok(Self { params, ret })
    }

    /// Slots taken by the parameters, excluding `this`
    pub fn param_slots(&self) -> usize {
        self.params.iter().map(FieldType::slots).sum()
    }

    /// Parameter part of the descriptor, e.g. `(ILjava/lang/String;)`
    pub fn params_descriptor(&self) -> String {
        let mut out = String::from("(");
        for param in &self.params {
            out.push_str(&param.to_string());
        }
        out.push(')');
        out
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.params_descriptor())?;
        match &self.ret {
            Some(ret) => write!(f, "{ret}"),
            None => f.write_str("V"),
        }
    }
}

/// Internal name of the element class of an array descriptor, if any.
///
/// Returns `None` for primitive arrays.
pub fn array_element_class(descriptor: &str) -> Option<&str> {
    let trimmed = descriptor.trim_start_matches('[');
    trimmed.strip_prefix('L')?.strip_suffix(';')
}

/// Rewrite the class names of a field descriptor
pub fn map_field_descriptor(
    descriptor: &str,
    map: &mut dyn FnMut(&str) -> String,
) -> Result<String, DescriptorError> {
    Ok(FieldType::parse(descriptor)?.map_names(map).to_string())
}

/// Rewrite the class names of a method descriptor
pub fn map_method_descriptor(
    descriptor: &str,
    map: &mut dyn FnMut(&str) -> String,
) -> Result<String, DescriptorError> {
    let parsed = MethodDescriptor::parse(descriptor)?;
    let mapped = MethodDescriptor {
        params: parsed.params.iter().map(|p| p.map_names(map)).collect(),
        ret: parsed.ret.as_ref().map(|r| r.map_names(map)),
    };
    Ok(mapped.to_string())
}

/// Rewrite the class names of a class, method or field generic signature.
///
/// Inner class suffixes (`Lp/Outer<TT;>.Inner;`) are mapped as the binary
/// name `p/Outer$Inner`, keeping only the part after the mapped outer name.
pub fn map_signature(
    signature: &str,
    map: &mut dyn FnMut(&str) -> String,
) -> Result<String, DescriptorError> {
    let mut parser = Parser::new(signature);
    let mut out = String::with_capacity(signature.len());

    if parser.peek() == Some(b'<') {
        parser.type_parameters(&mut out, map)?;
    }

    if parser.peek() == Some(b'(') {
        parser.pos += 1;
        out.push('(');
        while parser.peek() != Some(b')') {
            parser.java_type_signature(&mut out, map)?;
        }
        parser.pos += 1;
        out.push(')');
        if parser.peek() == Some(b'V') {
            parser.pos += 1;
            out.push('V');
        } else {
            parser.java_type_signature(&mut out, map)?;
        }
        while parser.peek() == Some(b'^') {
            parser.pos += 1;
            out.push('^');
            parser.reference_type_signature(&mut out, map)?;
        }
    } else {
        // Class signature: superclass then superinterfaces; a field signature
        // is the single-type case
        if !parser.has_more() {
            return Err(parser.error());
        }
        while parser.has_more() {
            parser.reference_type_signature(&mut out, map)?;
        }
    }

    parser.finish()?;
    Ok(out)
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self) -> DescriptorError {
        DescriptorError::Invalid {
            descriptor: self.text.to_string(),
            position: self.pos,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn has_more(&self) -> bool {
        self.pos < self.bytes.len()
    }

    fn expect(&mut self, byte: u8) -> Result<(), DescriptorError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn finish(&self) -> Result<(), DescriptorError> {
        if self.has_more() {
            Err(self.error())
        } else {
            Ok(())
        }
    }

    /// Read up to (not including) one of `stops`; must be non-empty
    fn until(&mut self, stops: &[u8]) -> Result<&'a str, DescriptorError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if stops.contains(&b) {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start || !self.has_more() {
            return Err(self.error());
        }
        // Stops are ASCII, so this is a char boundary
        Ok(&self.text[start..self.pos])
    }

    fn field_type(&mut self) -> Result<FieldType, DescriptorError> {
        let b = self.peek().ok_or_else(|| self.error())?;
        self.pos += 1;
        Ok(match b {
            b'B' => FieldType::Byte,
            b'C' => FieldType::Char,
            b'D' => FieldType::Double,
            b'F' => FieldType::Float,
            b'I' => FieldType::Int,
            b'J' => FieldType::Long,
            b'S' => FieldType::Short,
            b'Z' => FieldType::Boolean,
            b'L' => {
                let name = self.until(b";")?;
                self.pos += 1;
                FieldType::Object(name.to_string())
            }
            b'[' => FieldType::Array(Box::new(self.field_type()?)),
            _ => {
                self.pos -= 1;
                return Err(self.error());
            }
        })
    }

    fn type_parameters(
        &mut self,
        out: &mut String,
        map: &mut dyn FnMut(&str) -> String,
    ) -> Result<(), DescriptorError> {
        self.expect(b'<')?;
        out.push('<');
        while self.peek() != Some(b'>') {
            let ident = self.until(b":")?;
            out.push_str(ident);
            // Class bound (may be empty), then interface bounds
            while self.peek() == Some(b':') {
                self.pos += 1;
                out.push(':');
                if matches!(self.peek(), Some(b'L' | b'T' | b'[')) {
                    self.reference_type_signature(out, map)?;
                }
            }
        }
        self.pos += 1;
        out.push('>');
        Ok(())
    }

    fn java_type_signature(
        &mut self,
        out: &mut String,
        map: &mut dyn FnMut(&str) -> String,
    ) -> Result<(), DescriptorError> {
        match self.peek() {
            Some(b @ (b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z')) => {
                self.pos += 1;
                out.push(b as char);
                Ok(())
            }
            _ => self.reference_type_signature(out, map),
        }
    }

    fn reference_type_signature(
        &mut self,
        out: &mut String,
        map: &mut dyn FnMut(&str) -> String,
    ) -> Result<(), DescriptorError> {
        match self.peek() {
            Some(b'L') => self.class_type_signature(out, map),
            Some(b'T') => {
                self.pos += 1;
                let variable = self.until(b";")?;
                self.pos += 1;
                out.push('T');
                out.push_str(variable);
                out.push(';');
                Ok(())
            }
            Some(b'[') => {
                self.pos += 1;
                out.push('[');
                self.java_type_signature(out, map)
            }
            _ => Err(self.error()),
        }
    }

    fn class_type_signature(
        &mut self,
        out: &mut String,
        map: &mut dyn FnMut(&str) -> String,
    ) -> Result<(), DescriptorError> {
        self.expect(b'L')?;
        out.push('L');
        let mut binary = self.until(b"<.;")?.to_string();
        let mut mapped = map(&binary);
        out.push_str(&mapped);

        loop {
            match self.peek() {
                Some(b'<') => self.type_arguments(out, map)?,
                Some(b'.') => {
                    self.pos += 1;
                    let simple = self.until(b"<.;")?;
                    binary = format!("{binary}${simple}");
                    let mapped_inner = map(&binary);
                    let prefix = format!("{mapped}$");
                    let mapped_simple = match mapped_inner.strip_prefix(&prefix) {
                        Some(rest) => rest.to_string(),
                        None => match mapped_inner.rfind('$') {
                            Some(i) => mapped_inner[i + 1..].to_string(),
                            None => simple.to_string(),
                        },
                    };
                    out.push('.');
                    out.push_str(&mapped_simple);
                    mapped = mapped_inner;
                }
                Some(b';') => {
                    self.pos += 1;
                    out.push(';');
                    return Ok(());
                }
                _ => return Err(self.error()),
            }
        }
    }

    fn type_arguments(
        &mut self,
        out: &mut String,
        map: &mut dyn FnMut(&str) -> String,
    ) -> Result<(), DescriptorError> {
        self.expect(b'<')?;
        out.push('<');
        loop {
            match self.peek() {
                Some(b'>') => break,
                Some(b'*') => {
                    self.pos += 1;
                    out.push('*');
                }
                Some(b @ (b'+' | b'-')) => {
                    self.pos += 1;
                    out.push(b as char);
                    self.reference_type_signature(out, map)?;
                }
                Some(_) => self.reference_type_signature(out, map)?,
                None => return Err(self.error()),
            }
        }
        self.pos += 1;
        out.push('>');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rename(name: &str) -> String {
        match name {
            "a/b/Foo" => "org/pub/Foo".to_string(),
            "a/b/Foo$Inner" => "org/pub/Foo$Nested".to_string(),
            "a/b/Bar" => "org/pub/Bar".to_string(),
            other => other.to_string(),
        }
    }

    #[test]
    fn test_parse_method_descriptor() {
        let desc = MethodDescriptor::parse("(IJ[La/b/Foo;D)Ljava/lang/String;").unwrap();
        assert_eq!(desc.params.len(), 4);
        assert_eq!(desc.param_slots(), 1 + 2 + 1 + 2);
        assert_eq!(desc.ret, Some(FieldType::Object("java/lang/String".into())));
        assert_eq!(desc.to_string(), "(IJ[La/b/Foo;D)Ljava/lang/String;");
        assert_eq!(desc.params_descriptor(), "(IJ[La/b/Foo;D)");
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(MethodDescriptor::parse("(I").is_err());
        assert!(MethodDescriptor::parse("()").is_err());
        assert!(FieldType::parse("La/b/Foo").is_err());
        assert!(FieldType::parse("Q").is_err());
        assert!(FieldType::parse("II").is_err());
        assert!(FieldType::parse("V").is_err());
    }

    #[test]
    fn test_map_descriptors() {
        let mut map = rename;
        assert_eq!(
            map_method_descriptor("(La/b/Foo;[[La/b/Bar;I)La/b/Foo;", &mut map).unwrap(),
            "(Lorg/pub/Foo;[[Lorg/pub/Bar;I)Lorg/pub/Foo;"
        );
        assert_eq!(map_field_descriptor("[J", &mut map).unwrap(), "[J");
    }

    #[test]
    fn test_map_signature_generics() {
        let mut map = rename;
        let sig = "<T:La/b/Foo;:Ljava/lang/Comparable<TT;>;>(Ljava/util/List<+La/b/Bar;>;TT;)V^La/b/Foo;";
        assert_eq!(
            map_signature(sig, &mut map).unwrap(),
            "<T:Lorg/pub/Foo;:Ljava/lang/Comparable<TT;>;>(Ljava/util/List<+Lorg/pub/Bar;>;TT;)V^Lorg/pub/Foo;"
        );
    }

    #[test]
    fn test_map_signature_inner_class() {
        let mut map = rename;
        assert_eq!(
            map_signature("La/b/Foo<*>.Inner<La/b/Bar;>;", &mut map).unwrap(),
            "Lorg/pub/Foo<*>.Nested<Lorg/pub/Bar;>;"
        );
    }

    #[test]
    fn test_map_signature_class_with_empty_class_bound() {
        let mut map = rename;
        assert_eq!(
            map_signature("<E::Ljava/lang/Runnable;>La/b/Foo;Ljava/lang/Iterable<TE;>;", &mut map).unwrap(),
            "<E::Ljava/lang/Runnable;>Lorg/pub/Foo;Ljava/lang/Iterable<TE;>;"
        );
    }

    #[test]
    fn test_map_signature_rejects_garbage() {
        let mut map = rename;
        assert!(map_signature("La/b/Foo", &mut map).is_err());
        assert!(map_signature("", &mut map).is_err());
    }

    #[test]
    fn test_array_element_class() {
        assert_eq!(array_element_class("[[La/b/Foo;"), Some("a/b/Foo"));
        assert_eq!(array_element_class("[I"), None);
    }
}
