//! SRG and CSRG mapping file reader
//!
//! SRG lines are tagged (`PK:`, `CL:`, `FD:`, `MD:`); CSRG lines are bare
//! columns (two for a class or package, three for a field, four for a
//! method). Both forms may be mixed in one file.

use crate::mapping::NameMapping;
use std::path::Path;
use thiserror::Error;

/// Mapping file errors
#[derive(Debug, Error)]
pub enum MappingError {
    /// Failed to read the mapping file
    #[error("Failed to read mapping file: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed line
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },
}

/// Read a mapping file
pub fn load(path: &Path) -> Result<NameMapping, MappingError> {
    let content = std::fs::read_to_string(path)?;
    parse(&content)
}

/// Parse SRG / CSRG text into an internal→public mapping
pub fn parse(text: &str) -> Result<NameMapping, MappingError> {
    let mut mapping = NameMapping::new();

    for (number, raw) in text.lines().enumerate() {
        let line = number + 1;
        let content = raw.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }

        let syntax = |message: &str| MappingError::Syntax {
            line,
            message: format!("{}: {}", message, content),
        };

        let (tag, rest) = match content.split_once(": ") {
            Some((tag, rest)) if tag.len() == 2 => (Some(tag), rest),
            _ => (None, content),
        };
        let columns: Vec<&str> = rest.split_whitespace().collect();

        match (tag, columns.as_slice()) {
            (Some("PK"), [from, to]) => {
                // `./` stands for the default package
                let from = if *from == "." { "" } else { from };
                let to = if *to == "." { "" } else { to };
                mapping.add_package(from, to);
            }
            (Some("CL"), [from, to]) => mapping.add_class(from, to),
            (Some("FD"), [from, to]) | (Some("FD"), [from, _, to, _]) => {
                let (owner, name) = split_member(from).ok_or_else(|| syntax("Invalid field"))?;
                let (_, mapped) = split_member(to).ok_or_else(|| syntax("Invalid field"))?;
                let descriptor = if columns.len() == 4 { Some(columns[1]) } else { None };
                mapping.add_field(owner, name, descriptor, mapped);
            }
            (Some("MD"), [from, descriptor, to, _]) => {
                let (owner, name) = split_member(from).ok_or_else(|| syntax("Invalid method"))?;
                let (_, mapped) = split_member(to).ok_or_else(|| syntax("Invalid method"))?;
                mapping.add_method(owner, name, descriptor, mapped);
            }
            (Some(_), _) => return Err(syntax("Unknown or malformed entry")),
            (None, [from, to]) if from.ends_with('/') => mapping.add_package(from, to),
            (None, [from, to]) => mapping.add_class(from, to),
            (None, [owner, name, mapped]) => mapping.add_field(owner, name, None, mapped),
            (None, [owner, name, descriptor, mapped]) => mapping.add_method(owner, name, descriptor, mapped),
            (None, _) => return Err(syntax("Expected 2, 3 or 4 columns")),
        }
    }

    Ok(mapping)
}

fn split_member(qualified: &str) -> Option<(&str, &str)> {
    let (owner, name) = qualified.rsplit_once('/')?;
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_srg() {
        let text = "\
# sample
PK: a/b org/pub
CL: a/b/Foo org/pub/Foo
FD: a/b/Foo/f_1 org/pub/Foo/count
MD: a/b/Foo/doX ()V org/pub/Foo/run ()V
";
        let mapping = parse(text).unwrap();
        assert_eq!(mapping.map_class("a/b/Foo"), Some("org/pub/Foo"));
        assert_eq!(mapping.map_type("a/b/Other"), "org/pub/Other");
        assert_eq!(mapping.map_field("a/b/Foo", "f_1", "I"), Some("count"));
        assert_eq!(mapping.map_method("a/b/Foo", "doX", "()V"), Some("run"));
    }

    #[test]
    fn test_parse_csrg() {
        let text = "\
a/b/ org/pub/
a/b/Foo org/pub/Foo
a/b/Foo f_1 count
a/b/Foo doX ()V run   # trailing comment
";
        let mapping = parse(text).unwrap();
        assert_eq!(mapping.map_type("a/b/Foo"), "org/pub/Foo");
        assert_eq!(mapping.map_type("a/b/Zed"), "org/pub/Zed");
        assert_eq!(mapping.map_field("a/b/Foo", "f_1", "Z"), Some("count"));
        assert_eq!(mapping.map_method("a/b/Foo", "doX", "()V"), Some("run"));
    }

    #[test]
    fn test_srg_field_with_descriptor() {
        let mapping = parse("FD: a/b/Foo/f_1 I org/pub/Foo/count I").unwrap();
        assert_eq!(mapping.map_field("a/b/Foo", "f_1", "I"), Some("count"));
        assert_eq!(mapping.fields().len(), 2);
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = parse("CL: a/b/Foo org/pub/Foo\n\nMD: broken\n").unwrap_err();
        match err {
            MappingError::Syntax { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_member_name() {
        assert!(parse("FD: f_1 count").is_err());
        assert!(parse("a b c d e").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.srg");
        std::fs::write(&path, "CL: a/b/Foo org/pub/Foo\n").unwrap();
        let mapping = load(&path).unwrap();
        assert_eq!(mapping.class_count(), 1);
    }
}
