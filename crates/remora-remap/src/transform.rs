//! Post-substitution class transformers
//!
//! Transformers run in registration order after symbol substitution and
//! before frames are recomputed. They may edit code and the constant pool
//! but never the identity of the class.

use crate::bridge::{Redirect, REDIRECTS};
use crate::error::RemapError;
use crate::remapper::Remapper;
use remora_classfile::{decode_instructions, ClassFile, ClassFileError, ConstantPool, MemberKind, Opcode};
use std::sync::Arc;
use tracing::debug;

/// A rewrite applied to every class after substitution
pub trait Transformer: Send + Sync {
    /// Unique id within a chain
    fn id(&self) -> &str;

    fn transform(&self, class: &mut ClassFile, remapper: &Remapper) -> Result<(), RemapError>;
}

/// Ordered, append-only list of transformers
#[derive(Default, Clone)]
pub struct TransformerChain {
    transformers: Vec<Arc<dyn Transformer>>,
}

impl TransformerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transformer; a duplicate id is rejected
    pub fn register(&mut self, transformer: Arc<dyn Transformer>) -> Result<(), RemapError> {
        if self.transformers.iter().any(|t| t.id() == transformer.id()) {
            return Err(RemapError::Transformer {
                id: transformer.id().to_string(),
                reason: "duplicate transformer id".to_string(),
            });
        }
        self.transformers.push(transformer);
        Ok(())
    }

    /// Registered ids, in order
    pub fn ids(&self) -> Vec<&str> {
        self.transformers.iter().map(|t| t.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    /// Run every transformer, failing if one renames the class
    pub fn apply(&self, class: &mut ClassFile, remapper: &Remapper) -> Result<(), RemapError> {
        let identity = class_name(class)?;
        for transformer in &self.transformers {
            transformer.transform(class, remapper)?;
            let name = class_name(class)?;
            if name != identity {
                return Err(RemapError::Transformer {
                    id: transformer.id().to_string(),
                    reason: format!("renamed {} to {}", identity, name),
                });
            }
        }
        Ok(())
    }
}

fn class_name(class: &ClassFile) -> Result<String, RemapError> {
    class
        .name()
        .map(str::to_string)
        .map_err(|e| RemapError::malformed("<unknown>", e))
}

/// Routes reflective lookups through the engine's bridge
///
/// `invokevirtual Class.getField(String)` becomes
/// `invokestatic Bridge.getField(Class, String)`: same length, same stack
/// effect, so no offset moves.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReflectionRedirect;

impl ReflectionRedirect {
    pub const ID: &'static str = "reflection-redirect";
}

impl Transformer for ReflectionRedirect {
    fn id(&self) -> &str {
        Self::ID
    }

    fn transform(&self, class: &mut ClassFile, remapper: &Remapper) -> Result<(), RemapError> {
        let name = class_name(class)?;
        if name == remapper.bridge_name() {
            return Ok(());
        }
        let malformed = |e: ClassFileError| RemapError::malformed(name.as_str(), e);

        for index in 0..class.methods.len() {
            let Some(mut code) = class.methods[index].code(&class.constant_pool).map_err(malformed)? else {
                continue;
            };
            let sites = call_sites(&class.constant_pool, &code.code).map_err(malformed)?;
            if sites.is_empty() {
                continue;
            }
            for &(offset, redirect) in &sites {
                let target = class
                    .constant_pool
                    .add_member_ref(
                        MemberKind::Method,
                        remapper.bridge_name(),
                        redirect.bridge_method,
                        &redirect.bridge_descriptor(),
                    )
                    .map_err(|e| malformed(e.into()))?;
                code.code[offset] = Opcode::Invokestatic.to_u8();
                code.code[offset + 1..offset + 3].copy_from_slice(&target.to_be_bytes());
            }
            class.methods[index].set_code(&class.constant_pool, &code);
            debug!(class = %name, sites = sites.len(), "redirected reflective calls");
        }
        Ok(())
    }
}

fn call_sites(pool: &ConstantPool, code: &[u8]) -> Result<Vec<(usize, &'static Redirect)>, ClassFileError> {
    let mut sites = Vec::new();
    for insn in decode_instructions(code)? {
        let is_static = match insn.opcode {
            Opcode::Invokevirtual => false,
            Opcode::Invokestatic => true,
            _ => continue,
        };
        let member = pool.member_ref(insn.u16_operand())?;
        if let Some(redirect) = REDIRECTS.iter().find(|r| r.matches(&member, is_static)) {
            sites.push((insn.offset, redirect));
        }
    }
    Ok(sites)
}
