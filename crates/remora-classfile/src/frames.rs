//! Stack map frame computation
//!
//! Recomputes `max_stack`, `max_locals` and the `StackMapTable` of a method by
//! abstract interpretation over verification types. Merging two class types
//! asks a [`Hierarchy`] for their common superclass, so the result depends on
//! the class graph the caller supplies.
//!
//! Unreachable code cannot be described by frames; it is overwritten with
//! `nop ... athrow` and cut out of the exception table, the way the JDK's own
//! class writers do it.

use crate::classfile::{find_attribute, AttributeInfo, ClassFile, ClassFileError, ExceptionEntry, OBJECT, access};
use crate::constants::{Constant, ConstantPool, PoolError};
use crate::descriptor::{DescriptorError, FieldType, MethodDescriptor};
use crate::encoder::{BytecodeWriter, DecodeError};
use crate::opcode::{decode_instructions, Instruction, Opcode};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

const THROWABLE: &str = "java/lang/Throwable";

/// Frame computation errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Constant pool error
    #[error("Constant pool error: {0}")]
    Pool(#[from] PoolError),

    /// Class-file structure error
    #[error("Class file error: {0}")]
    ClassFile(#[from] ClassFileError),

    /// Descriptor error
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// No method at the given index
    #[error("No method at index {0}")]
    NoSuchMethod(usize),

    /// Method has no `Code` attribute
    #[error("Method has no code")]
    NoCode,

    /// `jsr` / `ret` cannot be described by stack map frames
    #[error("Subroutine instruction at offset {0}")]
    Subroutine(usize),

    /// Pop from an empty operand stack
    #[error("Stack underflow at offset {0}")]
    StackUnderflow(usize),

    /// Two paths reach an instruction with different stack heights
    #[error("Inconsistent stack height at offset {offset}: {expected} vs {actual}")]
    StackHeightMismatch {
        offset: usize,
        expected: usize,
        actual: usize,
    },

    /// Branch or handler into the middle of an instruction
    #[error("Target {target} from offset {offset} is not an instruction boundary")]
    InvalidTarget { target: usize, offset: usize },

    /// Execution falls off the end of the code
    #[error("Execution falls off end of code at offset {0}")]
    FallOffEnd(usize),
}

/// Answers superclass questions while merging types
pub trait Hierarchy {
    /// Nearest common superclass of two classes, by internal name
    fn common_super_class(&self, a: &str, b: &str) -> String;
}

/// Hierarchy that knows nothing: every distinct pair merges to `java/lang/Object`
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectHierarchy;

impl Hierarchy for ObjectHierarchy {
    fn common_super_class(&self, a: &str, b: &str) -> String {
        if a == b {
            a.to_string()
        } else {
            OBJECT.to_string()
        }
    }
}

/// Verification type (JVMS 4.10.1.2)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// Class by internal name, or array by descriptor
    Object(String),
    /// Result of the `new` at this offset, before its constructor ran
    Uninitialized(u16),
}

impl VType {
    /// Whether this type takes two slots
    pub fn is_wide(&self) -> bool {
        matches!(self, VType::Long | VType::Double)
    }

    fn slots(&self) -> usize {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    fn from_field_type(ty: &FieldType) -> Self {
        match ty {
            FieldType::Byte
            | FieldType::Char
            | FieldType::Short
            | FieldType::Boolean
            | FieldType::Int => VType::Integer,
            FieldType::Float => VType::Float,
            FieldType::Long => VType::Long,
            FieldType::Double => VType::Double,
            FieldType::Object(name) => VType::Object(name.clone()),
            FieldType::Array(_) => VType::Object(ty.to_string()),
        }
    }

    fn from_descriptor(descriptor: &str) -> Result<Self, DescriptorError> {
        Ok(Self::from_field_type(&FieldType::parse(descriptor)?))
    }

    fn encode(&self, writer: &mut BytecodeWriter, pool: &mut ConstantPool) -> Result<(), PoolError> {
        match self {
            VType::Top => writer.emit_u8(0),
            VType::Integer => writer.emit_u8(1),
            VType::Float => writer.emit_u8(2),
            VType::Double => writer.emit_u8(3),
            VType::Long => writer.emit_u8(4),
            VType::Null => writer.emit_u8(5),
            VType::UninitializedThis => writer.emit_u8(6),
            VType::Object(name) => {
                writer.emit_u8(7);
                writer.emit_u16(pool.add_class(name)?);
            }
            VType::Uninitialized(offset) => {
                writer.emit_u8(8);
                writer.emit_u16(*offset);
            }
        }
        Ok(())
    }
}

/// One compressed `StackMapTable` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    /// Same locals, empty stack (`same_frame` / `same_frame_extended`)
    Same { offset_delta: u16 },
    /// Same locals, one stack item (with its extended form)
    SameLocals1StackItem { offset_delta: u16, stack: VType },
    /// The last `k` locals removed, empty stack
    Chop { offset_delta: u16, k: u8 },
    /// Up to three locals added, empty stack
    Append { offset_delta: u16, locals: Vec<VType> },
    /// Everything spelled out
    Full {
        offset_delta: u16,
        locals: Vec<VType>,
        stack: Vec<VType>,
    },
}

/// Encode frames as the body of a `StackMapTable` attribute
pub fn encode_stack_map(frames: &[StackMapFrame], pool: &mut ConstantPool) -> Result<Vec<u8>, PoolError> {
    let mut writer = BytecodeWriter::new();
    writer.emit_u16(frames.len() as u16);
    for frame in frames {
        match frame {
            StackMapFrame::Same { offset_delta } if *offset_delta <= 63 => {
                writer.emit_u8(*offset_delta as u8);
            }
            StackMapFrame::Same { offset_delta } => {
                writer.emit_u8(251);
                writer.emit_u16(*offset_delta);
            }
            StackMapFrame::SameLocals1StackItem { offset_delta, stack } => {
                if *offset_delta <= 63 {
                    writer.emit_u8(64 + *offset_delta as u8);
                } else {
                    writer.emit_u8(247);
                    writer.emit_u16(*offset_delta);
                }
                stack.encode(&mut writer, pool)?;
            }
            StackMapFrame::Chop { offset_delta, k } => {
                writer.emit_u8(251 - k);
                writer.emit_u16(*offset_delta);
            }
            StackMapFrame::Append { offset_delta, locals } => {
                writer.emit_u8(251 + locals.len() as u8);
                writer.emit_u16(*offset_delta);
                for local in locals {
                    local.encode(&mut writer, pool)?;
                }
            }
            StackMapFrame::Full {
                offset_delta,
                locals,
                stack,
            } => {
                writer.emit_u8(255);
                writer.emit_u16(*offset_delta);
                writer.emit_u16(locals.len() as u16);
                for local in locals {
                    local.encode(&mut writer, pool)?;
                }
                writer.emit_u16(stack.len() as u16);
                for item in stack {
                    item.encode(&mut writer, pool)?;
                }
            }
        }
    }
    Ok(writer.into_bytes())
}

/// Result of analysing one method
#[derive(Debug, Clone)]
pub struct ComputedFrames {
    /// Operand stack size
    pub max_stack: u16,
    /// Local variable slots
    pub max_locals: u16,
    /// Code with unreachable ranges neutralised
    pub code: Vec<u8>,
    /// Exception table with unreachable ranges removed
    pub exception_table: Vec<ExceptionEntry>,
    /// Compressed frames in offset order
    pub frames: Vec<StackMapFrame>,
}

impl ComputedFrames {
    /// Write the results into the method's `Code` attribute
    pub fn apply(self, class: &mut ClassFile, method_index: usize) -> Result<(), FrameError> {
        let method = class
            .methods
            .get(method_index)
            .ok_or(FrameError::NoSuchMethod(method_index))?;
        let mut code = method.code(&class.constant_pool)?.ok_or(FrameError::NoCode)?;

        code.max_stack = self.max_stack;
        code.max_locals = self.max_locals;
        code.code = self.code;
        code.exception_table = self.exception_table;

        let pool = &mut class.constant_pool;
        code.attributes
            .retain(|attribute| attribute.name(pool).map(|n| n != "StackMapTable").unwrap_or(true));
        if !self.frames.is_empty() {
            code.attributes.push(AttributeInfo {
                name_index: pool.add_utf8("StackMapTable")?,
                info: encode_stack_map(&self.frames, pool)?,
            });
        }

        class.methods[method_index].set_code(&class.constant_pool, &code);
        Ok(())
    }
}

/// Compute frames and maxima for the method at `method_index`
pub fn compute_frames(
    class: &ClassFile,
    method_index: usize,
    hierarchy: &dyn Hierarchy,
) -> Result<ComputedFrames, FrameError> {
    let pool = &class.constant_pool;
    let method = class
        .methods
        .get(method_index)
        .ok_or(FrameError::NoSuchMethod(method_index))?;
    let code = method.code(pool)?.ok_or(FrameError::NoCode)?;
    let descriptor = MethodDescriptor::parse(method.descriptor(pool)?)?;
    let initial = initial_frame(
        class.name()?,
        method.name(pool)?,
        &descriptor,
        method.access_flags & access::STATIC != 0,
    );

    let mut analyzer = Analyzer::new(class.name()?, pool, &code.code, &code.exception_table, hierarchy)?;
    analyzer.run(initial.clone())?;
    analyzer.finish(initial)
}

/// Compute only `(max_stack, max_locals)`, without a class hierarchy
pub fn compute_maxs(class: &ClassFile, method_index: usize) -> Result<(u16, u16), FrameError> {
    let computed = compute_frames(class, method_index, &ObjectHierarchy)?;
    Ok((computed.max_stack, computed.max_locals))
}

/// Whether a method's code contains `jsr` or `ret`
pub fn has_subroutines(code: &[u8]) -> Result<bool, DecodeError> {
    Ok(decode_instructions(code)?
        .iter()
        .any(|insn| matches!(insn.opcode, Opcode::Jsr | Opcode::JsrW | Opcode::Ret)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    locals: Vec<VType>,
    stack: Vec<VType>,
}

impl Frame {
    fn push(&mut self, ty: VType) {
        self.stack.push(ty);
    }

    fn pop(&mut self, offset: usize) -> Result<VType, FrameError> {
        self.stack.pop().ok_or(FrameError::StackUnderflow(offset))
    }

    fn pop_n(&mut self, n: usize, offset: usize) -> Result<(), FrameError> {
        for _ in 0..n {
            self.pop(offset)?;
        }
        Ok(())
    }

    fn local(&self, index: usize) -> VType {
        self.locals.get(index).cloned().unwrap_or(VType::Top)
    }

    fn set_local(&mut self, index: usize, ty: VType) {
        let end = index + ty.slots();
        if self.locals.len() < end {
            self.locals.resize(end, VType::Top);
        }
        if index > 0 && self.locals[index - 1].is_wide() {
            self.locals[index - 1] = VType::Top;
        }
        if ty.is_wide() {
            self.locals[index + 1] = VType::Top;
        }
        self.locals[index] = ty;
    }

    fn stack_slots(&self) -> usize {
        self.stack.iter().map(VType::slots).sum()
    }

    /// Replace an uninitialized type after its constructor ran
    fn initialize(&mut self, uninitialized: &VType, initialized: &VType) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if slot == uninitialized {
                *slot = initialized.clone();
            }
        }
    }
}

fn initial_frame(class_name: &str, method_name: &str, descriptor: &MethodDescriptor, is_static: bool) -> Frame {
    let mut frame = Frame {
        locals: Vec::new(),
        stack: Vec::new(),
    };
    if !is_static {
        let this = if method_name == "<init>" && class_name != OBJECT {
            VType::UninitializedThis
        } else {
            VType::Object(class_name.to_string())
        };
        frame.locals.push(this);
    }
    for param in &descriptor.params {
        let ty = VType::from_field_type(param);
        let wide = ty.is_wide();
        frame.locals.push(ty);
        if wide {
            frame.locals.push(VType::Top);
        }
    }
    frame
}

/// Collapse slot-per-entry locals into frame notation
fn compact_locals(locals: &[VType]) -> Vec<VType> {
    let mut out = Vec::with_capacity(locals.len());
    let mut i = 0;
    while i < locals.len() {
        let ty = locals[i].clone();
        i += ty.slots();
        out.push(ty);
    }
    while out.last() == Some(&VType::Top) {
        out.pop();
    }
    out
}

fn compress(offset_delta: u16, previous: &[VType], locals: Vec<VType>, stack: Vec<VType>) -> StackMapFrame {
    if stack.is_empty() {
        if locals == previous {
            return StackMapFrame::Same { offset_delta };
        }
        if locals.len() < previous.len()
            && previous.len() - locals.len() <= 3
            && previous[..locals.len()] == locals[..]
        {
            return StackMapFrame::Chop {
                offset_delta,
                k: (previous.len() - locals.len()) as u8,
            };
        }
        if locals.len() > previous.len()
            && locals.len() - previous.len() <= 3
            && locals[..previous.len()] == previous[..]
        {
            return StackMapFrame::Append {
                offset_delta,
                locals: locals[previous.len()..].to_vec(),
            };
        }
    } else if stack.len() == 1 && locals == previous {
        return StackMapFrame::SameLocals1StackItem {
            offset_delta,
            stack: stack[0].clone(),
        };
    }
    StackMapFrame::Full {
        offset_delta,
        locals,
        stack,
    }
}

struct Analyzer<'a> {
    class_name: &'a str,
    pool: &'a ConstantPool,
    code: &'a [u8],
    handlers: &'a [ExceptionEntry],
    hierarchy: &'a dyn Hierarchy,
    instructions: Vec<Instruction<'a>>,
    index_of: FxHashMap<usize, usize>,
    frames: Vec<Option<Frame>>,
    max_stack: usize,
    max_locals: usize,
}

impl<'a> Analyzer<'a> {
    fn new(
        class_name: &'a str,
        pool: &'a ConstantPool,
        code: &'a [u8],
        handlers: &'a [ExceptionEntry],
        hierarchy: &'a dyn Hierarchy,
    ) -> Result<Self, FrameError> {
        let instructions = decode_instructions(code)?;
        let index_of = instructions
            .iter()
            .enumerate()
            .map(|(i, insn)| (insn.offset, i))
            .collect();
        let frames = vec![None; instructions.len()];
        Ok(Self {
            class_name,
            pool,
            code,
            handlers,
            hierarchy,
            instructions,
            index_of,
            frames,
            max_stack: 0,
            max_locals: 0,
        })
    }

    fn index(&self, target: usize, from: usize) -> Result<usize, FrameError> {
        self.index_of
            .get(&target)
            .copied()
            .ok_or(FrameError::InvalidTarget { target, offset: from })
    }

    fn track(&mut self, frame: &Frame) {
        self.max_stack = self.max_stack.max(frame.stack_slots());
        self.max_locals = self.max_locals.max(frame.locals.len());
    }

    fn run(&mut self, initial: Frame) -> Result<(), FrameError> {
        if self.instructions.is_empty() {
            return Err(FrameError::FallOffEnd(0));
        }
        self.track(&initial);
        self.frames[0] = Some(initial);
        let mut worklist = vec![0usize];
        let mut queued = vec![false; self.instructions.len()];
        queued[0] = true;

        while let Some(i) = worklist.pop() {
            queued[i] = false;
            let insn = self.instructions[i];
            let input = match &self.frames[i] {
                Some(frame) => frame.clone(),
                None => continue,
            };
            if matches!(insn.opcode, Opcode::Jsr | Opcode::JsrW | Opcode::Ret) {
                return Err(FrameError::Subroutine(insn.offset));
            }

            let mut output = input.clone();
            self.execute(&insn, &mut output)?;
            self.track(&output);

            let mut successors: Vec<(usize, Frame)> = Vec::new();
            for handler in self.handlers {
                let covered = (handler.start_pc as usize) <= insn.offset && insn.offset < handler.end_pc as usize;
                if !covered {
                    continue;
                }
                let caught = if handler.catch_type == 0 {
                    THROWABLE.to_string()
                } else {
                    self.pool.class_name(handler.catch_type)?.to_string()
                };
                let target = self.index(handler.handler_pc as usize, insn.offset)?;
                for locals in [&input.locals, &output.locals] {
                    successors.push((
                        target,
                        Frame {
                            locals: locals.clone(),
                            stack: vec![VType::Object(caught.clone())],
                        },
                    ));
                }
            }
            if !insn.opcode.is_terminator() {
                if i + 1 >= self.instructions.len() {
                    return Err(FrameError::FallOffEnd(insn.offset));
                }
                successors.push((i + 1, output.clone()));
            }
            for target in insn.branch_targets() {
                successors.push((self.index(target, insn.offset)?, output.clone()));
            }

            for (target, frame) in successors {
                self.track(&frame);
                if self.merge_into(target, frame)? && !queued[target] {
                    queued[target] = true;
                    worklist.push(target);
                }
            }
        }
        Ok(())
    }

    fn merge_into(&mut self, index: usize, frame: Frame) -> Result<bool, FrameError> {
        let merged = match &self.frames[index] {
            None => frame,
            Some(old) => {
                let merged = self.merge_frames(old, &frame, self.instructions[index].offset)?;
                if merged == *old {
                    return Ok(false);
                }
                merged
            }
        };
        self.frames[index] = Some(merged);
        Ok(true)
    }

    fn merge_frames(&self, old: &Frame, new: &Frame, offset: usize) -> Result<Frame, FrameError> {
        if old.stack.len() != new.stack.len() {
            return Err(FrameError::StackHeightMismatch {
                offset,
                expected: old.stack.len(),
                actual: new.stack.len(),
            });
        }
        let len = old.locals.len().max(new.locals.len());
        let locals = (0..len)
            .map(|i| self.merge_type(&old.local(i), &new.local(i)))
            .collect();
        let stack = old
            .stack
            .iter()
            .zip(&new.stack)
            .map(|(a, b)| self.merge_type(a, b))
            .collect();
        Ok(Frame { locals, stack })
    }

    fn merge_type(&self, a: &VType, b: &VType) -> VType {
        if a == b {
            return a.clone();
        }
        match (a, b) {
            (VType::Null, VType::Object(_)) => b.clone(),
            (VType::Object(_), VType::Null) => a.clone(),
            (VType::Object(x), VType::Object(y)) => VType::Object(self.merge_reference(x, y)),
            _ => VType::Top,
        }
    }

    fn merge_reference(&self, a: &str, b: &str) -> String {
        match (a.starts_with('['), b.starts_with('[')) {
            (false, false) => self.hierarchy.common_super_class(a, b),
            (true, true) => {
                let dims_a = a.bytes().take_while(|&c| c == b'[').count();
                let dims_b = b.bytes().take_while(|&c| c == b'[').count();
                let element_a = &a[dims_a..];
                let element_b = &b[dims_b..];
                let is_class = |e: &str| e.starts_with('L') && e.ends_with(';');
                if dims_a == dims_b && is_class(element_a) && is_class(element_b) {
                    let inner = self.merge_reference(
                        &element_a[1..element_a.len() - 1],
                        &element_b[1..element_b.len() - 1],
                    );
                    return format!("{}L{inner};", "[".repeat(dims_a));
                }
                // Mixed shapes meet at an Object array of the shallower depth
                let depth_a = if is_class(element_a) { dims_a } else { dims_a - 1 };
                let depth_b = if is_class(element_b) { dims_b } else { dims_b - 1 };
                match depth_a.min(depth_b) {
                    0 => OBJECT.to_string(),
                    depth => format!("{}L{OBJECT};", "[".repeat(depth)),
                }
            }
            _ => OBJECT.to_string(),
        }
    }

    fn constant_type(&self, index: u16) -> Result<VType, FrameError> {
        Ok(match self.pool.get(index) {
            Some(Constant::Integer(_)) => VType::Integer,
            Some(Constant::Float(_)) => VType::Float,
            Some(Constant::Long(_)) => VType::Long,
            Some(Constant::Double(_)) => VType::Double,
            Some(Constant::String { .. }) => VType::Object("java/lang/String".to_string()),
            Some(Constant::Class { .. }) => VType::Object("java/lang/Class".to_string()),
            Some(Constant::MethodType { .. }) => VType::Object("java/lang/invoke/MethodType".to_string()),
            Some(Constant::MethodHandle { .. }) => VType::Object("java/lang/invoke/MethodHandle".to_string()),
            Some(Constant::Dynamic {
                name_and_type_index, ..
            }) => {
                let (_, descriptor) = self.pool.name_and_type(*name_and_type_index)?;
                VType::from_descriptor(descriptor)?
            }
            _ => {
                return Err(PoolError::InvalidIndex {
                    index,
                    expected: "loadable constant",
                }
                .into())
            }
        })
    }

    fn execute(&self, insn: &Instruction<'a>, frame: &mut Frame) -> Result<(), FrameError> {
        const KINDS: [VType; 4] = [VType::Integer, VType::Long, VType::Float, VType::Double];
        let offset = insn.offset;
        let byte = insn.opcode.to_u8();

        match byte {
            // nop, iinc, goto, goto_w, return
            0x00 | 0x84 | 0xA7 | 0xC8 | 0xB1 => {}
            0x01 => frame.push(VType::Null),
            0x02..=0x08 | 0x10 | 0x11 => frame.push(VType::Integer),
            0x09 | 0x0A => frame.push(VType::Long),
            0x0B..=0x0D => frame.push(VType::Float),
            0x0E | 0x0F => frame.push(VType::Double),
            0x12 => frame.push(self.constant_type(insn.u8_operand() as u16)?),
            0x13 | 0x14 => frame.push(self.constant_type(insn.u16_operand())?),

            // Typed loads
            0x15..=0x18 => frame.push(KINDS[(byte - 0x15) as usize].clone()),
            0x19 => frame.push(frame.local(insn.local_index() as usize)),
            0x1A..=0x29 => frame.push(KINDS[((byte - 0x1A) / 4) as usize].clone()),
            0x2A..=0x2D => frame.push(frame.local((byte - 0x2A) as usize)),

            // Array loads
            0x2E..=0x31 => {
                frame.pop_n(2, offset)?;
                frame.push(KINDS[(byte - 0x2E) as usize].clone());
            }
            0x32 => {
                frame.pop(offset)?;
                let array = frame.pop(offset)?;
                frame.push(match array {
                    VType::Object(descriptor) if descriptor.starts_with('[') => {
                        VType::from_descriptor(&descriptor[1..])?
                    }
                    VType::Null => VType::Null,
                    _ => VType::Object(OBJECT.to_string()),
                });
            }
            0x33..=0x35 => {
                frame.pop_n(2, offset)?;
                frame.push(VType::Integer);
            }

            // Stores
            0x36..=0x3A => {
                let value = frame.pop(offset)?;
                let ty = if byte == 0x3A {
                    value
                } else {
                    KINDS[(byte - 0x36) as usize].clone()
                };
                frame.set_local(insn.local_index() as usize, ty);
            }
            0x3B..=0x4A => {
                frame.pop(offset)?;
                let kind = ((byte - 0x3B) / 4) as usize;
                frame.set_local(((byte - 0x3B) % 4) as usize, KINDS[kind].clone());
            }
            0x4B..=0x4E => {
                let value = frame.pop(offset)?;
                frame.set_local((byte - 0x4B) as usize, value);
            }
            0x4F..=0x56 => frame.pop_n(3, offset)?,

            // Stack manipulation
            0x57 => {
                frame.pop(offset)?;
            }
            0x58 => {
                if !frame.pop(offset)?.is_wide() {
                    frame.pop(offset)?;
                }
            }
            0x59 => {
                let v1 = frame.pop(offset)?;
                frame.push(v1.clone());
                frame.push(v1);
            }
            0x5A => {
                let v1 = frame.pop(offset)?;
                let v2 = frame.pop(offset)?;
                frame.stack.extend([v1.clone(), v2, v1]);
            }
            0x5B => {
                let v1 = frame.pop(offset)?;
                let v2 = frame.pop(offset)?;
                if v2.is_wide() {
                    frame.stack.extend([v1.clone(), v2, v1]);
                } else {
                    let v3 = frame.pop(offset)?;
                    frame.stack.extend([v1.clone(), v3, v2, v1]);
                }
            }
            0x5C => {
                let v1 = frame.pop(offset)?;
                if v1.is_wide() {
                    frame.stack.extend([v1.clone(), v1]);
                } else {
                    let v2 = frame.pop(offset)?;
                    frame.stack.extend([v2.clone(), v1.clone(), v2, v1]);
                }
            }
            0x5D => {
                let v1 = frame.pop(offset)?;
                let v2 = frame.pop(offset)?;
                if v1.is_wide() {
                    frame.stack.extend([v1.clone(), v2, v1]);
                } else {
                    let v3 = frame.pop(offset)?;
                    frame.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                }
            }
            0x5E => {
                let v1 = frame.pop(offset)?;
                let v2 = frame.pop(offset)?;
                match (v1.is_wide(), v2.is_wide()) {
                    (true, true) => frame.stack.extend([v1.clone(), v2, v1]),
                    (true, false) => {
                        let v3 = frame.pop(offset)?;
                        frame.stack.extend([v1.clone(), v3, v2, v1]);
                    }
                    (false, _) => {
                        let v3 = frame.pop(offset)?;
                        if v3.is_wide() {
                            frame.stack.extend([v2.clone(), v1.clone(), v3, v2, v1]);
                        } else {
                            let v4 = frame.pop(offset)?;
                            frame.stack.extend([v2.clone(), v1.clone(), v4, v3, v2, v1]);
                        }
                    }
                }
            }
            0x5F => {
                let v1 = frame.pop(offset)?;
                let v2 = frame.pop(offset)?;
                frame.stack.extend([v1, v2]);
            }

            // Arithmetic
            0x60..=0x73 => {
                frame.pop_n(2, offset)?;
                frame.push(KINDS[((byte - 0x60) % 4) as usize].clone());
            }
            0x74..=0x77 => {
                frame.pop(offset)?;
                frame.push(KINDS[(byte - 0x74) as usize].clone());
            }
            0x78..=0x83 => {
                frame.pop_n(2, offset)?;
                frame.push(if byte % 2 == 0 { VType::Integer } else { VType::Long });
            }

            // Conversions
            0x85..=0x93 => {
                frame.pop(offset)?;
                frame.push(match byte {
                    0x85 | 0x8C | 0x8F => VType::Long,
                    0x86 | 0x89 | 0x90 => VType::Float,
                    0x87 | 0x8A | 0x8D => VType::Double,
                    _ => VType::Integer,
                });
            }

            // Comparisons and branches
            0x94..=0x98 => {
                frame.pop_n(2, offset)?;
                frame.push(VType::Integer);
            }
            0x99..=0x9E | 0xC6 | 0xC7 | 0xAA | 0xAB => {
                frame.pop(offset)?;
            }
            0x9F..=0xA6 => frame.pop_n(2, offset)?,
            0xA8 | 0xA9 | 0xC9 => return Err(FrameError::Subroutine(offset)),
            0xAC..=0xB0 | 0xBF | 0xC2 | 0xC3 => {
                frame.pop(offset)?;
            }

            // Fields
            0xB2..=0xB5 => {
                let member = self.pool.member_ref(insn.u16_operand())?;
                let ty = VType::from_descriptor(member.descriptor)?;
                match byte {
                    0xB2 => frame.push(ty),
                    0xB3 => {
                        frame.pop(offset)?;
                    }
                    0xB4 => {
                        frame.pop(offset)?;
                        frame.push(ty);
                    }
                    _ => frame.pop_n(2, offset)?,
                }
            }

            // Invocations
            0xB6..=0xB9 => {
                let member = self.pool.member_ref(insn.u16_operand())?;
                let descriptor = MethodDescriptor::parse(member.descriptor)?;
                frame.pop_n(descriptor.params.len(), offset)?;
                if byte != 0xB8 {
                    let receiver = frame.pop(offset)?;
                    if byte == 0xB7 && member.name == "<init>" {
                        let initialized = match &receiver {
                            VType::UninitializedThis => VType::Object(self.class_name.to_string()),
                            VType::Uninitialized(at) => VType::Object(self.new_type(*at as usize)?),
                            other => other.clone(),
                        };
                        frame.initialize(&receiver, &initialized);
                    }
                }
                if let Some(ret) = &descriptor.ret {
                    frame.push(VType::from_field_type(ret));
                }
            }
            0xBA => {
                let name_and_type_index = match self.pool.get(insn.u16_operand()) {
                    Some(Constant::InvokeDynamic {
                        name_and_type_index, ..
                    }) => *name_and_type_index,
                    _ => {
                        return Err(PoolError::InvalidIndex {
                            index: insn.u16_operand(),
                            expected: "InvokeDynamic",
                        }
                        .into())
                    }
                };
                let (_, descriptor) = self.pool.name_and_type(name_and_type_index)?;
                let descriptor = MethodDescriptor::parse(descriptor)?;
                frame.pop_n(descriptor.params.len(), offset)?;
                if let Some(ret) = &descriptor.ret {
                    frame.push(VType::from_field_type(ret));
                }
            }

            // Objects and arrays
            0xBB => frame.push(VType::Uninitialized(offset as u16)),
            0xBC => {
                frame.pop(offset)?;
                let element = match insn.u8_operand() {
                    4 => 'Z',
                    5 => 'C',
                    6 => 'F',
                    7 => 'D',
                    8 => 'B',
                    9 => 'S',
                    10 => 'I',
                    _ => 'J',
                };
                frame.push(VType::Object(format!("[{element}")));
            }
            0xBD => {
                frame.pop(offset)?;
                let element = self.pool.class_name(insn.u16_operand())?;
                frame.push(VType::Object(if element.starts_with('[') {
                    format!("[{element}")
                } else {
                    format!("[L{element};")
                }));
            }
            0xBE | 0xC1 => {
                frame.pop(offset)?;
                frame.push(VType::Integer);
            }
            0xC0 => {
                frame.pop(offset)?;
                let target = self.pool.class_name(insn.u16_operand())?;
                frame.push(VType::Object(target.to_string()));
            }
            0xC5 => {
                frame.pop_n(insn.dimensions() as usize, offset)?;
                let array = self.pool.class_name(insn.u16_operand())?;
                frame.push(VType::Object(array.to_string()));
            }
            _ => return Err(DecodeError::InvalidOpcode(byte, offset).into()),
        }
        Ok(())
    }

    /// Class created by the `new` at `offset`
    fn new_type(&self, offset: usize) -> Result<String, FrameError> {
        match self.code.get(offset..offset + 3) {
            Some([0xBB, hi, lo]) => Ok(self.pool.class_name(u16::from_be_bytes([*hi, *lo]))?.to_string()),
            _ => Err(FrameError::InvalidTarget { target: offset, offset }),
        }
    }

    fn finish(self, initial: Frame) -> Result<ComputedFrames, FrameError> {
        let mut code = self.code.to_vec();
        let mut max_stack = self.max_stack;
        let reachable: Vec<bool> = self.frames.iter().map(Option::is_some).collect();

        // Unreachable runs as [start, end) byte ranges
        let mut dead: Vec<(usize, usize)> = Vec::new();
        let mut i = 0;
        while i < self.instructions.len() {
            if reachable[i] {
                i += 1;
                continue;
            }
            let start = self.instructions[i].offset;
            while i < self.instructions.len() && !reachable[i] {
                i += 1;
            }
            let end = self.instructions.get(i).map(|insn| insn.offset).unwrap_or(code.len());
            code[start..end - 1].fill(Opcode::Nop.to_u8());
            code[end - 1] = Opcode::Athrow.to_u8();
            dead.push((start, end));
            max_stack = max_stack.max(1);
        }

        let mut exception_table = self.handlers.to_vec();
        for &(start, end) in &dead {
            let mut split = Vec::with_capacity(exception_table.len());
            for entry in exception_table {
                let (from, to) = (entry.start_pc as usize, entry.end_pc as usize);
                if to <= start || from >= end {
                    split.push(entry);
                    continue;
                }
                if from < start {
                    split.push(ExceptionEntry {
                        end_pc: start as u16,
                        ..entry
                    });
                }
                if to > end {
                    split.push(ExceptionEntry {
                        start_pc: end as u16,
                        ..entry
                    });
                }
            }
            exception_table = split;
        }

        let mut targets: FxHashSet<usize> = exception_table
            .iter()
            .map(|entry| entry.handler_pc as usize)
            .collect();
        for (insn, live) in self.instructions.iter().zip(&reachable) {
            if *live {
                targets.extend(insn.branch_targets());
            }
        }

        let throwable_frame = Frame {
            locals: Vec::new(),
            stack: vec![VType::Object(THROWABLE.to_string())],
        };
        let mut frames = Vec::new();
        let mut previous_locals = compact_locals(&initial.locals);
        let mut previous_offset: Option<usize> = None;
        for (index, insn) in self.instructions.iter().enumerate() {
            let needs_frame = if reachable[index] {
                targets.contains(&insn.offset)
                    || (index > 0
                        && (!reachable[index - 1] || self.instructions[index - 1].opcode.is_terminator()))
            } else {
                index > 0 && reachable[index - 1]
            };
            if !needs_frame {
                continue;
            }
            let frame = match &self.frames[index] {
                Some(frame) => frame,
                None => &throwable_frame,
            };
            let offset_delta = match previous_offset {
                None => insn.offset,
                Some(previous) => insn.offset - previous - 1,
            } as u16;
            let locals = compact_locals(&frame.locals);
            frames.push(compress(offset_delta, &previous_locals, locals.clone(), frame.stack.clone()));
            previous_locals = locals;
            previous_offset = Some(insn.offset);
        }

        Ok(ComputedFrames {
            max_stack: max_stack as u16,
            max_locals: self.max_locals as u16,
            code,
            exception_table,
            frames,
        })
    }
}

/// Whether a method's `Code` carries a `StackMapTable`
pub fn has_stack_map(class: &ClassFile, method_index: usize) -> Result<bool, FrameError> {
    let method = class
        .methods
        .get(method_index)
        .ok_or(FrameError::NoSuchMethod(method_index))?;
    Ok(match method.code(&class.constant_pool)? {
        Some(code) => find_attribute(&code.attributes, &class.constant_pool, "StackMapTable").is_some(),
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassBuilder;
    use crate::classfile::access::{PUBLIC, STATIC};
    use crate::constants::MemberKind;

    struct TestHierarchy;

    impl Hierarchy for TestHierarchy {
        fn common_super_class(&self, a: &str, b: &str) -> String {
            match (a, b) {
                ("a/A", "a/B") | ("a/B", "a/A") => "a/Base".to_string(),
                _ => OBJECT.to_string(),
            }
        }
    }

    fn single_method(descriptor: &str, flags: u16, code: Vec<u8>) -> ClassFile {
        let mut builder = ClassBuilder::new("a/Test", Some(OBJECT), PUBLIC);
        builder.add_method(flags, "m", descriptor).code(0, 0, code);
        builder.build_class().unwrap()
    }

    #[test]
    fn test_straight_line_has_no_frames() {
        // iload_0 iload_1 iadd ireturn
        let class = single_method("(II)I", PUBLIC | STATIC, vec![0x1A, 0x1B, 0x60, 0xAC]);
        let computed = compute_frames(&class, 0, &TestHierarchy).unwrap();
        assert_eq!(computed.max_stack, 2);
        assert_eq!(computed.max_locals, 2);
        assert!(computed.frames.is_empty());
    }

    #[test]
    fn test_branch_target_gets_same_frame() {
        // 0 iload_0; 1 ifeq 6; 4 iconst_1; 5 ireturn; 6 iconst_0; 7 ireturn
        let class = single_method(
            "(I)I",
            PUBLIC | STATIC,
            vec![0x1A, 0x99, 0x00, 0x05, 0x04, 0xAC, 0x03, 0xAC],
        );
        let computed = compute_frames(&class, 0, &TestHierarchy).unwrap();
        assert_eq!(computed.frames, vec![StackMapFrame::Same { offset_delta: 6 }]);
    }

    #[test]
    fn test_merge_uses_hierarchy() {
        // 0 iload_0; 1 ifeq 8; 4 aload_1; 5 goto 9; 8 aload_2; 9 areturn
        let class = single_method(
            "(ZLa/A;La/B;)La/Base;",
            PUBLIC | STATIC,
            vec![0x1A, 0x99, 0x00, 0x07, 0x2B, 0xA7, 0x00, 0x04, 0x2C, 0xB0],
        );
        let computed = compute_frames(&class, 0, &TestHierarchy).unwrap();
        assert_eq!(
            computed.frames,
            vec![
                StackMapFrame::Same { offset_delta: 8 },
                StackMapFrame::SameLocals1StackItem {
                    offset_delta: 0,
                    stack: VType::Object("a/Base".to_string()),
                },
            ]
        );
    }

    #[test]
    fn test_unreachable_code_is_neutralised() {
        // return; iconst_1; pop; return
        let class = single_method("()V", PUBLIC | STATIC, vec![0xB1, 0x04, 0x57, 0xB1]);
        let computed = compute_frames(&class, 0, &TestHierarchy).unwrap();
        assert_eq!(computed.code, vec![0xB1, 0x00, 0x00, 0xBF]);
        assert_eq!(computed.max_stack, 1);
        assert_eq!(
            computed.frames,
            vec![StackMapFrame::SameLocals1StackItem {
                offset_delta: 1,
                stack: VType::Object(THROWABLE.to_string()),
            }]
        );
    }

    #[test]
    fn test_long_takes_two_slots() {
        // 0 lload_0; 1 lconst_0; 2 lcmp; 3 ifeq 7; 6 return; 7 return
        let class = single_method(
            "(J)V",
            PUBLIC | STATIC,
            vec![0x1E, 0x09, 0x94, 0x99, 0x00, 0x04, 0xB1, 0xB1],
        );
        let computed = compute_frames(&class, 0, &TestHierarchy).unwrap();
        assert_eq!(computed.max_stack, 4);
        assert_eq!(computed.max_locals, 2);
        assert_eq!(computed.frames, vec![StackMapFrame::Same { offset_delta: 7 }]);
    }

    #[test]
    fn test_constructor_initializes_this() {
        let mut builder = ClassBuilder::new("a/Test", Some(OBJECT), PUBLIC);
        let init = builder
            .pool()
            .add_member_ref(MemberKind::Method, OBJECT, "<init>", "()V")
            .unwrap();
        let [hi, lo] = init.to_be_bytes();
        // aload_0; invokespecial Object.<init>; aload_0; astore_1; return
        builder
            .add_method(PUBLIC, "<init>", "()V")
            .code(0, 0, vec![0x2A, 0xB7, hi, lo, 0x2A, 0x4C, 0xB1]);
        let class = builder.build_class().unwrap();

        let computed = compute_frames(&class, 0, &TestHierarchy).unwrap();
        assert_eq!(computed.max_stack, 1);
        assert_eq!(computed.max_locals, 2);
    }

    #[test]
    fn test_new_dup_init_then_branch() {
        let mut builder = ClassBuilder::new("a/Test", Some(OBJECT), PUBLIC);
        let class_index = builder.pool().add_class("a/A").unwrap();
        let init = builder
            .pool()
            .add_member_ref(MemberKind::Method, "a/A", "<init>", "()V")
            .unwrap();
        let [ch, cl] = class_index.to_be_bytes();
        let [ih, il] = init.to_be_bytes();
        // 0 new a/A; 3 dup; 4 invokespecial; 7 astore_0; 8 goto 11; 11 return
        builder.add_method(PUBLIC | STATIC, "m", "()V").code(
            0,
            0,
            vec![0xBB, ch, cl, 0x59, 0xB7, ih, il, 0x4B, 0xA7, 0x00, 0x03, 0xB1],
        );
        let class = builder.build_class().unwrap();

        let computed = compute_frames(&class, 0, &TestHierarchy).unwrap();
        assert_eq!(computed.max_stack, 2);
        assert_eq!(
            computed.frames,
            vec![StackMapFrame::Append {
                offset_delta: 11,
                locals: vec![VType::Object("a/A".to_string())],
            }]
        );
    }

    #[test]
    fn test_exception_handler_frame() {
        let mut builder = ClassBuilder::new("a/Test", Some(OBJECT), PUBLIC);
        let go = builder
            .pool()
            .add_member_ref(MemberKind::Method, "a/X", "go", "()V")
            .unwrap();
        let [hi, lo] = go.to_be_bytes();
        // 0 invokestatic go; 3 return; 4 astore_0; 5 return
        builder
            .add_method(PUBLIC | STATIC, "m", "()V")
            .code(0, 0, vec![0xB8, hi, lo, 0xB1, 0x4B, 0xB1])
            .handler(ExceptionEntry {
                start_pc: 0,
                end_pc: 3,
                handler_pc: 4,
                catch_type: 0,
            });
        let class = builder.build_class().unwrap();

        let computed = compute_frames(&class, 0, &TestHierarchy).unwrap();
        assert_eq!(computed.max_locals, 1);
        assert_eq!(
            computed.frames,
            vec![StackMapFrame::SameLocals1StackItem {
                offset_delta: 4,
                stack: VType::Object(THROWABLE.to_string()),
            }]
        );
    }

    #[test]
    fn test_dead_range_is_cut_from_handlers() {
        let mut builder = ClassBuilder::new("a/Test", Some(OBJECT), PUBLIC);
        let go = builder
            .pool()
            .add_member_ref(MemberKind::Method, "a/X", "go", "()V")
            .unwrap();
        let [hi, lo] = go.to_be_bytes();
        // 0 invokestatic go; 3 goto 8; 6 iconst_0; 7 pop; 8 return; 9 pop; 10 return
        builder
            .add_method(PUBLIC | STATIC, "m", "()V")
            .code(
                0,
                0,
                vec![0xB8, hi, lo, 0xA7, 0x00, 0x05, 0x03, 0x57, 0xB1, 0x57, 0xB1],
            )
            .handler(ExceptionEntry {
                start_pc: 0,
                end_pc: 8,
                handler_pc: 9,
                catch_type: 0,
            });
        let class = builder.build_class().unwrap();

        let computed = compute_frames(&class, 0, &TestHierarchy).unwrap();
        assert_eq!(&computed.code[6..8], &[0x00, 0xBF]);
        assert_eq!(
            computed.exception_table,
            vec![ExceptionEntry {
                start_pc: 0,
                end_pc: 6,
                handler_pc: 9,
                catch_type: 0,
            }]
        );
    }

    #[test]
    fn test_subroutines_are_rejected() {
        // jsr 3; return; astore_0; ret 0
        let class = single_method("()V", PUBLIC | STATIC, vec![0xA8, 0x00, 0x03, 0x4B, 0xA9, 0x00]);
        assert!(matches!(
            compute_frames(&class, 0, &TestHierarchy),
            Err(FrameError::Subroutine(0))
        ));
        let code = class.methods[0].code(&class.constant_pool).unwrap().unwrap();
        assert!(has_subroutines(&code.code).unwrap());
    }

    #[test]
    fn test_stack_height_mismatch() {
        // 0 iload_0; 1 ifeq 5; 4 iconst_0; 5 return
        let class = single_method("(I)V", PUBLIC | STATIC, vec![0x1A, 0x99, 0x00, 0x04, 0x03, 0xB1]);
        assert!(matches!(
            compute_frames(&class, 0, &TestHierarchy),
            Err(FrameError::StackHeightMismatch { offset: 5, .. })
        ));
    }

    #[test]
    fn test_apply_writes_stack_map() {
        let mut class = single_method(
            "(I)I",
            PUBLIC | STATIC,
            vec![0x1A, 0x99, 0x00, 0x05, 0x04, 0xAC, 0x03, 0xAC],
        );
        assert!(!has_stack_map(&class, 0).unwrap());
        compute_frames(&class, 0, &TestHierarchy)
            .unwrap()
            .apply(&mut class, 0)
            .unwrap();
        assert!(has_stack_map(&class, 0).unwrap());

        let code = class.methods[0].code(&class.constant_pool).unwrap().unwrap();
        assert_eq!(code.max_stack, 1);
        assert_eq!(code.max_locals, 1);
        let table = find_attribute(&code.attributes, &class.constant_pool, "StackMapTable").unwrap();
        // one frame, same_frame with delta 6
        assert_eq!(table.info, vec![0x00, 0x01, 0x06]);
    }

    #[test]
    fn test_extended_encodings() {
        let mut pool = ConstantPool::new();
        let bytes = encode_stack_map(
            &[
                StackMapFrame::Same { offset_delta: 100 },
                StackMapFrame::Chop {
                    offset_delta: 2,
                    k: 1,
                },
            ],
            &mut pool,
        )
        .unwrap();
        assert_eq!(bytes, vec![0x00, 0x02, 251, 0x00, 100, 250, 0x00, 0x02]);
    }

    #[test]
    fn test_array_merge() {
        let pool = ConstantPool::new();
        let analyzer = Analyzer::new("a/Test", &pool, &[0xB1], &[], &TestHierarchy).unwrap();
        assert_eq!(analyzer.merge_reference("[La/A;", "[La/B;"), "[La/Base;");
        assert_eq!(analyzer.merge_reference("[I", "[La/A;"), OBJECT);
        assert_eq!(
            analyzer.merge_reference("[[I", "[La/A;"),
            format!("[L{OBJECT};")
        );
        assert_eq!(analyzer.merge_reference("[I", "a/A"), OBJECT);
    }
}
