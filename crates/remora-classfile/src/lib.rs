//! JVM class-file model
//!
//! This crate provides the constant pool, class-file reader/writer,
//! descriptor and signature handling, the instruction set, and stack map
//! frame computation used by the remapping engine.

#![warn(rust_2018_idioms)]

pub mod builder;
pub mod classfile;
pub mod constants;
pub mod descriptor;
pub mod encoder;
pub mod frames;
pub mod opcode;

pub use builder::{empty_class, ClassBuilder};
pub use classfile::{
    access, decode_attributes, encode_attributes, find_attribute, peek_class_name, AttributeInfo, ClassFile,
    ClassFileError, CodeAttribute, ExceptionEntry, MemberInfo, FRAMES_MAJOR_VERSION, OBJECT,
};
pub use constants::{Constant, ConstantPool, MemberKind, MemberRef, PoolError};
pub use descriptor::{
    map_field_descriptor, map_method_descriptor, map_signature, DescriptorError, FieldType, MethodDescriptor,
};
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError, EncodeError};
pub use frames::{compute_frames, compute_maxs, ComputedFrames, FrameError, Hierarchy, StackMapFrame, VType};
pub use opcode::{decode_instructions, Instruction, Opcode};
