//! Opcode definitions for the bytecode instruction set.
//!
//! Opcodes fall into three width classes:
//!
//! - no operand (arithmetic, comparison, stack manipulation, protocol ops)
//! - one-byte operand, with a `*Long` escape carrying a three-byte
//!   **big-endian** operand when an index exceeds 255
//! - two-byte big-endian jump offsets (`Jump`, `JumpIfFalse`, `JumpIfTrue`,
//!   `Loop`, `PushTry`, `PushWith`)
//!
//! `Closure`/`ClosureLong` are followed by one descriptor per captured
//! upvalue: a flag byte (1 = enclosing local, 0 = enclosing upvalue) and a
//! one- or three-byte slot index (three bytes when the flag byte has its high
//! bit set).
//!
//! The numbering here is stable and exposed to tooling (the disassembler and
//! trace consumers); renumbering is a breaking change.

use strum::{EnumCount, FromRepr, IntoStaticStr};

/// A single bytecode instruction tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, EnumCount, serde::Serialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // ---- no operand ----
    Return = 0,
    Pop,
    Swap,
    Raise,
    Not,
    Negate,
    BitNegate,
    Is,
    Equal,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    In,
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Power,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    GetItem,
    SetItem,
    DelItem,
    GetSlice,
    SetSlice,
    DelSlice,
    InvokeIter,
    CleanupWith,
    PopTry,
    CloseUpvalue,
    Inherit,
    Finalize,
    Docstring,
    LoadNone,
    LoadTrue,
    LoadFalse,
    Yield,
    /// Pop a class and an exception, push whether the exception is an
    /// instance of the class (used by `except` clause filters).
    FilterExcept,

    // ---- one-byte operand ----
    /// Push `constants[operand]`.
    Constant,
    /// Load local slot `operand`.
    GetLocal,
    /// Store TOS (peeked) into local slot `operand`.
    SetLocal,
    /// Load upvalue `operand` of the running closure.
    GetUpvalue,
    /// Store TOS (peeked) into upvalue `operand`.
    SetUpvalue,
    /// Read `constants[operand]` (a name) from the module namespace,
    /// falling back to builtins.
    GetGlobal,
    /// Write TOS (peeked) under the name `constants[operand]`.
    SetGlobal,
    /// Pop TOS and bind it under `constants[operand]` in the module namespace.
    DefineGlobal,
    /// Remove `constants[operand]` from the module namespace.
    DelGlobal,
    /// Attribute read: pop object, push attribute `constants[operand]`.
    GetProperty,
    /// Attribute write: stack `[obj, value]`, pops both, pushes value back.
    SetProperty,
    /// Attribute delete on the popped object.
    DelProperty,
    /// Pop a method body and a class, bind under `constants[operand]`.
    Method,
    /// Pop a value and a class, bind as a class static.
    ClassProperty,
    /// Pop a callable and a class, wrap as a property descriptor.
    CreateProperty,
    /// Push a fresh class object named `constants[operand]`.
    BuildClass,
    /// Recursively load the dotted module `constants[operand]`, push the leaf.
    Import,
    /// Pop a module, push attribute/submodule `constants[operand]`.
    ImportFrom,
    /// Call the value below `operand` argument stack slots.
    Call,
    /// Push a copy of the value `operand` slots below the top.
    Dup,
    /// Pop `operand` values, push them as a tuple (first popped last).
    Tuple,
    /// Pop a sequence, push its `operand` elements in order.
    Unpack,
    /// Pop `operand` values into a new list.
    BuildList,
    /// Pop `2 * operand` values (key/value pairs) into a new dict.
    BuildDict,
    /// Pop `operand` values into a new set.
    BuildSet,
    /// Add the signed byte `operand` to TOS.
    Inc,
    /// Push an argument-unit tag for complex call assembly (see `vm::call`).
    ExpandArgs,
    /// Push the final `Kwargs(operand)` unit-count marker for a complex call.
    Kwargs,
    /// Pop a value, append to the list stored in local slot `operand`.
    ListAppend,
    /// Pop a value, add to the set stored in local slot `operand`.
    SetAdd,
    /// Pop value then key, insert into the dict stored in local slot `operand`.
    DictSet,
    /// Push a closure over `constants[operand]`; followed by upvalue
    /// descriptors.
    Closure,

    // ---- three-byte big-endian operand ----
    ConstantLong,
    GetLocalLong,
    SetLocalLong,
    GetGlobalLong,
    SetGlobalLong,
    DefineGlobalLong,
    DelGlobalLong,
    GetPropertyLong,
    SetPropertyLong,
    DelPropertyLong,
    MethodLong,
    ClassPropertyLong,
    CreatePropertyLong,
    BuildClassLong,
    ImportLong,
    ImportFromLong,
    ClosureLong,

    // ---- two-byte big-endian jump operand ----
    /// Unconditional forward jump.
    Jump,
    /// Forward jump when TOS (peeked, not popped) is falsey.
    JumpIfFalse,
    /// Forward jump when TOS (peeked, not popped) is truthy.
    JumpIfTrue,
    /// Backward jump (operand is subtracted from the ip).
    Loop,
    /// Push a `Handler::Try` whose target is `ip + operand`.
    PushTry,
    /// Push a `Handler::With` whose target is `ip + operand`, then invoke
    /// `__enter__` on the context manager beneath it.
    PushWith,
}

/// Operand encoding of an opcode, used by the disassembler and by sanity
/// checks in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// The opcode is a single byte.
    None,
    /// One u8 operand.
    Byte,
    /// Three-byte big-endian operand.
    Triple,
    /// Two-byte big-endian jump offset.
    Jump,
}

impl Opcode {
    /// Returns how the operand bytes following this opcode are laid out.
    ///
    /// `Closure`/`ClosureLong` additionally carry trailing upvalue
    /// descriptors which this classification does not cover; the
    /// disassembler handles them explicitly.
    #[must_use]
    pub fn operand_kind(self) -> OperandKind {
        match self {
            Self::Return
            | Self::Pop
            | Self::Swap
            | Self::Raise
            | Self::Not
            | Self::Negate
            | Self::BitNegate
            | Self::Is
            | Self::Equal
            | Self::Less
            | Self::Greater
            | Self::LessEqual
            | Self::GreaterEqual
            | Self::In
            | Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::FloorDivide
            | Self::Modulo
            | Self::Power
            | Self::BitAnd
            | Self::BitOr
            | Self::BitXor
            | Self::ShiftLeft
            | Self::ShiftRight
            | Self::GetItem
            | Self::SetItem
            | Self::DelItem
            | Self::GetSlice
            | Self::SetSlice
            | Self::DelSlice
            | Self::InvokeIter
            | Self::CleanupWith
            | Self::PopTry
            | Self::CloseUpvalue
            | Self::Inherit
            | Self::Finalize
            | Self::Docstring
            | Self::LoadNone
            | Self::LoadTrue
            | Self::LoadFalse
            | Self::Yield
            | Self::FilterExcept => OperandKind::None,
            Self::Constant
            | Self::GetLocal
            | Self::SetLocal
            | Self::GetUpvalue
            | Self::SetUpvalue
            | Self::GetGlobal
            | Self::SetGlobal
            | Self::DefineGlobal
            | Self::DelGlobal
            | Self::GetProperty
            | Self::SetProperty
            | Self::DelProperty
            | Self::Method
            | Self::ClassProperty
            | Self::CreateProperty
            | Self::BuildClass
            | Self::Import
            | Self::ImportFrom
            | Self::Call
            | Self::Dup
            | Self::Tuple
            | Self::Unpack
            | Self::BuildList
            | Self::BuildDict
            | Self::BuildSet
            | Self::Inc
            | Self::ExpandArgs
            | Self::Kwargs
            | Self::ListAppend
            | Self::SetAdd
            | Self::DictSet
            | Self::Closure => OperandKind::Byte,
            Self::ConstantLong
            | Self::GetLocalLong
            | Self::SetLocalLong
            | Self::GetGlobalLong
            | Self::SetGlobalLong
            | Self::DefineGlobalLong
            | Self::DelGlobalLong
            | Self::GetPropertyLong
            | Self::SetPropertyLong
            | Self::DelPropertyLong
            | Self::MethodLong
            | Self::ClassPropertyLong
            | Self::CreatePropertyLong
            | Self::BuildClassLong
            | Self::ImportLong
            | Self::ImportFromLong
            | Self::ClosureLong => OperandKind::Triple,
            Self::Jump | Self::JumpIfFalse | Self::JumpIfTrue | Self::Loop | Self::PushTry | Self::PushWith => {
                OperandKind::Jump
            }
        }
    }

    /// Returns the `*Long` escape for a short-form opcode, if it has one.
    #[must_use]
    pub fn long_form(self) -> Option<Self> {
        match self {
            Self::Constant => Some(Self::ConstantLong),
            Self::GetLocal => Some(Self::GetLocalLong),
            Self::SetLocal => Some(Self::SetLocalLong),
            Self::GetGlobal => Some(Self::GetGlobalLong),
            Self::SetGlobal => Some(Self::SetGlobalLong),
            Self::DefineGlobal => Some(Self::DefineGlobalLong),
            Self::DelGlobal => Some(Self::DelGlobalLong),
            Self::GetProperty => Some(Self::GetPropertyLong),
            Self::SetProperty => Some(Self::SetPropertyLong),
            Self::DelProperty => Some(Self::DelPropertyLong),
            Self::Method => Some(Self::MethodLong),
            Self::ClassProperty => Some(Self::ClassPropertyLong),
            Self::CreateProperty => Some(Self::CreatePropertyLong),
            Self::BuildClass => Some(Self::BuildClassLong),
            Self::Import => Some(Self::ImportLong),
            Self::ImportFrom => Some(Self::ImportFromLong),
            Self::Closure => Some(Self::ClosureLong),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_repr() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_repr(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_repr(Opcode::Return as u8), Some(Opcode::Return));
        assert_eq!(Opcode::from_repr(0xff), None);
    }

    #[test]
    fn long_forms_are_triple_width() {
        for byte in 0..=u8::MAX {
            let Some(op) = Opcode::from_repr(byte) else { continue };
            if let Some(long) = op.long_form() {
                assert_eq!(op.operand_kind(), OperandKind::Byte);
                assert_eq!(long.operand_kind(), OperandKind::Triple);
            }
        }
    }
}
