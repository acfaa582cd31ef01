//! Classes, instances, bound methods, and property descriptors.

use strum::{EnumCount, EnumIter, IntoStaticStr};

use crate::{heap::HeapId, object::AttrTable, value::Value};

/// Protocol operations with a cached slot on every finalized class.
///
/// The static-string form of each variant is the dunder name looked up
/// during [`finalize`](crate::vm::Vm::finalize_class); the VM dispatches
/// through the slot array instead of the method table on hot paths.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, EnumIter, IntoStaticStr)]
pub enum Special {
    #[strum(serialize = "__init__")]
    Init,
    #[strum(serialize = "__repr__")]
    Repr,
    #[strum(serialize = "__str__")]
    Str,
    #[strum(serialize = "__call__")]
    Call,
    #[strum(serialize = "__eq__")]
    Eq,
    #[strum(serialize = "__hash__")]
    Hash,
    #[strum(serialize = "__len__")]
    Len,
    #[strum(serialize = "__iter__")]
    Iter,
    #[strum(serialize = "__contains__")]
    Contains,
    #[strum(serialize = "__getitem__")]
    GetItem,
    #[strum(serialize = "__setitem__")]
    SetItem,
    #[strum(serialize = "__delitem__")]
    DelItem,
    #[strum(serialize = "__getslice__")]
    GetSlice,
    #[strum(serialize = "__setslice__")]
    SetSlice,
    #[strum(serialize = "__delslice__")]
    DelSlice,
    #[strum(serialize = "__enter__")]
    Enter,
    #[strum(serialize = "__exit__")]
    Exit,
    #[strum(serialize = "__getattr__")]
    GetAttr,
    #[strum(serialize = "__dir__")]
    Dir,
    #[strum(serialize = "__add__")]
    Add,
    #[strum(serialize = "__radd__")]
    RAdd,
    #[strum(serialize = "__sub__")]
    Sub,
    #[strum(serialize = "__rsub__")]
    RSub,
    #[strum(serialize = "__mul__")]
    Mul,
    #[strum(serialize = "__rmul__")]
    RMul,
    #[strum(serialize = "__truediv__")]
    Div,
    #[strum(serialize = "__rtruediv__")]
    RDiv,
    #[strum(serialize = "__floordiv__")]
    FloorDiv,
    #[strum(serialize = "__rfloordiv__")]
    RFloorDiv,
    #[strum(serialize = "__mod__")]
    Mod,
    #[strum(serialize = "__rmod__")]
    RMod,
    #[strum(serialize = "__pow__")]
    Pow,
    #[strum(serialize = "__rpow__")]
    RPow,
    #[strum(serialize = "__and__")]
    And,
    #[strum(serialize = "__rand__")]
    RAnd,
    #[strum(serialize = "__or__")]
    Or,
    #[strum(serialize = "__ror__")]
    ROr,
    #[strum(serialize = "__xor__")]
    Xor,
    #[strum(serialize = "__rxor__")]
    RXor,
    #[strum(serialize = "__lshift__")]
    Lshift,
    #[strum(serialize = "__rlshift__")]
    RLshift,
    #[strum(serialize = "__rshift__")]
    Rshift,
    #[strum(serialize = "__rrshift__")]
    RRshift,
    #[strum(serialize = "__lt__")]
    Lt,
    #[strum(serialize = "__gt__")]
    Gt,
    #[strum(serialize = "__le__")]
    Le,
    #[strum(serialize = "__ge__")]
    Ge,
    #[strum(serialize = "__neg__")]
    Neg,
    #[strum(serialize = "__invert__")]
    Invert,
}

impl Special {
    /// The dunder method name this slot caches.
    #[must_use]
    pub fn method_name(self) -> &'static str {
        self.into()
    }

    /// Reflected partner for binary arithmetic slots, if any.
    #[must_use]
    pub fn reflected(self) -> Option<Self> {
        match self {
            Self::Add => Some(Self::RAdd),
            Self::Sub => Some(Self::RSub),
            Self::Mul => Some(Self::RMul),
            Self::Div => Some(Self::RDiv),
            Self::FloorDiv => Some(Self::RFloorDiv),
            Self::Mod => Some(Self::RMod),
            Self::Pow => Some(Self::RPow),
            Self::And => Some(Self::RAnd),
            Self::Or => Some(Self::ROr),
            Self::Xor => Some(Self::RXor),
            Self::Lshift => Some(Self::RLshift),
            Self::Rshift => Some(Self::RRshift),
            _ => None,
        }
    }
}

/// A class object: name, single base, method/static tables, and the
/// protocol-slot cache populated by finalization.
#[derive(Debug)]
pub struct Class {
    /// Interned class name.
    pub name: HeapId,
    /// Base class; `None` only for `object` itself.
    pub base: Option<HeapId>,
    /// Methods and properties, bound through instances on access.
    pub methods: AttrTable,
    /// Class statics, returned unbound.
    pub statics: AttrTable,
    /// Protocol-slot cache, indexed by `Special as usize`. Empty until
    /// finalization.
    pub slots: Vec<Option<Value>>,
    pub finalized: bool,
    pub docstring: Value,
}

impl Class {
    #[must_use]
    pub fn new(name: HeapId, base: Option<HeapId>) -> Self {
        Self {
            name,
            base,
            methods: AttrTable::default(),
            statics: AttrTable::default(),
            slots: Vec::new(),
            finalized: false,
            docstring: Value::None,
        }
    }

    /// Cached protocol slot, or `None` before finalization / when the class
    /// chain does not define the method.
    #[inline]
    #[must_use]
    pub fn slot(&self, special: Special) -> Option<Value> {
        self.slots.get(special as usize).copied().flatten()
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + (self.methods.len() + self.statics.len()) * std::mem::size_of::<(HeapId, Value)>()
            + self.slots.len() * std::mem::size_of::<Option<Value>>()
    }
}

/// A class instance; modules are instances whose class is `module`.
#[derive(Debug)]
pub struct Instance {
    pub class: HeapId,
    pub fields: AttrTable,
}

impl Instance {
    #[must_use]
    pub fn new(class: HeapId) -> Self {
        Self {
            class,
            fields: AttrTable::default(),
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.fields.len() * std::mem::size_of::<(HeapId, Value)>()
    }
}

/// A method retrieved through an instance, carrying its receiver.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    /// The underlying callable (closure or native).
    pub method: Value,
}

/// A property descriptor: attribute reads call the getter; a setter is
/// attached when assignment through the property first occurs.
#[derive(Debug)]
pub struct Property {
    pub getter: Value,
    pub setter: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_names_are_dunders() {
        assert_eq!(Special::Init.method_name(), "__init__");
        assert_eq!(Special::GetSlice.method_name(), "__getslice__");
        assert_eq!(Special::RAdd.method_name(), "__radd__");
    }

    #[test]
    fn reflected_pairs() {
        assert_eq!(Special::Add.reflected(), Some(Special::RAdd));
        assert_eq!(Special::Lshift.reflected(), Some(Special::RLshift));
        assert_eq!(Special::Eq.reflected(), None);
    }
}
