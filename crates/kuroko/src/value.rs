//! The tagged value representation shared by the compiler, heap, and VM.

use crate::heap::{Heap, HeapData, HeapId};

/// Sentinel payloads carried by [`Value::Kwargs`].
///
/// Low values are unit counts used by complex call assembly; the high values
/// are reserved markers. `UNSET` doubles as the "keyword default not
/// supplied" sentinel filled into parameter slots at call binding time.
pub mod kwargs {
    /// Keyword parameter slot that has not been supplied by the caller.
    pub const UNSET: u32 = u32::MAX;
    /// Tag for a plain positional argument unit.
    pub const UNIT_POS: u32 = u32::MAX - 1;
    /// Tag for a `*sequence` splat unit.
    pub const UNIT_SEQ: u32 = u32::MAX - 2;
    /// Tag for a `**mapping` splat unit.
    pub const UNIT_MAP: u32 = u32::MAX - 3;
    /// Tag for a `name=value` unit (name string beneath the value).
    pub const UNIT_NAMED: u32 = u32::MAX - 4;
    /// Largest value interpreted as a unit count rather than a tag.
    pub const MAX_COUNT: u32 = u32::MAX - 8;
}

/// Discriminates the two flavors of stack-resident unwind records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Installed by `PushTry`; receives the in-flight exception.
    Try,
    /// Installed by `PushWith`; the context manager sits directly beneath it.
    With,
}

/// A stack-resident marker used during exception and `with` unwinding.
///
/// Handlers are created only by the VM (`PushTry`/`PushWith`) and are never
/// observable from the language; the unwinder scans the value stack for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub kind: HandlerKind,
    /// Absolute bytecode offset control transfers to.
    pub target: u32,
}

/// A runtime value: either an immediate scalar or a handle into the heap.
///
/// `Value` is `Copy`; ownership of heap objects belongs to the garbage
/// collector, so copying a `Ref` merely copies the handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Internal unwind record; see [`Handler`].
    Handler(Handler),
    /// Internal sentinel used during call assembly and for unset keyword
    /// defaults; see [`kwargs`].
    Kwargs(u32),
    /// The not-implemented sentinel returned by binary/compare dunders to
    /// request the reflected operation on the other operand.
    NotImplemented,
    /// Handle to a heap object.
    Ref(HeapId),
}

impl Value {
    /// Truthiness for conditions: `None`, `False`, zero, and empty
    /// containers are falsey.
    #[must_use]
    pub fn is_truthy(self, heap: &Heap) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => b,
            Self::Int(i) => i != 0,
            Self::Float(f) => f != 0.0,
            Self::Handler(_) | Self::Kwargs(_) | Self::NotImplemented => true,
            Self::Ref(id) => match heap.get(id) {
                HeapData::Str(s) => !s.as_str().is_empty(),
                HeapData::Bytes(b) => !b.as_slice().is_empty(),
                HeapData::Tuple(t) => !t.items.is_empty(),
                HeapData::List(l) => !l.items.is_empty(),
                HeapData::Dict(d) => d.len() != 0,
                HeapData::Set(s) => s.len() != 0,
                _ => true,
            },
        }
    }

    /// Human-readable type name, used in error messages.
    #[must_use]
    pub fn type_name(self, heap: &Heap) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Handler(_) => "handler",
            Self::Kwargs(_) => "kwargs",
            Self::NotImplemented => "NotImplementedType",
            Self::Ref(id) => heap.get(id).type_name(),
        }
    }

    /// Returns the numeric double value for ints, bools, and floats.
    #[must_use]
    pub fn as_number(self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(f64::from(i32::from(b))),
            Self::Int(i) => Some(i as f64),
            Self::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Returns the integer value for ints and bools.
    #[must_use]
    pub fn as_int(self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(b)),
            Self::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Identity test backing the `is` operator.
    ///
    /// Heap values compare by handle; immediates compare by value since they
    /// have no identity of their own. Interned strings make `"a" is "a"`
    /// hold as a consequence of interning.
    #[must_use]
    pub fn is_same(self, other: Self) -> bool {
        match (self, other) {
            (Self::Ref(a), Self::Ref(b)) => a == b,
            (Self::None, Self::None) | (Self::NotImplemented, Self::NotImplemented) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Kwargs(a), Self::Kwargs(b)) => a == b,
            (Self::Handler(a), Self::Handler(b)) => a == b,
            _ => false,
        }
    }
}

/// Structural equality without user-code dispatch.
///
/// Numbers are cross-promoted (`1 == 1.0 == True`); strings compare by
/// identity thanks to interning; bytes and tuples compare by content. Heap
/// kinds with user-defined `__eq__` fall back to identity here — this is the
/// equality used *inside* dict/set lookups, where re-entering the VM is not
/// possible. The `Equal` opcode dispatches `__eq__` separately.
#[must_use]
pub fn value_eq(heap: &Heap, a: Value, b: Value) -> bool {
    if a.is_same(b) {
        return true;
    }
    match (a, b) {
        (Value::Int(_) | Value::Bool(_) | Value::Float(_), Value::Int(_) | Value::Bool(_) | Value::Float(_)) => {
            match (a, b) {
                (Value::Float(_), _) | (_, Value::Float(_)) => {
                    // Promote through f64; i64 values beyond 2^53 are not
                    // representable exactly, matching the int/float compare
                    // rule used throughout.
                    a.as_number() == b.as_number()
                }
                _ => a.as_int() == b.as_int(),
            }
        }
        (Value::Ref(x), Value::Ref(y)) => match (heap.get(x), heap.get(y)) {
            (HeapData::Bytes(p), HeapData::Bytes(q)) => p.as_slice() == q.as_slice(),
            (HeapData::Tuple(p), HeapData::Tuple(q)) => {
                p.items.len() == q.items.len()
                    && p.items
                        .iter()
                        .zip(q.items.iter())
                        .all(|(&l, &r)| value_eq(heap, l, r))
            }
            _ => false,
        },
        _ => false,
    }
}

/// Hashes a value for dict/set keys, consistent with [`value_eq`].
///
/// Returns `None` for unhashable kinds (lists, dicts, sets); the caller
/// raises `TypeError`. Cross-promoted numerics hash identically so that
/// `hash(1) == hash(1.0) == hash(True)`.
#[must_use]
pub fn value_hash(heap: &Heap, v: Value) -> Option<u32> {
    match v {
        Value::None => Some(0x9e37_0001),
        Value::NotImplemented => Some(0x9e37_0002),
        Value::Bool(b) => Some(hash_i64(i64::from(b))),
        Value::Int(i) => Some(hash_i64(i)),
        Value::Float(f) => {
            // Integral floats must hash like the equal int.
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Some(hash_i64(f as i64))
            } else {
                Some(hash_u64(f.to_bits()))
            }
        }
        Value::Kwargs(n) => Some(hash_u64(u64::from(n) ^ KWARGS_HASH_SALT)),
        Value::Handler(_) => None,
        Value::Ref(id) => heap.hash_object(id),
    }
}

// Salt keeping Kwargs sentinels out of the small-int hash range.
const KWARGS_HASH_SALT: u64 = 0x4b57_4152_4753_0000;

/// Fibonacci-style mix of a signed word.
#[inline]
#[must_use]
pub fn hash_i64(v: i64) -> u32 {
    hash_u64(v.cast_unsigned())
}

/// Fibonacci-style mix of an unsigned word.
#[inline]
#[must_use]
pub fn hash_u64(v: u64) -> u32 {
    let mixed = v.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    (mixed >> 32) as u32 ^ (mixed as u32)
}

/// FNV-1a over bytes, used for string interning and bytes hashing.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn numeric_equality_is_cross_promoted() {
        let heap = Heap::new();
        assert!(value_eq(&heap, Value::Int(1), Value::Float(1.0)));
        assert!(value_eq(&heap, Value::Bool(true), Value::Int(1)));
        assert!(value_eq(&heap, Value::Bool(false), Value::Float(0.0)));
        assert!(!value_eq(&heap, Value::Int(1), Value::Int(2)));
        assert!(!value_eq(&heap, Value::None, Value::Bool(false)));
    }

    #[test]
    fn sentinels_equal_only_their_kind() {
        let heap = Heap::new();
        assert!(value_eq(&heap, Value::Kwargs(3), Value::Kwargs(3)));
        assert!(!value_eq(&heap, Value::Kwargs(3), Value::Kwargs(4)));
        assert!(!value_eq(&heap, Value::Kwargs(0), Value::Int(0)));
        assert!(!value_eq(&heap, Value::None, Value::Int(0)));
    }

    #[test]
    fn cross_promoted_hash_agreement() {
        let heap = Heap::new();
        assert_eq!(value_hash(&heap, Value::Int(7)), value_hash(&heap, Value::Float(7.0)));
        assert_eq!(value_hash(&heap, Value::Bool(true)), value_hash(&heap, Value::Int(1)));
    }
}
