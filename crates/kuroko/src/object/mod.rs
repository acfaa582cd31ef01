//! Heap object kinds: strings, containers, functions, classes, generators.
//!
//! Everything here is plain data addressed through the arena in
//! [`crate::heap`]; behavior that needs dispatch (calling, attribute lookup,
//! operator protocols) lives in the VM.

pub mod class;
pub mod dict;
pub mod function;
pub mod list;
pub mod str;

pub use class::{BoundMethod, Class, Instance, Property, Special};
pub use dict::{Dict, Set};
pub use function::{Closure, Function, FunctionFlags, Generator, GeneratorState, LocalDebug, Native, NativeFn, Upvalue};
pub use list::{Bytes, List, Tuple};
pub use str::Str;

use indexmap::IndexMap;

use crate::{heap::HeapId, value::Value};

/// Attribute namespace table: module globals, class methods/statics, and
/// instance fields.
///
/// Keyed by the `HeapId` of an *interned* name string — the interning
/// invariant (equal content implies identical object) makes identity hashing
/// sound and keeps attribute access allocation-free.
pub type AttrTable = IndexMap<HeapId, Value, ahash::RandomState>;
