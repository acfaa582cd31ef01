//! Sequence objects: immutable tuples and bytes, mutable lists.

use crate::value::Value;

/// An immutable ordered sequence.
#[derive(Debug)]
pub struct Tuple {
    pub items: Box<[Value]>,
}

impl Tuple {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: items.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.items.len() * std::mem::size_of::<Value>()
    }
}

/// A mutable resizable sequence.
#[derive(Debug, Default)]
pub struct List {
    pub items: Vec<Value>,
}

impl List {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.items.capacity() * std::mem::size_of::<Value>()
    }
}

/// An immutable byte buffer.
#[derive(Debug)]
pub struct Bytes {
    data: Box<[u8]>,
}

impl Bytes {
    #[must_use]
    pub fn new(data: impl Into<Box<[u8]>>) -> Self {
        Self { data: data.into() }
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.data.len()
    }
}
