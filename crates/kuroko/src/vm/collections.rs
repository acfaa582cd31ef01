//! Container opcodes: subscripts, slices, literal builders, unpacking, and
//! the iterator protocol.

use super::Vm;
use crate::{
    exception::{ExcType, RunResult},
    heap::{HeapData, HeapId},
    object::{Bytes, Dict, Instance, List, Set, Special, Tuple},
    value::Value,
};

impl Vm {
    // ---- subscripts ----

    pub(crate) fn op_get_item(&mut self) -> RunResult<()> {
        let index = self.pop();
        let container = self.pop();
        let value = self.get_item(container, index)?;
        self.push(value);
        Ok(())
    }

    pub(crate) fn get_item(&mut self, container: Value, index: Value) -> RunResult<Value> {
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::List(l) => {
                    let idx = normalize_index(index, l.items.len(), &self.heap)?;
                    return Ok(l.items[idx]);
                }
                HeapData::Tuple(t) => {
                    let idx = normalize_index(index, t.items.len(), &self.heap)?;
                    return Ok(t.items[idx]);
                }
                HeapData::Str(s) => {
                    let idx = normalize_index(index, s.char_len(), &self.heap)?;
                    let ch = match self.heap.get_mut(id) {
                        HeapData::Str(s) => s.char_at(idx),
                        _ => unreachable!("checked above"),
                    };
                    let out = self.heap.intern_string(ch.encode_utf8(&mut [0u8; 4]));
                    return Ok(Value::Ref(out));
                }
                HeapData::Bytes(b) => {
                    let idx = normalize_index(index, b.as_slice().len(), &self.heap)?;
                    return Ok(Value::Int(i64::from(b.as_slice()[idx])));
                }
                HeapData::Dict(d) => {
                    return match d.get(&self.heap, index)? {
                        Some(v) => Ok(v),
                        None => {
                            let repr = self.value_repr(index)?;
                            Err(ExcType::key_error(repr))
                        }
                    };
                }
                HeapData::Instance(_) => {
                    let class = self.class_of(container);
                    if let Some(method) = self.class_slot(class, Special::GetItem) {
                        return self.call_value_and_run(method, &[container, index]);
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object is not subscriptable",
            container.type_name(&self.heap)
        )))
    }

    pub(crate) fn op_set_item(&mut self) -> RunResult<()> {
        let value = self.pop();
        let index = self.pop();
        let container = self.pop();
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::List(l) => {
                    let idx = normalize_index(index, l.items.len(), &self.heap)?;
                    if let HeapData::List(l) = self.heap.get_mut(id) {
                        l.items[idx] = value;
                    }
                    self.push(value);
                    return Ok(());
                }
                HeapData::Dict(_) => {
                    self.heap.with_data_mut(id, |heap, data| match data {
                        HeapData::Dict(d) => d.insert(heap, index, value).map(|_| ()),
                        _ => unreachable!("checked above"),
                    })?;
                    self.push(value);
                    return Ok(());
                }
                HeapData::Instance(_) => {
                    let class = self.class_of(container);
                    if let Some(method) = self.class_slot(class, Special::SetItem) {
                        self.call_value_and_run(method, &[container, index, value])?;
                        self.push(value);
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object does not support item assignment",
            container.type_name(&self.heap)
        )))
    }

    pub(crate) fn op_del_item(&mut self) -> RunResult<()> {
        let index = self.pop();
        let container = self.pop();
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::List(l) => {
                    let idx = normalize_index(index, l.items.len(), &self.heap)?;
                    if let HeapData::List(l) = self.heap.get_mut(id) {
                        l.items.remove(idx);
                    }
                    return Ok(());
                }
                HeapData::Dict(_) => {
                    let removed = self.heap.with_data_mut(id, |heap, data| match data {
                        HeapData::Dict(d) => d.remove(heap, index),
                        _ => unreachable!("checked above"),
                    })?;
                    if removed.is_none() {
                        let repr = self.value_repr(index)?;
                        return Err(ExcType::key_error(repr));
                    }
                    return Ok(());
                }
                HeapData::Instance(_) => {
                    let class = self.class_of(container);
                    if let Some(method) = self.class_slot(class, Special::DelItem) {
                        self.call_value_and_run(method, &[container, index])?;
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object does not support item deletion",
            container.type_name(&self.heap)
        )))
    }

    // ---- slices ----

    pub(crate) fn op_get_slice(&mut self) -> RunResult<()> {
        let high = self.pop();
        let low = self.pop();
        let container = self.pop();
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::List(l) => {
                    let (start, end) = slice_bounds(low, high, l.items.len())?;
                    let items = l.items[start..end].to_vec();
                    let out = self.heap.allocate(HeapData::List(List::new(items)));
                    self.push(Value::Ref(out));
                    return Ok(());
                }
                HeapData::Tuple(t) => {
                    let (start, end) = slice_bounds(low, high, t.items.len())?;
                    let items = t.items[start..end].to_vec();
                    let out = self.heap.allocate(HeapData::Tuple(Tuple::new(items)));
                    self.push(Value::Ref(out));
                    return Ok(());
                }
                HeapData::Str(s) => {
                    let (start, end) = slice_bounds(low, high, s.char_len())?;
                    let text = match self.heap.get_mut(id) {
                        HeapData::Str(s) => s.slice(start, end),
                        _ => unreachable!("checked above"),
                    };
                    let out = self.heap.intern_string(&text);
                    self.push(Value::Ref(out));
                    return Ok(());
                }
                HeapData::Bytes(b) => {
                    let (start, end) = slice_bounds(low, high, b.as_slice().len())?;
                    let data = b.as_slice()[start..end].to_vec();
                    let out = self.heap.allocate(HeapData::Bytes(Bytes::new(data)));
                    self.push(Value::Ref(out));
                    return Ok(());
                }
                HeapData::Instance(_) => {
                    let class = self.class_of(container);
                    if let Some(method) = self.class_slot(class, Special::GetSlice) {
                        let result = self.call_value_and_run(method, &[container, low, high])?;
                        self.push(result);
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object cannot be sliced",
            container.type_name(&self.heap)
        )))
    }

    pub(crate) fn op_set_slice(&mut self) -> RunResult<()> {
        let value = self.pop();
        let high = self.pop();
        let low = self.pop();
        let container = self.pop();
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::List(l) => {
                    let (start, end) = slice_bounds(low, high, l.items.len())?;
                    let replacement = self.sequence_items(value)?;
                    if let HeapData::List(l) = self.heap.get_mut(id) {
                        l.items.splice(start..end, replacement);
                    }
                    self.push(value);
                    return Ok(());
                }
                HeapData::Instance(_) => {
                    let class = self.class_of(container);
                    if let Some(method) = self.class_slot(class, Special::SetSlice) {
                        self.call_value_and_run(method, &[container, low, high, value])?;
                        self.push(value);
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object does not support slice assignment",
            container.type_name(&self.heap)
        )))
    }

    pub(crate) fn op_del_slice(&mut self) -> RunResult<()> {
        let high = self.pop();
        let low = self.pop();
        let container = self.pop();
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::List(l) => {
                    let (start, end) = slice_bounds(low, high, l.items.len())?;
                    if let HeapData::List(l) = self.heap.get_mut(id) {
                        l.items.drain(start..end);
                    }
                    return Ok(());
                }
                HeapData::Instance(_) => {
                    let class = self.class_of(container);
                    if let Some(method) = self.class_slot(class, Special::DelSlice) {
                        self.call_value_and_run(method, &[container, low, high])?;
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object does not support slice deletion",
            container.type_name(&self.heap)
        )))
    }

    /// Items of a list or tuple, for splice-style operations.
    pub(crate) fn sequence_items(&self, value: Value) -> RunResult<Vec<Value>> {
        match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(l) => Ok(l.items.clone()),
                HeapData::Tuple(t) => Ok(t.items.to_vec()),
                other => Err(ExcType::type_error(format!(
                    "expected a sequence, not '{}'",
                    other.type_name()
                ))),
            },
            other => Err(ExcType::type_error(format!(
                "expected a sequence, not '{}'",
                other.type_name(&self.heap)
            ))),
        }
    }

    // ---- literal builders ----

    pub(crate) fn op_build_tuple(&mut self, count: usize) {
        let split = self.stack.len() - count;
        let items: Vec<Value> = self.stack.drain(split..).collect();
        let id = self.heap.allocate(HeapData::Tuple(Tuple::new(items)));
        self.push(Value::Ref(id));
    }

    pub(crate) fn op_build_list(&mut self, count: usize) {
        let split = self.stack.len() - count;
        let items: Vec<Value> = self.stack.drain(split..).collect();
        let id = self.heap.allocate(HeapData::List(List::new(items)));
        self.push(Value::Ref(id));
    }

    pub(crate) fn op_build_dict(&mut self, count: usize) -> RunResult<()> {
        let split = self.stack.len() - count * 2;
        let pairs: Vec<Value> = self.stack.drain(split..).collect();
        let mut dict = Dict::new();
        for pair in pairs.chunks_exact(2) {
            dict.insert(&self.heap, pair[0], pair[1])?;
        }
        let id = self.heap.allocate(HeapData::Dict(dict));
        self.push(Value::Ref(id));
        Ok(())
    }

    pub(crate) fn op_build_set(&mut self, count: usize) -> RunResult<()> {
        let split = self.stack.len() - count;
        let items: Vec<Value> = self.stack.drain(split..).collect();
        let mut set = Set::new();
        for item in items {
            set.add(&self.heap, item)?;
        }
        let id = self.heap.allocate(HeapData::Set(set));
        self.push(Value::Ref(id));
        Ok(())
    }

    pub(crate) fn op_list_append(&mut self, slot: usize) {
        let value = self.pop();
        let base = self.frame().slots;
        let Value::Ref(id) = self.stack[base + slot] else {
            panic!("list accumulator slot does not hold a list");
        };
        if let HeapData::List(l) = self.heap.get_mut(id) {
            l.items.push(value);
        }
    }

    pub(crate) fn op_set_add(&mut self, slot: usize) -> RunResult<()> {
        let value = self.pop();
        let base = self.frame().slots;
        let Value::Ref(id) = self.stack[base + slot] else {
            panic!("set accumulator slot does not hold a set");
        };
        self.heap.with_data_mut(id, |heap, data| match data {
            HeapData::Set(s) => s.add(heap, value).map(|_| ()),
            _ => panic!("set accumulator slot does not hold a set"),
        })
    }

    pub(crate) fn op_dict_set(&mut self, slot: usize) -> RunResult<()> {
        let value = self.pop();
        let key = self.pop();
        let base = self.frame().slots;
        let Value::Ref(id) = self.stack[base + slot] else {
            panic!("dict accumulator slot does not hold a dict");
        };
        self.heap.with_data_mut(id, |heap, data| match data {
            HeapData::Dict(d) => d.insert(heap, key, value).map(|_| ()),
            _ => panic!("dict accumulator slot does not hold a dict"),
        })
    }

    pub(crate) fn op_unpack(&mut self, count: usize) -> RunResult<()> {
        let value = self.pop();
        let items = match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(l) => l.items.clone(),
                HeapData::Tuple(t) => t.items.to_vec(),
                other => {
                    return Err(ExcType::type_error(format!(
                        "cannot unpack '{}' object",
                        other.type_name()
                    )));
                }
            },
            other => {
                return Err(ExcType::type_error(format!(
                    "cannot unpack '{}' object",
                    other.type_name(&self.heap)
                )));
            }
        };
        if items.len() != count {
            return Err(ExcType::value_error(format!(
                "expected {count} values to unpack, got {}",
                items.len()
            )));
        }
        for item in items {
            self.push(item);
        }
        Ok(())
    }

    // ---- iteration protocol ----

    /// Converts the top of stack into an iterator callable: repeatedly
    /// calling it yields values until it returns itself.
    pub(crate) fn op_invoke_iter(&mut self) -> RunResult<()> {
        let value = self.pop();
        let iterator = self.get_iterator(value)?;
        self.push(iterator);
        Ok(())
    }

    pub(crate) fn get_iterator(&mut self, value: Value) -> RunResult<Value> {
        if let Value::Ref(id) = value {
            match self.heap.get(id) {
                // Generators are their own iterators.
                HeapData::Generator(_) => return Ok(value),
                HeapData::List(_) | HeapData::Tuple(_) | HeapData::Str(_) | HeapData::Bytes(_) => {
                    return Ok(self.make_seq_iterator(value));
                }
                HeapData::Dict(d) => {
                    let keys: Vec<Value> = d.iter().map(|(k, _)| k).collect();
                    let list = self.heap.allocate(HeapData::List(List::new(keys)));
                    return Ok(self.make_seq_iterator(Value::Ref(list)));
                }
                HeapData::Set(s) => {
                    let elements: Vec<Value> = s.iter().collect();
                    let list = self.heap.allocate(HeapData::List(List::new(elements)));
                    return Ok(self.make_seq_iterator(Value::Ref(list)));
                }
                HeapData::Instance(_) => {
                    let class = self.class_of(value);
                    if let Some(method) = self.class_slot(class, Special::Iter) {
                        return self.call_value_and_run(method, &[value]);
                    }
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object is not iterable",
            value.type_name(&self.heap)
        )))
    }

    /// Builds an index-walking iterator instance over a sequence value.
    pub(crate) fn make_seq_iterator(&mut self, seq: Value) -> Value {
        let mut instance = Instance::new(self.base.seq_iterator);
        let seq_key = self.heap.intern_string(" seq");
        let idx_key = self.heap.intern_string(" idx");
        instance.fields.insert(seq_key, seq);
        instance.fields.insert(idx_key, Value::Int(0));
        let id = self.heap.allocate(HeapData::Instance(instance));
        Value::Ref(id)
    }
}

/// Normalizes a subscript index (negative indices count from the end).
fn normalize_index(index: Value, len: usize, heap: &crate::heap::Heap) -> RunResult<usize> {
    let Some(i) = index.as_int() else {
        return Err(ExcType::type_error(format!(
            "indices must be integers, not '{}'",
            index.type_name(heap)
        )));
    };
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let adjusted = if i < 0 { i + len_i } else { i };
    if adjusted < 0 || adjusted >= len_i {
        return Err(ExcType::index_error("index out of range"));
    }
    Ok(adjusted as usize)
}

/// Clamped slice bounds; `None` means the respective end.
fn slice_bounds(low: Value, high: Value, len: usize) -> RunResult<(usize, usize)> {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolve = |v: Value, default: i64| -> RunResult<i64> {
        match v {
            Value::None => Ok(default),
            _ => match v.as_int() {
                Some(i) => Ok(if i < 0 { (i + len_i).max(0) } else { i.min(len_i) }),
                None => Err(ExcType::type_error("slice indices must be integers or None")),
            },
        }
    };
    let start = resolve(low, 0)?;
    let end = resolve(high, len_i)?;
    let start = usize::try_from(start.clamp(0, len_i)).unwrap_or(0);
    let end = usize::try_from(end.clamp(0, len_i)).unwrap_or(len);
    Ok((start, end.max(start)))
}
