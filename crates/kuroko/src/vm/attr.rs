//! Attribute access, class construction, and the protocol-slot cache.

use strum::IntoEnumIterator;

use super::Vm;
use crate::{
    exception::{ExcType, RunResult},
    heap::{HeapData, HeapId},
    object::{BoundMethod, Class, Property, Special},
    value::Value,
};

impl Vm {
    /// The class object governing a value's behavior.
    pub(crate) fn class_of(&self, value: Value) -> HeapId {
        match value {
            Value::None => self.base.none,
            Value::Bool(_) => self.base.bool_,
            Value::Int(_) => self.base.int,
            Value::Float(_) => self.base.float,
            Value::Handler(_) | Value::Kwargs(_) | Value::NotImplemented => self.base.object,
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(_) => self.base.str_,
                HeapData::Bytes(_) => self.base.bytes,
                HeapData::Tuple(_) => self.base.tuple,
                HeapData::List(_) => self.base.list,
                HeapData::Dict(_) => self.base.dict,
                HeapData::Set(_) => self.base.set,
                HeapData::Function(_) | HeapData::Closure(_) => self.base.function,
                HeapData::Native(_) => self.base.function,
                HeapData::BoundMethod(_) => self.base.method,
                HeapData::Generator(_) => self.base.generator,
                HeapData::Property(_) => self.base.property_,
                HeapData::Upvalue(_) => self.base.object,
                HeapData::Class(_) => self.base.type_,
                HeapData::Instance(i) => i.class,
            },
        }
    }

    pub(crate) fn class_name(&self, class: HeapId) -> &str {
        match self.heap.get(class) {
            HeapData::Class(c) => self.heap.str_value(c.name),
            other => other.type_name(),
        }
    }

    /// Cached protocol slot for a class, if finalized and present.
    pub(crate) fn class_slot(&self, class: HeapId, special: Special) -> Option<Value> {
        match self.heap.get(class) {
            HeapData::Class(c) => {
                if c.finalized {
                    c.slot(special)
                } else {
                    // Un-finalized classes (mid class-body) fall back to a
                    // chain walk.
                    let name = self.special_names[special as usize];
                    self.lookup_method(class, name)
                }
            }
            _ => None,
        }
    }

    /// Walks the base chain looking for a method (or property) entry.
    pub(crate) fn lookup_method(&self, mut class: HeapId, name: HeapId) -> Option<Value> {
        loop {
            let HeapData::Class(c) = self.heap.get(class) else {
                return None;
            };
            if let Some(&v) = c.methods.get(&name) {
                return Some(v);
            }
            class = c.base?;
        }
    }

    /// Walks the base chain looking for a class static.
    pub(crate) fn lookup_static(&self, mut class: HeapId, name: HeapId) -> Option<Value> {
        loop {
            let HeapData::Class(c) = self.heap.get(class) else {
                return None;
            };
            if let Some(&v) = c.statics.get(&name) {
                return Some(v);
            }
            class = c.base?;
        }
    }

    /// Populates the protocol-slot cache for a class. Called by the
    /// `Finalize` opcode when a class body completes, and by the embedding
    /// API after native method registration.
    pub fn finalize_class(&mut self, class_id: HeapId) {
        let mut slots = vec![None; Special::iter().count()];
        for special in Special::iter() {
            let name = self.special_names[special as usize];
            slots[special as usize] = self.lookup_method(class_id, name);
        }
        if let HeapData::Class(c) = self.heap.get_mut(class_id) {
            c.slots = slots;
            c.finalized = true;
        }
    }

    /// Checks whether `value` is an instance of `class` (or a subclass).
    pub(crate) fn value_isinstance(&self, value: Value, class: HeapId) -> bool {
        let mut current = self.class_of(value);
        loop {
            if current == class {
                return true;
            }
            match self.heap.get(current) {
                HeapData::Class(c) => match c.base {
                    Some(base) => current = base,
                    None => return false,
                },
                _ => return false,
            }
        }
    }

    // ---- attribute opcodes ----

    pub(crate) fn op_get_property(&mut self, name: HeapId) -> RunResult<()> {
        let receiver = self.pop();
        let value = self.get_attribute(receiver, name)?;
        self.push(value);
        Ok(())
    }

    /// The attribute ladder: instance fields, then the class chain
    /// (properties invoke their getter, callables bind), then statics, then
    /// `__getattr__`.
    pub(crate) fn get_attribute(&mut self, receiver: Value, name: HeapId) -> RunResult<Value> {
        if let Value::Ref(id) = receiver {
            match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    if let Some(&v) = instance.fields.get(&name) {
                        return Ok(v);
                    }
                    let class = instance.class;
                    if let Some(found) = self.lookup_method(class, name) {
                        return self.bind_attribute(receiver, found);
                    }
                    if let Some(found) = self.lookup_static(class, name) {
                        return Ok(found);
                    }
                    if let Some(getattr) = self.class_slot(class, Special::GetAttr) {
                        let name_value = Value::Ref(name);
                        return self.call_value_and_run(getattr, &[receiver, name_value]);
                    }
                    return Err(ExcType::attribute_error(format!(
                        "'{}' object has no attribute '{}'",
                        self.class_name(class),
                        self.heap.str_value(name)
                    )));
                }
                HeapData::Class(_) => {
                    // Class attribute access returns statics and unbound
                    // methods.
                    if let Some(found) = self.lookup_static(id, name) {
                        return Ok(found);
                    }
                    if let Some(found) = self.lookup_method(id, name) {
                        return Ok(found);
                    }
                    return Err(ExcType::attribute_error(format!(
                        "type '{}' has no attribute '{}'",
                        self.class_name(id),
                        self.heap.str_value(name)
                    )));
                }
                _ => {}
            }
        }
        // Builtin values look methods up on their builtin class.
        let class = self.class_of(receiver);
        if let Some(found) = self.lookup_method(class, name) {
            return self.bind_attribute(receiver, found);
        }
        if let Some(found) = self.lookup_static(class, name) {
            return Ok(found);
        }
        Err(ExcType::attribute_error(format!(
            "'{}' object has no attribute '{}'",
            receiver.type_name(&self.heap),
            self.heap.str_value(name)
        )))
    }

    /// Binding step for attributes found on the class chain: properties run
    /// their getter, callables become bound methods.
    fn bind_attribute(&mut self, receiver: Value, found: Value) -> RunResult<Value> {
        if let Value::Ref(found_id) = found {
            match self.heap.get(found_id) {
                HeapData::Property(p) => {
                    let getter = p.getter;
                    return self.call_value_and_run(getter, &[receiver]);
                }
                HeapData::Closure(_) | HeapData::Native(_) => {
                    let bound = self.heap.allocate(HeapData::BoundMethod(BoundMethod {
                        receiver,
                        method: found,
                    }));
                    return Ok(Value::Ref(bound));
                }
                _ => {}
            }
        }
        Ok(found)
    }

    pub(crate) fn op_set_property(&mut self, name: HeapId) -> RunResult<()> {
        let value = self.pop();
        let receiver = self.pop();
        let Value::Ref(id) = receiver else {
            return Err(ExcType::attribute_error(format!(
                "cannot set attributes on '{}'",
                receiver.type_name(&self.heap)
            )));
        };
        match self.heap.get(id) {
            HeapData::Instance(instance) => {
                let class = instance.class;
                // A property on the class intercepts the write.
                if let Some(Value::Ref(found)) = self.lookup_method(class, name)
                    && let HeapData::Property(p) = self.heap.get(found)
                {
                    let Some(setter) = p.setter else {
                        return Err(ExcType::attribute_error(format!(
                            "property '{}' has no setter",
                            self.heap.str_value(name)
                        )));
                    };
                    self.call_value_and_run(setter, &[receiver, value])?;
                    self.push(value);
                    return Ok(());
                }
                if let HeapData::Instance(instance) = self.heap.get_mut(id) {
                    instance.fields.insert(name, value);
                }
            }
            HeapData::Class(_) => {
                // Assigning through a property name attaches the setter;
                // anything else becomes (or replaces) a class static.
                if let Some(Value::Ref(found)) = self.lookup_method(id, name)
                    && matches!(self.heap.get(found), HeapData::Property(_))
                {
                    if let HeapData::Property(p) = self.heap.get_mut(found) {
                        p.setter = Some(value);
                    }
                } else {
                    let was_finalized = match self.heap.get_mut(id) {
                        HeapData::Class(c) => {
                            c.statics.insert(name, value);
                            c.finalized
                        }
                        _ => false,
                    };
                    if was_finalized {
                        self.finalize_class(id);
                    }
                }
            }
            other => {
                return Err(ExcType::attribute_error(format!(
                    "cannot set attributes on '{}'",
                    other.type_name()
                )));
            }
        }
        self.push(value);
        Ok(())
    }

    pub(crate) fn op_del_property(&mut self, name: HeapId) -> RunResult<()> {
        let receiver = self.pop();
        let Value::Ref(id) = receiver else {
            return Err(ExcType::attribute_error(format!(
                "cannot delete attributes on '{}'",
                receiver.type_name(&self.heap)
            )));
        };
        enum Outcome {
            Removed,
            Missing(HeapId),
            ClassChanged(bool),
            NotSupported(&'static str),
        }
        let outcome = match self.heap.get_mut(id) {
            HeapData::Instance(instance) => {
                if instance.fields.shift_remove(&name).is_some() {
                    Outcome::Removed
                } else {
                    Outcome::Missing(instance.class)
                }
            }
            HeapData::Class(c) => {
                let removed = c.statics.shift_remove(&name).is_some() || c.methods.shift_remove(&name).is_some();
                Outcome::ClassChanged(removed)
            }
            other => Outcome::NotSupported(other.type_name()),
        };
        match outcome {
            Outcome::Removed => Ok(()),
            Outcome::Missing(class) => Err(ExcType::attribute_error(format!(
                "'{}' object has no attribute '{}'",
                self.class_name(class),
                self.heap.str_value(name)
            ))),
            Outcome::ClassChanged(true) => {
                self.finalize_class(id);
                Ok(())
            }
            Outcome::ClassChanged(false) => Err(ExcType::attribute_error(format!(
                "type has no attribute '{}'",
                self.heap.str_value(name)
            ))),
            Outcome::NotSupported(kind) => Err(ExcType::attribute_error(format!(
                "cannot delete attributes on '{kind}'"
            ))),
        }
    }

    // ---- class construction opcodes ----

    pub(crate) fn op_build_class(&mut self, name: HeapId) {
        let class = self.heap.allocate(HeapData::Class(Class::new(name, Some(self.base.object))));
        self.push(Value::Ref(class));
    }

    pub(crate) fn op_inherit(&mut self) -> RunResult<()> {
        let base = self.peek(0);
        let class = self.peek(1);
        let Value::Ref(base_id) = base else {
            return Err(ExcType::type_error("base must be a class"));
        };
        if !matches!(self.heap.get(base_id), HeapData::Class(_)) {
            return Err(ExcType::type_error(format!(
                "base must be a class, not '{}'",
                base.type_name(&self.heap)
            )));
        }
        let Value::Ref(class_id) = class else {
            return Err(ExcType::type_error("inherit target must be a class"));
        };
        if let HeapData::Class(c) = self.heap.get_mut(class_id) {
            c.base = Some(base_id);
        }
        Ok(())
    }

    pub(crate) fn op_method(&mut self, name: HeapId) -> RunResult<()> {
        let method = self.pop();
        let class = self.pop();
        let Value::Ref(class_id) = class else {
            return Err(ExcType::type_error("method target must be a class"));
        };
        if let HeapData::Class(c) = self.heap.get_mut(class_id) {
            c.methods.insert(name, method);
        }
        Ok(())
    }

    pub(crate) fn op_class_property(&mut self, name: HeapId) -> RunResult<()> {
        let value = self.pop();
        let class = self.pop();
        let Value::Ref(class_id) = class else {
            return Err(ExcType::type_error("class attribute target must be a class"));
        };
        if let HeapData::Class(c) = self.heap.get_mut(class_id) {
            c.statics.insert(name, value);
        }
        Ok(())
    }

    pub(crate) fn op_create_property(&mut self, name: HeapId) -> RunResult<()> {
        let getter = self.pop();
        let class = self.pop();
        let Value::Ref(class_id) = class else {
            return Err(ExcType::type_error("property target must be a class"));
        };
        let property = self.heap.allocate(HeapData::Property(Property { getter, setter: None }));
        if let HeapData::Class(c) = self.heap.get_mut(class_id) {
            c.methods.insert(name, Value::Ref(property));
        }
        Ok(())
    }
}
