//! Builtin classes, their native method tables, and the global builtin
//! functions. `boot` wires everything into a fresh [`Vm`].

use strum::IntoEnumIterator;

use crate::{
    exception::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    object::{Bytes, Class, Dict, GeneratorState, Instance, List, Native, NativeFn, Set, Special, Tuple},
    value::{Value, value_hash},
    vm::Vm,
};

impl Vm {
    /// Creates a fresh, unfinalized class (embedding API).
    pub fn make_class(&mut self, name: &str, base: Option<HeapId>) -> HeapId {
        let name_id = self.heap.intern_string(name);
        let base = base.or(Some(self.base.object));
        self.heap.allocate(HeapData::Class(Class::new(name_id, base)))
    }

    /// Registers a native method on a class (embedding API). Call
    /// [`Vm::finalize_class`] once all methods are bound.
    pub fn define_native_method(&mut self, class: HeapId, name: &'static str, func: NativeFn) {
        let name_id = self.heap.intern_string(name);
        let native = self.heap.allocate(HeapData::Native(Native {
            name,
            doc: "",
            func,
            is_method: true,
        }));
        if let HeapData::Class(c) = self.heap.get_mut(class) {
            c.methods.insert(name_id, Value::Ref(native));
        }
    }

    /// Binds a native function into a module namespace (embedding API).
    pub fn define_native_fn(&mut self, module: HeapId, name: &'static str, func: NativeFn) {
        let name_id = self.heap.intern_string(name);
        let native = self.heap.allocate(HeapData::Native(Native {
            name,
            doc: "",
            func,
            is_method: false,
        }));
        if let HeapData::Instance(m) = self.heap.get_mut(module) {
            m.fields.insert(name_id, Value::Ref(native));
        }
    }

    /// Looks up a bound method handle on a class (embedding API).
    #[must_use]
    pub fn bind_method(&self, class: HeapId, name: HeapId) -> Option<Value> {
        self.lookup_method(class, name)
    }

    /// Drains an iterable into a vector using the iterator protocol.
    ///
    /// The backing list stays on the protected-root list so the collected
    /// values remain reachable while the caller works through them; the
    /// protection ends with the enclosing call (see `op_call`).
    pub(crate) fn collect_iterable(&mut self, value: Value) -> RunResult<Vec<Value>> {
        let iterator = self.get_iterator(value)?;
        let list_id = self.heap.allocate(HeapData::List(List::default()));
        self.protect(Value::Ref(list_id));
        self.protect(iterator);
        let result = (|| -> RunResult<()> {
            loop {
                let item = self.call_value_and_run(iterator, &[])?;
                if item.is_same(iterator) {
                    return Ok(());
                }
                if let HeapData::List(l) = self.heap.get_mut(list_id) {
                    l.items.push(item);
                }
            }
        })();
        self.unprotect();
        result?;
        match self.heap.get(list_id) {
            HeapData::List(l) => Ok(l.items.clone()),
            _ => unreachable!("rooted list survives collection"),
        }
    }

    /// Constructs instances of builtin type classes (`str(x)`, `list(xs)`,
    /// ...). Returns `None` when the class is user-defined.
    pub(crate) fn construct_builtin(
        &mut self,
        class_id: HeapId,
        pos: &[Value],
        kw: &[(HeapId, Value)],
    ) -> RunResult<Option<Value>> {
        let base = self.base;
        if !kw.is_empty()
            && (class_id == base.str_ || class_id == base.int || class_id == base.float || class_id == base.bool_
                || class_id == base.list || class_id == base.dict || class_id == base.set
                || class_id == base.tuple || class_id == base.bytes || class_id == base.range)
        {
            return Err(ExcType::type_error("builtin constructor takes no keyword arguments"));
        }
        let value = if class_id == base.str_ {
            match pos {
                [] => Value::Ref(self.heap.intern_string("")),
                [v] => {
                    let text = self.value_str(*v)?;
                    Value::Ref(self.heap.intern_string(&text))
                }
                _ => return Err(ExcType::argument_error("str() takes at most 1 argument")),
            }
        } else if class_id == base.int {
            match pos {
                [] => Value::Int(0),
                [v] => int_from_value(self, *v)?,
                _ => return Err(ExcType::argument_error("int() takes at most 1 argument")),
            }
        } else if class_id == base.float {
            match pos {
                [] => Value::Float(0.0),
                [v] => float_from_value(self, *v)?,
                _ => return Err(ExcType::argument_error("float() takes at most 1 argument")),
            }
        } else if class_id == base.bool_ {
            match pos {
                [] => Value::Bool(false),
                [v] => Value::Bool(v.is_truthy(&self.heap)),
                _ => return Err(ExcType::argument_error("bool() takes at most 1 argument")),
            }
        } else if class_id == base.list {
            match pos {
                [] => {
                    let id = self.heap.allocate(HeapData::List(List::default()));
                    Value::Ref(id)
                }
                [v] => {
                    let items = self.collect_iterable(*v)?;
                    let id = self.heap.allocate(HeapData::List(List::new(items)));
                    Value::Ref(id)
                }
                _ => return Err(ExcType::argument_error("list() takes at most 1 argument")),
            }
        } else if class_id == base.tuple {
            match pos {
                [] => {
                    let id = self.heap.allocate(HeapData::Tuple(Tuple::new(Vec::new())));
                    Value::Ref(id)
                }
                [v] => {
                    let items = self.collect_iterable(*v)?;
                    let id = self.heap.allocate(HeapData::Tuple(Tuple::new(items)));
                    Value::Ref(id)
                }
                _ => return Err(ExcType::argument_error("tuple() takes at most 1 argument")),
            }
        } else if class_id == base.set {
            match pos {
                [] => {
                    let id = self.heap.allocate(HeapData::Set(Set::new()));
                    Value::Ref(id)
                }
                [v] => {
                    let items = self.collect_iterable(*v)?;
                    let mut set = Set::new();
                    for item in items {
                        set.add(&self.heap, item)?;
                    }
                    let id = self.heap.allocate(HeapData::Set(set));
                    Value::Ref(id)
                }
                _ => return Err(ExcType::argument_error("set() takes at most 1 argument")),
            }
        } else if class_id == base.dict {
            match pos {
                [] => {
                    let id = self.heap.allocate(HeapData::Dict(Dict::new()));
                    Value::Ref(id)
                }
                _ => return Err(ExcType::argument_error("dict() takes no positional arguments")),
            }
        } else if class_id == base.bytes {
            match pos {
                [] => {
                    let id = self.heap.allocate(HeapData::Bytes(Bytes::new(Vec::new())));
                    Value::Ref(id)
                }
                [v] => {
                    let items = self.collect_iterable(*v)?;
                    let mut data = Vec::with_capacity(items.len());
                    for item in items {
                        let Some(byte) = item.as_int().and_then(|i| u8::try_from(i).ok()) else {
                            return Err(ExcType::value_error("bytes must be in range(0, 256)"));
                        };
                        data.push(byte);
                    }
                    let id = self.heap.allocate(HeapData::Bytes(Bytes::new(data)));
                    Value::Ref(id)
                }
                _ => return Err(ExcType::argument_error("bytes() takes at most 1 argument")),
            }
        } else if class_id == base.range {
            let (start, stop, step) = match pos {
                [stop] => (0, expect_int(self, *stop)?, 1),
                [start, stop] => (expect_int(self, *start)?, expect_int(self, *stop)?, 1),
                [start, stop, step] => (
                    expect_int(self, *start)?,
                    expect_int(self, *stop)?,
                    expect_int(self, *step)?,
                ),
                _ => return Err(ExcType::argument_error("range() takes 1 to 3 arguments")),
            };
            if step == 0 {
                return Err(ExcType::value_error("range() step must not be zero"));
            }
            let mut instance = Instance::new(base.range);
            let keys = ["start", "stop", "step"];
            for (key, v) in keys.iter().zip([start, stop, step]) {
                let key_id = self.heap.intern_string(key);
                instance.fields.insert(key_id, Value::Int(v));
            }
            let id = self.heap.allocate(HeapData::Instance(instance));
            Value::Ref(id)
        } else if class_id == base.type_ {
            match pos {
                [v] => Value::Ref(self.class_of(*v)),
                _ => return Err(ExcType::argument_error("type() takes exactly 1 argument")),
            }
        } else {
            return Ok(None);
        };
        Ok(Some(value))
    }

    /// Reads a named instance field, panicking on boot-time invariants.
    pub(crate) fn instance_field(&mut self, id: HeapId, name: &str) -> Option<Value> {
        let key = self.heap.intern_string(name);
        match self.heap.get(id) {
            HeapData::Instance(i) => i.fields.get(&key).copied(),
            _ => None,
        }
    }

    pub(crate) fn set_instance_field(&mut self, id: HeapId, name: &str, value: Value) {
        let key = self.heap.intern_string(name);
        if let HeapData::Instance(i) = self.heap.get_mut(id) {
            i.fields.insert(key, value);
        }
    }
}

/// Wires classes, methods, exception hierarchy, and global functions into a
/// freshly constructed VM.
pub(crate) fn boot(vm: &mut Vm) {
    // Exception hierarchy.
    let exception_root = vm.make_class("Exception", Some(vm.base.object));
    vm.heap.make_immortal(exception_root);
    vm.define_native_method(exception_root, "__init__", exc_init);
    vm.define_native_method(exception_root, "__repr__", exc_repr);
    vm.define_native_method(exception_root, "__str__", exc_str);
    for exc_type in ExcType::iter() {
        let class = if exc_type == ExcType::Exception {
            exception_root
        } else {
            let class = vm.make_class(exc_type.name(), Some(exception_root));
            vm.heap.make_immortal(class);
            class
        };
        vm.exc_classes.push(class);
        vm.finalize_class(class);
    }

    // Iterator plumbing.
    vm.define_native_method(vm.base.seq_iterator, "__call__", seq_iterator_call);
    vm.define_native_method(vm.base.seq_iterator, "__iter__", return_self);
    vm.define_native_method(vm.base.range_iterator, "__call__", range_iterator_call);
    vm.define_native_method(vm.base.range_iterator, "__iter__", return_self);
    vm.define_native_method(vm.base.range, "__iter__", range_iter);
    vm.define_native_method(vm.base.range, "__len__", range_len);
    vm.define_native_method(vm.base.generator, "send", generator_send);
    vm.define_native_method(vm.base.generator, "__iter__", return_self);
    vm.define_native_method(vm.base.generator, "__finish__", generator_finish);

    // str methods.
    let str_class = vm.base.str_;
    vm.define_native_method(str_class, "upper", str_upper);
    vm.define_native_method(str_class, "lower", str_lower);
    vm.define_native_method(str_class, "strip", str_strip);
    vm.define_native_method(str_class, "lstrip", str_lstrip);
    vm.define_native_method(str_class, "rstrip", str_rstrip);
    vm.define_native_method(str_class, "split", str_split);
    vm.define_native_method(str_class, "join", str_join);
    vm.define_native_method(str_class, "replace", str_replace);
    vm.define_native_method(str_class, "startswith", str_startswith);
    vm.define_native_method(str_class, "endswith", str_endswith);
    vm.define_native_method(str_class, "find", str_find);
    vm.define_native_method(str_class, "encode", str_encode);

    // list methods.
    let list_class = vm.base.list;
    vm.define_native_method(list_class, "append", list_append);
    vm.define_native_method(list_class, "insert", list_insert);
    vm.define_native_method(list_class, "pop", list_pop);
    vm.define_native_method(list_class, "remove", list_remove);
    vm.define_native_method(list_class, "extend", list_extend);
    vm.define_native_method(list_class, "index", list_index);
    vm.define_native_method(list_class, "count", list_count);
    vm.define_native_method(list_class, "reverse", list_reverse);
    vm.define_native_method(list_class, "sort", list_sort);
    vm.define_native_method(list_class, "clear", list_clear);

    // dict methods.
    let dict_class = vm.base.dict;
    vm.define_native_method(dict_class, "get", dict_get);
    vm.define_native_method(dict_class, "keys", dict_keys);
    vm.define_native_method(dict_class, "values", dict_values);
    vm.define_native_method(dict_class, "items", dict_items);
    vm.define_native_method(dict_class, "pop", dict_pop);
    vm.define_native_method(dict_class, "update", dict_update);
    vm.define_native_method(dict_class, "setdefault", dict_setdefault);
    vm.define_native_method(dict_class, "clear", dict_clear);

    // set methods.
    let set_class = vm.base.set;
    vm.define_native_method(set_class, "add", set_add);
    vm.define_native_method(set_class, "remove", set_remove);
    vm.define_native_method(set_class, "discard", set_discard);
    vm.define_native_method(set_class, "clear", set_clear);

    // tuple and bytes methods.
    vm.define_native_method(vm.base.tuple, "index", list_index);
    vm.define_native_method(vm.base.tuple, "count", list_count);
    vm.define_native_method(vm.base.bytes, "decode", bytes_decode);
    vm.define_native_method(vm.base.bytes, "hex", bytes_hex);

    // Finalize every builtin class.
    let classes = [
        vm.base.object,
        vm.base.type_,
        vm.base.str_,
        vm.base.int,
        vm.base.float,
        vm.base.bool_,
        vm.base.none,
        vm.base.tuple,
        vm.base.list,
        vm.base.dict,
        vm.base.set,
        vm.base.bytes,
        vm.base.function,
        vm.base.method,
        vm.base.generator,
        vm.base.property_,
        vm.base.module,
        vm.base.range,
        vm.base.seq_iterator,
        vm.base.range_iterator,
    ];
    for class in classes {
        vm.finalize_class(class);
    }

    // Global builtin functions.
    let module = vm.builtins_module;
    vm.define_native_fn(module, "print", builtin_print);
    vm.define_native_fn(module, "len", builtin_len);
    vm.define_native_fn(module, "repr", builtin_repr);
    vm.define_native_fn(module, "isinstance", builtin_isinstance);
    vm.define_native_fn(module, "hash", builtin_hash);
    vm.define_native_fn(module, "id", builtin_id);
    vm.define_native_fn(module, "ord", builtin_ord);
    vm.define_native_fn(module, "chr", builtin_chr);
    vm.define_native_fn(module, "hex", builtin_hex);
    vm.define_native_fn(module, "oct", builtin_oct);
    vm.define_native_fn(module, "bin", builtin_bin);
    vm.define_native_fn(module, "abs", builtin_abs);
    vm.define_native_fn(module, "any", builtin_any);
    vm.define_native_fn(module, "all", builtin_all);
    vm.define_native_fn(module, "min", builtin_min);
    vm.define_native_fn(module, "max", builtin_max);
    vm.define_native_fn(module, "sum", builtin_sum);
    vm.define_native_fn(module, "sorted", builtin_sorted);
    vm.define_native_fn(module, "getattr", builtin_getattr);
    vm.define_native_fn(module, "setattr", builtin_setattr);
    vm.define_native_fn(module, "hasattr", builtin_hasattr);
    vm.define_native_fn(module, "dir", builtin_dir);
    vm.define_native_fn(module, "next", builtin_next);
    vm.define_native_fn(module, "globals", builtin_globals);
    vm.define_native_fn(module, "enumerate", builtin_enumerate);
    vm.define_native_fn(module, "zip", builtin_zip);
    vm.define_native_fn(module, "map", builtin_map);
    vm.define_native_fn(module, "filter", builtin_filter);

    // Type classes and exception classes as globals.
    let class_globals: Vec<(&str, HeapId)> = vec![
        ("object", vm.base.object),
        ("type", vm.base.type_),
        ("str", vm.base.str_),
        ("int", vm.base.int),
        ("float", vm.base.float),
        ("bool", vm.base.bool_),
        ("tuple", vm.base.tuple),
        ("list", vm.base.list),
        ("dict", vm.base.dict),
        ("set", vm.base.set),
        ("bytes", vm.base.bytes),
        ("range", vm.base.range),
        ("property", vm.base.property_),
    ];
    for (name, class) in class_globals {
        let key = vm.heap.intern_string(name);
        if let HeapData::Instance(m) = vm.heap.get_mut(module) {
            m.fields.insert(key, Value::Ref(class));
        }
    }
    for exc_type in ExcType::iter() {
        let class = vm.exc_class(exc_type);
        let key = vm.heap.intern_string(exc_type.name());
        if let HeapData::Instance(m) = vm.heap.get_mut(module) {
            m.fields.insert(key, Value::Ref(class));
        }
    }

    // Register the `builtins` module itself.
    let builtins_name = vm.heap.intern_string("builtins");
    vm.set_instance_field(module, "__name__", Value::Ref(builtins_name));
    vm.modules.insert(builtins_name, Value::Ref(module));

    // The `kuroko` module: interpreter introspection and module paths.
    let kuroko_name = vm.heap.intern_string("kuroko");
    let kuroko_module = vm.new_module_instance(kuroko_name);
    let paths: Vec<Value> = vm
        .options
        .module_paths
        .clone()
        .into_iter()
        .map(|p| Value::Ref(vm.heap.intern_string(&p)))
        .collect();
    if let HeapData::List(l) = vm.heap.get_mut(vm.module_paths_list) {
        l.items = paths;
    }
    vm.set_instance_field(kuroko_module, "module_paths", Value::Ref(vm.module_paths_list));
    let version = vm.heap.intern_string("1.0.0");
    vm.set_instance_field(kuroko_module, "version", Value::Ref(version));
    vm.modules.insert(kuroko_name, Value::Ref(kuroko_module));
}

// ---- shared argument helpers ----

fn arity(name: &str, args: &[Value], want: usize) -> RunResult<()> {
    if args.len() == want {
        Ok(())
    } else {
        Err(ExcType::argument_error(format!(
            "{name}() takes {want} arguments, got {}",
            args.len()
        )))
    }
}

fn no_kwargs(name: &str, kw: &[(HeapId, Value)]) -> RunResult<()> {
    if kw.is_empty() {
        Ok(())
    } else {
        Err(ExcType::type_error(format!("{name}() takes no keyword arguments")))
    }
}

fn expect_int(vm: &Vm, v: Value) -> RunResult<i64> {
    v.as_int()
        .ok_or_else(|| ExcType::type_error(format!("expected an integer, got '{}'", v.type_name(&vm.heap))))
}

fn expect_str<'a>(vm: &'a Vm, v: Value, context: &str) -> RunResult<&'a str> {
    if let Value::Ref(id) = v
        && let HeapData::Str(s) = vm.heap.get(id)
    {
        return Ok(s.as_str());
    }
    Err(ExcType::type_error(format!(
        "{context} expected a string, got '{}'",
        v.type_name(&vm.heap)
    )))
}

fn expect_list_id(vm: &Vm, v: Value, context: &str) -> RunResult<HeapId> {
    if let Value::Ref(id) = v
        && matches!(vm.heap.get(id), HeapData::List(_))
    {
        return Ok(id);
    }
    Err(ExcType::type_error(format!(
        "{context} expected a list, got '{}'",
        v.type_name(&vm.heap)
    )))
}

fn expect_dict_id(vm: &Vm, v: Value, context: &str) -> RunResult<HeapId> {
    if let Value::Ref(id) = v
        && matches!(vm.heap.get(id), HeapData::Dict(_))
    {
        return Ok(id);
    }
    Err(ExcType::type_error(format!(
        "{context} expected a dict, got '{}'",
        v.type_name(&vm.heap)
    )))
}

fn int_from_value(vm: &mut Vm, v: Value) -> RunResult<Value> {
    match v {
        Value::Int(_) => Ok(v),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Str(s) => s
                .as_str()
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| ExcType::value_error(format!("invalid literal for int(): '{}'", s.as_str()))),
            other => Err(ExcType::type_error(format!(
                "int() argument must be a number or string, not '{}'",
                other.type_name()
            ))),
        },
        _ => Err(ExcType::type_error("int() argument must be a number or string")),
    }
}

fn float_from_value(vm: &mut Vm, v: Value) -> RunResult<Value> {
    match v {
        Value::Float(_) => Ok(v),
        Value::Int(i) => Ok(Value::Float(i as f64)),
        Value::Bool(b) => Ok(Value::Float(f64::from(i32::from(b)))),
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Str(s) => s
                .as_str()
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| ExcType::value_error(format!("invalid literal for float(): '{}'", s.as_str()))),
            other => Err(ExcType::type_error(format!(
                "float() argument must be a number or string, not '{}'",
                other.type_name()
            ))),
        },
        _ => Err(ExcType::type_error("float() argument must be a number or string")),
    }
}

// ---- exception natives ----

fn exc_init(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("Exception", kw)?;
    let Some(&this) = args.first() else {
        return Err(ExcType::argument_error("Exception() missing receiver"));
    };
    let Value::Ref(id) = this else {
        return Err(ExcType::type_error("Exception receiver must be an instance"));
    };
    let arg = args.get(1).copied().unwrap_or(Value::None);
    if args.len() > 2 {
        return Err(ExcType::argument_error("Exception() takes at most 1 argument"));
    }
    vm.set_instance_field(id, "arg", arg);
    Ok(this)
}

fn exc_repr(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let this = args[0];
    let class = vm.class_of(this);
    let name = vm.class_name(class).to_owned();
    let arg = match this {
        Value::Ref(id) => vm.instance_field(id, "arg").unwrap_or(Value::None),
        _ => Value::None,
    };
    let rendered = match arg {
        Value::None => format!("{name}()"),
        _ => format!("{name}({})", vm.value_repr(arg)?),
    };
    Ok(Value::Ref(vm.heap.intern_string(&rendered)))
}

fn exc_str(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let this = args[0];
    let arg = match this {
        Value::Ref(id) => vm.instance_field(id, "arg").unwrap_or(Value::None),
        _ => Value::None,
    };
    let rendered = match arg {
        Value::None => String::new(),
        _ => vm.value_str(arg)?,
    };
    Ok(Value::Ref(vm.heap.intern_string(&rendered)))
}

// ---- iterator natives ----

fn return_self(_vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    Ok(args[0])
}

/// Sequence iterator: walks list/tuple/str/bytes by index, returning itself
/// when exhausted.
fn seq_iterator_call(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let this = args[0];
    let Value::Ref(id) = this else {
        return Err(RunError::internal("sequence iterator receiver"));
    };
    let seq = vm.instance_field(id, " seq").unwrap_or(Value::None);
    let idx = vm
        .instance_field(id, " idx")
        .and_then(Value::as_int)
        .unwrap_or(0);
    let Value::Ref(seq_id) = seq else {
        return Ok(this);
    };
    let idx_usize = usize::try_from(idx).unwrap_or(usize::MAX);
    let item = match vm.heap.get(seq_id) {
        HeapData::List(l) => l.items.get(idx_usize).copied(),
        HeapData::Tuple(t) => t.items.get(idx_usize).copied(),
        HeapData::Bytes(b) => b.as_slice().get(idx_usize).map(|&byte| Value::Int(i64::from(byte))),
        HeapData::Str(s) => {
            if idx_usize < s.char_len() {
                let ch = match vm.heap.get_mut(seq_id) {
                    HeapData::Str(s) => s.char_at(idx_usize),
                    _ => unreachable!("checked above"),
                };
                Some(Value::Ref(vm.heap.intern_string(ch.encode_utf8(&mut [0u8; 4]))))
            } else {
                None
            }
        }
        _ => None,
    };
    match item {
        Some(value) => {
            vm.set_instance_field(id, " idx", Value::Int(idx + 1));
            Ok(value)
        }
        None => Ok(this),
    }
}

fn range_iter(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(RunError::internal("range receiver"));
    };
    let start = vm.instance_field(id, "start").and_then(Value::as_int).unwrap_or(0);
    let stop = vm.instance_field(id, "stop").and_then(Value::as_int).unwrap_or(0);
    let step = vm.instance_field(id, "step").and_then(Value::as_int).unwrap_or(1);
    let mut instance = Instance::new(vm.base.range_iterator);
    for (key, v) in [(" i", start), (" stop", stop), (" step", step)] {
        let key_id = vm.heap.intern_string(key);
        instance.fields.insert(key_id, Value::Int(v));
    }
    let iter_id = vm.heap.allocate(HeapData::Instance(instance));
    Ok(Value::Ref(iter_id))
}

fn range_len(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(RunError::internal("range receiver"));
    };
    let start = vm.instance_field(id, "start").and_then(Value::as_int).unwrap_or(0);
    let stop = vm.instance_field(id, "stop").and_then(Value::as_int).unwrap_or(0);
    let step = vm.instance_field(id, "step").and_then(Value::as_int).unwrap_or(1);
    let len = if step > 0 {
        (stop - start + step - 1).max(0) / step
    } else {
        (start - stop - step - 1).max(0) / -step
    };
    Ok(Value::Int(len))
}

fn range_iterator_call(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let this = args[0];
    let Value::Ref(id) = this else {
        return Err(RunError::internal("range iterator receiver"));
    };
    let i = vm.instance_field(id, " i").and_then(Value::as_int).unwrap_or(0);
    let stop = vm.instance_field(id, " stop").and_then(Value::as_int).unwrap_or(0);
    let step = vm.instance_field(id, " step").and_then(Value::as_int).unwrap_or(1);
    let exhausted = if step > 0 { i >= stop } else { i <= stop };
    if exhausted {
        return Ok(this);
    }
    vm.set_instance_field(id, " i", Value::Int(i + step));
    Ok(Value::Int(i))
}

fn generator_send(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("send", kw)?;
    arity("send", args, 2)?;
    let Value::Ref(gen_id) = args[0] else {
        return Err(ExcType::type_error("send() receiver must be a generator"));
    };
    let result = vm.resume_generator(gen_id, args[1])?;
    if result.is_same(args[0]) {
        let payload = match vm.heap.get(gen_id) {
            HeapData::Generator(g) => g.result,
            _ => Value::None,
        };
        return Err(RunError::stop_iteration(payload));
    }
    Ok(result)
}

/// Internal channel surfacing a finished generator's return value.
fn generator_finish(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let Value::Ref(gen_id) = args[0] else {
        return Err(ExcType::type_error("__finish__() receiver must be a generator"));
    };
    match vm.heap.get(gen_id) {
        HeapData::Generator(g) if g.state == GeneratorState::Finished => Ok(g.result),
        HeapData::Generator(_) => Ok(Value::None),
        _ => Err(ExcType::type_error("__finish__() receiver must be a generator")),
    }
}

// ---- global builtins ----

fn builtin_print(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let mut sep = " ".to_owned();
    let mut end = "\n".to_owned();
    for &(name, value) in kw {
        let name_str = vm.heap.str_value(name).to_owned();
        match name_str.as_str() {
            "sep" => sep = vm.value_str(value)?,
            "end" => end = vm.value_str(value)?,
            other => {
                return Err(ExcType::type_error(format!(
                    "print() got an unexpected keyword argument '{other}'"
                )));
            }
        }
    }
    let mut rendered = Vec::with_capacity(args.len());
    for &arg in args {
        rendered.push(vm.value_str(arg)?);
    }
    for (i, text) in rendered.iter().enumerate() {
        if i > 0 {
            vm.printer.write_str(&sep);
        }
        vm.printer.write_str(text);
    }
    vm.printer.write_str(&end);
    Ok(Value::None)
}

fn builtin_len(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("len", kw)?;
    arity("len", args, 1)?;
    let v = args[0];
    if let Value::Ref(id) = v {
        let len = match vm.heap.get(id) {
            HeapData::Str(s) => Some(s.char_len()),
            HeapData::Bytes(b) => Some(b.as_slice().len()),
            HeapData::Tuple(t) => Some(t.items.len()),
            HeapData::List(l) => Some(l.items.len()),
            HeapData::Dict(d) => Some(d.len()),
            HeapData::Set(s) => Some(s.len()),
            _ => None,
        };
        if let Some(len) = len {
            return Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)));
        }
        let class = vm.class_of(v);
        if let Some(method) = vm.class_slot(class, Special::Len) {
            let result = vm.call_value_and_run(method, &[v])?;
            return expect_int(vm, result).map(Value::Int);
        }
    }
    Err(ExcType::type_error(format!(
        "object of type '{}' has no len()",
        v.type_name(&vm.heap)
    )))
}

fn builtin_repr(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("repr", kw)?;
    arity("repr", args, 1)?;
    let text = vm.value_repr(args[0])?;
    Ok(Value::Ref(vm.heap.intern_string(&text)))
}

fn builtin_isinstance(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("isinstance", kw)?;
    arity("isinstance", args, 2)?;
    let classes: Vec<HeapId> = match args[1] {
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Class(_) => vec![id],
            HeapData::Tuple(t) => {
                let mut out = Vec::with_capacity(t.items.len());
                for &item in &t.items {
                    let Value::Ref(class_id) = item else {
                        return Err(ExcType::type_error("isinstance() arg 2 must be a type or tuple of types"));
                    };
                    out.push(class_id);
                }
                out
            }
            _ => return Err(ExcType::type_error("isinstance() arg 2 must be a type or tuple of types")),
        },
        _ => return Err(ExcType::type_error("isinstance() arg 2 must be a type or tuple of types")),
    };
    let hit = classes.iter().any(|&class| vm.value_isinstance(args[0], class));
    Ok(Value::Bool(hit))
}

fn builtin_hash(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("hash", kw)?;
    arity("hash", args, 1)?;
    match value_hash(&vm.heap, args[0]) {
        Some(h) => Ok(Value::Int(i64::from(h))),
        None => Err(ExcType::type_error(format!(
            "unhashable type: '{}'",
            args[0].type_name(&vm.heap)
        ))),
    }
}

fn builtin_id(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("id", kw)?;
    arity("id", args, 1)?;
    let id = match args[0] {
        Value::Ref(id) => i64::try_from(id.index()).unwrap_or(i64::MAX),
        other => i64::from(value_hash(&vm.heap, other).unwrap_or(0)),
    };
    Ok(Value::Int(id))
}

fn builtin_ord(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("ord", kw)?;
    arity("ord", args, 1)?;
    let text = expect_str(vm, args[0], "ord()")?;
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Ok(Value::Int(i64::from(u32::from(ch)))),
        _ => Err(ExcType::type_error("ord() expected a character")),
    }
}

fn builtin_chr(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("chr", kw)?;
    arity("chr", args, 1)?;
    let code = expect_int(vm, args[0])?;
    let ch = u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| ExcType::value_error("chr() arg not in range"))?;
    Ok(Value::Ref(vm.heap.intern_string(ch.encode_utf8(&mut [0u8; 4]))))
}

fn builtin_hex(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("hex", kw)?;
    arity("hex", args, 1)?;
    let v = expect_int(vm, args[0])?;
    let text = if v < 0 { format!("-0x{:x}", -(v as i128)) } else { format!("0x{v:x}") };
    Ok(Value::Ref(vm.heap.intern_string(&text)))
}

fn builtin_oct(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("oct", kw)?;
    arity("oct", args, 1)?;
    let v = expect_int(vm, args[0])?;
    let text = if v < 0 { format!("-0o{:o}", -(v as i128)) } else { format!("0o{v:o}") };
    Ok(Value::Ref(vm.heap.intern_string(&text)))
}

fn builtin_bin(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("bin", kw)?;
    arity("bin", args, 1)?;
    let v = expect_int(vm, args[0])?;
    let text = if v < 0 { format!("-0b{:b}", -(v as i128)) } else { format!("0b{v:b}") };
    Ok(Value::Ref(vm.heap.intern_string(&text)))
}

fn builtin_abs(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("abs", kw)?;
    arity("abs", args, 1)?;
    match args[0] {
        Value::Int(i) => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| ExcType::overflow("integer overflow")),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(ExcType::type_error(format!(
            "bad operand type for abs(): '{}'",
            other.type_name(&vm.heap)
        ))),
    }
}

fn builtin_any(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("any", kw)?;
    arity("any", args, 1)?;
    let items = vm.collect_iterable(args[0])?;
    Ok(Value::Bool(items.iter().any(|v| v.is_truthy(&vm.heap))))
}

fn builtin_all(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("all", kw)?;
    arity("all", args, 1)?;
    let items = vm.collect_iterable(args[0])?;
    Ok(Value::Bool(items.iter().all(|v| v.is_truthy(&vm.heap))))
}

/// Ordering used by min/max/sorted; numbers and strings only.
fn compare_for_sort(vm: &mut Vm, a: Value, b: Value) -> RunResult<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Ok(x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal));
    }
    if let (Value::Ref(ia), Value::Ref(ib)) = (a, b)
        && let (HeapData::Str(p), HeapData::Str(q)) = (vm.heap.get(ia), vm.heap.get(ib))
    {
        return Ok(p.as_str().cmp(q.as_str()));
    }
    Err(ExcType::type_error(format!(
        "'<' not supported between '{}' and '{}'",
        a.type_name(&vm.heap),
        b.type_name(&vm.heap)
    )))
}

fn builtin_min(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("min", kw)?;
    let items = if args.len() == 1 { vm.collect_iterable(args[0])? } else { args.to_vec() };
    let mut iter = items.into_iter();
    let Some(mut best) = iter.next() else {
        return Err(ExcType::value_error("min() of an empty sequence"));
    };
    for v in iter {
        if compare_for_sort(vm, v, best)? == std::cmp::Ordering::Less {
            best = v;
        }
    }
    Ok(best)
}

fn builtin_max(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("max", kw)?;
    let items = if args.len() == 1 { vm.collect_iterable(args[0])? } else { args.to_vec() };
    let mut iter = items.into_iter();
    let Some(mut best) = iter.next() else {
        return Err(ExcType::value_error("max() of an empty sequence"));
    };
    for v in iter {
        if compare_for_sort(vm, v, best)? == std::cmp::Ordering::Greater {
            best = v;
        }
    }
    Ok(best)
}

fn builtin_sum(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("sum", kw)?;
    if args.is_empty() || args.len() > 2 {
        return Err(ExcType::argument_error("sum() takes 1 or 2 arguments"));
    }
    let items = vm.collect_iterable(args[0])?;
    let mut total = args.get(1).copied().unwrap_or(Value::Int(0));
    for item in items {
        total = vm.binary_dispatch(total, item, Special::Add)?;
    }
    Ok(total)
}

fn builtin_sorted(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("sorted", kw)?;
    arity("sorted", args, 1)?;
    let mut items = vm.collect_iterable(args[0])?;
    let mut error = None;
    items.sort_by(|&a, &b| match compare_for_sort(vm, a, b) {
        Ok(ordering) => ordering,
        Err(err) => {
            if error.is_none() {
                error = Some(err);
            }
            std::cmp::Ordering::Equal
        }
    });
    if let Some(err) = error {
        return Err(err);
    }
    let id = vm.heap.allocate(HeapData::List(List::new(items)));
    Ok(Value::Ref(id))
}

fn builtin_getattr(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("getattr", kw)?;
    if args.len() != 2 && args.len() != 3 {
        return Err(ExcType::argument_error("getattr() takes 2 or 3 arguments"));
    }
    let name = expect_str(vm, args[1], "getattr()")?.to_owned();
    let name_id = vm.heap.intern_string(&name);
    match vm.get_attribute(args[0], name_id) {
        Ok(v) => Ok(v),
        Err(err) => match args.get(2) {
            Some(&default) => Ok(default),
            None => Err(err),
        },
    }
}

fn builtin_setattr(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("setattr", kw)?;
    arity("setattr", args, 3)?;
    let name = expect_str(vm, args[1], "setattr()")?.to_owned();
    let name_id = vm.heap.intern_string(&name);
    vm.push(args[0]);
    vm.push(args[2]);
    vm.op_set_property(name_id)?;
    vm.pop();
    Ok(Value::None)
}

fn builtin_hasattr(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("hasattr", kw)?;
    arity("hasattr", args, 2)?;
    let name = expect_str(vm, args[1], "hasattr()")?.to_owned();
    let name_id = vm.heap.intern_string(&name);
    Ok(Value::Bool(vm.get_attribute(args[0], name_id).is_ok()))
}

fn builtin_dir(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("dir", kw)?;
    arity("dir", args, 1)?;
    let mut names: Vec<String> = Vec::new();
    let mut class = match args[0] {
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Instance(instance) => {
                for &key in instance.fields.keys() {
                    names.push(vm.heap.str_value(key).to_owned());
                }
                Some(instance.class)
            }
            HeapData::Class(_) => Some(id),
            _ => Some(vm.class_of(args[0])),
        },
        _ => Some(vm.class_of(args[0])),
    };
    while let Some(current) = class {
        let HeapData::Class(c) = vm.heap.get(current) else { break };
        for &key in c.methods.keys().chain(c.statics.keys()) {
            names.push(vm.heap.str_value(key).to_owned());
        }
        class = c.base;
    }
    names.sort();
    names.dedup();
    let items: Vec<Value> = names
        .into_iter()
        .map(|n| Value::Ref(vm.heap.intern_string(&n)))
        .collect();
    let id = vm.heap.allocate(HeapData::List(List::new(items)));
    Ok(Value::Ref(id))
}

fn builtin_next(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("next", kw)?;
    if args.is_empty() || args.len() > 2 {
        return Err(ExcType::argument_error("next() takes 1 or 2 arguments"));
    }
    let iterator = args[0];
    let result = vm.call_value_and_run(iterator, &[])?;
    if result.is_same(iterator) {
        if let Some(&default) = args.get(1) {
            return Ok(default);
        }
        // Finished generators carry their return value into StopIteration.
        let payload = match iterator {
            Value::Ref(id) => match vm.heap.get(id) {
                HeapData::Generator(g) => g.result,
                _ => Value::None,
            },
            _ => Value::None,
        };
        return Err(RunError::stop_iteration(payload));
    }
    Ok(result)
}

fn builtin_globals(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("globals", kw)?;
    arity("globals", args, 0)?;
    let frame = *vm.frame();
    let globals = vm.closure_of(&frame).globals;
    let entries: Vec<(HeapId, Value)> = match vm.heap.get(globals) {
        HeapData::Instance(m) => m.fields.iter().map(|(&k, &v)| (k, v)).collect(),
        _ => Vec::new(),
    };
    let mut dict = Dict::new();
    for (key, value) in entries {
        dict.insert(&vm.heap, Value::Ref(key), value)?;
    }
    let id = vm.heap.allocate(HeapData::Dict(dict));
    Ok(Value::Ref(id))
}

fn builtin_enumerate(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("enumerate", kw)?;
    if args.is_empty() || args.len() > 2 {
        return Err(ExcType::argument_error("enumerate() takes 1 or 2 arguments"));
    }
    let start = match args.get(1) {
        Some(&v) => expect_int(vm, v)?,
        None => 0,
    };
    let items = vm.collect_iterable(args[0])?;
    let list_id = vm.heap.allocate(HeapData::List(List::default()));
    vm.protect(Value::Ref(list_id));
    for (i, item) in items.into_iter().enumerate() {
        let index = start + i64::try_from(i).unwrap_or(i64::MAX);
        let pair = vm.heap.allocate(HeapData::Tuple(Tuple::new(vec![Value::Int(index), item])));
        if let HeapData::List(l) = vm.heap.get_mut(list_id) {
            l.items.push(Value::Ref(pair));
        }
    }
    vm.unprotect();
    Ok(Value::Ref(list_id))
}

fn builtin_zip(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("zip", kw)?;
    let mut columns = Vec::with_capacity(args.len());
    for &arg in args {
        columns.push(vm.collect_iterable(arg)?);
    }
    let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
    let list_id = vm.heap.allocate(HeapData::List(List::default()));
    vm.protect(Value::Ref(list_id));
    for i in 0..shortest {
        let row: Vec<Value> = columns.iter().map(|c| c[i]).collect();
        let tuple = vm.heap.allocate(HeapData::Tuple(Tuple::new(row)));
        if let HeapData::List(l) = vm.heap.get_mut(list_id) {
            l.items.push(Value::Ref(tuple));
        }
    }
    vm.unprotect();
    Ok(Value::Ref(list_id))
}

fn builtin_map(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("map", kw)?;
    arity("map", args, 2)?;
    let items = vm.collect_iterable(args[1])?;
    let list_id = vm.heap.allocate(HeapData::List(List::default()));
    vm.protect(Value::Ref(list_id));
    let result = (|| -> RunResult<()> {
        for item in items {
            let mapped = vm.call_value_and_run(args[0], &[item])?;
            if let HeapData::List(l) = vm.heap.get_mut(list_id) {
                l.items.push(mapped);
            }
        }
        Ok(())
    })();
    vm.unprotect();
    result?;
    Ok(Value::Ref(list_id))
}

fn builtin_filter(vm: &mut Vm, args: &[Value], kw: &[(HeapId, Value)]) -> RunResult<Value> {
    no_kwargs("filter", kw)?;
    arity("filter", args, 2)?;
    let items = vm.collect_iterable(args[1])?;
    let list_id = vm.heap.allocate(HeapData::List(List::default()));
    vm.protect(Value::Ref(list_id));
    let result = (|| -> RunResult<()> {
        for item in items {
            let keep = if matches!(args[0], Value::None) {
                item.is_truthy(&vm.heap)
            } else {
                let verdict = vm.call_value_and_run(args[0], &[item])?;
                verdict.is_truthy(&vm.heap)
            };
            if keep && let HeapData::List(l) = vm.heap.get_mut(list_id) {
                l.items.push(item);
            }
        }
        Ok(())
    })();
    vm.unprotect();
    result?;
    Ok(Value::Ref(list_id))
}

// ---- str methods ----

fn str_receiver<'a>(vm: &'a Vm, args: &[Value], name: &str) -> RunResult<&'a str> {
    expect_str(vm, args[0], name)
}

fn str_upper(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let out = str_receiver(vm, args, "upper()")?.to_uppercase();
    Ok(Value::Ref(vm.heap.intern_string(&out)))
}

fn str_lower(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let out = str_receiver(vm, args, "lower()")?.to_lowercase();
    Ok(Value::Ref(vm.heap.intern_string(&out)))
}

fn str_strip(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let out = str_receiver(vm, args, "strip()")?.trim().to_owned();
    Ok(Value::Ref(vm.heap.intern_string(&out)))
}

fn str_lstrip(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let out = str_receiver(vm, args, "lstrip()")?.trim_start().to_owned();
    Ok(Value::Ref(vm.heap.intern_string(&out)))
}

fn str_rstrip(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let out = str_receiver(vm, args, "rstrip()")?.trim_end().to_owned();
    Ok(Value::Ref(vm.heap.intern_string(&out)))
}

fn str_split(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let text = str_receiver(vm, args, "split()")?.to_owned();
    let parts: Vec<String> = match args.get(1) {
        Some(&sep) => {
            let sep = expect_str(vm, sep, "split()")?.to_owned();
            if sep.is_empty() {
                return Err(ExcType::value_error("empty separator"));
            }
            text.split(&sep).map(str::to_owned).collect()
        }
        None => text.split_whitespace().map(str::to_owned).collect(),
    };
    let list_id = vm.heap.allocate(HeapData::List(List::default()));
    vm.protect(Value::Ref(list_id));
    for part in parts {
        let piece = vm.heap.intern_string(&part);
        if let HeapData::List(l) = vm.heap.get_mut(list_id) {
            l.items.push(Value::Ref(piece));
        }
    }
    vm.unprotect();
    Ok(Value::Ref(list_id))
}

fn str_join(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("join", args, 2)?;
    let sep = str_receiver(vm, args, "join()")?.to_owned();
    let items = vm.collect_iterable(args[1])?;
    let mut out = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push_str(&sep);
        }
        out.push_str(expect_str(vm, item, "join()")?);
    }
    Ok(Value::Ref(vm.heap.intern_string(&out)))
}

fn str_replace(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("replace", args, 3)?;
    let text = str_receiver(vm, args, "replace()")?.to_owned();
    let from = expect_str(vm, args[1], "replace()")?.to_owned();
    let to = expect_str(vm, args[2], "replace()")?.to_owned();
    let out = text.replace(&from, &to);
    Ok(Value::Ref(vm.heap.intern_string(&out)))
}

fn str_startswith(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("startswith", args, 2)?;
    let text = str_receiver(vm, args, "startswith()")?;
    let prefix = expect_str(vm, args[1], "startswith()")?;
    Ok(Value::Bool(text.starts_with(prefix)))
}

fn str_endswith(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("endswith", args, 2)?;
    let text = str_receiver(vm, args, "endswith()")?;
    let suffix = expect_str(vm, args[1], "endswith()")?;
    Ok(Value::Bool(text.ends_with(suffix)))
}

fn str_find(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("find", args, 2)?;
    let text = str_receiver(vm, args, "find()")?;
    let needle = expect_str(vm, args[1], "find()")?;
    match text.find(needle) {
        Some(byte_pos) => {
            let char_pos = text[..byte_pos].chars().count();
            Ok(Value::Int(i64::try_from(char_pos).unwrap_or(i64::MAX)))
        }
        None => Ok(Value::Int(-1)),
    }
}

fn str_encode(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let text = str_receiver(vm, args, "encode()")?.to_owned();
    let id = vm.heap.allocate(HeapData::Bytes(Bytes::new(text.into_bytes())));
    Ok(Value::Ref(id))
}

// ---- list methods ----

fn list_append(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("append", args, 2)?;
    let id = expect_list_id(vm, args[0], "append()")?;
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items.push(args[1]);
    }
    Ok(Value::None)
}

fn list_insert(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("insert", args, 3)?;
    let id = expect_list_id(vm, args[0], "insert()")?;
    let index = expect_int(vm, args[1])?;
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        let len = l.items.len();
        let index = if index < 0 {
            usize::try_from(index + i64::try_from(len).unwrap_or(i64::MAX)).unwrap_or(0)
        } else {
            usize::try_from(index).unwrap_or(len).min(len)
        };
        l.items.insert(index.min(len), args[2]);
    }
    Ok(Value::None)
}

fn list_pop(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let id = expect_list_id(vm, args[0], "pop()")?;
    let index = match args.get(1) {
        Some(&v) => Some(expect_int(vm, v)?),
        None => None,
    };
    let len = match vm.heap.get(id) {
        HeapData::List(l) => l.items.len(),
        _ => unreachable!("checked above"),
    };
    if len == 0 {
        return Err(ExcType::index_error("pop from empty list"));
    }
    let index = match index {
        Some(i) => {
            let adjusted = if i < 0 { i + i64::try_from(len).unwrap_or(i64::MAX) } else { i };
            usize::try_from(adjusted).ok().filter(|&i| i < len).ok_or_else(|| {
                ExcType::index_error("pop index out of range")
            })?
        }
        None => len - 1,
    };
    match vm.heap.get_mut(id) {
        HeapData::List(l) => Ok(l.items.remove(index)),
        _ => unreachable!("checked above"),
    }
}

fn list_remove(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("remove", args, 2)?;
    let id = expect_list_id(vm, args[0], "remove()")?;
    let items = match vm.heap.get(id) {
        HeapData::List(l) => l.items.clone(),
        _ => unreachable!("checked above"),
    };
    for (i, item) in items.into_iter().enumerate() {
        if vm.values_equal(args[1], item)? {
            if let HeapData::List(l) = vm.heap.get_mut(id) {
                l.items.remove(i);
            }
            return Ok(Value::None);
        }
    }
    Err(ExcType::value_error("list.remove(x): x not in list"))
}

fn list_extend(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("extend", args, 2)?;
    let id = expect_list_id(vm, args[0], "extend()")?;
    let items = vm.collect_iterable(args[1])?;
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items.extend(items);
    }
    Ok(Value::None)
}

fn list_index(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("index", args, 2)?;
    let items = vm.sequence_items(args[0])?;
    for (i, item) in items.into_iter().enumerate() {
        if vm.values_equal(args[1], item)? {
            return Ok(Value::Int(i64::try_from(i).unwrap_or(i64::MAX)));
        }
    }
    Err(ExcType::value_error("value not in sequence"))
}

fn list_count(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("count", args, 2)?;
    let items = vm.sequence_items(args[0])?;
    let mut count = 0i64;
    for item in items {
        if vm.values_equal(args[1], item)? {
            count += 1;
        }
    }
    Ok(Value::Int(count))
}

fn list_reverse(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("reverse", args, 1)?;
    let id = expect_list_id(vm, args[0], "reverse()")?;
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items.reverse();
    }
    Ok(Value::None)
}

fn list_sort(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("sort", args, 1)?;
    let id = expect_list_id(vm, args[0], "sort()")?;
    let mut items = match vm.heap.get(id) {
        HeapData::List(l) => l.items.clone(),
        _ => unreachable!("checked above"),
    };
    let mut error = None;
    items.sort_by(|&a, &b| match compare_for_sort(vm, a, b) {
        Ok(ordering) => ordering,
        Err(err) => {
            if error.is_none() {
                error = Some(err);
            }
            std::cmp::Ordering::Equal
        }
    });
    if let Some(err) = error {
        return Err(err);
    }
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items = items;
    }
    Ok(Value::None)
}

fn list_clear(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("clear", args, 1)?;
    let id = expect_list_id(vm, args[0], "clear()")?;
    if let HeapData::List(l) = vm.heap.get_mut(id) {
        l.items.clear();
    }
    Ok(Value::None)
}

// ---- dict methods ----

fn dict_get(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let id = expect_dict_id(vm, args[0], "get()")?;
    let found = match vm.heap.get(id) {
        HeapData::Dict(d) => d.get(&vm.heap, args[1])?,
        _ => unreachable!("checked above"),
    };
    Ok(found.unwrap_or_else(|| args.get(2).copied().unwrap_or(Value::None)))
}

fn dict_keys(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("keys", args, 1)?;
    let id = expect_dict_id(vm, args[0], "keys()")?;
    let keys: Vec<Value> = match vm.heap.get(id) {
        HeapData::Dict(d) => d.iter().map(|(k, _)| k).collect(),
        _ => unreachable!("checked above"),
    };
    let out = vm.heap.allocate(HeapData::List(List::new(keys)));
    Ok(Value::Ref(out))
}

fn dict_values(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("values", args, 1)?;
    let id = expect_dict_id(vm, args[0], "values()")?;
    let values: Vec<Value> = match vm.heap.get(id) {
        HeapData::Dict(d) => d.iter().map(|(_, v)| v).collect(),
        _ => unreachable!("checked above"),
    };
    let out = vm.heap.allocate(HeapData::List(List::new(values)));
    Ok(Value::Ref(out))
}

fn dict_items(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("items", args, 1)?;
    let id = expect_dict_id(vm, args[0], "items()")?;
    let pairs: Vec<(Value, Value)> = match vm.heap.get(id) {
        HeapData::Dict(d) => d.iter().collect(),
        _ => unreachable!("checked above"),
    };
    let list_id = vm.heap.allocate(HeapData::List(List::default()));
    vm.protect(Value::Ref(list_id));
    for (key, value) in pairs {
        let tuple = vm.heap.allocate(HeapData::Tuple(Tuple::new(vec![key, value])));
        if let HeapData::List(l) = vm.heap.get_mut(list_id) {
            l.items.push(Value::Ref(tuple));
        }
    }
    vm.unprotect();
    Ok(Value::Ref(list_id))
}

fn dict_pop(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let id = expect_dict_id(vm, args[0], "pop()")?;
    let removed = vm.heap.with_data_mut(id, |heap, data| match data {
        HeapData::Dict(d) => d.remove(heap, args[1]),
        _ => unreachable!("checked above"),
    })?;
    match removed {
        Some(value) => Ok(value),
        None => match args.get(2) {
            Some(&default) => Ok(default),
            None => {
                let repr = vm.value_repr(args[1])?;
                Err(ExcType::key_error(repr))
            }
        },
    }
}

fn dict_update(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("update", args, 2)?;
    let id = expect_dict_id(vm, args[0], "update()")?;
    let other = expect_dict_id(vm, args[1], "update()")?;
    let pairs: Vec<(Value, Value)> = match vm.heap.get(other) {
        HeapData::Dict(d) => d.iter().collect(),
        _ => unreachable!("checked above"),
    };
    for (key, value) in pairs {
        vm.heap.with_data_mut(id, |heap, data| match data {
            HeapData::Dict(d) => d.insert(heap, key, value).map(|_| ()),
            _ => unreachable!("checked above"),
        })?;
    }
    Ok(Value::None)
}

fn dict_setdefault(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let id = expect_dict_id(vm, args[0], "setdefault()")?;
    let default = args.get(2).copied().unwrap_or(Value::None);
    let existing = match vm.heap.get(id) {
        HeapData::Dict(d) => d.get(&vm.heap, args[1])?,
        _ => unreachable!("checked above"),
    };
    if let Some(value) = existing {
        return Ok(value);
    }
    vm.heap.with_data_mut(id, |heap, data| match data {
        HeapData::Dict(d) => d.insert(heap, args[1], default).map(|_| ()),
        _ => unreachable!("checked above"),
    })?;
    Ok(default)
}

fn dict_clear(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("clear", args, 1)?;
    let id = expect_dict_id(vm, args[0], "clear()")?;
    if let HeapData::Dict(d) = vm.heap.get_mut(id) {
        *d = Dict::new();
    }
    Ok(Value::None)
}

// ---- set methods ----

fn expect_set_id(vm: &Vm, v: Value, context: &str) -> RunResult<HeapId> {
    if let Value::Ref(id) = v
        && matches!(vm.heap.get(id), HeapData::Set(_))
    {
        return Ok(id);
    }
    Err(ExcType::type_error(format!(
        "{context} expected a set, got '{}'",
        v.type_name(&vm.heap)
    )))
}

fn set_add(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("add", args, 2)?;
    let id = expect_set_id(vm, args[0], "add()")?;
    vm.heap.with_data_mut(id, |heap, data| match data {
        HeapData::Set(s) => s.add(heap, args[1]).map(|_| ()),
        _ => unreachable!("checked above"),
    })?;
    Ok(Value::None)
}

fn set_remove(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("remove", args, 2)?;
    let id = expect_set_id(vm, args[0], "remove()")?;
    let removed = vm.heap.with_data_mut(id, |heap, data| match data {
        HeapData::Set(s) => s.discard(heap, args[1]),
        _ => unreachable!("checked above"),
    })?;
    if removed {
        Ok(Value::None)
    } else {
        let repr = vm.value_repr(args[1])?;
        Err(ExcType::key_error(repr))
    }
}

fn set_discard(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("discard", args, 2)?;
    let id = expect_set_id(vm, args[0], "discard()")?;
    vm.heap.with_data_mut(id, |heap, data| match data {
        HeapData::Set(s) => s.discard(heap, args[1]).map(|_| ()),
        _ => unreachable!("checked above"),
    })?;
    Ok(Value::None)
}

fn set_clear(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    arity("clear", args, 1)?;
    let id = expect_set_id(vm, args[0], "clear()")?;
    if let HeapData::Set(s) = vm.heap.get_mut(id) {
        *s = Set::new();
    }
    Ok(Value::None)
}

// ---- bytes methods ----

fn bytes_decode(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(ExcType::type_error("decode() receiver must be bytes"));
    };
    let HeapData::Bytes(b) = vm.heap.get(id) else {
        return Err(ExcType::type_error("decode() receiver must be bytes"));
    };
    let text = String::from_utf8(b.as_slice().to_vec())
        .map_err(|_| ExcType::value_error("invalid utf-8 sequence"))?;
    Ok(Value::Ref(vm.heap.intern_string(&text)))
}

fn bytes_hex(vm: &mut Vm, args: &[Value], _kw: &[(HeapId, Value)]) -> RunResult<Value> {
    let Value::Ref(id) = args[0] else {
        return Err(ExcType::type_error("hex() receiver must be bytes"));
    };
    let HeapData::Bytes(b) = vm.heap.get(id) else {
        return Err(ExcType::type_error("hex() receiver must be bytes"));
    };
    let mut out = String::with_capacity(b.as_slice().len() * 2);
    for byte in b.as_slice() {
        out.push_str(&format!("{byte:02x}"));
    }
    Ok(Value::Ref(vm.heap.intern_string(&out)))
}
