//! The bytecode virtual machine: frame stack, dispatch loop, upvalues,
//! exception unwinding, and generator resumption.
//!
//! Execution happens through [`Vm::run_until`], which dispatches until the
//! frame stack drops back to a floor depth. Protocol invocations that call
//! user code (`__exit__`, `__iter__`, dunder operators) nest another
//! `run_until` with the floor set to the freshly pushed frame. Garbage
//! collection runs only at the top of the dispatch loop, so helpers may
//! allocate freely as long as intermediate values stay reachable from the
//! stack or the protected-root list.

mod attr;
mod binary;
mod call;
mod collections;
mod exceptions;
mod format;

use ahash::AHashMap;
use strum::{EnumCount, IntoEnumIterator};

use crate::{
    compile::Compiler,
    exception::{ExcType, Exception, RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    io::{PrintWriter, StdPrint},
    modules,
    object::{AttrTable, Closure, GeneratorState, Instance, Special, Upvalue},
    op::Opcode,
    tracer::{NoopTracer, VmTracer},
    value::{Handler, HandlerKind, Value, kwargs},
};

/// Construction-time configuration for a [`Vm`].
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Collect on every instruction (debug aid).
    pub gc_stress: bool,
    /// Maximum call-frame depth before raising.
    pub recursion_limit: usize,
    /// Initial module search roots, exposed as `kuroko.module_paths`.
    pub module_paths: Vec<String>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            gc_stress: false,
            recursion_limit: 1000,
            module_paths: vec![".".to_owned()],
        }
    }
}

/// VM execution record for a single function invocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallFrame {
    /// The executing closure.
    pub closure: HeapId,
    /// Byte offset of the next instruction.
    pub ip: usize,
    /// Absolute stack index where local slot 0 (the callee) lives.
    pub slots: usize,
    /// Set when this frame belongs to a resumed generator.
    pub generator: Option<HeapId>,
}

/// Result of running a frame to a suspension point.
#[derive(Debug)]
pub(crate) enum StepExit {
    Return(Value),
    Yield(Value),
}

/// Heap ids of the builtin base classes, filled during boot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BaseClasses {
    pub object: HeapId,
    pub type_: HeapId,
    pub str_: HeapId,
    pub int: HeapId,
    pub float: HeapId,
    pub bool_: HeapId,
    pub none: HeapId,
    pub tuple: HeapId,
    pub list: HeapId,
    pub dict: HeapId,
    pub set: HeapId,
    pub bytes: HeapId,
    pub function: HeapId,
    pub method: HeapId,
    pub generator: HeapId,
    pub property_: HeapId,
    pub module: HeapId,
    pub range: HeapId,
    /// Internal iterator classes (not exposed as globals).
    pub seq_iterator: HeapId,
    pub range_iterator: HeapId,
}

/// The interpreter: heap, thread state, and process-wide tables.
pub struct Vm {
    pub heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalues sorted by stack slot, highest first.
    pub(crate) open_upvalues: Vec<HeapId>,
    /// Loaded modules keyed by interned dotted name.
    pub(crate) modules: AttrTable,
    /// The `builtins` module instance; global reads fall back to it.
    pub(crate) builtins_module: HeapId,
    pub(crate) base: BaseClasses,
    /// Interned special-method name strings, indexed by `Special`.
    pub(crate) special_names: Vec<HeapId>,
    /// Builtin exception class objects, indexed by `ExcType`.
    pub(crate) exc_classes: Vec<HeapId>,
    /// The `kuroko.module_paths` list object.
    pub(crate) module_paths_list: HeapId,
    /// Transient GC roots held by natives and the unwinder.
    pub(crate) protected: Vec<Value>,
    pub(crate) printer: Box<dyn PrintWriter>,
    pub(crate) tracer: Box<dyn VmTracer>,
    pub(crate) options: VmOptions,
}

impl Vm {
    /// Creates a VM with the default stdout printer and no tracing.
    #[must_use]
    pub fn new(options: VmOptions) -> Self {
        Self::with_io(options, Box::new(StdPrint), Box::new(NoopTracer))
    }

    /// Creates a VM with a custom print sink and tracer.
    #[must_use]
    pub fn with_io(options: VmOptions, printer: Box<dyn PrintWriter>, tracer: Box<dyn VmTracer>) -> Self {
        let mut heap = Heap::new();
        heap.stress = options.gc_stress;

        let special_names: Vec<HeapId> = Special::iter()
            .map(|s| {
                let id = heap.intern_string(s.method_name());
                heap.make_immortal(id);
                id
            })
            .collect();
        debug_assert_eq!(special_names.len(), Special::COUNT);

        let base = BaseClasses::bootstrap(&mut heap);

        let module_class = base.module;
        let builtins_module = heap.allocate(HeapData::Instance(Instance::new(module_class)));
        heap.make_immortal(builtins_module);

        let module_paths_list = heap.allocate(HeapData::List(crate::object::List::default()));
        heap.make_immortal(module_paths_list);

        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            open_upvalues: Vec::new(),
            modules: AttrTable::default(),
            builtins_module,
            base,
            special_names,
            exc_classes: Vec::new(),
            module_paths_list,
            protected: Vec::new(),
            printer,
            tracer,
            options,
        };
        crate::builtins::boot(&mut vm);
        vm
    }

    /// Replaces the tracer, returning the previous one.
    pub fn set_tracer(&mut self, tracer: Box<dyn VmTracer>) -> Box<dyn VmTracer> {
        std::mem::replace(&mut self.tracer, tracer)
    }

    // ---- stack primitives ----

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    /// Value `distance` slots below the top.
    #[inline]
    #[must_use]
    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    #[inline]
    #[must_use]
    pub fn stack_top(&self) -> usize {
        self.stack.len()
    }

    /// Keeps a value alive across allocations inside native code.
    pub fn protect(&mut self, value: Value) {
        self.protected.push(value);
    }

    pub fn unprotect(&mut self) {
        self.protected.pop();
    }

    // ---- frame helpers ----

    pub(crate) fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    pub(crate) fn closure_of(&self, frame: &CallFrame) -> &Closure {
        match self.heap.get(frame.closure) {
            HeapData::Closure(c) => c,
            other => panic!("frame closure is {}", other.type_name()),
        }
    }

    pub(crate) fn frame_function(&self, frame: &CallFrame) -> &crate::object::Function {
        let closure = self.closure_of(frame);
        match self.heap.get(closure.function) {
            HeapData::Function(f) => f,
            other => panic!("closure function is {}", other.type_name()),
        }
    }

    fn fetch_byte(&mut self) -> u8 {
        let frame = *self.frame();
        let byte = self.frame_function(&frame).chunk.code()[frame.ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn fetch_u16(&mut self) -> u16 {
        let hi = self.fetch_byte();
        let lo = self.fetch_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn fetch_u24(&mut self) -> usize {
        let a = self.fetch_byte();
        let b = self.fetch_byte();
        let c = self.fetch_byte();
        usize::from(a) << 16 | usize::from(b) << 8 | usize::from(c)
    }

    pub(crate) fn constant(&self, index: usize) -> Value {
        let frame = self.frame();
        self.frame_function(frame).chunk.constants()[index]
    }

    /// Interned name string referenced by a name-constant operand.
    pub(crate) fn constant_name(&self, index: usize) -> HeapId {
        match self.constant(index) {
            Value::Ref(id) => id,
            other => panic!("name constant is not a string: {other:?}"),
        }
    }

    // ---- globals ----

    fn globals_id(&self) -> HeapId {
        let frame = self.frame();
        self.closure_of(frame).globals
    }

    fn module_fields(&self, module: HeapId) -> &AttrTable {
        match self.heap.get(module) {
            HeapData::Instance(i) => &i.fields,
            other => panic!("module is {}", other.type_name()),
        }
    }

    fn module_fields_mut(&mut self, module: HeapId) -> &mut AttrTable {
        match self.heap.get_mut(module) {
            HeapData::Instance(i) => &mut i.fields,
            other => panic!("module is {}", other.type_name()),
        }
    }

    fn get_global(&mut self, name: HeapId) -> RunResult<Value> {
        let globals = self.globals_id();
        if let Some(&v) = self.module_fields(globals).get(&name) {
            return Ok(v);
        }
        if let Some(&v) = self.module_fields(self.builtins_module).get(&name) {
            return Ok(v);
        }
        Err(ExcType::name_error(format!(
            "name '{}' is not defined",
            self.heap.str_value(name)
        )))
    }

    // ---- upvalues ----

    /// Finds or creates an open upvalue for an absolute stack slot. The
    /// open list stays sorted by slot, highest first.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.open_upvalues.len();
        for (i, &id) in self.open_upvalues.iter().enumerate() {
            let HeapData::Upvalue(Upvalue::Open(existing)) = self.heap.get(id) else {
                continue;
            };
            if *existing == slot {
                return id;
            }
            if *existing < slot {
                insert_at = i;
                break;
            }
        }
        let id = self.heap.allocate(HeapData::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, id);
        id
    }

    /// Closes every open upvalue at or above `from_slot`, copying the live
    /// stack value into the upvalue object.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&id) = self.open_upvalues.first() {
            let slot = match self.heap.get(id) {
                HeapData::Upvalue(Upvalue::Open(slot)) => *slot,
                _ => break,
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            *self.heap.get_mut(id) = HeapData::Upvalue(Upvalue::Closed(value));
            self.open_upvalues.remove(0);
        }
    }

    fn upvalue_get(&self, index: usize) -> Value {
        let frame = self.frame();
        let id = self.closure_of(frame).upvalues[index];
        match self.heap.get(id) {
            HeapData::Upvalue(Upvalue::Open(slot)) => self.stack[*slot],
            HeapData::Upvalue(Upvalue::Closed(v)) => *v,
            other => panic!("upvalue is {}", other.type_name()),
        }
    }

    fn upvalue_set(&mut self, index: usize, value: Value) {
        let frame = self.frame();
        let id = self.closure_of(frame).upvalues[index];
        match self.heap.get(id) {
            HeapData::Upvalue(Upvalue::Open(slot)) => {
                let slot = *slot;
                self.stack[slot] = value;
            }
            HeapData::Upvalue(Upvalue::Closed(_)) => {
                *self.heap.get_mut(id) = HeapData::Upvalue(Upvalue::Closed(value));
            }
            other => panic!("upvalue is {}", other.type_name()),
        }
    }

    // ---- garbage collection ----

    /// Marks every root the VM holds and sweeps the heap.
    pub fn collect_garbage(&mut self) {
        self.heap.begin_mark();
        for i in 0..self.stack.len() {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for i in 0..self.frames.len() {
            let frame = self.frames[i];
            self.heap.mark_object(frame.closure);
            if let Some(r#gen) = frame.generator {
                self.heap.mark_object(r#gen);
            }
        }
        for i in 0..self.open_upvalues.len() {
            let id = self.open_upvalues[i];
            self.heap.mark_object(id);
        }
        let module_entries: Vec<(HeapId, Value)> = self.modules.iter().map(|(&k, &v)| (k, v)).collect();
        for (name, value) in module_entries {
            self.heap.mark_object(name);
            self.heap.mark_value(value);
        }
        self.heap.mark_object(self.builtins_module);
        self.heap.mark_object(self.module_paths_list);
        for i in 0..self.protected.len() {
            let v = self.protected[i];
            self.heap.mark_value(v);
        }
        self.heap.trace_references();
        self.heap.sweep();
    }

    // ---- public API ----

    /// Compiles `source` without running it, returning the module-body
    /// function.
    pub fn compile(&mut self, source: &str, filename: &str) -> Result<HeapId, Exception> {
        Compiler::compile(&mut self.heap, source, filename).map_err(|e| Exception {
            exc_type: ExcType::SyntaxError.name().to_owned(),
            message: format!("{} (line {}, column {})", e.message, e.line, e.col),
            traceback: Vec::new(),
        })
    }

    /// Compiles and executes `source` as the `__main__` module, returning
    /// the module body's result value.
    pub fn interpret(&mut self, source: &str, filename: &str) -> Result<Value, Exception> {
        let func = self.compile(source, filename)?;
        let main_name = self.heap.intern_string("__main__");
        let module = self.new_module_instance(main_name);
        self.modules.insert(main_name, Value::Ref(module));
        self.run_function(func, module).map_err(|err| self.render_error(&err))
    }

    /// Runs a compiled module-body function inside the given module
    /// namespace.
    pub(crate) fn run_function(&mut self, func: HeapId, module: HeapId) -> RunResult<Value> {
        let closure = self.heap.allocate(HeapData::Closure(Closure {
            function: func,
            upvalues: Vec::new(),
            globals: module,
        }));
        self.push(Value::Ref(closure));
        let floor = self.frames.len();
        match self.op_call(0)? {
            Some(value) => Ok(value),
            None => match self.run_until(floor)? {
                StepExit::Return(value) => {
                    self.pop();
                    Ok(value)
                }
                StepExit::Yield(_) => Err(RunError::internal("module body yielded")),
            },
        }
    }

    /// Creates a fresh module instance with `__name__` set.
    pub(crate) fn new_module_instance(&mut self, name: HeapId) -> HeapId {
        let mut instance = Instance::new(self.base.module);
        let name_key = self.heap.intern_string("__name__");
        instance.fields.insert(name_key, Value::Ref(name));
        self.heap.allocate(HeapData::Instance(instance))
    }

    // ---- object creation (embedding API) ----

    /// Interns a string, returning the canonical string object.
    pub fn copy_string(&mut self, text: &str) -> Value {
        Value::Ref(self.heap.intern_string(text))
    }

    /// Interns an owned string, returning the canonical string object.
    pub fn take_string(&mut self, text: String) -> Value {
        Value::Ref(self.heap.take_string(text))
    }

    /// Allocates a tuple from the given items.
    pub fn new_tuple(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(self.heap.allocate(HeapData::Tuple(crate::object::Tuple::new(items))))
    }

    /// Allocates a bytes object.
    pub fn new_bytes(&mut self, data: Vec<u8>) -> Value {
        Value::Ref(self.heap.allocate(HeapData::Bytes(crate::object::Bytes::new(data))))
    }

    /// Allocates a bare instance of a class without running `__init__`.
    pub fn new_instance(&mut self, class: HeapId) -> Value {
        Value::Ref(self.heap.allocate(HeapData::Instance(Instance::new(class))))
    }

    /// Calls the value beneath `argc` arguments already pushed on the
    /// stack, running it to completion.
    pub fn call_value(&mut self, argc: usize) -> Result<Value, Exception> {
        match self.call_top(argc) {
            Ok(v) => Ok(v),
            Err(err) => Err(self.render_error(&err)),
        }
    }

    fn call_top(&mut self, argc: usize) -> RunResult<Value> {
        let floor = self.frames.len();
        match self.op_call(argc)? {
            Some(value) => Ok(value),
            None => match self.run_until(floor)? {
                StepExit::Return(value) => {
                    self.pop();
                    Ok(value)
                }
                StepExit::Yield(_) => Err(RunError::internal("call yielded outside a generator")),
            },
        }
    }

    // ---- dispatch ----

    /// Dispatches instructions until the frame stack returns to `floor`.
    pub(crate) fn run_until(&mut self, floor: usize) -> RunResult<StepExit> {
        /// Routes a helper's error into the unwinder; execution continues
        /// if a handler was found.
        macro_rules! vm_try {
            ($self:expr, $e:expr) => {
                if let Err(err) = $e {
                    $self.handle_exception(err, floor)?;
                    continue;
                }
            };
        }

        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            let op_byte = self.fetch_byte();
            let op = Opcode::from_repr(op_byte)
                .ok_or_else(|| RunError::internal(format!("invalid opcode {op_byte:#04x}")))?;
            if self.tracer.enabled() {
                let ip = self.frame().ip - 1;
                self.tracer.on_instruction(ip, op);
            }
            match op {
                Opcode::Return => {
                    let exited = self.op_return(floor);
                    match exited {
                        Ok(Some(exit)) => return Ok(exit),
                        Ok(None) => {}
                        Err(err) => {
                            self.handle_exception(err, floor)?;
                        }
                    }
                }
                Opcode::Yield => {
                    let value = self.pop();
                    return self.op_yield(value, floor);
                }
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Swap => {
                    let top = self.stack.len();
                    self.stack.swap(top - 1, top - 2);
                }
                Opcode::Dup => {
                    let depth = usize::from(self.fetch_byte());
                    self.push(self.peek(depth));
                }
                Opcode::LoadNone => self.push(Value::None),
                Opcode::LoadTrue => self.push(Value::Bool(true)),
                Opcode::LoadFalse => self.push(Value::Bool(false)),
                Opcode::Constant => {
                    let index = usize::from(self.fetch_byte());
                    self.push(self.constant(index));
                }
                Opcode::ConstantLong => {
                    let index = self.fetch_u24();
                    self.push(self.constant(index));
                }
                Opcode::GetLocal => {
                    let slot = usize::from(self.fetch_byte());
                    let base = self.frame().slots;
                    self.push(self.stack[base + slot]);
                }
                Opcode::GetLocalLong => {
                    let slot = self.fetch_u24();
                    let base = self.frame().slots;
                    self.push(self.stack[base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = usize::from(self.fetch_byte());
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                Opcode::SetLocalLong => {
                    let slot = self.fetch_u24();
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                Opcode::GetUpvalue => {
                    let index = usize::from(self.fetch_byte());
                    self.push(self.upvalue_get(index));
                }
                Opcode::SetUpvalue => {
                    let index = usize::from(self.fetch_byte());
                    let value = self.peek(0);
                    self.upvalue_set(index, value);
                }
                Opcode::CloseUpvalue => {
                    let slot = self.stack.len() - 1;
                    self.close_upvalues(slot);
                    self.pop();
                }
                Opcode::GetGlobal | Opcode::GetGlobalLong => {
                    let index = if op == Opcode::GetGlobal {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    match self.get_global(name) {
                        Ok(v) => self.push(v),
                        Err(err) => {
                            self.handle_exception(err, floor)?;
                        }
                    }
                }
                Opcode::SetGlobal | Opcode::SetGlobalLong => {
                    let index = if op == Opcode::SetGlobal {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    let value = self.peek(0);
                    let globals = self.globals_id();
                    self.module_fields_mut(globals).insert(name, value);
                }
                Opcode::DefineGlobal | Opcode::DefineGlobalLong => {
                    let index = if op == Opcode::DefineGlobal {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    let value = self.pop();
                    let globals = self.globals_id();
                    self.module_fields_mut(globals).insert(name, value);
                }
                Opcode::DelGlobal | Opcode::DelGlobalLong => {
                    let index = if op == Opcode::DelGlobal {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    let globals = self.globals_id();
                    if self.module_fields_mut(globals).shift_remove(&name).is_none() {
                        let err = ExcType::name_error(format!(
                            "name '{}' is not defined",
                            self.heap.str_value(name)
                        ));
                        self.handle_exception(err, floor)?;
                    }
                }
                Opcode::GetProperty | Opcode::GetPropertyLong => {
                    let index = if op == Opcode::GetProperty {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    vm_try!(self, self.op_get_property(name));
                }
                Opcode::SetProperty | Opcode::SetPropertyLong => {
                    let index = if op == Opcode::SetProperty {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    vm_try!(self, self.op_set_property(name));
                }
                Opcode::DelProperty | Opcode::DelPropertyLong => {
                    let index = if op == Opcode::DelProperty {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    vm_try!(self, self.op_del_property(name));
                }
                Opcode::Equal => vm_try!(self, self.op_equal()),
                Opcode::Less => vm_try!(self, self.op_compare(Special::Lt)),
                Opcode::Greater => vm_try!(self, self.op_compare(Special::Gt)),
                Opcode::LessEqual => vm_try!(self, self.op_compare(Special::Le)),
                Opcode::GreaterEqual => vm_try!(self, self.op_compare(Special::Ge)),
                Opcode::Is => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.is_same(b)));
                }
                Opcode::In => vm_try!(self, self.op_contains()),
                Opcode::Not => {
                    let v = self.pop();
                    let truthy = v.is_truthy(&self.heap);
                    self.push(Value::Bool(!truthy));
                }
                Opcode::Negate => vm_try!(self, self.op_negate()),
                Opcode::BitNegate => vm_try!(self, self.op_bit_negate()),
                Opcode::Add => vm_try!(self, self.op_binary(Special::Add)),
                Opcode::Subtract => vm_try!(self, self.op_binary(Special::Sub)),
                Opcode::Multiply => vm_try!(self, self.op_binary(Special::Mul)),
                Opcode::Divide => vm_try!(self, self.op_binary(Special::Div)),
                Opcode::FloorDivide => vm_try!(self, self.op_binary(Special::FloorDiv)),
                Opcode::Modulo => vm_try!(self, self.op_binary(Special::Mod)),
                Opcode::Power => vm_try!(self, self.op_binary(Special::Pow)),
                Opcode::BitAnd => vm_try!(self, self.op_binary(Special::And)),
                Opcode::BitOr => vm_try!(self, self.op_binary(Special::Or)),
                Opcode::BitXor => vm_try!(self, self.op_binary(Special::Xor)),
                Opcode::ShiftLeft => vm_try!(self, self.op_binary(Special::Lshift)),
                Opcode::ShiftRight => vm_try!(self, self.op_binary(Special::Rshift)),
                Opcode::Inc => {
                    let delta = i64::from(self.fetch_byte().cast_signed());
                    vm_try!(self, self.op_inc(delta));
                }
                Opcode::GetItem => vm_try!(self, self.op_get_item()),
                Opcode::SetItem => vm_try!(self, self.op_set_item()),
                Opcode::DelItem => vm_try!(self, self.op_del_item()),
                Opcode::GetSlice => vm_try!(self, self.op_get_slice()),
                Opcode::SetSlice => vm_try!(self, self.op_set_slice()),
                Opcode::DelSlice => vm_try!(self, self.op_del_slice()),
                Opcode::InvokeIter => vm_try!(self, self.op_invoke_iter()),
                Opcode::Tuple => {
                    let count = usize::from(self.fetch_byte());
                    self.op_build_tuple(count);
                }
                Opcode::Unpack => {
                    let count = usize::from(self.fetch_byte());
                    vm_try!(self, self.op_unpack(count));
                }
                Opcode::BuildList => {
                    let count = usize::from(self.fetch_byte());
                    self.op_build_list(count);
                }
                Opcode::BuildDict => {
                    let count = usize::from(self.fetch_byte());
                    vm_try!(self, self.op_build_dict(count));
                }
                Opcode::BuildSet => {
                    let count = usize::from(self.fetch_byte());
                    vm_try!(self, self.op_build_set(count));
                }
                Opcode::ListAppend => {
                    let slot = usize::from(self.fetch_byte());
                    self.op_list_append(slot);
                }
                Opcode::SetAdd => {
                    let slot = usize::from(self.fetch_byte());
                    vm_try!(self, self.op_set_add(slot));
                }
                Opcode::DictSet => {
                    let slot = usize::from(self.fetch_byte());
                    vm_try!(self, self.op_dict_set(slot));
                }
                Opcode::Jump => {
                    let distance = usize::from(self.fetch_u16());
                    self.frame_mut().ip += distance;
                }
                Opcode::JumpIfFalse => {
                    let distance = usize::from(self.fetch_u16());
                    if !self.peek(0).is_truthy(&self.heap) {
                        self.frame_mut().ip += distance;
                    }
                }
                Opcode::JumpIfTrue => {
                    let distance = usize::from(self.fetch_u16());
                    if self.peek(0).is_truthy(&self.heap) {
                        self.frame_mut().ip += distance;
                    }
                }
                Opcode::Loop => {
                    let distance = usize::from(self.fetch_u16());
                    self.frame_mut().ip -= distance;
                }
                Opcode::Call => {
                    let argc = usize::from(self.fetch_byte());
                    let result = self.op_call(argc);
                    match result {
                        Ok(Some(value)) => self.push(value),
                        Ok(None) => {}
                        Err(err) => {
                            self.handle_exception(err, floor)?;
                        }
                    }
                }
                Opcode::Closure | Opcode::ClosureLong => {
                    let index = if op == Opcode::Closure {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    self.op_closure(index);
                }
                Opcode::ExpandArgs => {
                    let kind = self.fetch_byte();
                    let tag = match kind {
                        0 => kwargs::UNIT_POS,
                        1 => kwargs::UNIT_SEQ,
                        2 => kwargs::UNIT_MAP,
                        _ => kwargs::UNIT_NAMED,
                    };
                    self.push(Value::Kwargs(tag));
                }
                Opcode::Kwargs => {
                    let count = u32::from(self.fetch_byte());
                    self.push(Value::Kwargs(count));
                }
                Opcode::PushTry => {
                    let distance = usize::from(self.fetch_u16());
                    let target = self.frame().ip + distance;
                    self.push(Value::Handler(Handler {
                        kind: HandlerKind::Try,
                        target: u32::try_from(target).unwrap_or(u32::MAX),
                    }));
                }
                Opcode::PopTry => {
                    let top = self.stack.len() - 1;
                    debug_assert!(matches!(self.stack[top], Value::Handler(_)));
                    self.stack[top] = Value::None;
                }
                Opcode::PushWith => {
                    let distance = usize::from(self.fetch_u16());
                    let target = self.frame().ip + distance;
                    vm_try!(self, self.op_push_with(target));
                }
                Opcode::CleanupWith => vm_try!(self, self.op_cleanup_with()),
                Opcode::Raise => {
                    let value = self.pop();
                    let err = self.raise_value(value);
                    self.handle_exception(err, floor)?;
                }
                Opcode::FilterExcept => vm_try!(self, self.op_filter_except()),
                Opcode::BuildClass | Opcode::BuildClassLong => {
                    let index = if op == Opcode::BuildClass {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    self.op_build_class(name);
                }
                Opcode::Inherit => vm_try!(self, self.op_inherit()),
                Opcode::Finalize => {
                    let class = self.peek(0);
                    if let Value::Ref(id) = class {
                        self.finalize_class(id);
                    }
                }
                Opcode::Method | Opcode::MethodLong => {
                    let index = if op == Opcode::Method {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    vm_try!(self, self.op_method(name));
                }
                Opcode::ClassProperty | Opcode::ClassPropertyLong => {
                    let index = if op == Opcode::ClassProperty {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    vm_try!(self, self.op_class_property(name));
                }
                Opcode::CreateProperty | Opcode::CreatePropertyLong => {
                    let index = if op == Opcode::CreateProperty {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    vm_try!(self, self.op_create_property(name));
                }
                Opcode::Docstring => {
                    let value = self.pop();
                    let frame = *self.frame();
                    let func_id = self.closure_of(&frame).function;
                    if let HeapData::Function(f) = self.heap.get_mut(func_id) {
                        f.docstring = value;
                    }
                }
                Opcode::Import | Opcode::ImportLong => {
                    let index = if op == Opcode::Import {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    let dotted = self.heap.str_value(name).to_owned();
                    let result = modules::import_module(self, &dotted);
                    match result {
                        Ok(v) => self.push(v),
                        Err(err) => {
                            self.handle_exception(err, floor)?;
                        }
                    }
                }
                Opcode::ImportFrom | Opcode::ImportFromLong => {
                    let index = if op == Opcode::ImportFrom {
                        usize::from(self.fetch_byte())
                    } else {
                        self.fetch_u24()
                    };
                    let name = self.constant_name(index);
                    vm_try!(self, self.op_import_from(name));
                }
            }
        }
    }

    fn op_return(&mut self, floor: usize) -> RunResult<Option<StepExit>> {
        let result = self.pop();
        self.protect(result);
        let exit_result = self.run_with_exits_for_return();
        self.unprotect();
        exit_result?;

        let frame = self.frames.pop().expect("return without a frame");
        self.close_upvalues(frame.slots);
        if let Some(gen_id) = frame.generator {
            self.stack.truncate(frame.slots);
            if let HeapData::Generator(r#gen) = self.heap.get_mut(gen_id) {
                r#gen.state = GeneratorState::Finished;
                r#gen.result = result;
            }
            debug_assert_eq!(self.frames.len(), floor);
            return Ok(Some(StepExit::Return(result)));
        }
        self.stack.truncate(frame.slots);
        self.push(result);
        if self.frames.len() == floor {
            return Ok(Some(StepExit::Return(result)));
        }
        Ok(None)
    }

    /// Invokes `__exit__(None, None, None)` for every live `with` handler
    /// in the returning frame, innermost first.
    fn run_with_exits_for_return(&mut self) -> RunResult<()> {
        let slots = self.frame().slots;
        let mut idx = self.stack.len();
        while idx > slots {
            idx -= 1;
            if let Value::Handler(h) = self.stack[idx]
                && h.kind == HandlerKind::With
            {
                let manager = self.stack[idx - 1];
                self.call_special(manager, Special::Exit, &[Value::None, Value::None, Value::None])?;
                // Deactivate so unwinding cannot run it twice.
                self.stack[idx] = Value::None;
                idx -= 1;
            }
        }
        Ok(())
    }

    fn op_yield(&mut self, value: Value, floor: usize) -> RunResult<StepExit> {
        let frame = self.frames.pop().expect("yield without a frame");
        let Some(gen_id) = frame.generator else {
            return Err(RunError::internal("yield outside a generator frame"));
        };
        let saved = self.stack.split_off(frame.slots);
        if let HeapData::Generator(r#gen) = self.heap.get_mut(gen_id) {
            r#gen.stack = saved;
            r#gen.ip = frame.ip;
            r#gen.state = GeneratorState::Suspended;
        }
        debug_assert_eq!(self.frames.len(), floor);
        Ok(StepExit::Yield(value))
    }

    fn op_closure(&mut self, index: usize) {
        let Value::Ref(func_id) = self.constant(index) else {
            panic!("closure constant is not a function");
        };
        let upvalue_count = match self.heap.get(func_id) {
            HeapData::Function(f) => f.upvalue_count,
            other => panic!("closure constant is {}", other.type_name()),
        };
        let frame = *self.frame();
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let flag = self.fetch_byte();
            let index = if flag & 0x80 == 0 {
                usize::from(self.fetch_byte())
            } else {
                self.fetch_u24()
            };
            if flag & 1 == 1 {
                upvalues.push(self.capture_upvalue(frame.slots + index));
            } else {
                let parent = self.closure_of(&frame);
                upvalues.push(parent.upvalues[index]);
            }
        }
        let globals = self.closure_of(&frame).globals;
        let closure = self.heap.allocate(HeapData::Closure(Closure {
            function: func_id,
            upvalues,
            globals,
        }));
        self.push(Value::Ref(closure));
    }
}

impl BaseClasses {
    /// Allocates the builtin class skeletons; methods and finalization
    /// happen in `builtins::boot`.
    fn bootstrap(heap: &mut Heap) -> Self {
        let mut make = |heap: &mut Heap, name: &str, base: Option<HeapId>| {
            let name_id = heap.intern_string(name);
            heap.make_immortal(name_id);
            let id = heap.allocate(HeapData::Class(crate::object::Class::new(name_id, base)));
            heap.make_immortal(id);
            id
        };
        let object = make(heap, "object", None);
        let type_ = make(heap, "type", Some(object));
        Self {
            object,
            type_,
            str_: make(heap, "str", Some(object)),
            int: make(heap, "int", Some(object)),
            float: make(heap, "float", Some(object)),
            bool_: make(heap, "bool", Some(object)),
            none: make(heap, "NoneType", Some(object)),
            tuple: make(heap, "tuple", Some(object)),
            list: make(heap, "list", Some(object)),
            dict: make(heap, "dict", Some(object)),
            set: make(heap, "set", Some(object)),
            bytes: make(heap, "bytes", Some(object)),
            function: make(heap, "function", Some(object)),
            method: make(heap, "method", Some(object)),
            generator: make(heap, "generator", Some(object)),
            property_: make(heap, "property", Some(object)),
            module: make(heap, "module", Some(object)),
            range: make(heap, "range", Some(object)),
            seq_iterator: make(heap, "iterator", Some(object)),
            range_iterator: make(heap, "rangeiterator", Some(object)),
        }
    }
}

// Exception-class lookup used across the vm submodules.
impl Vm {
    pub(crate) fn exc_class(&self, exc_type: ExcType) -> HeapId {
        self.exc_classes[exc_type as usize]
    }

    /// Maps a class back to the builtin exception type it descends from.
    pub(crate) fn exc_type_of_class(&self, mut class: HeapId) -> Option<ExcType> {
        loop {
            for exc_type in ExcType::iter() {
                if self.exc_classes.get(exc_type as usize) == Some(&class) {
                    return Some(exc_type);
                }
            }
            match self.heap.get(class) {
                HeapData::Class(c) => match c.base {
                    Some(base) => class = base,
                    None => return None,
                },
                _ => return None,
            }
        }
    }
}
