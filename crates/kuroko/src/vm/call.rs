//! Call dispatch: closures, natives, bound methods, classes, generators,
//! and the complex-argument assembler.

use smallvec::SmallVec;

use super::{CallFrame, StepExit, Vm};
use crate::{
    exception::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    object::{Dict, Generator, GeneratorState, Instance, List, Special},
    value::{Value, kwargs},
};

/// Positional arguments collected for a call.
type PosArgs = SmallVec<[Value; 8]>;
/// Keyword arguments: interned name id plus value.
type KwArgs = SmallVec<[(HeapId, Value); 4]>;

impl Vm {
    /// Calls the value sitting beneath `argc` argument stack slots.
    ///
    /// Returns `Ok(None)` when a frame was pushed (the dispatch loop
    /// continues into it) and `Ok(Some(value))` when the call completed
    /// immediately (natives, generators constructed, builtin type
    /// constructors); the caller pushes the value. In both cases the
    /// callee and argument slots have been consumed.
    pub(crate) fn op_call(&mut self, argc: usize) -> RunResult<Option<Value>> {
        // Any transient roots taken during the call (natives, builtin
        // constructors, iterable collection) end with it.
        let protected_floor = self.protected.len();
        let result = (|| {
            let (pos, kw) = self.collect_args(argc)?;
            let callee_pos = self.stack.len() - 1;
            let callee = self.stack[callee_pos];
            self.dispatch_call(callee, callee_pos, pos, kw)
        })();
        self.protected.truncate(protected_floor);
        result
    }

    /// Pops the argument window. The simple form pops `argc` values; if the
    /// top of the window is a unit-count marker the complex assembler walks
    /// the tagged units in reverse.
    fn collect_args(&mut self, argc: usize) -> RunResult<(PosArgs, KwArgs)> {
        let mut pos = PosArgs::new();
        let mut kw = KwArgs::new();
        if argc == 0 {
            return Ok((pos, kw));
        }
        if let Value::Kwargs(units) = self.peek(0)
            && units <= kwargs::MAX_COUNT
        {
            self.pop();
            // Units are popped last-first; collect then reverse.
            enum Unit {
                Pos(Value),
                Seq(Value),
                Map(Value),
                Named(HeapId, Value),
            }
            let mut collected: SmallVec<[Unit; 8]> = SmallVec::new();
            for _ in 0..units {
                let Value::Kwargs(tag) = self.pop() else {
                    return Err(RunError::internal("malformed argument unit tag"));
                };
                match tag {
                    kwargs::UNIT_POS => collected.push(Unit::Pos(self.pop())),
                    kwargs::UNIT_SEQ => collected.push(Unit::Seq(self.pop())),
                    kwargs::UNIT_MAP => collected.push(Unit::Map(self.pop())),
                    kwargs::UNIT_NAMED => {
                        let value = self.pop();
                        let Value::Ref(name) = self.pop() else {
                            return Err(RunError::internal("keyword name is not a string"));
                        };
                        collected.push(Unit::Named(name, value));
                    }
                    _ => return Err(RunError::internal("unknown argument unit tag")),
                }
            }
            for unit in collected.into_iter().rev() {
                match unit {
                    Unit::Pos(v) => pos.push(v),
                    Unit::Seq(v) => match v {
                        Value::Ref(id) => match self.heap.get(id) {
                            HeapData::List(l) => pos.extend(l.items.iter().copied()),
                            HeapData::Tuple(t) => pos.extend(t.items.iter().copied()),
                            other => {
                                return Err(ExcType::type_error(format!(
                                    "argument after * must be a sequence, not {}",
                                    other.type_name()
                                )));
                            }
                        },
                        other => {
                            return Err(ExcType::type_error(format!(
                                "argument after * must be a sequence, not {}",
                                other.type_name(&self.heap)
                            )));
                        }
                    },
                    Unit::Map(v) => {
                        let Value::Ref(id) = v else {
                            return Err(ExcType::type_error("argument after ** must be a mapping"));
                        };
                        let pairs: Vec<(Value, Value)> = match self.heap.get(id) {
                            HeapData::Dict(d) => d.iter().collect(),
                            other => {
                                return Err(ExcType::type_error(format!(
                                    "argument after ** must be a mapping, not {}",
                                    other.type_name()
                                )));
                            }
                        };
                        for (key, value) in pairs {
                            let Value::Ref(key_id) = key else {
                                return Err(ExcType::type_error("keywords must be strings"));
                            };
                            if !matches!(self.heap.get(key_id), HeapData::Str(_)) {
                                return Err(ExcType::type_error("keywords must be strings"));
                            }
                            push_kw(&mut kw, key_id, value, &self.heap)?;
                        }
                    }
                    Unit::Named(name, value) => push_kw(&mut kw, name, value, &self.heap)?,
                }
            }
        } else {
            let split = self.stack.len() - argc;
            pos.extend(self.stack.drain(split..));
        }
        Ok((pos, kw))
    }

    fn dispatch_call(
        &mut self,
        callee: Value,
        callee_pos: usize,
        mut pos: PosArgs,
        kw: KwArgs,
    ) -> RunResult<Option<Value>> {
        if self.frames.len() >= self.options.recursion_limit {
            return Err(RunError::exc(ExcType::Exception, "maximum recursion depth exceeded"));
        }
        let Value::Ref(callee_id) = callee else {
            return Err(ExcType::type_error(format!(
                "'{}' object is not callable",
                callee.type_name(&self.heap)
            )));
        };
        match self.heap.get(callee_id) {
            HeapData::Closure(_) => self.call_closure(callee_id, callee_pos, pos, kw),
            HeapData::Native(_) => self.call_native(callee_id, callee_pos, pos, kw),
            HeapData::BoundMethod(bm) => {
                let receiver = bm.receiver;
                let method = bm.method;
                pos.insert(0, receiver);
                self.stack[callee_pos] = method;
                self.dispatch_call(method, callee_pos, pos, kw)
            }
            HeapData::Generator(_) => {
                if !pos.is_empty() || !kw.is_empty() {
                    return Err(ExcType::type_error("generator takes no arguments"));
                }
                self.stack.truncate(callee_pos);
                let value = self.resume_generator(callee_id, Value::None)?;
                Ok(Some(value))
            }
            HeapData::Class(_) => self.call_class(callee_id, callee_pos, pos, kw),
            HeapData::Instance(instance) => {
                let class = instance.class;
                let Some(call) = self.class_slot(class, Special::Call) else {
                    return Err(ExcType::type_error(format!(
                        "'{}' object is not callable",
                        self.class_name(class)
                    )));
                };
                pos.insert(0, callee);
                self.stack[callee_pos] = call;
                self.dispatch_call(call, callee_pos, pos, kw)
            }
            other => Err(ExcType::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    /// Binds arguments to a closure's parameter slots and pushes a frame
    /// (or constructs a generator for generator functions).
    fn call_closure(
        &mut self,
        closure_id: HeapId,
        callee_pos: usize,
        pos: PosArgs,
        kw: KwArgs,
    ) -> RunResult<Option<Value>> {
        let func_id = match self.heap.get(closure_id) {
            HeapData::Closure(c) => c.function,
            _ => unreachable!("checked by dispatch"),
        };
        let slots = self.bind_args(func_id, Value::Ref(closure_id), pos, kw)?;
        let is_generator = match self.heap.get(func_id) {
            HeapData::Function(f) => f.flags.is_generator,
            _ => unreachable!("closure function is a function"),
        };
        self.stack.truncate(callee_pos);
        if is_generator {
            let generator = self.heap.allocate(HeapData::Generator(Generator::new(closure_id, slots)));
            return Ok(Some(Value::Ref(generator)));
        }
        self.stack.extend(slots);
        self.frames.push(CallFrame {
            closure: closure_id,
            ip: 0,
            slots: callee_pos,
            generator: None,
        });
        self.trace_call(closure_id);
        Ok(None)
    }

    /// Produces the bound local-slot vector for a call:
    /// `[callee, required..., keyword..., *args?, **kwargs?]`. Unsupplied
    /// keyword parameters receive the unset sentinel; the compiled prologue
    /// evaluates their defaults.
    fn bind_args(&mut self, func_id: HeapId, callee: Value, pos: PosArgs, kw: KwArgs) -> RunResult<Vec<Value>> {
        let (required, keyword, collects_args, collects_kwargs, name_id) = match self.heap.get(func_id) {
            HeapData::Function(f) => (
                f.required_args.clone(),
                f.keyword_args.clone(),
                f.flags.collects_args,
                f.flags.collects_kwargs,
                f.name,
            ),
            other => return Err(RunError::internal(format!("binding args to {}", other.type_name()))),
        };
        let func_name = self.heap.str_value(name_id).to_owned();
        let named_count = required.len() + keyword.len();

        let mut filled: Vec<Option<Value>> = vec![None; named_count];
        let mut extra_pos: Vec<Value> = Vec::new();
        for (i, value) in pos.into_iter().enumerate() {
            if i < named_count {
                filled[i] = Some(value);
            } else {
                extra_pos.push(value);
            }
        }
        let mut extra_kw: Vec<(HeapId, Value)> = Vec::new();
        for (name, value) in kw {
            let index = required
                .iter()
                .chain(keyword.iter())
                .position(|&param| param == name);
            match index {
                Some(i) => {
                    if filled[i].is_some() {
                        return Err(ExcType::type_error(format!(
                            "{func_name}() got multiple values for argument '{}'",
                            self.heap.str_value(name)
                        )));
                    }
                    filled[i] = Some(value);
                }
                None if collects_kwargs => extra_kw.push((name, value)),
                None => {
                    return Err(ExcType::type_error(format!(
                        "{func_name}() got an unexpected keyword argument '{}'",
                        self.heap.str_value(name)
                    )));
                }
            }
        }
        if !extra_pos.is_empty() && !collects_args {
            return Err(ExcType::argument_error(format!(
                "{func_name}() takes {} positional arguments but more were given",
                named_count
            )));
        }

        let mut slots = Vec::with_capacity(1 + named_count + 2);
        slots.push(callee);
        for (i, value) in filled.into_iter().enumerate() {
            match value {
                Some(v) => slots.push(v),
                None if i < required.len() => {
                    return Err(ExcType::argument_error(format!(
                        "{func_name}() missing required argument '{}'",
                        self.heap.str_value(required[i])
                    )));
                }
                None => slots.push(Value::Kwargs(kwargs::UNSET)),
            }
        }
        if collects_args {
            let list = self.heap.allocate(HeapData::List(List::new(extra_pos)));
            slots.push(Value::Ref(list));
        }
        if collects_kwargs {
            let mut dict = Dict::new();
            for (name, value) in extra_kw {
                dict.insert(&self.heap, Value::Ref(name), value)?;
            }
            let dict_id = self.heap.allocate(HeapData::Dict(dict));
            slots.push(Value::Ref(dict_id));
        }
        Ok(slots)
    }

    /// Invokes a native function. Arguments are protected for the duration
    /// so re-entrant allocation cannot collect them.
    fn call_native(
        &mut self,
        native_id: HeapId,
        callee_pos: usize,
        pos: PosArgs,
        kw: KwArgs,
    ) -> RunResult<Option<Value>> {
        let func = match self.heap.get(native_id) {
            HeapData::Native(n) => n.func,
            _ => unreachable!("checked by dispatch"),
        };
        self.stack.truncate(callee_pos);
        let protected_floor = self.protected.len();
        self.protected.extend(pos.iter().copied());
        self.protected.extend(kw.iter().map(|&(_, v)| v));
        let result = func(self, &pos, &kw);
        self.protected.truncate(protected_floor);
        result.map(Some)
    }

    /// Instantiates a class: builtin constructors are dispatched directly;
    /// user classes allocate an instance and run `__init__` (whose compiled
    /// form returns the receiver).
    fn call_class(
        &mut self,
        class_id: HeapId,
        callee_pos: usize,
        mut pos: PosArgs,
        kw: KwArgs,
    ) -> RunResult<Option<Value>> {
        if let Some(value) = self.construct_builtin(class_id, &pos, &kw)? {
            self.stack.truncate(callee_pos);
            return Ok(Some(value));
        }
        let instance = self.heap.allocate(HeapData::Instance(Instance::new(class_id)));
        match self.class_slot(class_id, Special::Init) {
            Some(init) => {
                pos.insert(0, Value::Ref(instance));
                self.stack[callee_pos] = init;
                self.dispatch_call(init, callee_pos, pos, kw)
            }
            None => {
                if !pos.is_empty() || !kw.is_empty() {
                    return Err(ExcType::argument_error(format!(
                        "{}() takes no arguments",
                        self.class_name(class_id)
                    )));
                }
                self.stack.truncate(callee_pos);
                Ok(Some(Value::Ref(instance)))
            }
        }
    }

    /// Calls `callable` with `args`, running any pushed frame to
    /// completion. Used for protocol invocations from inside the VM.
    pub(crate) fn call_value_and_run(&mut self, callable: Value, args: &[Value]) -> RunResult<Value> {
        self.push(callable);
        for &arg in args {
            self.push(arg);
        }
        let floor = self.frames.len();
        match self.op_call(args.len())? {
            Some(value) => Ok(value),
            None => match self.run_until(floor)? {
                StepExit::Return(value) => {
                    self.pop();
                    Ok(value)
                }
                StepExit::Yield(_) => Err(RunError::internal("protocol call yielded")),
            },
        }
    }

    /// Looks up `special` on the receiver's class and calls it with the
    /// receiver prepended.
    pub(crate) fn call_special(&mut self, receiver: Value, special: Special, args: &[Value]) -> RunResult<Value> {
        let class = self.class_of(receiver);
        let Some(method) = self.class_slot(class, special) else {
            return Err(ExcType::type_error(format!(
                "'{}' object has no {}",
                self.class_name(class),
                special.method_name()
            )));
        };
        let mut full: SmallVec<[Value; 4]> = SmallVec::new();
        full.push(receiver);
        full.extend_from_slice(args);
        self.call_value_and_run(method, &full)
    }

    /// Resumes a generator with a sent value, returning the yielded value
    /// or the generator itself once it is exhausted.
    pub(crate) fn resume_generator(&mut self, gen_id: HeapId, sent: Value) -> RunResult<Value> {
        let (state, closure, saved_ip) = match self.heap.get(gen_id) {
            HeapData::Generator(g) => (g.state, g.closure, g.ip),
            other => return Err(RunError::internal(format!("resuming {}", other.type_name()))),
        };
        match state {
            GeneratorState::Running => {
                return Err(ExcType::value_error("generator already executing"));
            }
            GeneratorState::Finished => return Ok(Value::Ref(gen_id)),
            GeneratorState::Ready => {
                if !matches!(sent, Value::None) {
                    return Err(ExcType::type_error(
                        "can't send non-None value to a just-started generator",
                    ));
                }
            }
            GeneratorState::Suspended => {}
        }

        let slots = self.stack.len();
        let saved = match self.heap.get_mut(gen_id) {
            HeapData::Generator(g) => {
                g.state = GeneratorState::Running;
                std::mem::take(&mut g.stack)
            }
            _ => unreachable!("checked above"),
        };
        self.stack.extend(saved);
        if state == GeneratorState::Suspended {
            // The sent value becomes the result of the suspended yield.
            self.push(sent);
        }
        self.frames.push(CallFrame {
            closure,
            ip: if state == GeneratorState::Ready { 0 } else { saved_ip },
            slots,
            generator: Some(gen_id),
        });
        self.trace_call(closure);
        let floor = self.frames.len() - 1;
        let exit = self.run_until(floor);
        match exit {
            Ok(StepExit::Yield(value)) => Ok(value),
            Ok(StepExit::Return(_)) => Ok(Value::Ref(gen_id)),
            Err(err) => {
                if let HeapData::Generator(g) = self.heap.get_mut(gen_id) {
                    g.state = GeneratorState::Finished;
                }
                Err(err)
            }
        }
    }

    fn trace_call(&mut self, closure: HeapId) {
        if !self.tracer.enabled() {
            return;
        }
        let event = self.build_call_event(closure);
        self.tracer.on_call(event);
    }

    fn build_call_event(&self, closure: HeapId) -> crate::tracer::CallEvent {
        let (callee_file, callee_func) = match self.heap.get(closure) {
            HeapData::Closure(c) => match self.heap.get(c.function) {
                HeapData::Function(f) => (f.chunk.filename().to_owned(), self.heap.str_value(f.name).to_owned()),
                _ => (String::new(), String::new()),
            },
            _ => (String::new(), String::new()),
        };
        // The caller is the frame beneath the newly pushed one.
        let (caller_file, caller_func, caller_line) = if self.frames.len() >= 2 {
            let frame = &self.frames[self.frames.len() - 2];
            let func = self.frame_function(frame);
            (
                func.chunk.filename().to_owned(),
                self.heap.str_value(func.name).to_owned(),
                func.chunk.line_for_offset(frame.ip.saturating_sub(1)),
            )
        } else {
            (String::new(), "<module>".to_owned(), 0)
        };
        crate::tracer::CallEvent {
            caller_file,
            caller_func,
            caller_line,
            callee_file,
            callee_func,
            callee_line: 1,
        }
    }
}

fn push_kw(kw: &mut KwArgs, name: HeapId, value: Value, heap: &crate::heap::Heap) -> RunResult<()> {
    if kw.iter().any(|&(existing, _)| existing == name) {
        return Err(ExcType::type_error(format!(
            "got multiple values for keyword argument '{}'",
            heap.str_value(name)
        )));
    }
    kw.push((name, value));
    Ok(())
}
