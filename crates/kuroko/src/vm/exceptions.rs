//! Raising, unwinding, and rendering exceptions.
//!
//! An in-flight exception travels as a [`RunError`]. Unwinding scans each
//! frame's stack slice for [`Handler`] values: a `with` handler runs
//! `__exit__` (a truthy result suppresses the exception), a `try` handler
//! receives the materialized exception object at its own stack slot and
//! transfers control to its target.

use super::Vm;
use crate::{
    exception::{ExcInfo, ExcType, Exception, RunError, RunResult, TraceFrame},
    heap::{HeapData, HeapId},
    object::{GeneratorState, Instance, Special},
    value::{HandlerKind, Value},
};

impl Vm {
    /// Builds the error for a `raise` of an arbitrary value.
    pub(crate) fn raise_value(&mut self, value: Value) -> RunError {
        match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    let class = instance.class;
                    match self.exc_type_of_class(class) {
                        Some(exc_type) => RunError::raised(exc_type, value),
                        None => ExcType::type_error("exceptions must derive from Exception"),
                    }
                }
                HeapData::Class(_) => {
                    // `raise ValueError` without a call: instantiate first.
                    if self.exc_type_of_class(id).is_none() {
                        return ExcType::type_error("exceptions must derive from Exception");
                    }
                    self.push(value);
                    match self.op_call(0) {
                        Ok(Some(instance)) => self.raise_value(instance),
                        Ok(None) => RunError::internal("exception constructor pushed a frame"),
                        Err(err) => err,
                    }
                }
                _ => ExcType::type_error("exceptions must derive from Exception"),
            },
            _ => ExcType::type_error("exceptions must derive from Exception"),
        }
    }

    /// Unwinds until a handler takes the exception or the frame stack
    /// reaches `floor`, in which case the error propagates to the nested
    /// caller.
    pub(crate) fn handle_exception(&mut self, err: RunError, floor: usize) -> RunResult<()> {
        let RunError::Exc(mut info) = err else {
            return Err(err);
        };
        loop {
            if self.frames.len() <= floor {
                return Err(RunError::Exc(info));
            }
            let frame = *self.frame();
            let slots = frame.slots;
            let mut idx = self.stack.len();
            while idx > slots {
                idx -= 1;
                let Value::Handler(handler) = self.stack[idx] else {
                    continue;
                };
                match handler.kind {
                    HandlerKind::Try => {
                        let exc_value = self.materialize_exception(&mut info);
                        self.stack.truncate(idx);
                        self.push(exc_value);
                        self.frame_mut().ip = handler.target as usize;
                        return Ok(());
                    }
                    HandlerKind::With => {
                        let manager = self.stack[idx - 1];
                        // Drop operands above the handler, keep the manager.
                        self.stack.truncate(idx);
                        let exc_value = self.materialize_exception(&mut info);
                        self.protect(exc_value);
                        let exc_class = Value::Ref(self.class_of(exc_value));
                        let exit_result =
                            self.call_special(manager, Special::Exit, &[exc_class, exc_value, Value::None]);
                        self.unprotect();
                        match exit_result {
                            Ok(result) if result.is_truthy(&self.heap) => {
                                // Suppressed: discard the manager and resume
                                // at the continuation.
                                self.stack.truncate(idx - 1);
                                self.frame_mut().ip = handler.target as usize;
                                return Ok(());
                            }
                            Ok(_) => {
                                self.stack.truncate(idx - 1);
                                idx -= 1;
                            }
                            Err(RunError::Exc(new_info)) => {
                                // __exit__ raised: that exception wins.
                                self.stack.truncate(idx - 1);
                                idx -= 1;
                                info = new_info;
                            }
                            Err(other) => return Err(other),
                        }
                    }
                }
            }
            // No handler in this frame: record a traceback entry and pop.
            let func = self.frame_function(&frame);
            info.traceback.push(TraceFrame {
                file: func.chunk.filename().to_owned(),
                func: self.heap.str_value(func.name).to_owned(),
                line: func.chunk.line_for_offset(frame.ip.saturating_sub(1)),
            });
            if let Some(gen_id) = frame.generator
                && let HeapData::Generator(g) = self.heap.get_mut(gen_id)
            {
                g.state = GeneratorState::Finished;
            }
            self.close_upvalues(frame.slots);
            self.frames.pop();
            self.stack.truncate(frame.slots);
        }
    }

    /// Turns an in-flight exception into a language-level instance (once;
    /// repeated handlers observe the same object).
    pub(crate) fn materialize_exception(&mut self, info: &mut ExcInfo) -> Value {
        if let Some(value) = info.value {
            return value;
        }
        let class = self.exc_class(info.exc_type);
        let mut instance = Instance::new(class);
        let arg_key = self.heap.intern_string("arg");
        let arg_value = if info.message.is_empty() {
            Value::None
        } else {
            Value::Ref(self.heap.intern_string(&info.message))
        };
        instance.fields.insert(arg_key, arg_value);
        if info.exc_type == ExcType::StopIteration {
            let value_key = self.heap.intern_string("value");
            instance.fields.insert(value_key, info.payload);
        }
        if let Some(top) = info.traceback.first() {
            let line_key = self.heap.intern_string("lineno");
            instance.fields.insert(line_key, Value::Int(i64::from(top.line)));
            let file_key = self.heap.intern_string("file");
            let file_id = self.heap.intern_string(&top.file.clone());
            instance.fields.insert(file_key, Value::Ref(file_id));
            let func_key = self.heap.intern_string("func");
            let func_id = self.heap.intern_string(&top.func.clone());
            instance.fields.insert(func_key, Value::Ref(func_id));
        }
        let id = self.heap.allocate(HeapData::Instance(instance));
        info.value = Some(Value::Ref(id));
        Value::Ref(id)
    }

    /// Installs a `with` handler above the context manager and invokes
    /// `__enter__`. An exception inside `__enter__` is not routed to
    /// `__exit__`, so the handler is pushed only after it succeeds.
    pub(crate) fn op_push_with(&mut self, target: usize) -> RunResult<()> {
        let manager = self.peek(0);
        let class = self.class_of(manager);
        if self.class_slot(class, Special::Exit).is_none() {
            return Err(ExcType::type_error(format!(
                "'{}' object does not support the context manager protocol",
                manager.type_name(&self.heap)
            )));
        }
        let result = self.call_special(manager, Special::Enter, &[])?;
        self.push(Value::Handler(crate::value::Handler {
            kind: HandlerKind::With,
            target: u32::try_from(target).unwrap_or(u32::MAX),
        }));
        self.push(result);
        Ok(())
    }

    /// Normal `with` exit: calls `__exit__(None, None, None)` and pops the
    /// handler and manager.
    pub(crate) fn op_cleanup_with(&mut self) -> RunResult<()> {
        let handler = self.pop();
        debug_assert!(matches!(
            handler,
            Value::Handler(h) if h.kind == HandlerKind::With
        ) || matches!(handler, Value::None));
        let manager = self.peek(0);
        self.call_special(manager, Special::Exit, &[Value::None, Value::None, Value::None])?;
        self.pop();
        Ok(())
    }

    /// `except` clause filter: `[exc, class]` on the stack becomes a bool.
    pub(crate) fn op_filter_except(&mut self) -> RunResult<()> {
        let class = self.pop();
        let exc = self.pop();
        let Value::Ref(class_id) = class else {
            return Err(ExcType::type_error("except filter must be a class"));
        };
        if !matches!(self.heap.get(class_id), HeapData::Class(_)) {
            return Err(ExcType::type_error("except filter must be a class"));
        }
        self.push(Value::Bool(self.value_isinstance(exc, class_id)));
        Ok(())
    }

    /// Renders a terminal error for embedders, with the traceback in
    /// outermost-first order.
    pub(crate) fn render_error(&mut self, err: &RunError) -> Exception {
        match err {
            RunError::Exc(info) => {
                let (exc_type, message) = match info.value {
                    Some(value) => {
                        let class = self.class_of(value);
                        let name = self.class_name(class).to_owned();
                        let message = self.exception_message(value).unwrap_or_else(|| info.message.clone());
                        (name, message)
                    }
                    None => (info.exc_type.name().to_owned(), info.message.clone()),
                };
                let mut traceback = info.traceback.clone();
                traceback.reverse();
                Exception {
                    exc_type,
                    message,
                    traceback,
                }
            }
            RunError::Internal(message) => Exception {
                exc_type: "InternalError".to_owned(),
                message: message.clone(),
                traceback: Vec::new(),
            },
        }
    }

    /// Message payload of an exception instance (its `arg` field).
    fn exception_message(&mut self, value: Value) -> Option<String> {
        let Value::Ref(id) = value else { return None };
        if !matches!(self.heap.get(id), HeapData::Instance(_)) {
            return None;
        }
        let arg_key = self.heap.intern_string("arg");
        let arg = match self.heap.get(id) {
            HeapData::Instance(instance) => instance.fields.get(&arg_key).copied(),
            _ => None,
        }?;
        match arg {
            Value::None => None,
            _ => self.value_str(arg).ok(),
        }
    }
}
