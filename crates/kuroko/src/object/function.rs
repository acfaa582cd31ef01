//! Compiled functions, closures, upvalues, generators, and native callables.

use crate::{
    chunk::Chunk,
    exception::RunResult,
    heap::HeapId,
    value::Value,
};

/// Behavioral flags detected by the compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionFlags {
    /// Has a trailing `*args` collector parameter.
    pub collects_args: bool,
    /// Has a trailing `**kwargs` collector parameter.
    pub collects_kwargs: bool,
    /// Body contains `yield`; calls construct a [`Generator`].
    pub is_generator: bool,
    /// Compiled as `__init__`; `return` yields the receiver.
    pub is_init: bool,
}

/// Debug record mapping a local slot to its name and live bytecode range.
#[derive(Debug, Clone, Copy)]
pub struct LocalDebug {
    pub slot: u32,
    /// Interned name string.
    pub name: HeapId,
    /// Bytecode offset where the slot becomes live.
    pub birth: u32,
    /// Bytecode offset where the slot dies (end of chunk if never closed).
    pub death: u32,
}

/// A compiled function: bytecode plus signature metadata.
///
/// Parameter slots at call time are laid out as
/// `[callee, required..., keyword..., *args?, **kwargs?]` with the callee
/// itself occupying local slot 0.
#[derive(Debug)]
pub struct Function {
    /// Interned function name.
    pub name: HeapId,
    pub chunk: Chunk,
    /// Names of required positional parameters, in order.
    pub required_args: Vec<HeapId>,
    /// Names of keyword parameters; their defaults are compiled inline as a
    /// prologue testing each slot against the unset sentinel.
    pub keyword_args: Vec<HeapId>,
    pub flags: FunctionFlags,
    pub upvalue_count: usize,
    /// Docstring value (`None` when absent).
    pub docstring: Value,
    /// Local-name debug table for disassembly and error messages.
    pub locals_debug: Vec<LocalDebug>,
}

impl Function {
    /// Total parameter slots bound at call time, including collectors and
    /// the callee slot.
    #[must_use]
    pub fn local_param_slots(&self) -> usize {
        1 + self.required_args.len()
            + self.keyword_args.len()
            + usize::from(self.flags.collects_args)
            + usize::from(self.flags.collects_kwargs)
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.chunk.estimate_size()
            + self.locals_debug.len() * std::mem::size_of::<LocalDebug>()
    }
}

/// A function paired with its captured upvalues and owning module namespace.
#[derive(Debug)]
pub struct Closure {
    /// Heap id of the [`Function`].
    pub function: HeapId,
    /// Heap ids of [`Upvalue`] objects, in descriptor order.
    pub upvalues: Vec<HeapId>,
    /// Module instance whose field table serves as the global namespace.
    pub globals: HeapId,
}

/// A captured variable: open while its stack slot is live, closed after.
#[derive(Debug)]
pub enum Upvalue {
    /// Absolute index into the thread's value stack.
    Open(usize),
    Closed(Value),
}

/// Execution state of a generator object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created, never resumed; the saved stack holds the bound arguments.
    Ready,
    /// Suspended at a `yield`.
    Suspended,
    /// Currently executing (re-entry raises).
    Running,
    /// Completed; further calls return the generator itself.
    Finished,
}

/// A suspendable function invocation: a saved stack slice plus an
/// instruction pointer.
#[derive(Debug)]
pub struct Generator {
    pub closure: HeapId,
    pub state: GeneratorState,
    /// Saved instruction pointer (byte offset into the function's chunk).
    pub ip: usize,
    /// Saved stack slice: locals plus operand stack at the suspension point.
    pub stack: Vec<Value>,
    /// Value of a `return` executed inside the body, surfaced through
    /// `StopIteration`.
    pub result: Value,
}

impl Generator {
    #[must_use]
    pub fn new(closure: HeapId, bound_args: Vec<Value>) -> Self {
        Self {
            closure,
            state: GeneratorState::Ready,
            ip: 0,
            stack: bound_args,
            result: Value::None,
        }
    }

    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.stack.capacity() * std::mem::size_of::<Value>()
    }
}

/// Signature shared by all native (host) functions.
///
/// `args` are the positional arguments (with the receiver first for bound
/// methods); `kwargs` carries interned-name/value pairs. Natives that
/// allocate multiple objects must keep intermediate values reachable via the
/// VM stack, since allocation is a GC safe point.
pub type NativeFn = fn(&mut crate::vm::Vm, args: &[Value], kwargs: &[(HeapId, Value)]) -> RunResult<Value>;

/// A host function exposed to the language.
pub struct Native {
    pub name: &'static str,
    pub doc: &'static str,
    pub func: NativeFn,
    /// Bound through instances like a method (receiver prepended).
    pub is_method: bool,
}

impl std::fmt::Debug for Native {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Native")
            .field("name", &self.name)
            .field("is_method", &self.is_method)
            .finish_non_exhaustive()
    }
}
