#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked at the call sites")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional in hashing and encoding")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors the word-integer semantics")]
#![expect(clippy::module_name_repetitions, reason = "public type names stay self-describing")]
#![expect(clippy::must_use_candidate, reason = "builder-style accessors are used for effects too")]
#![expect(clippy::missing_panics_doc, reason = "internal invariants panic only on interpreter bugs")]
#![expect(clippy::return_self_not_must_use, reason = "fluent helpers are consumed immediately")]

mod builtins;
mod chunk;
mod compile;
mod exception;
mod heap;
mod io;
mod modules;
pub mod object;
mod op;
mod scan;
mod tracer;
mod value;
mod vm;

pub use crate::{
    chunk::{Chunk, LineEntry},
    compile::{CompileError, Compiler},
    exception::{ExcInfo, ExcType, Exception, RunError, RunResult, TraceFrame},
    heap::{Heap, HeapData, HeapId, HeapStats},
    io::{CollectStringPrint, CollectedOutput, PrintWriter, StdPrint},
    object::{NativeFn, Special},
    op::{Opcode, OperandKind},
    scan::{Scanner, Token, TokenKind},
    tracer::{CallEvent, CallTracer, NoopTracer, ProfilingReport, ProfilingTracer, StderrTracer, VmTracer},
    value::{Handler, HandlerKind, Value},
    vm::{Vm, VmOptions},
};
