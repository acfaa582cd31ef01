//! VM execution tracing.
//!
//! The dispatch loop consults a [`VmTracer`] at instruction and call
//! boundaries. [`NoopTracer`] reports itself disabled so the hot path skips
//! event construction entirely; [`CallTracer`] records the profiler's
//! space-separated trace-line format; [`ProfilingTracer`] keeps opcode
//! frequency counters that serialize to JSON.

use std::{collections::HashMap, time::Instant};

use crate::op::Opcode;

/// One call edge, as reported to tracers.
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub caller_file: String,
    pub caller_func: String,
    pub caller_line: u32,
    pub callee_file: String,
    pub callee_func: String,
    pub callee_line: u32,
}

/// Hook points for observing execution.
pub trait VmTracer {
    /// When false, the VM skips building events entirely.
    fn enabled(&self) -> bool {
        false
    }

    fn on_instruction(&mut self, _ip: usize, _op: Opcode) {}

    /// A frame was pushed for a closure or generator resume.
    fn on_call(&mut self, _event: CallEvent) {}

    /// Profiling summary, if this tracer collects one.
    fn profiling_report(&self) -> Option<ProfilingReport> {
        None
    }

    /// Drains accumulated trace-file output, if this tracer records any.
    fn take_trace_output(&mut self) -> Option<String> {
        None
    }
}

/// Zero-cost default tracer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Logs every call edge to stderr as it happens.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn enabled(&self) -> bool {
        true
    }

    fn on_call(&mut self, event: CallEvent) {
        eprintln!(
            "call {}:{} {} -> {}:{} {}",
            event.caller_file, event.caller_line, event.caller_func, event.callee_file, event.callee_line,
            event.callee_func
        );
    }
}

/// Records call edges in the trace-file format consumed by profiler
/// tooling: one line of
/// `callerFile callerFunc callerLine calleeFile calleeFunc calleeLine nanos`
/// per completed call.
#[derive(Debug, Default)]
pub struct CallTracer {
    lines: Vec<String>,
    in_flight: Vec<(CallEvent, Instant)>,
    /// Frame depth tracked from instruction Return opcodes.
    depth: usize,
}

impl CallTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed trace lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Drains the recorded lines into a single trace-file body.
    pub fn into_trace_file(mut self) -> String {
        // Close any edges still open (e.g. an uncaught exception).
        while let Some((event, started)) = self.in_flight.pop() {
            self.lines.push(render_line(&event, started.elapsed().as_nanos()));
        }
        let mut out = self.lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

fn render_line(event: &CallEvent, nanos: u128) -> String {
    format!(
        "{} {} {} {} {} {} {nanos}",
        event.caller_file, event.caller_func, event.caller_line, event.callee_file, event.callee_func,
        event.callee_line
    )
}

impl VmTracer for CallTracer {
    fn enabled(&self) -> bool {
        true
    }

    fn on_call(&mut self, event: CallEvent) {
        self.in_flight.push((event, Instant::now()));
        self.depth += 1;
    }

    fn on_instruction(&mut self, _ip: usize, op: Opcode) {
        if op == Opcode::Return && self.depth > 0 {
            self.depth -= 1;
            if let Some((event, started)) = self.in_flight.pop() {
                self.lines.push(render_line(&event, started.elapsed().as_nanos()));
            }
        }
    }

    fn take_trace_output(&mut self) -> Option<String> {
        let drained = std::mem::take(self);
        Some(drained.into_trace_file())
    }
}

/// Opcode frequency and call counters.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: HashMap<&'static str, u64>,
    instructions: u64,
    calls: u64,
}

/// Serializable profiling summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfilingReport {
    pub instructions: u64,
    pub calls: u64,
    pub opcode_counts: HashMap<&'static str, u64>,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        ProfilingReport {
            instructions: self.instructions,
            calls: self.calls,
            opcode_counts: self.opcode_counts.clone(),
        }
    }
}

impl VmTracer for ProfilingTracer {
    fn enabled(&self) -> bool {
        true
    }

    fn on_instruction(&mut self, _ip: usize, op: Opcode) {
        self.instructions += 1;
        *self.opcode_counts.entry(op.into()).or_insert(0) += 1;
    }

    fn on_call(&mut self, _event: CallEvent) {
        self.calls += 1;
    }

    fn profiling_report(&self) -> Option<ProfilingReport> {
        Some(self.report())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_tracer_renders_trace_lines() {
        let mut tracer = CallTracer::new();
        tracer.on_call(CallEvent {
            caller_file: "a.krk".to_owned(),
            caller_func: "<module>".to_owned(),
            caller_line: 1,
            callee_file: "a.krk".to_owned(),
            callee_func: "f".to_owned(),
            callee_line: 3,
        });
        tracer.on_instruction(0, Opcode::Return);
        let body = tracer.into_trace_file();
        let fields: Vec<&str> = body.split_whitespace().collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(&fields[..6], &["a.krk", "<module>", "1", "a.krk", "f", "3"]);
        assert!(fields[6].parse::<u128>().is_ok());
    }

    #[test]
    fn profiling_tracer_counts_opcodes() {
        let mut tracer = ProfilingTracer::new();
        tracer.on_instruction(0, Opcode::Add);
        tracer.on_instruction(1, Opcode::Add);
        tracer.on_instruction(2, Opcode::Pop);
        let report = tracer.report();
        assert_eq!(report.instructions, 3);
        assert_eq!(report.opcode_counts.get("ADD"), Some(&2));
    }
}
