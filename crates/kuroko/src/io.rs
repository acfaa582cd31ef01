//! Output plumbing for `print` and tracebacks.
//!
//! Embedders choose where interpreter output goes by supplying a
//! [`PrintWriter`]; tests capture output with [`CollectStringPrint`].

use std::io::Write as _;

/// Sink for interpreter output.
///
/// Writes are infallible from the language's point of view; sinks that can
/// fail (a closed pipe) drop the output rather than surfacing an error into
/// script execution.
pub trait PrintWriter {
    /// Writes a fragment of output with no added separators or newline.
    fn write_str(&mut self, text: &str);
}

/// Default writer: line-buffered standard output.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_str(&mut self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        if text.ends_with('\n') {
            let _ = stdout.flush();
        }
    }
}

/// Captures all output into a shared string buffer.
///
/// The buffer handle stays usable after the VM takes ownership of the
/// writer, so tests read output after execution:
///
/// ```
/// use kuroko::{CollectStringPrint, Vm, VmOptions};
/// let (writer, handle) = CollectStringPrint::new();
/// let mut vm = Vm::with_io(VmOptions::default(), Box::new(writer), Box::new(kuroko::NoopTracer));
/// vm.interpret("print(1 + 2)\n", "demo.krk").unwrap();
/// assert_eq!(handle.take(), "3\n");
/// ```
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    buffer: std::rc::Rc<std::cell::RefCell<String>>,
}

/// Read side of a [`CollectStringPrint`].
#[derive(Debug, Clone, Default)]
pub struct CollectedOutput {
    buffer: std::rc::Rc<std::cell::RefCell<String>>,
}

impl CollectStringPrint {
    /// Creates the writer plus the handle used to read what was written.
    #[must_use]
    pub fn new() -> (Self, CollectedOutput) {
        let buffer = std::rc::Rc::new(std::cell::RefCell::new(String::new()));
        (
            Self { buffer: buffer.clone() },
            CollectedOutput { buffer },
        )
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_str(&mut self, text: &str) {
        self.buffer.borrow_mut().push_str(text);
    }
}

impl CollectedOutput {
    /// Returns and clears the captured output.
    #[must_use]
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.buffer.borrow_mut())
    }

    /// Returns the captured output without clearing it.
    #[must_use]
    pub fn snapshot(&self) -> String {
        self.buffer.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_string_print_accumulates() {
        let (mut writer, handle) = CollectStringPrint::new();
        writer.write_str("a");
        writer.write_str("b\n");
        assert_eq!(handle.snapshot(), "ab\n");
        assert_eq!(handle.take(), "ab\n");
        assert_eq!(handle.snapshot(), "");
    }
}
