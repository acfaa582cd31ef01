//! Error taxonomy and the result types threaded through the compiler and VM.
//!
//! Internally the VM works with [`RunError`]; embedders see the rendered
//! [`Exception`] with its traceback. Builtin raises stay lightweight
//! (`ExcType` + message) and are materialized into language-level exception
//! instances only when an `except` clause actually binds them.

use strum::{EnumIter, IntoStaticStr};

use crate::value::Value;

/// The builtin exception class hierarchy. Everything descends from
/// `Exception`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
pub enum ExcType {
    Exception,
    SyntaxError,
    TypeError,
    ValueError,
    NameError,
    AttributeError,
    IndexError,
    KeyError,
    ArgumentError,
    ImportError,
    NotImplementedError,
    ZeroDivisionError,
    OverflowError,
    StopIteration,
}

impl ExcType {
    /// Class name as it appears in tracebacks.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Direct base in the builtin hierarchy (`None` for the root).
    #[must_use]
    pub fn base(self) -> Option<Self> {
        match self {
            Self::Exception => None,
            _ => Some(Self::Exception),
        }
    }

    // Convenience constructors mirroring how natives raise.

    pub fn type_error(message: impl Into<String>) -> RunError {
        RunError::exc(Self::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> RunError {
        RunError::exc(Self::ValueError, message)
    }

    pub fn name_error(message: impl Into<String>) -> RunError {
        RunError::exc(Self::NameError, message)
    }

    pub fn attribute_error(message: impl Into<String>) -> RunError {
        RunError::exc(Self::AttributeError, message)
    }

    pub fn index_error(message: impl Into<String>) -> RunError {
        RunError::exc(Self::IndexError, message)
    }

    pub fn key_error(message: impl Into<String>) -> RunError {
        RunError::exc(Self::KeyError, message)
    }

    pub fn argument_error(message: impl Into<String>) -> RunError {
        RunError::exc(Self::ArgumentError, message)
    }

    pub fn import_error(message: impl Into<String>) -> RunError {
        RunError::exc(Self::ImportError, message)
    }

    pub fn zero_division(message: impl Into<String>) -> RunError {
        RunError::exc(Self::ZeroDivisionError, message)
    }

    pub fn overflow(message: impl Into<String>) -> RunError {
        RunError::exc(Self::OverflowError, message)
    }
}

/// One rendered traceback frame, innermost last.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TraceFrame {
    pub file: String,
    pub func: String,
    pub line: u32,
}

/// An in-flight exception, before materialization.
#[derive(Debug)]
pub struct ExcInfo {
    pub exc_type: ExcType,
    pub message: String,
    /// The raised instance for `raise <expr>` of a user-defined exception;
    /// `None` for lightweight builtin raises.
    pub value: Option<Value>,
    /// Carried payload: the `return` value of a finished generator for
    /// `StopIteration`.
    pub payload: Value,
    /// Frames collected while unwinding, innermost first.
    pub traceback: Vec<TraceFrame>,
}

/// Error channel for compilation-free execution paths.
#[derive(Debug)]
pub enum RunError {
    /// A language-level exception subject to `try`/`except`.
    Exc(ExcInfo),
    /// An interpreter bug or unrecoverable host failure; never catchable.
    Internal(String),
}

impl RunError {
    pub fn exc(exc_type: ExcType, message: impl Into<String>) -> Self {
        Self::Exc(ExcInfo {
            exc_type,
            message: message.into(),
            value: None,
            payload: Value::None,
            traceback: Vec::new(),
        })
    }

    /// `raise <instance>` of an already-materialized exception object.
    #[must_use]
    pub fn raised(exc_type: ExcType, value: Value) -> Self {
        Self::Exc(ExcInfo {
            exc_type,
            message: String::new(),
            value: Some(value),
            payload: Value::None,
            traceback: Vec::new(),
        })
    }

    /// `StopIteration` carrying a generator's return value.
    #[must_use]
    pub fn stop_iteration(payload: Value) -> Self {
        Self::Exc(ExcInfo {
            exc_type: ExcType::StopIteration,
            message: String::new(),
            value: None,
            payload,
            traceback: Vec::new(),
        })
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Result alias used by every fallible runtime operation.
pub type RunResult<T> = Result<T, RunError>;

/// A finished, rendered exception handed to embedders and the CLI.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Exception {
    /// Exception class name (`TypeError`, or a user class name).
    pub exc_type: String,
    pub message: String,
    /// Frames outermost first, the order tracebacks print in.
    pub traceback: Vec<TraceFrame>,
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.traceback.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for frame in &self.traceback {
                writeln!(f, "  File \"{}\", line {}, in {}", frame.file, frame.line, frame.func)?;
            }
        }
        if self.message.is_empty() {
            write!(f, "{}", self.exc_type)
        } else {
            write!(f, "{}: {}", self.exc_type, self.message)
        }
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_roots_at_exception() {
        assert_eq!(ExcType::Exception.base(), None);
        assert_eq!(ExcType::KeyError.base(), Some(ExcType::Exception));
        assert_eq!(ExcType::StopIteration.base(), Some(ExcType::Exception));
    }

    #[test]
    fn display_renders_traceback() {
        let exc = Exception {
            exc_type: "ValueError".to_owned(),
            message: "bad value".to_owned(),
            traceback: vec![TraceFrame {
                file: "demo.krk".to_owned(),
                func: "<module>".to_owned(),
                line: 3,
            }],
        };
        let rendered = exc.to_string();
        assert!(rendered.starts_with("Traceback (most recent call last):"));
        assert!(rendered.contains("File \"demo.krk\", line 3, in <module>"));
        assert!(rendered.ends_with("ValueError: bad value"));
    }
}
