//! Public error types for the two failure phases of `interpret`.
//!
//! Compile errors are accumulated by the parser (panic-mode suppression keeps
//! cascades down to one report per defect) and returned as a batch. Runtime
//! errors carry the message plus a stack trace walking the call frames
//! top-to-bottom. There is no user-visible exception mechanism in the
//! language; both kinds bubble out of `interpret` as [`InterpretError`].

use std::fmt;

/// Where in the source a compile error was anchored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    /// The error was reported at the end of input.
    Eof,
    /// The error was reported at a concrete lexeme.
    Lexeme(String),
    /// The error came from a scanner error token; there is no lexeme to show.
    Unknown,
}

/// A single compile-time diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// 1-based source line of the offending token.
    pub line: u32,
    /// Token context for the ` at '…'` clause of the rendered message.
    pub location: ErrorLocation,
    /// Human-readable description, e.g. `Expect ';' after value.`.
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            ErrorLocation::Eof => write!(f, " at end")?,
            ErrorLocation::Lexeme(lexeme) => write!(f, " at '{lexeme}'")?,
            ErrorLocation::Unknown => {}
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// One call-stack entry of a runtime error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Source line of the instruction that was executing in this frame.
    pub line: u32,
    /// Function name; `None` for the top-level script.
    pub function: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime failure: type mismatch, undefined name, arity mismatch,
/// stack overflow, out-of-bounds index, or a native reporting an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    /// Description of the failure, e.g. `Operands must be numbers.`.
    pub message: String,
    /// Call frames at the moment of the error, innermost first.
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Failure result of [`crate::Vm::interpret`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpretError {
    /// One or more compile-time diagnostics; nothing was executed.
    Compile(Vec<CompileError>),
    /// Execution started and failed; both VM stacks have been reset.
    Runtime(RuntimeError),
}

impl InterpretError {
    /// Conventional process exit code for this error kind.
    ///
    /// Compile errors map to 65 (`EX_DATAERR`), runtime errors to 70
    /// (`EX_SOFTWARE`), matching the CLI contract.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Compile(_) => 65,
            Self::Runtime(_) => 70,
        }
    }
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(errors) => {
                let mut first = true;
                for error in errors {
                    if !first {
                        writeln!(f)?;
                    }
                    first = false;
                    write!(f, "{error}")?;
                }
                Ok(())
            }
            Self::Runtime(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for InterpretError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_rendering() {
        let at_lexeme = CompileError {
            line: 3,
            location: ErrorLocation::Lexeme("}".to_string()),
            message: "Expect expression.".to_string(),
        };
        assert_eq!(at_lexeme.to_string(), "[line 3] Error at '}': Expect expression.");

        let at_end = CompileError {
            line: 7,
            location: ErrorLocation::Eof,
            message: "Expect ';' after value.".to_string(),
        };
        assert_eq!(at_end.to_string(), "[line 7] Error at end: Expect ';' after value.");

        let scanner_error = CompileError {
            line: 1,
            location: ErrorLocation::Unknown,
            message: "Unexpected character.".to_string(),
        };
        assert_eq!(scanner_error.to_string(), "[line 1] Error: Unexpected character.");
    }

    #[test]
    fn runtime_error_rendering_walks_frames() {
        let error = RuntimeError {
            message: "Operands must be numbers.".to_string(),
            trace: vec![
                TraceFrame {
                    line: 4,
                    function: Some("inner".to_string()),
                },
                TraceFrame { line: 9, function: None },
            ],
        };
        assert_eq!(
            error.to_string(),
            "Operands must be numbers.\n[line 4] in inner()\n[line 9] in script"
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(InterpretError::Compile(Vec::new()).exit_code(), 65);
        let runtime = InterpretError::Runtime(RuntimeError {
            message: String::new(),
            trace: Vec::new(),
        });
        assert_eq!(runtime.exit_code(), 70);
    }
}
