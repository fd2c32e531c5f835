//! Diagnostic types returned by [`crate::interpret`].
//!
//! Two kinds, matching the spec: compile-time errors (collected while
//! parsing; execution is never attempted) and a single runtime error (fatal
//! to the current `interpret` call, carrying a frame-by-frame trace).

use std::fmt;

/// One diagnostic produced during compilation.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error: {}", self.line, self.message)
    }
}

/// One line of a runtime stack trace: the function name (`None` for the
/// top-level script) and the source line active in that frame.
#[derive(Debug, Clone)]
pub struct TraceLine {
    pub function_name: Option<String>,
    pub line: u32,
}

impl fmt::Display for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function_name {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// The reason a `RuntimeError` was raised, independent of the stack trace
/// attached to it. Native functions return this directly; the VM wraps it
/// with a trace before it leaves `interpret`.
#[derive(Debug, Clone)]
pub enum RuntimeErrorKind {
    UndefinedVariable(String),
    UndefinedProperty(String),
    TypeError(String),
    NotCallable,
    StackOverflow,
    WrongArity { expected: u8, got: u8 },
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErrorKind::UndefinedVariable(name) => write!(f, "Undefined variable '{name}'."),
            RuntimeErrorKind::UndefinedProperty(name) => write!(f, "Undefined property '{name}'."),
            RuntimeErrorKind::TypeError(message) => write!(f, "{message}"),
            RuntimeErrorKind::NotCallable => write!(f, "Can only call functions and classes."),
            RuntimeErrorKind::StackOverflow => write!(f, "Stack overflow."),
            RuntimeErrorKind::WrongArity { expected, got } => {
                write!(f, "Expected {expected} arguments but got {got}.")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub trace: Vec<TraceLine>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;
        for line in self.trace.iter().rev() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
impl std::error::Error for CompileError {}

/// The `Err` arm of `interpret`. `Ok(())` is the spec's `INTERPRET_OK`.
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(errors) => {
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
            InterpretError::Runtime(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for InterpretError {}
