//! Compiler and bytecode virtual machine for cinder, a small dynamically
//! typed, class-based scripting language in the tradition of a single-pass,
//! stack-based teaching interpreter: a Pratt-parsing compiler that emits
//! bytecode directly (no intermediate AST), run by a tree of call frames
//! over one value stack, backed by a tracing mark-sweep collector.
//!
//! The crate has no notion of its own entry point beyond [`interpret`]:
//! everything else (a REPL, a file runner, native extensions) is built on
//! top of [`Vm`] and [`Heap`] by a driver such as `cinder-cli`.

mod chunk;
mod compiler;
mod config;
mod error;
mod heap;
mod io;
mod lexer;
mod native;
mod object;
mod op;
mod table;
mod token;
mod tracer;
mod value;
mod vm;

pub use crate::{
    config::VmConfig,
    error::{CompileError, InterpretError, RuntimeError, RuntimeErrorKind, TraceLine},
    heap::Heap,
    io::{CollectingSink, PrintSink, StdoutSink},
    native::{clock, register_builtins},
    object::{NativeFn, ObjId},
    tracer::{NoopTracer, StderrTracer, VmTracer},
    value::Value,
    vm::Vm,
};

/// Compiles and runs `source` in a fresh `Vm`/`Heap` pair with the bundled
/// natives registered, tracing disabled. The one-shot convenience entry
/// point for callers that don't need to reuse a `Vm` across multiple
/// `interpret` calls (a REPL does; a `run this file once` driver doesn't).
pub fn interpret(source: &str) -> Result<(), InterpretError> {
    let config = VmConfig::default();
    let mut heap = Heap::new(&config);
    let mut vm = Vm::new(&config);
    register_builtins(&mut vm, &mut heap);
    vm.interpret(source, &mut heap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpret_runs_a_trivial_script() {
        assert!(interpret("print 1 + 1;").is_ok());
    }

    #[test]
    fn interpret_surfaces_compile_errors() {
        let err = interpret("var ;").unwrap_err();
        assert!(matches!(err, InterpretError::Compile(_)));
    }

    #[test]
    fn interpret_surfaces_runtime_errors() {
        let err = interpret("print nope;").unwrap_err();
        assert!(matches!(err, InterpretError::Runtime(_)));
    }

    #[test]
    fn clock_is_callable_from_scripts() {
        assert!(interpret("print clock() >= 0;").is_ok());
    }
}
