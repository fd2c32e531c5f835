//! VM execution tracing.
//!
//! A trait-based hook system with a zero-cost no-op default, in the same
//! shape as an execution tracer for a bytecode VM: the VM is generic over
//! `Tr: VmTracer`, so [`NoopTracer`]'s empty, `#[inline(always)]` methods
//! erase entirely via monomorphization in a release build, while a
//! `StderrTracer` can be swapped in for debugging without touching the
//! dispatch loop.
//!
//! This is observability for a *live* VM, not the disassembler the spec
//! calls out as a separate, out-of-scope collaborator: nothing here decodes
//! a bytecode stream offline.

use crate::op::Opcode;

pub trait VmTracer {
    /// Called immediately before dispatching `opcode` at `ip`.
    fn on_instruction(&mut self, ip: usize, opcode: Opcode) {
        let _ = (ip, opcode);
    }

    /// Called after a new call frame is pushed.
    fn on_call(&mut self, function_name: Option<&str>, depth: usize) {
        let _ = (function_name, depth);
    }

    /// Called after a call frame is popped.
    fn on_return(&mut self, depth: usize) {
        let _ = depth;
    }

    /// Called when a collection cycle begins, with the current byte count.
    fn on_gc_begin(&mut self, bytes_allocated: usize) {
        let _ = bytes_allocated;
    }

    /// Called when a collection cycle ends, with bytes freed and the next
    /// threshold.
    fn on_gc_end(&mut self, bytes_freed: usize, next_gc: usize) {
        let _ = (bytes_freed, next_gc);
    }
}

/// Production default: every hook is empty and inlines away.
#[derive(Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Human-readable execution log to stderr, useful while developing the
/// compiler or VM by hand.
#[derive(Default)]
pub struct StderrTracer {
    depth: usize,
}

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode) {
        eprintln!("{:indent$}{ip:04} {opcode:?}", "", indent = self.depth * 2);
    }

    fn on_call(&mut self, function_name: Option<&str>, depth: usize) {
        self.depth = depth;
        eprintln!("-- call {} (depth {depth})", function_name.unwrap_or("<script>"));
    }

    fn on_return(&mut self, depth: usize) {
        self.depth = depth;
        eprintln!("-- return (depth {depth})");
    }

    fn on_gc_begin(&mut self, bytes_allocated: usize) {
        eprintln!("-- gc begin ({bytes_allocated} bytes live)");
    }

    fn on_gc_end(&mut self, bytes_freed: usize, next_gc: usize) {
        eprintln!("-- gc end (freed {bytes_freed} bytes, next at {next_gc})");
    }
}
