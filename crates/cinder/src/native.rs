//! Native function registry. A native is a plain `fn` pointer stored in a
//! [`crate::object::LNative`] heap object and bound into the VM's globals
//! table exactly like a user-defined global, so `Call`/`Invoke` dispatch
//! never needs to special-case it.

use crate::error::RuntimeErrorKind;
use crate::heap::Heap;
use crate::io::PrintSink;
use crate::tracer::VmTracer;
use crate::value::Value;
use crate::vm::Vm;

/// Seconds since the Unix epoch, as a float. The one native the engine ships
/// with, mostly to exercise the registration path end to end.
pub fn clock(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeErrorKind> {
    if !args.is_empty() {
        return Err(RuntimeErrorKind::WrongArity { expected: 0, got: args.len() as u8 });
    }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    Ok(Value::Number(now.as_secs_f64()))
}

/// Registers every bundled native into `vm`'s globals. Called once by
/// `interpret`'s caller (or by `cinder::interpret`) before running a script.
pub fn register_builtins<Tr: VmTracer, Sink: PrintSink>(vm: &mut Vm<Tr, Sink>, heap: &mut Heap) {
    vm.define_native(heap, "clock", 0, clock);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_returns_a_number() {
        let mut heap = Heap::new(&crate::config::VmConfig::default());
        let result = clock(&mut heap, &[]).expect("clock takes no arguments");
        assert!(result.as_number().is_some());
    }

    #[test]
    fn clock_rejects_arguments() {
        let mut heap = Heap::new(&crate::config::VmConfig::default());
        let err = clock(&mut heap, &[Value::Nil]).unwrap_err();
        assert!(matches!(err, RuntimeErrorKind::WrongArity { expected: 0, got: 1 }));
    }
}
