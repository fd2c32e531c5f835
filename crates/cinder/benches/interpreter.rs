use cinder::{Heap, Vm, VmConfig};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

const FIB: &str = "\
fun fib(n) {
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}
fib(20);
";

/// Recursive `fib(20)` exercises the call/return protocol (closures,
/// frame push/pop, arithmetic) under repeated invocation, which is exactly
/// the path a change to call dispatch is most likely to regress.
fn fib_recursive(c: &mut Criterion) {
    c.bench_function("fib(20)", |b| {
        b.iter(|| {
            let config = VmConfig::default();
            let mut heap = Heap::new(&config);
            let mut vm = Vm::new(&config);
            vm.interpret(black_box(FIB), &mut heap).expect("fib benchmark script must interpret cleanly");
        });
    });
}

criterion_group!(benches, fib_recursive);
criterion_main!(benches);
