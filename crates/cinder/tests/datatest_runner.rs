//! Data-driven fixtures: every `tests/scripts/*.cin` source is interpreted
//! and its collected `print` output diffed against the neighboring `*.out`
//! file.

use cinder::{CollectingSink, Heap, Vm, VmConfig, register_builtins};
use datatest_stable::Utf8Path;
use pretty_assertions::assert_eq;

fn run_script(path: &Utf8Path, source: String) -> datatest_stable::Result<()> {
    let expected_path = path.with_extension("out");
    let expected = std::fs::read_to_string(&expected_path)?;

    let config = VmConfig::default();
    let mut heap = Heap::new(&config);
    let mut vm = Vm::with_sink(&config, CollectingSink::default());
    register_builtins(&mut vm, &mut heap);
    vm.interpret(&source, &mut heap)?;

    assert_eq!(vm.sink().output(), expected, "fixture: {path}");
    Ok(())
}

datatest_stable::harness! {
    { test = run_script, root = "tests/scripts", pattern = r"^.*\.cin$" },
}
