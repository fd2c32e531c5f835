use std::io::Write;
use std::{env, fs, io, process::ExitCode};

use cinder::{Heap, InterpretError, NoopTracer, StderrTracer, Vm, VmConfig, VmTracer, register_builtins};

// BSD sysexits, matching this family of teaching interpreters.
const EX_OK: u8 = 0;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

fn main() -> ExitCode {
    let mut args = env::args().skip(1).peekable();
    let trace = if args.peek().map(String::as_str) == Some("--trace") {
        args.next();
        true
    } else {
        false
    };

    match args.next() {
        Some(path) => run_file(&path, trace),
        None => {
            run_repl(trace);
            ExitCode::from(EX_OK)
        }
    }
}

fn run_file(path: &str, trace: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error reading {path}: {err}");
            return ExitCode::from(EX_IOERR);
        }
    };

    let config = VmConfig::default();
    let mut heap = Heap::new(&config);
    let code = if trace {
        let mut vm = Vm::with_tracer(&config, StderrTracer::default());
        register_builtins(&mut vm, &mut heap);
        report(vm.interpret(&source, &mut heap))
    } else {
        let mut vm = Vm::new(&config);
        register_builtins(&mut vm, &mut heap);
        report(vm.interpret(&source, &mut heap))
    };
    ExitCode::from(code)
}

fn report(result: Result<(), InterpretError>) -> u8 {
    match result {
        Ok(()) => EX_OK,
        Err(err @ InterpretError::Compile(_)) => {
            eprintln!("{err}");
            EX_DATAERR
        }
        Err(err @ InterpretError::Runtime(_)) => {
            eprintln!("{err}");
            EX_SOFTWARE
        }
    }
}

/// No path given: read one line at a time from stdin, interpreting each as
/// its own `interpret` call. Errors are printed but never exit the loop.
fn run_repl(trace: bool) {
    let config = VmConfig::default();
    let mut heap = Heap::new(&config);

    if trace {
        let mut vm = Vm::with_tracer(&config, StderrTracer::default());
        register_builtins(&mut vm, &mut heap);
        repl_loop(&mut vm, &mut heap);
    } else {
        let mut vm: Vm<NoopTracer> = Vm::new(&config);
        register_builtins(&mut vm, &mut heap);
        repl_loop(&mut vm, &mut heap);
    }
}

fn repl_loop<Tr: VmTracer>(vm: &mut Vm<Tr>, heap: &mut Heap) {
    let mut line = String::new();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return;
        }
        line.clear();
        match io::stdin().read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {
                if let Err(err) = vm.interpret(&line, heap) {
                    eprintln!("{err}");
                }
            }
            Err(err) => {
                eprintln!("error reading stdin: {err}");
                return;
            }
        }
    }
}
