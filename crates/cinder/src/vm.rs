//! The bytecode dispatch loop: call frames, the value stack, the call
//! protocol across closures/natives/classes/bound methods, property access,
//! and runtime upvalue management.
//!
//! Generic over `Tr: VmTracer` so a release build with [`crate::tracer::NoopTracer`]
//! monomorphizes every tracer call away; nothing here decides *whether* to
//! trace, only *what* to report when asked.

use crate::compiler;
use crate::config::VmConfig;
use crate::error::{InterpretError, RuntimeError, RuntimeErrorKind, TraceLine};
use crate::heap::{GcRoots, Heap};
use crate::io::{PrintSink, StdoutSink};
use crate::object::{LBoundMethod, LClass, LClosure, LInstance, Obj, ObjId, UpvalueState};
use crate::op::Opcode;
use crate::table::Table;
use crate::tracer::{NoopTracer, VmTracer};
use crate::value::Value;
use smallvec::SmallVec;

struct CallFrame {
    closure: ObjId,
    ip: usize,
    /// Index into `Vm::stack` of this frame's slot 0.
    slots_base: usize,
}

/// A stack-based tree-walking VM this is not: every frame owns an
/// instruction pointer into its closure's chunk, and control transfer
/// between frames is just pushing/popping this `Vec`.
pub struct Vm<Tr: VmTracer = NoopTracer, Sink: PrintSink = StdoutSink> {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Open upvalues, kept sorted by stack slot in descending order so
    /// `close_upvalues` can close a contiguous run from the front.
    open_upvalues: Vec<ObjId>,
    stack_max: usize,
    frames_max: usize,
    tracer: Tr,
    sink: Sink,
}

impl Vm<NoopTracer, StdoutSink> {
    pub fn new(config: &VmConfig) -> Self {
        Self::with_tracer_and_sink(config, NoopTracer, StdoutSink)
    }
}

impl<Tr: VmTracer> Vm<Tr, StdoutSink> {
    pub fn with_tracer(config: &VmConfig, tracer: Tr) -> Self {
        Self::with_tracer_and_sink(config, tracer, StdoutSink)
    }
}

impl<Sink: PrintSink> Vm<NoopTracer, Sink> {
    pub fn with_sink(config: &VmConfig, sink: Sink) -> Self {
        Self::with_tracer_and_sink(config, NoopTracer, sink)
    }
}

impl<Tr: VmTracer, Sink: PrintSink> Vm<Tr, Sink> {
    pub fn with_tracer_and_sink(config: &VmConfig, tracer: Tr, sink: Sink) -> Self {
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            stack_max: config.stack_max,
            frames_max: config.frames_max,
            tracer,
            sink,
        }
    }

    pub fn sink(&self) -> &Sink {
        &self.sink
    }

    /// Compiles and runs `source` to completion. The VM's stack and frames
    /// are reset first, so a single `Vm` can be reused across `interpret`
    /// calls (globals and the heap persist between them).
    pub fn interpret(&mut self, source: &str, heap: &mut Heap) -> Result<(), InterpretError> {
        let function_id = compiler::compile(source, heap).map_err(InterpretError::Compile)?;

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        let closure_id = self.alloc(heap, Obj::Closure(LClosure { function: function_id, upvalues: Vec::new() }));
        self.stack.push(Value::Object(closure_id));
        self.call_closure(heap, closure_id, 0).map_err(|kind| InterpretError::Runtime(self.runtime_error(heap, kind)))?;

        self.run(heap).map_err(InterpretError::Runtime)
    }

    /// Binds `name` as a global whose value is a native function, for use by
    /// [`crate::native::register_builtins`] and by embedders adding their
    /// own natives before calling `interpret`.
    pub fn define_native(&mut self, heap: &mut Heap, name: &str, arity: u8, func: crate::object::NativeFn) {
        let name_id = self.intern(heap, name.as_bytes());
        let hash = Self::string_hash(heap, name_id);
        let native_id = self.alloc(heap, Obj::Native(crate::object::LNative { name: name_id, arity, func }));
        self.globals.set(name_id, hash, Value::Object(native_id));
    }

    fn run(&mut self, heap: &mut Heap) -> Result<(), RuntimeError> {
        loop {
            let opcode_byte = self.read_byte(heap);
            let Some(opcode) = Opcode::from_byte(opcode_byte) else {
                let kind = RuntimeErrorKind::TypeError("Invalid opcode.".to_owned());
                return Err(self.runtime_error(heap, kind));
            };
            self.tracer.on_instruction(self.frames.last().expect("at least one frame while running").ip - 1, opcode);

            match self.execute(heap, opcode) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(kind) => return Err(self.runtime_error(heap, kind)),
            }
        }
    }

    /// Runs a single instruction. Returns `Ok(true)` when the outermost
    /// frame has returned and the VM should stop.
    fn execute(&mut self, heap: &mut Heap, opcode: Opcode) -> Result<bool, RuntimeErrorKind> {
        match opcode {
            Opcode::Constant => {
                let value = self.read_constant(heap);
                self.push(value)?;
            }
            Opcode::Nil => self.push(Value::Nil)?,
            Opcode::True => self.push(Value::Bool(true))?,
            Opcode::False => self.push(Value::Bool(false))?,
            Opcode::Pop => {
                self.pop();
            }
            Opcode::GetLocal => {
                let slot = self.read_byte(heap) as usize;
                let base = self.frames.last().expect("frame").slots_base;
                self.push(self.stack[base + slot])?;
            }
            Opcode::SetLocal => {
                let slot = self.read_byte(heap) as usize;
                let base = self.frames.last().expect("frame").slots_base;
                self.stack[base + slot] = *self.peek(0);
            }
            Opcode::GetGlobal => {
                let name = self.read_constant(heap).as_object().expect("compiler emits a string constant");
                let hash = Self::string_hash(heap, name);
                match self.globals.get(name, hash) {
                    Some(value) => self.push(value)?,
                    None => {
                        return Err(RuntimeErrorKind::UndefinedVariable(Self::string_content(heap, name)));
                    }
                }
            }
            Opcode::DefineGlobal => {
                let name = self.read_constant(heap).as_object().expect("compiler emits a string constant");
                let hash = Self::string_hash(heap, name);
                let value = self.pop();
                self.globals.set(name, hash, value);
            }
            Opcode::SetGlobal => {
                let name = self.read_constant(heap).as_object().expect("compiler emits a string constant");
                let hash = Self::string_hash(heap, name);
                let value = *self.peek(0);
                if self.globals.set(name, hash, value) {
                    self.globals.delete(name, hash);
                    return Err(RuntimeErrorKind::UndefinedVariable(Self::string_content(heap, name)));
                }
            }
            Opcode::GetUpvalue => {
                let index = self.read_byte(heap) as usize;
                let closure = self.frames.last().expect("frame").closure;
                let up_id = heap.obj(closure).as_closure().expect("frame closure").upvalues[index];
                self.push(self.read_upvalue(heap, up_id))?;
            }
            Opcode::SetUpvalue => {
                let index = self.read_byte(heap) as usize;
                let closure = self.frames.last().expect("frame").closure;
                let up_id = heap.obj(closure).as_closure().expect("frame closure").upvalues[index];
                let value = *self.peek(0);
                self.write_upvalue(heap, up_id, value);
            }
            Opcode::GetProperty => {
                let name = self.read_constant(heap).as_object().expect("compiler emits a string constant");
                self.get_property(heap, name)?;
            }
            Opcode::SetProperty => {
                let name = self.read_constant(heap).as_object().expect("compiler emits a string constant");
                self.set_property(heap, name)?;
            }
            Opcode::GetSuper => {
                let name = self.read_constant(heap).as_object().expect("compiler emits a string constant");
                self.get_super(heap, name)?;
            }
            Opcode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b))?;
            }
            Opcode::Greater => self.numeric_compare(|a, b| a > b)?,
            Opcode::Less => self.numeric_compare(|a, b| a < b)?,
            Opcode::Add => self.add(heap)?,
            Opcode::Subtract => self.numeric_binary(|a, b| a - b)?,
            Opcode::Multiply => self.numeric_binary(|a, b| a * b)?,
            Opcode::Divide => self.numeric_binary(|a, b| a / b)?,
            Opcode::Not => {
                let value = self.pop();
                self.push(Value::Bool(value.is_falsey()))?;
            }
            Opcode::Negate => {
                let value = self.pop();
                match value.as_number() {
                    Some(n) => self.push(Value::Number(-n))?,
                    None => return Err(RuntimeErrorKind::TypeError("Operand must be a number.".to_owned())),
                }
            }
            Opcode::Print => {
                let value = self.pop();
                let line = value.format(heap);
                self.sink.print_line(&line);
            }
            Opcode::Jump => {
                let offset = self.read_u16(heap);
                self.frames.last_mut().expect("frame").ip += offset as usize;
            }
            Opcode::JumpIfFalse => {
                let offset = self.read_u16(heap);
                if self.peek(0).is_falsey() {
                    self.frames.last_mut().expect("frame").ip += offset as usize;
                }
            }
            Opcode::Loop => {
                let offset = self.read_u16(heap);
                self.frames.last_mut().expect("frame").ip -= offset as usize;
            }
            Opcode::Call => {
                let argc = self.read_byte(heap);
                let callee = *self.peek(argc as usize);
                self.call_value(heap, callee, argc)?;
            }
            Opcode::Invoke => {
                let name = self.read_constant(heap).as_object().expect("compiler emits a string constant");
                let argc = self.read_byte(heap);
                self.invoke(heap, name, argc)?;
            }
            Opcode::SuperInvoke => {
                let name = self.read_constant(heap).as_object().expect("compiler emits a string constant");
                let argc = self.read_byte(heap);
                self.super_invoke(heap, name, argc)?;
            }
            Opcode::Closure => self.closure(heap)?,
            Opcode::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(heap, top);
                self.pop();
            }
            Opcode::Return => return self.do_return(heap),
            Opcode::Class => {
                let name = self.read_constant(heap).as_object().expect("compiler emits a string constant");
                let id = self.alloc(heap, Obj::Class(LClass { name, methods: Table::new() }));
                self.push(Value::Object(id))?;
            }
            Opcode::Inherit => self.inherit(heap)?,
            Opcode::Method => self.method(heap),
        }
        Ok(false)
    }

    // --- stack plumbing -------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), RuntimeErrorKind> {
        if self.stack.len() >= self.stack_max {
            return Err(RuntimeErrorKind::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("compiler balances every push with a pop")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    // --- fetch ------------------------------------------------------------

    fn current_function(&self, heap: &Heap) -> ObjId {
        let closure = self.frames.last().expect("frame").closure;
        heap.obj(closure).as_closure().expect("frame always holds a closure").function
    }

    fn read_byte(&mut self, heap: &Heap) -> u8 {
        let function_id = self.current_function(heap);
        let frame = self.frames.last_mut().expect("frame");
        let byte = heap.obj(function_id).as_function().expect("closure wraps a function").chunk.read_byte(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self, heap: &Heap) -> u16 {
        let function_id = self.current_function(heap);
        let frame = self.frames.last_mut().expect("frame");
        let value = heap.obj(function_id).as_function().expect("closure wraps a function").chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self, heap: &Heap) -> Value {
        let index = self.read_byte(heap);
        let function_id = self.current_function(heap);
        *heap.obj(function_id).as_function().expect("closure wraps a function").chunk.constant(index)
    }

    fn string_hash(heap: &Heap, id: ObjId) -> u32 {
        heap.obj(id).as_string().expect("name constants are interned strings").hash
    }

    fn string_content(heap: &Heap, id: ObjId) -> String {
        heap.obj(id).as_string().expect("name constants are interned strings").as_str().to_owned()
    }

    // --- allocation (GC-triggering) ---------------------------------------

    fn alloc(&mut self, heap: &mut Heap, obj: Obj) -> ObjId {
        if heap.should_collect() {
            self.collect_garbage(heap);
        }
        heap.alloc(obj)
    }

    fn intern(&mut self, heap: &mut Heap, bytes: &[u8]) -> ObjId {
        if let Some(id) = heap.find_interned(bytes) {
            return id;
        }
        if heap.should_collect() {
            self.collect_garbage(heap);
        }
        heap.intern_new(bytes)
    }

    fn collect_garbage(&mut self, heap: &mut Heap) {
        self.tracer.on_gc_begin(heap.bytes_allocated());
        let frame_closures: Vec<ObjId> = self.frames.iter().map(|f| f.closure).collect();
        let init_string = heap.init_string();
        let stats = heap.collect_garbage(GcRoots {
            stack: &self.stack,
            frame_closures: &frame_closures,
            open_upvalues: &self.open_upvalues,
            tables: &[&self.globals],
            extra: &[init_string],
        });
        self.tracer.on_gc_end(stats.bytes_before.saturating_sub(stats.bytes_after), stats.next_gc);
    }

    // --- arithmetic ---------------------------------------------------------

    fn numeric_binary(&mut self, op: impl FnOnce(f64, f64) -> f64) -> Result<(), RuntimeErrorKind> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => self.push(Value::Number(op(x, y))),
            _ => Err(RuntimeErrorKind::TypeError("Operands must be numbers.".to_owned())),
        }
    }

    fn numeric_compare(&mut self, op: impl FnOnce(f64, f64) -> bool) -> Result<(), RuntimeErrorKind> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => self.push(Value::Bool(op(x, y))),
            _ => Err(RuntimeErrorKind::TypeError("Operands must be numbers.".to_owned())),
        }
    }

    /// Numeric `+` adds; object `+` concatenates only when both operands are
    /// strings. The intern lookup runs before any allocation, so concatenating
    /// two already-seen strings never grows the heap.
    fn add(&mut self, heap: &mut Heap) -> Result<(), RuntimeErrorKind> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
            (Value::Object(x), Value::Object(y)) => {
                let concatenated = match (heap.obj(x).as_string(), heap.obj(y).as_string()) {
                    (Some(sx), Some(sy)) => {
                        let mut bytes = Vec::with_capacity(sx.bytes.len() + sy.bytes.len());
                        bytes.extend_from_slice(&sx.bytes);
                        bytes.extend_from_slice(&sy.bytes);
                        Some(bytes)
                    }
                    _ => None,
                };
                match concatenated {
                    Some(bytes) => {
                        let id = self.intern(heap, &bytes);
                        self.push(Value::Object(id))
                    }
                    None => Err(RuntimeErrorKind::TypeError("Operands must be two numbers or two strings.".to_owned())),
                }
            }
            _ => Err(RuntimeErrorKind::TypeError("Operands must be two numbers or two strings.".to_owned())),
        }
    }

    // --- calls ---------------------------------------------------------------

    fn call_value(&mut self, heap: &mut Heap, callee: Value, argc: u8) -> Result<(), RuntimeErrorKind> {
        let Some(id) = callee.as_object() else {
            return Err(RuntimeErrorKind::NotCallable);
        };
        enum Kind {
            Closure,
            Native,
            Class,
            BoundMethod,
            Other,
        }
        let kind = match heap.obj(id) {
            Obj::Closure(_) => Kind::Closure,
            Obj::Native(_) => Kind::Native,
            Obj::Class(_) => Kind::Class,
            Obj::BoundMethod(_) => Kind::BoundMethod,
            _ => Kind::Other,
        };
        match kind {
            Kind::Closure => self.call_closure(heap, id, argc),
            Kind::Native => {
                let (arity, func) = {
                    let native = heap.obj(id).as_native().expect("matched above");
                    (native.arity, native.func)
                };
                if argc != arity {
                    return Err(RuntimeErrorKind::WrongArity { expected: arity, got: argc });
                }
                let args_start = self.stack.len() - argc as usize;
                let args: SmallVec<[Value; 4]> = SmallVec::from_slice(&self.stack[args_start..]);
                let result = func(heap, &args)?;
                self.stack.truncate(args_start - 1);
                self.push(result)
            }
            Kind::Class => {
                let instance_id = self.alloc(heap, Obj::Instance(LInstance { class: id, fields: Table::new() }));
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::Object(instance_id);
                let init_name = heap.init_string();
                let init_hash = heap.init_string_hash();
                let initializer = heap.obj(id).as_class().expect("matched above").methods.get(init_name, init_hash);
                match initializer {
                    Some(init_closure) => self.call_value(heap, init_closure, argc),
                    None if argc == 0 => Ok(()),
                    None => Err(RuntimeErrorKind::WrongArity { expected: 0, got: argc }),
                }
            }
            Kind::BoundMethod => {
                let (receiver, method) = {
                    let bound = heap.obj(id).as_bound_method().expect("matched above");
                    (bound.receiver, bound.method)
                };
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = receiver;
                self.call_closure(heap, method, argc)
            }
            Kind::Other => Err(RuntimeErrorKind::NotCallable),
        }
    }

    fn call_closure(&mut self, heap: &Heap, closure_id: ObjId, argc: u8) -> Result<(), RuntimeErrorKind> {
        let function_id = heap.obj(closure_id).as_closure().expect("call_closure only called with closures").function;
        let function = heap.obj(function_id).as_function().expect("closure always wraps a function");
        if argc != function.arity {
            return Err(RuntimeErrorKind::WrongArity { expected: function.arity, got: argc });
        }
        if self.frames.len() >= self.frames_max {
            return Err(RuntimeErrorKind::StackOverflow);
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        let name = function.name.map(|id| heap.obj(id).as_string().expect("function name is interned").as_str().to_owned());
        self.frames.push(CallFrame { closure: closure_id, ip: 0, slots_base });
        self.tracer.on_call(name.as_deref(), self.frames.len());
        Ok(())
    }

    fn do_return(&mut self, heap: &mut Heap) -> Result<bool, RuntimeErrorKind> {
        let result = self.pop();
        let frame = self.frames.pop().expect("at least one frame while running");
        self.close_upvalues(heap, frame.slots_base);
        self.tracer.on_return(self.frames.len());
        self.stack.truncate(frame.slots_base);
        if self.frames.is_empty() {
            return Ok(true);
        }
        self.push(result)?;
        Ok(false)
    }

    // --- properties ------------------------------------------------------

    fn find_method(heap: &Heap, class_id: ObjId, name: ObjId, hash: u32) -> Option<Value> {
        heap.obj(class_id).as_class().expect("find_method only called with classes").methods.get(name, hash)
    }

    fn get_property(&mut self, heap: &mut Heap, name: ObjId) -> Result<(), RuntimeErrorKind> {
        let receiver = *self.peek(0);
        let Some(instance_id) = receiver.as_object().filter(|&id| heap.obj(id).as_instance().is_some()) else {
            return Err(RuntimeErrorKind::TypeError("Only instances have properties.".to_owned()));
        };
        let hash = Self::string_hash(heap, name);
        let instance = heap.obj(instance_id).as_instance().expect("checked above");
        if let Some(value) = instance.fields.get(name, hash) {
            self.pop();
            return self.push(value);
        }
        let class_id = instance.class;
        match Self::find_method(heap, class_id, name, hash) {
            Some(method) => {
                self.pop();
                let method_id = method.as_object().expect("methods are always closures");
                let bound_id = self.alloc(heap, Obj::BoundMethod(LBoundMethod { receiver, method: method_id }));
                self.push(Value::Object(bound_id))
            }
            None => Err(RuntimeErrorKind::UndefinedProperty(Self::string_content(heap, name))),
        }
    }

    fn set_property(&mut self, heap: &mut Heap, name: ObjId) -> Result<(), RuntimeErrorKind> {
        let value = *self.peek(0);
        let receiver = *self.peek(1);
        let Some(instance_id) = receiver.as_object().filter(|&id| heap.obj(id).as_instance().is_some()) else {
            return Err(RuntimeErrorKind::TypeError("Only instances have fields.".to_owned()));
        };
        let hash = Self::string_hash(heap, name);
        heap.obj_mut(instance_id).as_instance_mut().expect("checked above").fields.set(name, hash, value);
        self.pop();
        self.pop();
        self.push(value)
    }

    fn invoke(&mut self, heap: &mut Heap, name: ObjId, argc: u8) -> Result<(), RuntimeErrorKind> {
        let receiver = *self.peek(argc as usize);
        let Some(instance_id) = receiver.as_object().filter(|&id| heap.obj(id).as_instance().is_some()) else {
            return Err(RuntimeErrorKind::TypeError("Only instances have methods.".to_owned()));
        };
        let hash = Self::string_hash(heap, name);
        let instance = heap.obj(instance_id).as_instance().expect("checked above");
        if let Some(field_value) = instance.fields.get(name, hash) {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = field_value;
            return self.call_value(heap, field_value, argc);
        }
        let class_id = instance.class;
        match Self::find_method(heap, class_id, name, hash) {
            Some(method) => {
                let closure_id = method.as_object().expect("methods are always closures");
                self.call_closure(heap, closure_id, argc)
            }
            None => Err(RuntimeErrorKind::UndefinedProperty(Self::string_content(heap, name))),
        }
    }

    fn super_invoke(&mut self, heap: &mut Heap, name: ObjId, argc: u8) -> Result<(), RuntimeErrorKind> {
        let superclass_val = self.pop();
        let superclass_id = superclass_val.as_object().expect("compiler only emits SuperInvoke with a class on stack");
        let hash = Self::string_hash(heap, name);
        match Self::find_method(heap, superclass_id, name, hash) {
            Some(method) => {
                let closure_id = method.as_object().expect("methods are always closures");
                self.call_closure(heap, closure_id, argc)
            }
            None => Err(RuntimeErrorKind::UndefinedProperty(Self::string_content(heap, name))),
        }
    }

    fn get_super(&mut self, heap: &mut Heap, name: ObjId) -> Result<(), RuntimeErrorKind> {
        let superclass_val = self.pop();
        let receiver = self.pop();
        let superclass_id = superclass_val.as_object().expect("compiler only emits GetSuper with a class on stack");
        let hash = Self::string_hash(heap, name);
        match Self::find_method(heap, superclass_id, name, hash) {
            Some(method) => {
                let method_id = method.as_object().expect("methods are always closures");
                let bound_id = self.alloc(heap, Obj::BoundMethod(LBoundMethod { receiver, method: method_id }));
                self.push(Value::Object(bound_id))
            }
            None => Err(RuntimeErrorKind::UndefinedProperty(Self::string_content(heap, name))),
        }
    }

    // --- classes -------------------------------------------------------------

    fn inherit(&mut self, heap: &mut Heap) -> Result<(), RuntimeErrorKind> {
        let superclass_val = *self.peek(1);
        let subclass_val = *self.peek(0);
        let Some(superclass_id) = superclass_val.as_object().filter(|&id| heap.obj(id).as_class().is_some()) else {
            return Err(RuntimeErrorKind::TypeError("Superclass must be a class.".to_owned()));
        };
        let subclass_id = subclass_val.as_object().expect("compiler only emits Inherit with a class on stack");
        let entries: Vec<(ObjId, Value)> = heap.obj(superclass_id).as_class().expect("checked above").methods.iter().collect();
        for (key, value) in entries {
            let hash = Self::string_hash(heap, key);
            heap.obj_mut(subclass_id).as_class_mut().expect("subclass is a class").methods.set(key, hash, value);
        }
        self.pop();
        Ok(())
    }

    fn method(&mut self, heap: &mut Heap) {
        let name_val = self.read_constant(heap);
        let name = name_val.as_object().expect("compiler emits a string constant");
        let method_val = self.pop();
        let class_val = *self.peek(0);
        let class_id = class_val.as_object().expect("compiler only emits Method with a class on stack");
        let hash = Self::string_hash(heap, name);
        heap.obj_mut(class_id).as_class_mut().expect("target is a class").methods.set(name, hash, method_val);
    }

    // --- closures and upvalues ------------------------------------------------

    fn closure(&mut self, heap: &mut Heap) -> Result<(), RuntimeErrorKind> {
        let function_val = self.read_constant(heap);
        let function_id = function_val.as_object().expect("compiler emits a function constant");
        let upvalue_count = heap.obj(function_id).as_function().expect("closure wraps a function").upvalue_count;

        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte(heap) != 0;
            let index = self.read_byte(heap) as usize;
            let up_id = if is_local {
                let base = self.frames.last().expect("frame").slots_base;
                self.capture_upvalue(heap, base + index)
            } else {
                let enclosing = self.frames.last().expect("frame").closure;
                heap.obj(enclosing).as_closure().expect("frame closure").upvalues[index]
            };
            upvalues.push(up_id);
        }

        let closure_id = self.alloc(heap, Obj::Closure(LClosure { function: function_id, upvalues }));
        self.push(Value::Object(closure_id))
    }

    /// Returns an existing open upvalue for `stack_slot` if one is already
    /// live, otherwise creates one and keeps `open_upvalues` sorted by
    /// descending slot.
    fn capture_upvalue(&mut self, heap: &mut Heap, stack_slot: usize) -> ObjId {
        let mut insert_at = self.open_upvalues.len();
        for (i, &up_id) in self.open_upvalues.iter().enumerate() {
            let UpvalueState::Open(slot) = heap.obj(up_id).as_upvalue().expect("open_upvalues only holds upvalues").state
            else {
                unreachable!("closed upvalues are removed from open_upvalues");
            };
            if slot == stack_slot {
                return up_id;
            }
            if slot < stack_slot {
                insert_at = i;
                break;
            }
        }
        let up_id = self.alloc(heap, Obj::Upvalue(crate::object::LUpvalue { state: UpvalueState::Open(stack_slot) }));
        self.open_upvalues.insert(insert_at, up_id);
        up_id
    }

    fn read_upvalue(&self, heap: &Heap, up_id: ObjId) -> Value {
        match heap.obj(up_id).as_upvalue().expect("read_upvalue only called with upvalues").state {
            UpvalueState::Open(slot) => self.stack[slot],
            UpvalueState::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, heap: &mut Heap, up_id: ObjId, value: Value) {
        let slot = match heap.obj(up_id).as_upvalue().expect("write_upvalue only called with upvalues").state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        };
        match slot {
            Some(slot) => self.stack[slot] = value,
            None => heap.obj_mut(up_id).as_upvalue_mut().expect("checked above").state = UpvalueState::Closed(value),
        }
    }

    /// Closes every open upvalue pointing at `threshold` or higher, copying
    /// the stack value into the cell before the stack itself is popped.
    fn close_upvalues(&mut self, heap: &mut Heap, threshold: usize) {
        let split = self
            .open_upvalues
            .iter()
            .position(|&id| match heap.obj(id).as_upvalue().expect("open_upvalues only holds upvalues").state {
                UpvalueState::Open(slot) => slot < threshold,
                UpvalueState::Closed(_) => unreachable!("closed upvalues are removed from open_upvalues"),
            })
            .unwrap_or(self.open_upvalues.len());
        for up_id in self.open_upvalues.drain(0..split) {
            let slot = match heap.obj(up_id).as_upvalue().expect("open_upvalues only holds upvalues").state {
                UpvalueState::Open(slot) => slot,
                UpvalueState::Closed(_) => unreachable!(),
            };
            let value = self.stack[slot];
            heap.obj_mut(up_id).as_upvalue_mut().expect("checked above").state = UpvalueState::Closed(value);
        }
    }

    // --- diagnostics -----------------------------------------------------

    fn runtime_error(&self, heap: &Heap, kind: RuntimeErrorKind) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function_id = heap.obj(frame.closure).as_closure().expect("frame closure").function;
            let function = heap.obj(function_id).as_function().expect("closure wraps a function");
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let function_name = function.name.map(|id| heap.obj(id).as_string().expect("function name is interned").as_str().to_owned());
            trace.push(TraceLine { function_name, line });
        }
        RuntimeError { kind, trace }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(source: &str) -> (Vm, Heap) {
        let mut vm = Vm::new(&VmConfig::default());
        let mut heap = Heap::new(&VmConfig::default());
        vm.interpret(source, &mut heap).expect("program should interpret cleanly");
        (vm, heap)
    }

    #[test]
    fn arithmetic_and_print_do_not_error() {
        run_ok("print 1 + 2 * 3;");
    }

    #[test]
    fn string_concatenation_interns_result() {
        let (_, mut heap) = run_ok(r#"var a = "foo" + "bar";"#);
        assert!(heap.find_interned(b"foobar").is_some());
    }

    #[test]
    fn closures_capture_by_reference() {
        run_ok(
            r#"
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    return i;
                }
                return count;
            }
            var c = makeCounter();
            if (c() != 1) { print "fail"; }
            if (c() != 2) { print "fail"; }
            "#,
        );
    }

    #[test]
    fn stack_is_empty_and_frames_are_clear_after_interpret() {
        let (vm, _) = run_ok("var a = 1; print a;");
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
    }

    #[test]
    fn class_instantiation_and_method_dispatch() {
        run_ok(
            r#"
            class Greeter {
                init(name) { this.name = name; }
                greet() { return "hi " + this.name; }
            }
            var g = Greeter("ok");
            print g.greet();
            "#,
        );
    }

    #[test]
    fn superclass_method_dispatch() {
        run_ok(
            r#"
            class A { speak() { return "a"; } }
            class B < A { speak() { return super.speak() + "b"; } }
            print B().speak();
            "#,
        );
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let mut vm = Vm::new(&VmConfig::default());
        let mut heap = Heap::new(&VmConfig::default());
        let err = vm.interpret("print undefinedThing;", &mut heap).unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(matches!(e.kind, RuntimeErrorKind::UndefinedVariable(_))),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn calling_a_non_callable_value_is_a_runtime_error() {
        let mut vm = Vm::new(&VmConfig::default());
        let mut heap = Heap::new(&VmConfig::default());
        let err = vm.interpret("var x = 1; x();", &mut heap).unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(matches!(e.kind, RuntimeErrorKind::NotCallable)),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn bound_method_pulled_into_a_variable_behaves_like_the_direct_call() {
        run_ok(
            r#"
            class Greeter {
                init(name) { this.name = name; }
                greet() { return "hi " + this.name; }
            }
            var g = Greeter("ok");
            var m = g.greet;
            if (m() != g.greet()) { print "fail"; }
            "#,
        );
    }

    #[test]
    fn bare_return_in_an_initializer_yields_this() {
        run_ok(
            r#"
            class Box {
                init(value) {
                    this.value = value;
                    return;
                }
            }
            var b = Box(5);
            if (b.value != 5) { print "fail"; }
            "#,
        );
    }
}
