//! Heap object variants. Objects never hold raw pointers to one another;
//! they refer to each other through [`ObjId`] handles resolved against the
//! [`crate::heap::Heap`] arena that owns them.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// A handle into the heap arena. Stable for the lifetime of the object it
/// names; reused only after the slot has been swept, at which point nothing
/// reachable still holds the old id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(u32);

impl ObjId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for ObjId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjId({})", self.0)
    }
}

pub struct LString {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl LString {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }
}

/// Compile-time artifact produced for every `fun` declaration and for the
/// implicit top-level script function.
pub struct LFunction {
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `None` for the top-level script.
    pub name: Option<ObjId>,
}

pub type NativeFn = fn(&mut crate::heap::Heap, &[Value]) -> Result<Value, crate::error::RuntimeErrorKind>;

pub struct LNative {
    pub name: ObjId,
    pub arity: u8,
    pub func: NativeFn,
}

/// Either an open cell pointing at a live stack slot, or a closed cell that
/// owns its value after the stack frame it pointed into has returned.
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

pub struct LUpvalue {
    pub state: UpvalueState,
}

pub struct LClosure {
    pub function: ObjId,
    pub upvalues: Vec<ObjId>,
}

pub struct LClass {
    pub name: ObjId,
    pub methods: Table,
}

pub struct LInstance {
    pub class: ObjId,
    pub fields: Table,
}

pub struct LBoundMethod {
    pub receiver: Value,
    pub method: ObjId,
}

pub enum Obj {
    String(LString),
    Function(LFunction),
    Native(LNative),
    Closure(LClosure),
    Upvalue(LUpvalue),
    Class(LClass),
    Instance(LInstance),
    BoundMethod(LBoundMethod),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native function",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }

    /// Approximate in-memory footprint, used to drive the GC's allocation
    /// counter. Conservative is fine; the collector only needs a monotone
    /// signal, not an exact count.
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.bytes.len(),
            Obj::Function(f) => f.chunk.len() + f.chunk.constants().len() * std::mem::size_of::<Value>(),
            Obj::Native(_) => 0,
            Obj::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjId>(),
            Obj::Upvalue(_) => 0,
            Obj::Class(c) => c.methods.approx_size(),
            Obj::Instance(i) => i.fields.approx_size(),
            Obj::BoundMethod(_) => 0,
        }
    }

    pub fn as_string(&self) -> Option<&LString> {
        match self {
            Obj::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&LFunction> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&LClosure> {
        match self {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&LClass> {
        match self {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut LClass> {
        match self {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&LInstance> {
        match self {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_instance_mut(&mut self) -> Option<&mut LInstance> {
        match self {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&LBoundMethod> {
        match self {
            Obj::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&LUpvalue> {
        match self {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_upvalue_mut(&mut self) -> Option<&mut LUpvalue> {
        match self {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&LNative> {
        match self {
            Obj::Native(n) => Some(n),
            _ => None,
        }
    }
}

/// FNV-1a-32, computed once at string-creation time and cached on the
/// object so hash-table probing never re-scans the bytes.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
    const FNV_PRIME: u32 = 16_777_619;
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
