// File: src/value.rs
//
// Tagged value representation for the Ruff virtual machine.
// A `Value` is either one of a handful of immediate variants stored inline,
// or a handle into the object heap (see `heap.rs`/`object.rs`).

use std::fmt;

/// Handle to a heap-allocated `Obj`. Plain index into `Heap`'s arena; see
/// `heap.rs` for why this crate uses handles instead of raw pointers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(transparent)]
pub struct ObjRef(pub u32);

/// Which kind of block a `Handler` value marks on the VM's value stack.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandlerKind {
    Try,
    With,
}

/// A `Handler` marker, pushed by `OP_PUSH_TRY`/`OP_PUSH_WITH` and popped during
/// unwinding. Lives on the VM's side handler stack (`Vm::handlers`), not the
/// operand stack: the compiler's local-slot numbering assumes the operand
/// stack holds exactly the locals it has declared, so a handler marker can't
/// also occupy an untracked operand slot. Never appears in a constant pool or
/// a field table either way.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Handler {
    pub kind: HandlerKind,
    /// Absolute bytecode offset to jump to when this handler is triggered.
    pub target: u32,
}

/// Reserved `Kwargs` sentinels used by the calling convention (see vm.rs).
/// `UNSET_DEFAULT` marks "caller did not supply this keyword argument"; the
/// others mark argument-expansion forms in a `KWARGS n` trailer.
pub mod kwargs {
    pub const UNSET_DEFAULT: i64 = 0;
    pub const SINGLE: i64 = i64::MAX;
    pub const LIST: i64 = i64::MAX - 1;
    pub const DICT: i64 = i64::MAX - 2;
    pub const NIL: i64 = i64::MAX - 3;
}

/// The tagged union at the heart of the interpreter. Immediate variants never
/// allocate; `Obj` defers to the heap.
#[derive(Clone, Copy, Debug)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Handler(Handler),
    Kwargs(i64),
    Obj(ObjRef),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Handler(_) => true,
            Value::Kwargs(k) => *k != kwargs::UNSET_DEFAULT,
            Value::Obj(_) => true,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(o) => Some(*o),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn type_name_immediate(&self) -> Option<&'static str> {
        match self {
            Value::None => Some("NoneType"),
            Value::Bool(_) => Some("bool"),
            Value::Int(_) => Some("int"),
            Value::Float(_) => Some("float"),
            Value::Handler(_) => Some("handler"),
            Value::Kwargs(_) => Some("kwargs"),
            Value::Obj(_) => None,
        }
    }
}

impl fmt::Display for Value {
    /// Debug-only rendering that doesn't need heap access; real `str()`/`repr()`
    /// dispatch through the VM so that `__str__`/`__repr__` overrides apply
    /// (see vm.rs `stringify`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(fl) => write!(f, "{fl}"),
            Value::Handler(h) => write!(
                f,
                "{{{}->{}}}",
                if h.kind == HandlerKind::Try { "try" } else { "with" },
                h.target
            ),
            Value::Kwargs(k) => match *k {
                kwargs::SINGLE => write!(f, "{{unpack single}}"),
                kwargs::LIST => write!(f, "{{unpack list}}"),
                kwargs::DICT => write!(f, "{{unpack dict}}"),
                kwargs::NIL => write!(f, "{{unpack nil}}"),
                0 => write!(f, "{{unset default}}"),
                n => write!(f, "{{sentinel={n}}}"),
            },
            Value::Obj(o) => write!(f, "<object #{}>", o.0),
        }
    }
}
